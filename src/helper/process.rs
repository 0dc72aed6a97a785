//! Blocking execution of external programs (dump tools, cipher programs)
//! with cancellation and deadline support.
//!
//! Every call blocks the current thread until the child exits. Callers on
//! the async runtime run these inside `tokio::task::spawn_blocking`.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::ProcessError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATION_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL: usize = 2048;

/// Why a supervised operation was interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones share the flag, so cancelling the run cancels every archive,
/// while each archive carries its own deadline.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns a token sharing this flag that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::TimedOut),
            _ => None,
        }
    }
}

/// Runs `command` to completion. Stdout is left as configured by the caller,
/// stderr is captured for the error message.
pub fn run(mut command: Command, cancel: &Cancellation) -> Result<(), ProcessError> {
    let program = program_name(&command);
    command.stdin(Stdio::null());
    command.stderr(Stdio::piped());
    let mut child = spawn(&mut command, &program)?;
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, &program, cancel);
    let stderr = stderr.join().unwrap_or_default();
    check_status(&program, status?, &stderr)
}

/// Like [`run`], but feeds `stdin` to the child.
pub fn run_with_stdin(
    mut command: Command,
    stdin: Stdio,
    cancel: &Cancellation,
) -> Result<(), ProcessError> {
    let program = program_name(&command);
    command.stdin(stdin);
    command.stderr(Stdio::piped());
    let mut child = spawn(&mut command, &program)?;
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, &program, cancel);
    let stderr = stderr.join().unwrap_or_default();
    check_status(&program, status?, &stderr)
}

/// Runs `command` to completion and returns everything it wrote to stdout.
pub fn output(mut command: Command, cancel: &Cancellation) -> Result<Vec<u8>, ProcessError> {
    let program = program_name(&command);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    let mut child = spawn(&mut command, &program)?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, &program, cancel);
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    check_status(&program, status?, &stderr)?;

    Ok(stdout)
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

fn spawn(command: &mut Command, program: &str) -> Result<Child, ProcessError> {
    // arguments may carry credentials, so only the program name is logged
    debug!("executing '{}'", program);
    command.spawn().map_err(|cause| ProcessError::Spawn {
        program: program.to_string(),
        cause,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(err) = pipe.read_to_end(&mut buffer) {
                warn!("unable to read child output: {}", err);
            }
        }
        buffer
    })
}

fn wait(child: &mut Child, program: &str, cancel: &Cancellation) -> Result<ExitStatus, ProcessError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(cause) => {
                return Err(ProcessError::Io {
                    program: program.to_string(),
                    cause,
                })
            }
        }

        if let Some(interrupt) = cancel.interrupted() {
            terminate(child, program);
            let program = program.to_string();
            return Err(match interrupt {
                Interrupt::Cancelled => ProcessError::Cancelled { program },
                Interrupt::TimedOut => ProcessError::TimedOut { program },
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM first, SIGKILL once the grace period is over.
fn terminate(child: &mut Child, program: &str) {
    warn!("terminating '{}' (pid {})", program, child.id());
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
        warn!("unable to send SIGTERM to '{}': {}", program, err);
    }

    let started = Instant::now();
    while started.elapsed() < TERMINATION_GRACE {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    if let Err(err) = child.kill() {
        warn!("unable to kill '{}': {}", program, err);
    }
    let _ = child.wait();
}

fn check_status(program: &str, status: ExitStatus, stderr: &[u8]) -> Result<(), ProcessError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ProcessError::Exit {
            program: program.to_string(),
            code,
            stderr: tail(stderr),
        }),
        None => Err(ProcessError::Signalled {
            program: program.to_string(),
        }),
    }
}

fn tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_output_captures_stdout() {
        let stdout = output(shell("printf 'a\\nb\\n'"), &Cancellation::new()).unwrap();
        assert_eq!(stdout, b"a\nb\n");
    }

    #[test]
    fn test_non_zero_exit_reports_code_and_stderr() {
        let err = run(shell("echo broken >&2; exit 3"), &Cancellation::new()).unwrap_err();
        match err {
            ProcessError::Exit { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = run(
            Command::new("rusty-archiver-no-such-program"),
            &Cancellation::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_cancellation_terminates_child() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run(shell("exec sleep 30"), &cancel).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, ProcessError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_deadline_times_out_child() {
        let cancel = Cancellation::new().with_timeout(Some(Duration::from_millis(100)));
        let err = run(shell("exec sleep 30"), &cancel).unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(!cancel.is_cancelled());
    }
}
