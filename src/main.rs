#[macro_use]
extern crate clap;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, Command};
use log::{error, info, warn, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    filter::threshold::ThresholdFilter,
};

use rusty_archiver::{Backup, Cancellation, Configuration, Registry, Restore};

const CONFIG_FILE_NAME: &str = "rusty-archiver.conf";

struct Arguments {
    backup_settings_file: String,
    mode: String,
    jobs: Option<usize>,
    verbose: bool,
}

async fn start_main(arguments: Arguments) -> bool {
    let mut configuration = match Configuration::load(arguments.backup_settings_file.as_str()) {
        Ok(configuration) => configuration,
        Err(why) => {
            error!("Error: {}", why);
            return false;
        }
    };
    if let Some(jobs) = arguments.jobs {
        configuration.jobs = jobs.max(1);
    }

    let adapters = match Registry::default().build(&configuration) {
        Ok(adapters) => adapters,
        Err(why) => {
            error!("{}", why);
            return false;
        }
    };

    let cancel = Cancellation::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling the running archives");
            interrupt.cancel();
        }
    });

    match arguments.mode.as_str() {
        "backup" => match Backup::new(adapters).run(&configuration, &cancel).await {
            Ok(report) => {
                report.log_summary();
                report.is_success()
            }
            Err(why) => {
                error!("{}", why);
                false
            }
        },
        "restore" => match Restore::new(adapters).run(&configuration, &cancel).await {
            Ok(report) => {
                report.log_summary();
                report.is_success()
            }
            Err(why) => {
                error!("{}", why);
                false
            }
        },
        mode => {
            error!("invalid mode: {}", mode);
            false
        }
    }
}

fn init_logging(verbose: bool) -> Result<(), String> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let stderr = ConsoleAppender::builder().target(Target::Stderr).build();

    let config = Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(stderr)),
        )
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|why| why.to_string())?;
    log4rs::init_config(config).map_err(|why| why.to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = command().get_matches();
    if let Err(why) = init_logging(matches.get_flag("verbose")) {
        eprintln!("unable to initialize logging: {}", why);
        process::exit(1);
    }

    let arguments = match get_arguments(&matches) {
        Ok(arguments) => arguments,
        Err(why) => {
            error!("{}", why);
            process::exit(1);
        }
    };
    info!(
        "rusty-archiver {} ({} mode, verbose: {})",
        crate_version!(),
        arguments.mode,
        arguments.verbose
    );

    if !start_main(arguments).await {
        process::exit(1);
    }
}

fn command() -> Command {
    Command::new("rusty-archiver")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Creates, encrypts and ships backup archives of directories and databases.")
        .arg(
            Arg::new("backup-settings-file")
                .short('s')
                .long("backup-settings-file")
                .value_name("FILE")
                .help("The file, where to load the backup settings (default: backup_settings.xml)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Specify a config file from where to read settings"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .value_parser(["backup", "restore"])
                .help("backup (default) or restore"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("How many archives are processed at the same time"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log debug messages"),
        )
}

/// Looks for a config file in the working directory, the home directory and
/// `/etc`, in this order.
fn find_config_file(explicit: Option<&String>) -> Result<Option<PathBuf>, String> {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

    if let Some(file) = explicit {
        let normalized = match file.strip_prefix("~/") {
            Some(rest) => home_dir.join(rest),
            None => PathBuf::from(file),
        };
        if !normalized.exists() {
            return Err(format!("config file '{}' doesn't exist.", file));
        }
        return Ok(Some(normalized));
    }

    let candidates = [
        PathBuf::from(CONFIG_FILE_NAME),
        home_dir.join(CONFIG_FILE_NAME),
        Path::new("/etc").join(CONFIG_FILE_NAME),
    ];
    Ok(candidates.into_iter().find(|candidate| candidate.exists()))
}

/// Reads `key = value` lines. Unknown keys and lines without `=` are skipped.
fn read_config_file(path: &Path) -> Vec<(String, String)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(why) => {
            warn!("unable to read {}: {}", path.display(), why);
            return Vec::new();
        }
    };

    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn get_arguments(matches: &clap::ArgMatches) -> Result<Arguments, String> {
    let mut backup_settings_file = String::from("backup_settings.xml");
    let mut mode = String::from("backup");
    let mut jobs = None;

    if let Some(file_name) = find_config_file(matches.get_one::<String>("config"))? {
        info!("read setting from {}", file_name.display());
        for (key, value) in read_config_file(&file_name) {
            match key.as_str() {
                "backup_settings_file" => backup_settings_file = value,
                "mode" => mode = value,
                "jobs" => match value.parse::<usize>() {
                    Ok(value) => jobs = Some(value),
                    Err(_) => warn!("ignoring invalid jobs value '{}'", value),
                },
                _ => (),
            }
        }
    }

    if let Some(file) = matches.get_one::<String>("backup-settings-file") {
        backup_settings_file = file.clone();
    }
    if let Some(value) = matches.get_one::<String>("mode") {
        mode = value.clone();
    }
    if let Some(value) = matches.get_one::<usize>("jobs") {
        jobs = Some(*value);
    }

    Ok(Arguments {
        backup_settings_file,
        mode,
        jobs,
        verbose: matches.get_flag("verbose"),
    })
}
