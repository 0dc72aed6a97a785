use std::collections::VecDeque;
use std::io::Write;
use std::ops::Sub;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::formatter::Formatter;

pub mod process;

pub struct ProgressStats {
    pub total_length: Option<usize>,
    pub progressed_size: usize,
    finished: bool,
    start_time: Instant,
    time_series: VecDeque<(Instant, usize)>,
}

impl ProgressStats {
    pub fn new() -> ProgressStats {
        ProgressStats {
            total_length: None,
            progressed_size: 0,
            finished: false,
            start_time: Instant::now(),
            time_series: VecDeque::new(),
        }
    }

    pub fn add_progressed_size(&mut self, size: usize) {
        self.progressed_size += size;
        self.time_series.push_back((Instant::now(), size));
        while let Some(tuple) = self.time_series.front() {
            if Instant::now().sub(tuple.0) > Duration::from_secs(10) {
                self.time_series.pop_front();
            } else {
                break;
            }
        }
    }

    fn get_formatted_duration(duration: Duration) -> String {
        let seconds = duration.as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds / 60) % 60,
            seconds % 60
        )
    }

    pub fn get_formatted_ete(&self) -> Option<String> {
        self.get_ete().map(Self::get_formatted_duration)
    }

    pub fn get_formatted_runtime(&self) -> String {
        Self::get_formatted_duration(self.get_runtime())
    }

    /// Gets the average transfer speed in Bytes per second.
    pub fn get_average_speed(&self) -> usize {
        let total_seconds = self.get_runtime().as_secs_f64();
        if total_seconds <= 0.0 {
            return 0;
        }
        (self.progressed_size as f64 / total_seconds) as usize
    }

    /// Gets the average transfer speed of the last 10 seconds in Bytes per second.
    pub fn get_average_speed_for_last_10_seconds(&self) -> usize {
        let seconds = 10;
        let now = Instant::now();
        let mut bytes_progressed = 0_usize;
        let mut first_found_progressed_time = None;
        for tuple in &self.time_series {
            if now.sub(tuple.0) > Duration::from_secs(seconds) {
                continue;
            }
            if first_found_progressed_time.is_none() {
                first_found_progressed_time = Some(tuple.0);
            }
            bytes_progressed += tuple.1;
        }

        let last_seconds = match first_found_progressed_time {
            Some(time) => now.sub(time).as_secs().max(1),
            None => seconds,
        };

        bytes_progressed / last_seconds as usize
    }

    pub fn get_progress_in_percentage(&self) -> Option<f64> {
        match self.total_length {
            Some(0) => Some(100.0),
            Some(total_length) => Some(self.progressed_size as f64 * 100.0 / total_length as f64),
            None => None,
        }
    }

    pub fn get_runtime(&self) -> Duration {
        Instant::now().sub(self.start_time)
    }

    /// Gets the "Estimated Time Enroute".
    pub fn get_ete(&self) -> Option<Duration> {
        let total_duration = self.get_total_duration()?;
        let runtime = self.get_runtime();
        if total_duration > runtime {
            Some(total_duration.sub(runtime))
        } else {
            Some(Duration::from_secs(0))
        }
    }

    pub fn get_total_duration(&self) -> Option<Duration> {
        let percentage = self.get_progress_in_percentage()?;
        if percentage > 0.0 {
            Some(self.get_runtime().mul_f64(100.0 / percentage))
        } else {
            None
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_finished(&mut self) {
        self.finished = true;
    }

    fn describe(&self, label: &str) -> String {
        let mut output_string = format!("{}... ", label);
        output_string.push_str(Formatter::format_size(self.progressed_size, 2).as_str());
        if let Some(content_length) = self.total_length {
            output_string.push_str(
                format!(
                    "/{} ({number:.2}%)",
                    Formatter::format_size(content_length, 2),
                    number = self.get_progress_in_percentage().unwrap_or_default()
                )
                .as_str(),
            );
        }
        output_string.push_str(format!("; runtime: {}", self.get_formatted_runtime()).as_str());
        if let Some(formatted_ete) = self.get_formatted_ete() {
            output_string.push_str(format!("; ete: {}", formatted_ete).as_str());
        }
        output_string.push_str(
            format!(
                "; speed: {}/s; speed (<=10s): {}/s",
                Formatter::format_size(self.get_average_speed(), 2),
                Formatter::format_size(self.get_average_speed_for_last_10_seconds(), 2)
            )
            .as_str(),
        );
        output_string
    }
}

/// Redraws the progress line of `stats` on stdout until it is marked finished.
pub fn spawn_progress_printer(stats: Arc<Mutex<ProgressStats>>, label: String) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let finished = match stats.lock() {
            Ok(stats) => {
                print!("{}\r{}", termion::clear::CurrentLine, stats.describe(&label));
                std::io::stdout().flush().unwrap_or_default();
                stats.is_finished()
            }
            Err(_) => true,
        };

        if finished {
            println!();
            break;
        }

        thread::sleep(Duration::from_millis(250));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut stats = ProgressStats::new();
        assert_eq!(stats.get_progress_in_percentage(), None);

        stats.total_length = Some(200);
        stats.add_progressed_size(50);
        assert_eq!(stats.get_progress_in_percentage(), Some(25.0));
        assert!(stats.get_ete().is_some());
    }

    #[test]
    fn test_formatted_duration() {
        assert_eq!(
            ProgressStats::get_formatted_duration(Duration::from_secs(3_723)),
            "01:02:03"
        );
    }
}
