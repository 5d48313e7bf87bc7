//! Terminal progress for a running operation

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sx_core::OperationEvent;

use super::{Formatter, format_size};

/// A progress bar fed by one operation's events
///
/// Hidden when the formatter is quiet or in JSON mode, so callers can apply
/// events unconditionally.
pub struct OperationProgress {
    bar: Option<ProgressBar>,
}

impl OperationProgress {
    /// Create a bar; pass `group` when several operations render at once
    pub fn new(formatter: &Formatter, label: &str, group: Option<&MultiProgress>) -> Self {
        if !formatter.shows_progress() {
            return Self { bar: None };
        }

        let bar = match group {
            Some(multi) => multi.add(ProgressBar::new(100)),
            None => ProgressBar::new(100),
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(label.to_string());
        bar.set_message("queued");
        Self { bar: Some(bar) }
    }

    pub fn apply(&self, event: &OperationEvent) {
        let Some(bar) = &self.bar else {
            return;
        };

        match event {
            OperationEvent::Started { .. } => bar.set_message("starting"),
            OperationEvent::Progress {
                percent,
                status,
                bytes_per_sec,
                ..
            } => {
                bar.set_position(u64::from(*percent));
                if *bytes_per_sec > 0 {
                    bar.set_message(format!("{status} ({}/s)", format_size(*bytes_per_sec)));
                } else {
                    bar.set_message(status.clone());
                }
            }
            OperationEvent::Retrying {
                retry,
                delay_ms,
                code,
                ..
            } => bar.set_message(format!("retry {retry} in {delay_ms}ms after {code}")),
            OperationEvent::Settled { .. } | OperationEvent::Removed { .. } => {}
        }
    }

    pub fn set_message(&self, message: &'static str) {
        if let Some(bar) = &self.bar {
            bar.set_message(message);
        }
    }

    /// Clear the bar before the final result line is printed
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
