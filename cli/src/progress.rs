use std::sync::Arc;
use std::time::Duration;

use colored::*;
use huntlog_core::{ScanEventSink, SinkRef};
use indicatif::{ProgressBar, ProgressStyle};

/// Scan events rendered as a progress bar, with log lines printed above it.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub fn new_ref() -> (Arc<Self>, SinkRef) {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        let sink = Arc::new(Self { bar });
        let erased: SinkRef = sink.clone();
        (sink, erased)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ScanEventSink for ProgressSink {
    fn on_log(&self, level: &str, message: &str) {
        let line = match level {
            "success" => message.green().to_string(),
            "error" => message.red().to_string(),
            "warn" => message.yellow().to_string(),
            "phase" => message.bright_cyan().bold().to_string(),
            _ => message.dimmed().to_string(),
        };
        self.bar.println(line);
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(phase.to_string());
    }
}
