use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = 1_048_576;

/// Human wording for a byte count: plain bytes below 1 KB, then whole KB,
/// then whole MB.
pub fn format_size(bytes: u64) -> String {
    if bytes < KB {
        format!("{} bytes", bytes)
    } else if bytes < MB {
        format!("{} KB", (bytes as f64 / KB as f64).round() as u64)
    } else {
        format!("{} MB", (bytes as f64 / MB as f64).round() as u64)
    }
}

/// Seconds left at the average rate observed so far.
///
/// `None` while the total is unknown or there is nothing to average yet.
pub fn estimate_remaining(received: u64, total: Option<u64>, elapsed: Duration) -> Option<f64> {
    let total = total.filter(|t| *t > 0)?;
    let elapsed_secs = elapsed.as_secs();
    if elapsed_secs == 0 || received == 0 {
        return None;
    }

    let rate = received as f64 / elapsed_secs as f64;
    Some(total.saturating_sub(received) as f64 / rate)
}

pub fn format_eta(remaining_secs: f64) -> String {
    if remaining_secs > 7200.0 {
        let hours = (remaining_secs / 3600.0 + 0.5) as u64;
        if hours > 1 {
            format!("about {} hours", hours)
        } else {
            "about one hour".to_string()
        }
    } else if remaining_secs > 60.0 {
        let minutes = (remaining_secs / 60.0 + 0.5) as u64;
        if minutes > 1 {
            format!("{} minutes", minutes)
        } else {
            "1 minute".to_string()
        }
    } else {
        let seconds = (remaining_secs + 0.5) as u64;
        if seconds > 1 {
            format!("{} seconds", seconds)
        } else {
            "1 second".to_string()
        }
    }
}

pub fn progress_message(received: u64, total: Option<u64>, elapsed: Duration) -> String {
    let remaining = estimate_remaining(received, total, elapsed)
        .map(format_eta)
        .unwrap_or_else(|| "unknown".to_string());

    match total.filter(|t| *t > 0) {
        Some(total) => format!(
            "Downloading updates ({} of {}) | Time remaining: {}",
            format_size(received),
            format_size(total),
            remaining
        ),
        None => format!("Downloading updates... | Time remaining: {}", remaining),
    }
}

/// Terminal rendering of a single transfer.
pub struct TransferProgress {
    pb: ProgressBar,
}

impl TransferProgress {
    pub fn stderr() -> Self {
        let pb = ProgressBar::new(0);
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        Self::styled(pb)
    }

    pub fn hidden() -> Self {
        Self::styled(ProgressBar::hidden())
    }

    fn styled(pb: ProgressBar) -> Self {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { pb }
    }

    pub fn reset(&self) {
        self.pb.reset();
        self.pb.set_length(0);
        self.pb.set_position(0);
        self.pb.set_message("Downloading updates | Time remaining: unknown");
    }

    pub fn update(&self, received: u64, total: Option<u64>, elapsed: Duration) {
        match total.filter(|t| *t > 0) {
            Some(total) => {
                self.pb.set_length(total);
                self.pb.set_position(received.min(total));
            }
            None => self.pb.tick(),
        }
        self.pb.set_message(progress_message(received, total, elapsed));
    }

    pub fn finish(&self, message: String) {
        self.pb.finish_with_message(message);
    }

    pub fn abandon(&self, message: String) {
        self.pb.abandon_with_message(message);
    }
}
