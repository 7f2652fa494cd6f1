//! Progress reporting for bulk writes

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives progress of a long-running bulk operation
pub trait Progress: Send + Sync {
    fn start(&self, total: u64);
    fn advance(&self, n: u64);
    fn finish(&self);
}

/// Discards all progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _total: u64) {}
    fn advance(&self, _n: u64) {}
    fn finish(&self) {}
}

/// Progress bar drawn to stderr
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} records ({elapsed})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    /// A bar that never draws, used when logs go out as JSON
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Pick a visible bar unless the log output is machine-readable
    pub fn for_log_format(label: &str, log_format: &str) -> Self {
        if log_format.eq_ignore_ascii_case("json") {
            Self::hidden()
        } else {
            Self::new(label)
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Progress for BarProgress {
    fn start(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn advance(&self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_tracks_position() {
        let progress = BarProgress::hidden();
        progress.start(10);
        progress.advance(3);
        progress.advance(4);
        assert_eq!(progress.position(), 7);
        progress.finish();
    }

    #[test]
    fn test_json_log_format_hides_bar() {
        let progress = BarProgress::for_log_format("catalog", "JSON");
        assert!(progress.bar.is_hidden());
    }

    #[test]
    fn test_no_progress_is_inert() {
        let progress = NoProgress;
        progress.start(5);
        progress.advance(5);
        progress.finish();
    }
}
