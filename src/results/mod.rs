//! Result consolidation and reporting
//!
//! Artifact collection, the result merger and the end-of-run summary.

mod artifacts;
mod merger;
pub mod xml;

pub use artifacts::copy_artifacts;
pub use merger::{merge_results, missing_output_units, MergeOutcome, MergeStats};

use std::fmt;
use std::time::Duration;

/// Human-readable elapsed time, e.g. `1 hour 2 minutes 3.45 seconds`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let centis = (elapsed.subsec_millis() / 10) as u64;
    let seconds = total % 60;
    let minutes = (total / 60) % 60;
    let hours = total / 3600;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours} hour{} ", plural(hours)));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes} minute{} ", plural(minutes)));
    }
    out.push_str(&format!("{seconds}.{centis:02} seconds"));
    out
}

fn plural(n: u64) -> &'static str {
    if n > 1 {
        "s"
    } else {
        ""
    }
}

impl fmt::Display for MergeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests, {} passed, {} failed, {} skipped.",
            self.total, self.passed, self.failed, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_millis(3450)), "3.45 seconds");
        assert_eq!(
            format_elapsed(Duration::from_secs(62)),
            "1 minute 2.00 seconds"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(2 * 3600 + 120 + 5)),
            "2 hours 2 minutes 5.00 seconds"
        );
    }

    #[test]
    fn stats_display() {
        let stats = MergeStats {
            total: 4,
            passed: 2,
            failed: 1,
            skipped: 1,
        };
        assert_eq!(stats.to_string(), "4 tests, 2 passed, 1 failed, 1 skipped.");
    }
}
