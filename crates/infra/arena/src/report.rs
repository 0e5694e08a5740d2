//! Textual statistics reports
//!
//! Layout follows the native memory summary:
//!
//! ```text
//! Test (reserved=2KB, committed=2KB)
//!      (arena=2KB #2) (at peak)
//! ```

use crate::arena::{ArenaHandle, ArenaStats};
use crate::registry::Stats;
use common::Scale;
use std::fmt::Write;

const DEFAULT_LABEL: &str = "Test";

/// Renders [`Stats`] at a fixed scale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsReporter {
    label: String,
    scale: Scale,
}

impl Default for StatisticsReporter {
    fn default() -> Self {
        Self::new(Scale::default())
    }
}

impl StatisticsReporter {
    /// Reporter with the default `Test` label
    pub fn new(scale: Scale) -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            scale,
        }
    }

    /// Replace the category label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Summary report
    pub fn format(&self, stats: &Stats) -> String {
        let mut out = format!(
            "{} (reserved={}, committed={})\n",
            self.label,
            self.amount(stats.reserved),
            self.amount(stats.committed)
        );
        self.indent(&mut out);
        let _ = write!(
            out,
            "(arena={} #{}) {}",
            self.amount(stats.committed),
            stats.live_count,
            self.peak(stats)
        );
        out
    }

    /// Summary report with signed deltas against `baseline`; zero deltas are
    /// left out
    pub fn format_diff(&self, baseline: &Stats, current: &Stats) -> String {
        let mut out = format!(
            "{} (reserved={}{}, committed={}{})\n",
            self.label,
            self.amount(current.reserved),
            self.delta(baseline.reserved, current.reserved),
            self.amount(current.committed),
            self.delta(baseline.committed, current.committed)
        );
        self.indent(&mut out);
        let _ = write!(
            out,
            "(arena={}{} #{}{}) {}",
            self.amount(current.committed),
            self.delta(baseline.committed, current.committed),
            current.live_count,
            count_delta(baseline.live_count, current.live_count),
            self.peak(current)
        );
        out
    }

    /// One-line detail for a single arena
    pub fn format_arena(&self, handle: ArenaHandle, stats: &ArenaStats) -> String {
        format!(
            "{handle} (reserved={}, committed={}, peak={}, growths={}, allocations={})",
            self.amount(stats.reserved),
            self.amount(stats.committed),
            self.amount(stats.peak_committed),
            stats.growth_count,
            stats.allocation_count
        )
    }

    fn amount(&self, bytes: u64) -> String {
        format!("{}{}", self.scale.apply(bytes), self.scale.unit())
    }

    fn peak(&self, stats: &Stats) -> String {
        if stats.is_at_peak() {
            "(at peak)".to_string()
        } else {
            format!(
                "(peak={} #{})",
                self.amount(stats.peak_committed),
                stats.peak_count
            )
        }
    }

    fn delta(&self, before: u64, after: u64) -> String {
        let diff = i128::from(after) - i128::from(before);
        // Truncates toward zero, like the absolute values
        let scaled = diff / i128::from(self.scale.divisor());
        if scaled == 0 {
            String::new()
        } else {
            format!(" {scaled:+}{}", self.scale.unit())
        }
    }

    // Second line starts under the opening parenthesis of the first
    fn indent(&self, out: &mut String) {
        let width = self.label.chars().count() + 1;
        out.extend(std::iter::repeat_n(' ', width));
    }
}

fn count_delta(before: usize, after: usize) -> String {
    // SAFETY: arena counts are far below i64::MAX
    let diff = after as i64 - before as i64;
    if diff == 0 {
        String::new()
    } else {
        format!(" {diff:+}")
    }
}

/// Render `stats` at `scale` with the default label
pub fn format(stats: &Stats, scale: Scale) -> String {
    StatisticsReporter::new(scale).format(stats)
}
