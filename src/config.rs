/// Knobs of one detector run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Allocation and free calls are assumed not to race.
    pub assume_safe_malloc: bool,
    /// Ignore calls in blocks that end the program.
    pub ignore_termination_calls: bool,
    /// Bound on the uses a capture query explores before giving up; `None` is unbounded.
    pub max_uses_to_explore: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            assume_safe_malloc: true,
            ignore_termination_calls: true,
            max_uses_to_explore: None,
        }
    }
}

/// The environment variable holding extra command-line flags.
pub const FLAGS_ENV: &str = "RACEBUD_FLAGS";

/// The environment variable holding the log filter.
pub const LOG_ENV: &str = "RACEBUD_LOG";
