use std::fmt::{Display, Formatter};

/// Counters describing the work the engine did since it was created.
///
/// Returned by [`crate::Engine::diagnostics`]. Useful in tests to assert that
/// an operation did not recompute more than necessary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    /// Evaluation rounds, one per provider reaction.
    pub rounds: u64,
    /// Updater functions actually invoked.
    pub updater_invocations: u64,
    /// Helper computations started.
    pub helper_starts: u64,
    /// Fetch attempts started.
    pub fetch_starts: u64,
    /// Completions ignored because their attempt was superseded.
    pub stale_completions: u64,
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rounds, {} updaters, {} helpers, {} fetches, {} stale",
            self.rounds,
            self.updater_invocations,
            self.helper_starts,
            self.fetch_starts,
            self.stale_completions
        )
    }
}
