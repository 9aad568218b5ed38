//! Build progress reporting.

/// Phases reported during an index build, in order of appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Initializing,
    PerformingKmeans,
    AssigningTuples,
    LoadingTuples,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Initializing => "initializing",
            BuildPhase::PerformingKmeans => "performing k-means",
            BuildPhase::AssigningTuples => "assigning tuples",
            BuildPhase::LoadingTuples => "loading tuples",
        }
    }
}

/// Sink for build progress. The host wires this to its progress views;
/// tests use recording sinks to assert phase ordering.
pub trait ProgressSink: Send + Sync {
    fn phase(&self, _phase: BuildPhase) {}

    /// `done` tuples out of `total` (when the total is known) within the
    /// current phase.
    fn update(&self, _done: u64, _total: Option<u64>) {}
}

/// Progress sink that logs phase transitions via `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn phase(&self, phase: BuildPhase) {
        tracing::info!(phase = phase.as_str(), "build phase");
    }

    fn update(&self, done: u64, total: Option<u64>) {
        if let Some(total) = total {
            tracing::debug!(done, total, "build progress");
        } else {
            tracing::debug!(done, "build progress");
        }
    }
}

/// Sink that discards all reports.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(BuildPhase::Initializing.as_str(), "initializing");
        assert_eq!(BuildPhase::PerformingKmeans.as_str(), "performing k-means");
        assert_eq!(BuildPhase::AssigningTuples.as_str(), "assigning tuples");
        assert_eq!(BuildPhase::LoadingTuples.as_str(), "loading tuples");
    }
}
