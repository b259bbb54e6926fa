//! Collection diagnostics

use std::time::Duration;

use crate::roots::RootSetCounts;

/// Timings and counts of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Epoch this cycle completed
    pub epoch: u64,
    /// Time since the previous cycle finished, `None` for the first cycle
    pub since_last_gc: Option<Duration>,
    /// Time to stop the world
    pub suspend_time: Duration,
    /// Time to enumerate roots
    pub root_set_time: Duration,
    /// Time to mark
    pub mark_time: Duration,
    /// Time to sweep
    pub sweep_time: Duration,
    /// Time to release the world
    pub resume_time: Duration,
    /// Total stop-the-world pause, suspension included
    pub pause: Duration,
    /// Roots per source
    pub roots: RootSetCounts,
    /// Live objects before sweep
    pub objects_before: usize,
    /// Objects scanned by the marker
    pub marked: usize,
    /// Objects freed outright
    pub collected: usize,
    /// Objects queued for finalization
    pub to_finalize: usize,
    /// Live objects after sweep
    pub remaining: usize,
}

/// Cumulative statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed cycles
    pub collections: u64,
    /// Requests that found another cycle in progress
    pub aborted_requests: u64,
    /// Objects freed outright, over all cycles
    pub total_collected: u64,
    /// Objects finalized, over all cycles
    pub total_finalized: u64,
    /// Pause of the last cycle
    pub last_pause: Duration,
    /// Longest pause seen
    pub max_pause: Duration,
    /// Sum of all pauses
    pub total_pause: Duration,
    /// Report of the last completed cycle
    pub last_report: Option<CycleReport>,
}

impl GcStats {
    pub(crate) fn record_cycle(&mut self, report: &CycleReport) {
        self.collections += 1;
        self.total_collected += report.collected as u64;
        self.last_pause = report.pause;
        self.max_pause = self.max_pause.max(report.pause);
        self.total_pause += report.pause;
        self.last_report = Some(report.clone());
    }

    pub(crate) fn record_finalized(&mut self, count: usize) {
        self.total_finalized += count as u64;
    }

    /// Mean pause over completed cycles
    pub fn average_pause(&self) -> Duration {
        match u32::try_from(self.collections) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_pause / n,
            Err(_) => Duration::from_nanos(
                (self.total_pause.as_nanos() / u128::from(self.collections)) as u64,
            ),
        }
    }
}

/// Receives collection events.
///
/// Called on the collecting thread after the world resumes. Implementations must not block.
pub trait GcObserver: Send + Sync {
    /// A cycle finished
    fn on_cycle_complete(&self, report: &CycleReport);

    /// A request was dropped because another thread was already collecting
    fn on_cycle_aborted(&self, _epoch: u64) {}

    /// Finalizers queued by a cycle ran
    fn on_finalizers_run(&self, _count: usize, _elapsed: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_cycle() {
        let mut stats = GcStats::default();
        assert_eq!(stats.average_pause(), Duration::ZERO);

        for (epoch, pause_ms) in [(0u64, 4u64), (1, 2)] {
            stats.record_cycle(&CycleReport {
                epoch,
                pause: Duration::from_millis(pause_ms),
                collected: 10,
                ..CycleReport::default()
            });
        }
        stats.record_finalized(3);

        assert_eq!(stats.collections, 2);
        assert_eq!(stats.total_collected, 20);
        assert_eq!(stats.total_finalized, 3);
        assert_eq!(stats.last_pause, Duration::from_millis(2));
        assert_eq!(stats.max_pause, Duration::from_millis(4));
        assert_eq!(stats.average_pause(), Duration::from_millis(3));
        assert_eq!(stats.last_report.map(|r| r.epoch), Some(1));
    }
}
