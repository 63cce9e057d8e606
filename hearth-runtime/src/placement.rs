//! Worker selection for unpinned services.

/// Snapshot of one worker's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLoad {
    /// Live services.
    pub count: u32,
    /// Eligible for unpinned placement. A worker stops being shared when a
    /// service is pinned to it and becomes shared again once empty.
    pub shared: bool,
}

/// Index of the least-loaded shared worker; if none is shared, the
/// least-loaded worker overall. Ties go to the lowest index.
#[must_use]
pub fn pick_worker(loads: &[WorkerLoad]) -> usize {
    loads
        .iter()
        .enumerate()
        .filter(|(_, w)| w.shared)
        .min_by_key(|(_, w)| w.count)
        .or_else(|| loads.iter().enumerate().min_by_key(|(_, w)| w.count))
        .map_or(0, |(i, _)| i)
}
