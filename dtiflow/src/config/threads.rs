//! Thread-count hint for multi-threaded external tools.

use tracing::debug;

/// Default hint for a machine with `cores` logical CPUs.
///
/// Leaves two cores free on machines with more than four.
#[must_use]
pub fn default_thread_count(cores: usize) -> usize {
    if cores > 4 {
        cores - 2
    } else {
        cores.max(1)
    }
}

/// Lowers `base` by the cores already busy according to the load average.
#[must_use]
pub fn load_adjusted_thread_count(base: usize, cores: usize, load_average: Option<f64>) -> usize {
    let Some(load) = load_average.filter(|l| l.is_finite() && *l >= 0.0) else {
        return base.max(1);
    };
    let busy = load.round() as usize;
    let idle = cores.saturating_sub(busy);
    base.min(idle).max(1)
}

/// Parses the 1-minute load average from `/proc/loadavg` (Linux only).
#[must_use]
pub fn read_load_average() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Resolves the thread hint: explicit override wins, otherwise the default
/// reduced by current system load.
#[must_use]
pub fn resolve_thread_count(override_threads: Option<usize>) -> usize {
    if let Some(n) = override_threads.filter(|n| *n > 0) {
        return n;
    }
    let cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    let load = read_load_average();
    let threads = load_adjusted_thread_count(default_thread_count(cores), cores, load);
    debug!(cores, ?load, threads, "Resolved thread-count hint");
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thread_count() {
        assert_eq!(default_thread_count(16), 14);
        assert_eq!(default_thread_count(5), 3);
        assert_eq!(default_thread_count(4), 4);
        assert_eq!(default_thread_count(1), 1);
        assert_eq!(default_thread_count(0), 1);
    }

    #[test]
    fn test_load_adjustment() {
        assert_eq!(load_adjusted_thread_count(14, 16, None), 14);
        assert_eq!(load_adjusted_thread_count(14, 16, Some(0.2)), 14);
        assert_eq!(load_adjusted_thread_count(14, 16, Some(6.0)), 10);
        assert_eq!(load_adjusted_thread_count(14, 16, Some(40.0)), 1);
        assert_eq!(load_adjusted_thread_count(14, 16, Some(f64::NAN)), 14);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(resolve_thread_count(Some(3)), 3);
        assert!(resolve_thread_count(Some(0)) >= 1);
    }
}
