//! Process resource accounting.
//!
//! CPU times are reported as deltas over the measured span; peak RSS is
//! cumulative from process start, which for a fresh worker process is the
//! execution itself.

use bifrost_workflow::execution::ResourceMetrics;

/// Point-in-time rusage reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusageSnapshot {
    pub max_rss_bytes: u64,
    pub user_seconds: f64,
    pub system_seconds: f64,
}

fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

/// Read cumulative usage for the current process.
pub fn snapshot() -> RusageSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return RusageSnapshot::default();
    }

    // ru_maxrss is kilobytes on Linux, bytes on macOS.
    let max_rss_bytes = if cfg!(target_os = "macos") {
        usage.ru_maxrss as u64
    } else {
        usage.ru_maxrss as u64 * 1024
    };

    RusageSnapshot {
        max_rss_bytes,
        user_seconds: timeval_seconds(usage.ru_utime),
        system_seconds: timeval_seconds(usage.ru_stime),
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Metrics since `start`, with CPU deltas and the current peak RSS.
pub fn capture_since(start: &RusageSnapshot) -> ResourceMetrics {
    let end = snapshot();
    let cpu_user = round4((end.user_seconds - start.user_seconds).max(0.0));
    let cpu_system = round4((end.system_seconds - start.system_seconds).max(0.0));
    ResourceMetrics {
        peak_memory_bytes: end.max_rss_bytes,
        cpu_user_seconds: cpu_user,
        cpu_system_seconds: cpu_system,
        cpu_total_seconds: round4(cpu_user + cpu_system),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_nonzero_rss() {
        let reading = snapshot();
        assert!(reading.max_rss_bytes > 0);
    }

    #[test]
    fn test_capture_since_yields_nonnegative_deltas() {
        let start = snapshot();
        // Burn a little CPU so the delta has a chance to be visible.
        let mut total = 0u64;
        for i in 0..200_000u64 {
            total = total.wrapping_add(i * i);
        }
        std::hint::black_box(total);

        let metrics = capture_since(&start);
        assert!(metrics.cpu_user_seconds >= 0.0);
        assert!(metrics.cpu_system_seconds >= 0.0);
        assert!(metrics.cpu_total_seconds >= metrics.cpu_user_seconds);
        assert!(metrics.peak_memory_bytes >= start.max_rss_bytes);
    }
}
