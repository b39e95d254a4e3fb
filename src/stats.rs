//! Dataplane statistics
//!
//! Worker threads bump lock-free counters; callers read a consistent-enough
//! snapshot at any time without stopping traffic. Snapshots are plain value
//! types so they can be logged or diffed freely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of segmenter send-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    /// Datagrams handed to the kernel
    pub datagram_count: u64,

    /// Send calls that failed
    pub error_count: u64,

    /// OS errno of the most recent failure, 0 if none
    pub last_errno: i32,
}

impl SendStats {
    pub fn summary(&self) -> String {
        format!(
            "datagrams: {} | errors: {} | last errno: {}",
            self.datagram_count, self.error_count, self.last_errno
        )
    }
}

/// Snapshot of sync-thread counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sync messages sent
    pub msg_count: u64,

    /// Sync sends that failed
    pub error_count: u64,

    /// OS errno of the most recent failure, 0 if none
    pub last_errno: i32,
}

/// Snapshot of reassembler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvStats {
    /// Events fully reassembled and delivered to the completed queue
    pub event_success: u64,

    /// Completed events dropped because the completed queue was full
    pub enqueue_loss: u64,

    /// Partial events abandoned after the reassembly timeout
    pub event_timeout_count: u64,

    /// Datagrams rejected as malformed or inconsistent
    pub data_err_count: u64,

    /// Failed control plane state reports
    pub cp_err_count: u64,

    /// OS errno of the most recent socket failure, 0 if none
    pub last_errno: i32,
}

impl RecvStats {
    pub fn summary(&self) -> String {
        format!(
            "events: {} | timeouts: {} | queue drops: {} | data errors: {} | cp errors: {}",
            self.event_success,
            self.event_timeout_count,
            self.enqueue_loss,
            self.data_err_count,
            self.cp_err_count
        )
    }
}

/// Shared send-side accumulator.
#[derive(Debug, Default)]
pub(crate) struct SendCounters {
    datagram_count: AtomicU64,
    error_count: AtomicU64,
    last_errno: AtomicI32,
}

impl SendCounters {
    pub(crate) fn record_datagram(&self) {
        self.datagram_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, err: &std::io::Error) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = err.raw_os_error() {
            self.last_errno.store(errno, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SendStats {
        SendStats {
            datagram_count: self.datagram_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_errno: self.last_errno.load(Ordering::Relaxed),
        }
    }
}

/// Shared sync-thread accumulator.
#[derive(Debug, Default)]
pub(crate) struct SyncCounters {
    msg_count: AtomicU64,
    error_count: AtomicU64,
    last_errno: AtomicI32,
}

impl SyncCounters {
    pub(crate) fn record_msg(&self) {
        self.msg_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, err: &std::io::Error) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = err.raw_os_error() {
            self.last_errno.store(errno, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SyncStats {
        SyncStats {
            msg_count: self.msg_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_errno: self.last_errno.load(Ordering::Relaxed),
        }
    }
}

/// Shared receive-side accumulator.
#[derive(Debug, Default)]
pub(crate) struct RecvCounters {
    event_success: AtomicU64,
    enqueue_loss: AtomicU64,
    event_timeout_count: AtomicU64,
    data_err_count: AtomicU64,
    cp_err_count: AtomicU64,
    last_errno: AtomicI32,
}

impl RecvCounters {
    pub(crate) fn record_event_success(&self) {
        self.event_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueue_loss(&self) {
        self.enqueue_loss.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_timeout(&self) {
        self.event_timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_data_err(&self) {
        self.data_err_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cp_err(&self) {
        self.cp_err_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_socket_error(&self, err: &std::io::Error) {
        if let Some(errno) = err.raw_os_error() {
            self.last_errno.store(errno, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> RecvStats {
        RecvStats {
            event_success: self.event_success.load(Ordering::Relaxed),
            enqueue_loss: self.enqueue_loss.load(Ordering::Relaxed),
            event_timeout_count: self.event_timeout_count.load(Ordering::Relaxed),
            data_err_count: self.data_err_count.load(Ordering::Relaxed),
            cp_err_count: self.cp_err_count.load(Ordering::Relaxed),
            last_errno: self.last_errno.load(Ordering::Relaxed),
        }
    }
}

/// Sliding window of per-period event counts, used by the sync thread to
/// advertise a smoothed rate.
#[derive(Debug)]
pub(crate) struct RateWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl RateWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record the number of events sent during one period.
    pub(crate) fn push(&mut self, count: u64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(count);
    }

    /// Average event rate over the window, in Hz.
    pub(crate) fn average_hz(&self, period: Duration) -> u32 {
        if self.samples.is_empty() || period.is_zero() {
            return 0;
        }
        let total: u64 = self.samples.iter().sum();
        let span = period.as_secs_f64() * self.samples.len() as f64;
        (total as f64 / span).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_counters_snapshot() {
        let counters = SendCounters::default();
        counters.record_datagram();
        counters.record_datagram();
        counters.record_error(&std::io::Error::from_raw_os_error(111));

        let snap = counters.snapshot();
        assert_eq!(snap.datagram_count, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.last_errno, 111);
    }

    #[test]
    fn test_rate_window_average() {
        let mut window = RateWindow::new(3);
        assert_eq!(window.average_hz(Duration::from_secs(1)), 0);

        window.push(100);
        window.push(200);
        assert_eq!(window.average_hz(Duration::from_secs(1)), 150);

        // window keeps only the newest three samples
        window.push(300);
        window.push(400);
        assert_eq!(window.average_hz(Duration::from_secs(1)), 300);

        // 300 events per 100ms period averages to 3000 Hz
        let mut window = RateWindow::new(4);
        window.push(300);
        assert_eq!(window.average_hz(Duration::from_millis(100)), 3000);
    }
}
