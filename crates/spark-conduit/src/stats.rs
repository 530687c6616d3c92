use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

/// 单条连接的吞吐统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub reads_completed: u64,
    pub writes_completed: u64,
    /// 观察到的出站在途字节峰值。
    pub peak_outgoing_bytes: usize,
    pub last_read_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    reads_completed: AtomicU64,
    writes_completed: AtomicU64,
    peak_outgoing_bytes: AtomicUsize,
    last_read_at: Mutex<Option<Instant>>,
}

impl StatsCell {
    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.reads_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_read_at.lock() = Some(Instant::now());
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_outgoing(&self, in_flight: usize) {
        self.peak_outgoing_bytes.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            reads_completed: self.reads_completed.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            peak_outgoing_bytes: self.peak_outgoing_bytes.load(Ordering::Relaxed),
            last_read_at: *self.last_read_at.lock(),
        }
    }
}
