//! Observability and Metrics
//!
//! Atomic counters describing link and channel activity. A `LinkMetrics`
//! instance is created by whoever owns a group of peers (typically the server)
//! and handed to each peer as an `Arc`; there is no process-wide instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters shared by every peer of one endpoint
#[derive(Debug)]
pub struct LinkMetrics {
    /// Total links established
    pub links_total: AtomicU64,
    /// Currently live links
    pub links_active: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Frames received
    pub frames_received: AtomicU64,
    /// Payload bytes written
    pub bytes_sent: AtomicU64,
    /// Payload bytes received
    pub bytes_received: AtomicU64,
    /// Channels that reached the open state
    pub channels_opened: AtomicU64,
    /// Open attempts rejected by either side
    pub channels_rejected: AtomicU64,
    /// Tracked requests registered
    pub requests_tracked: AtomicU64,
    /// Tracked requests that hit their deadline
    pub requests_timed_out: AtomicU64,
    /// Data messages dropped for a channel that was not open
    pub messages_dropped: AtomicU64,
    /// Links closed for a protocol violation
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            links_total: AtomicU64::new(0),
            links_active: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_rejected: AtomicU64::new(0),
            requests_tracked: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn link_up(&self) {
        self.links_total.fetch_add(1, Ordering::Relaxed);
        self.links_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_down(&self) {
        self.links_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_rejected(&self) {
        self.channels_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_tracked(&self) {
        self.requests_tracked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_timed_out(&self, count: usize) {
        self.requests_timed_out
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            links_total: self.links_total.load(Ordering::Relaxed),
            links_active: self.links_active.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_rejected: self.channels_rejected.load(Ordering::Relaxed),
            requests_tracked: self.requests_tracked.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            links_total = snapshot.links_total,
            links_active = snapshot.links_active,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            channels_opened = snapshot.channels_opened,
            channels_rejected = snapshot.channels_rejected,
            requests_tracked = snapshot.requests_tracked,
            requests_timed_out = snapshot.requests_timed_out,
            messages_dropped = snapshot.messages_dropped,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Link metrics snapshot"
        );
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub links_total: u64,
    pub links_active: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub channels_opened: u64,
    pub channels_rejected: u64,
    pub requests_tracked: u64,
    pub requests_timed_out: u64,
    pub messages_dropped: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}
