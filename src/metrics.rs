//! Process-wide engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::FrameBody;
use crate::types::Performative;

/// Records engine activity in lock-free counters.
pub(crate) struct Metrics;

static FRAMES_IN: AtomicU64 = AtomicU64::new(0);
static FRAMES_OUT: AtomicU64 = AtomicU64::new(0);
static BYTES_IN: AtomicU64 = AtomicU64::new(0);
static BYTES_OUT: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS_IN: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS_OUT: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_SENT: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static ENGINE_FAILURES: AtomicU64 = AtomicU64::new(0);
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static LARGEST_FRAME: AtomicU64 = AtomicU64::new(0);

struct PerformativeCounters {
    open: AtomicU64,
    begin: AtomicU64,
    attach: AtomicU64,
    flow: AtomicU64,
    transfer: AtomicU64,
    disposition: AtomicU64,
    detach: AtomicU64,
    end: AtomicU64,
    close: AtomicU64,
    sasl: AtomicU64,
}

static PERFORMATIVE_COUNTERS: PerformativeCounters = PerformativeCounters::new();

impl PerformativeCounters {
    const fn new() -> Self {
        Self {
            open: AtomicU64::new(0),
            begin: AtomicU64::new(0),
            attach: AtomicU64::new(0),
            flow: AtomicU64::new(0),
            transfer: AtomicU64::new(0),
            disposition: AtomicU64::new(0),
            detach: AtomicU64::new(0),
            end: AtomicU64::new(0),
            close: AtomicU64::new(0),
            sasl: AtomicU64::new(0),
        }
    }

    fn increment(&self, body: &FrameBody) {
        let counter = match body {
            FrameBody::Sasl(_) => &self.sasl,
            FrameBody::Amqp(performative) => match performative {
                Performative::Open(_) => &self.open,
                Performative::Begin(_) => &self.begin,
                Performative::Attach(_) => &self.attach,
                Performative::Flow(_) => &self.flow,
                Performative::Transfer(_) => &self.transfer,
                Performative::Disposition(_) => &self.disposition,
                Performative::Detach(_) => &self.detach,
                Performative::End(_) => &self.end,
                Performative::Close(_) => &self.close,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Direction a frame travelled.
#[derive(Clone, Copy)]
pub(crate) enum FrameDirection {
    Inbound,
    Outbound,
}

impl Metrics {
    #[inline]
    pub(crate) fn record_frame(direction: FrameDirection, body: &FrameBody) {
        match direction {
            FrameDirection::Inbound => FRAMES_IN.fetch_add(1, Ordering::Relaxed),
            FrameDirection::Outbound => FRAMES_OUT.fetch_add(1, Ordering::Relaxed),
        };
        PERFORMATIVE_COUNTERS.increment(body);
    }

    #[inline]
    pub(crate) fn record_heartbeat(direction: FrameDirection) {
        match direction {
            FrameDirection::Inbound => HEARTBEATS_IN.fetch_add(1, Ordering::Relaxed),
            FrameDirection::Outbound => HEARTBEATS_OUT.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub(crate) fn record_bytes(direction: FrameDirection, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        match direction {
            FrameDirection::Inbound => BYTES_IN.fetch_add(count, Ordering::Relaxed),
            FrameDirection::Outbound => BYTES_OUT.fetch_add(count, Ordering::Relaxed),
        };
    }

    #[inline]
    pub(crate) fn record_frame_size(size: u32) {
        update_max(&LARGEST_FRAME, u64::from(size));
    }

    #[inline]
    pub(crate) fn record_delivery_sent() {
        DELIVERIES_SENT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_delivery_received() {
        DELIVERIES_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failure() {
        ENGINE_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_open() {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_close() {
        let _ = ACTIVE_CONNECTIONS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(1))
        });
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        let per = &PERFORMATIVE_COUNTERS;
        MetricsSnapshot {
            frames_in: FRAMES_IN.load(Ordering::Relaxed),
            frames_out: FRAMES_OUT.load(Ordering::Relaxed),
            bytes_in: BYTES_IN.load(Ordering::Relaxed),
            bytes_out: BYTES_OUT.load(Ordering::Relaxed),
            heartbeats_in: HEARTBEATS_IN.load(Ordering::Relaxed),
            heartbeats_out: HEARTBEATS_OUT.load(Ordering::Relaxed),
            deliveries_sent: DELIVERIES_SENT.load(Ordering::Relaxed),
            deliveries_received: DELIVERIES_RECEIVED.load(Ordering::Relaxed),
            engine_failures: ENGINE_FAILURES.load(Ordering::Relaxed),
            active_connections: ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
            largest_frame: LARGEST_FRAME.load(Ordering::Relaxed),
            transfers: per.transfer.load(Ordering::Relaxed),
            flows: per.flow.load(Ordering::Relaxed),
            dispositions: per.disposition.load(Ordering::Relaxed),
            lifecycle_frames: [
                &per.open,
                &per.begin,
                &per.attach,
                &per.detach,
                &per.end,
                &per.close,
            ]
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum(),
            sasl_frames: per.sasl.load(Ordering::Relaxed),
        }
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Point-in-time copy of the counters, summed over every engine in the process.
#[derive(Default, Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub heartbeats_in: u64,
    pub heartbeats_out: u64,
    pub deliveries_sent: u64,
    pub deliveries_received: u64,
    pub engine_failures: u64,
    pub active_connections: u64,
    pub largest_frame: u64,
    pub transfers: u64,
    pub flows: u64,
    pub dispositions: u64,
    /// Open, begin, attach, detach, end and close frames.
    pub lifecycle_frames: u64,
    pub sasl_frames: u64,
}

impl MetricsSnapshot {
    /// Average encoded bytes per outbound frame.
    #[must_use]
    pub fn avg_outbound_frame_bytes(&self) -> Option<u64> {
        average(self.bytes_out, self.frames_out + self.heartbeats_out)
    }

    /// Average encoded bytes per inbound frame.
    #[must_use]
    pub fn avg_inbound_frame_bytes(&self) -> Option<u64> {
        average(self.bytes_in, self.frames_in + self.heartbeats_in)
    }
}

/// Current process-wide counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    Metrics::totals()
}

fn average(total: u64, count: u64) -> Option<u64> {
    (count > 0).then(|| total / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Close;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        Metrics::record_frame(FrameDirection::Outbound, &FrameBody::Amqp(Close::default().into()));
        Metrics::record_bytes(FrameDirection::Outbound, 16);
        Metrics::record_frame_size(16);
        let after = snapshot();
        assert!(after.frames_out > before.frames_out);
        assert!(after.bytes_out >= before.bytes_out + 16);
        assert!(after.lifecycle_frames > before.lifecycle_frames);
        assert!(after.largest_frame >= 16);
    }

    #[test]
    fn averages_need_samples() {
        let empty = MetricsSnapshot::default();
        assert_eq!(empty.avg_outbound_frame_bytes(), None);
        let snapshot = MetricsSnapshot {
            frames_out: 3,
            heartbeats_out: 1,
            bytes_out: 100,
            ..MetricsSnapshot::default()
        };
        assert_eq!(snapshot.avg_outbound_frame_bytes(), Some(25));
    }
}
