//! kelpie-observe: vendor-neutral observability ABI.
//!
//! The log core depends only on these traits and event types. Metric
//! backends (prometheus exporters, live dashboards, test probes) live
//! elsewhere and implement [`Meter`].

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: WalEvent);
}

/// A do-nothing meter for tests and hosts that don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: WalEvent) {}
}

/// Typed log lifecycle events (payload bytes never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum WalEvent {
    /// The active segment reached its size limit and a new one was opened.
    SegmentRoll { segment: u32, bytes: u64 },
    /// An fsync covering pending appends completed.
    Fsync { segment: u32, micros: u64 },
    /// Orphan bytes past the last indexed record were cut off at startup.
    TailTrimmed { segment: u32, bytes: u64 },
    /// A dead segment was removed by compaction or truncation.
    SegmentDeleted { segment: u32 },
    /// A dead segment was moved into an archive directory.
    SegmentArchived { segment: u32 },
    /// The meta index dropped its committed prefix.
    Compacted { base: u32 },
    /// The committed prefix was moved off-side.
    Archived { base: u32 },
    /// The batched meta index queue was written out.
    MetaFlush { entries: usize },
    /// The log head was rewound.
    Truncated { head: u32 },
}
