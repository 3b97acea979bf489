//! strand-observe: vendor-neutral observability ABI.
//!
//! Core crates depend only on these traits and event types. Backends live elsewhere.

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
    fn emit(&self, evt: StoreEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
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
    fn emit(&self, _e: StoreEvent) {}
}

/// Typed events for live inspection (payloads never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Append(AppendEvt),
    Store(ShardEvt),
    Release(ReleaseEvt),
    Read(ReadEvt),
    Epoch(EpochEvt),
    Gossip(GossipEvt),
}

#[derive(Clone, Debug)]
pub struct AppendEvt {
    pub log: u64,
    pub kind: AppendKind,
}
#[derive(Clone, Debug)]
pub enum AppendKind {
    Admitted { bytes: u64 },
    Rejected { status: &'static str },
    Retired { waves: u32 },
}

#[derive(Clone, Debug)]
pub struct ShardEvt {
    pub node: u32,
    pub shard: u32,
    pub kind: ShardKind,
}
#[derive(Clone, Debug)]
pub enum ShardKind {
    Stored { bytes: u64 },
    Sealed { epoch: u32 },
    Trimmed,
    CorruptionTruncated,
}

#[derive(Clone, Debug)]
pub struct ReleaseEvt {
    pub log: u64,
    pub epoch: u32,
}

#[derive(Clone, Debug)]
pub struct ReadEvt {
    pub log: u64,
    pub kind: ReadKind,
}
#[derive(Clone, Debug)]
pub enum ReadKind {
    Delivered { bytes: u64 },
    Gap { kind: &'static str },
    ScdAllSend,
    Unhealthy,
}

#[derive(Clone, Debug)]
pub struct EpochEvt {
    pub log: u64,
    pub kind: EpochKind,
}
#[derive(Clone, Debug)]
pub enum EpochKind {
    Activated { epoch: u32 },
    Preempted { by: u32 },
    LceAdvanced { lce: u32 },
    CasRetry,
}

#[derive(Clone, Debug)]
pub struct GossipEvt {
    pub node: u32,
    pub kind: GossipKind,
}
#[derive(Clone, Debug)]
pub enum GossipKind {
    Suspected,
    Declared,
    Refuted,
}
