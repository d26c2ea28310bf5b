use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static UPDATES_APPENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("updates_appended_total", "Log entries appended per bucket kind"),
        &["bucket_kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PUSH_FRAMES_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("push_frames_delivered_total", "Frames delivered to live sessions")
        .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MAILBOX_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("mailbox_enqueued_total", "Durable user-bucket mailbox entries")
        .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PULL_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("pull_requests_total", "Pull-sync requests by result type"),
        &["result_type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("live_sessions", "Currently connected event-stream sessions").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
