//! Prometheus-text-format counters/gauges for session and runtime stats,
//! served at `/metrics`, built on the `prometheus` crate's own
//! `Registry`/encoder rather than a hand-rolled text format.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub active_sessions: IntGauge,
    pub sessions_created_total: IntCounter,
    pub admission_rejections_total: IntCounter,
    pub inbound_frames_dropped_total: IntCounter,
    pub outbound_frames_dropped_total: IntCounter,
    pub control_messages_total: IntCounterVec,
    pub barge_ins_total: IntCounter,
    pub stopword_matches_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_sessions = IntGauge::new("active_sessions", "Currently active sessions").unwrap();
        let sessions_created_total = IntCounter::new("sessions_created_total", "Sessions admitted since startup").unwrap();
        let admission_rejections_total =
            IntCounter::new("admission_rejections_total", "Sessions rejected due to concurrency_limit").unwrap();
        let inbound_frames_dropped_total =
            IntCounter::new("inbound_frames_dropped_total", "Inbound frames dropped on queue overflow").unwrap();
        let outbound_frames_dropped_total =
            IntCounter::new("outbound_frames_dropped_total", "Outbound frames dropped on queue overflow").unwrap();
        let control_messages_total = IntCounterVec::new(
            Opts::new("control_messages_total", "Control messages sent, by type"),
            &["type"],
        )
        .unwrap();
        let barge_ins_total = IntCounter::new("barge_ins_total", "Barge-in events handled").unwrap();
        let stopword_matches_total = IntCounter::new("stopword_matches_total", "Stopword matches detected").unwrap();

        registry.register(Box::new(active_sessions.clone())).unwrap();
        registry.register(Box::new(sessions_created_total.clone())).unwrap();
        registry.register(Box::new(admission_rejections_total.clone())).unwrap();
        registry.register(Box::new(inbound_frames_dropped_total.clone())).unwrap();
        registry.register(Box::new(outbound_frames_dropped_total.clone())).unwrap();
        registry.register(Box::new(control_messages_total.clone())).unwrap();
        registry.register(Box::new(barge_ins_total.clone())).unwrap();
        registry.register(Box::new(stopword_matches_total.clone())).unwrap();

        Self {
            registry,
            active_sessions,
            sessions_created_total,
            admission_rejections_total,
            inbound_frames_dropped_total,
            outbound_frames_dropped_total,
            control_messages_total,
            barge_ins_total,
            stopword_matches_total,
        }
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).expect("prometheus text encoding never fails on valid metrics");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
