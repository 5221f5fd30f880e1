//! Prometheus registry for the control plane's observability surface.
//! Grounded on a sibling pack example that exposes a `/metrics`
//! salvo-adjacent endpoint; this repo otherwise carries no metrics crate.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub struct Metrics {
    pub registry: Registry,
    pub active_connections: IntGauge,
    pub active_rooms: IntGauge,
    pub room_participant_count: IntGaugeVec,
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_failures_total: IntCounter,
    pub events_total: IntCounterVec,
    pub rate_limit_rejections_total: IntCounter,
    pub event_processing_duration_seconds: Histogram,
    pub coordination_store_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections =
            IntGauge::new("active_connections", "Currently open WebSocket connections").unwrap();
        let active_rooms = IntGauge::new("active_rooms", "Currently live rooms").unwrap();
        let room_participant_count = IntGaugeVec::new(
            Opts::new("room_participant_count", "Participant count per room"),
            &["room_id"],
        )
        .unwrap();
        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "SFU circuit breaker state (0=closed,1=open,2=half_open)",
        )
        .unwrap();
        let circuit_breaker_failures_total = IntCounter::new(
            "circuit_breaker_failures_total",
            "Failures counted against the SFU circuit breaker",
        )
        .unwrap();
        let events_total = IntCounterVec::new(
            Opts::new("events_total", "Room events processed"),
            &["event_type", "status"],
        )
        .unwrap();
        let rate_limit_rejections_total = IntCounter::new(
            "rate_limit_rejections_total",
            "Requests rejected by a rate limit",
        )
        .unwrap();
        let event_processing_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "event_processing_duration_seconds",
            "Time spent processing a single room command",
        ))
        .unwrap();
        let coordination_store_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "coordination_store_latency_seconds",
            "Latency of coordination bus round-trips",
        ))
        .unwrap();

        for collector in [
            Box::new(active_connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_rooms.clone()),
            Box::new(room_participant_count.clone()),
            Box::new(circuit_breaker_state.clone()),
            Box::new(circuit_breaker_failures_total.clone()),
            Box::new(events_total.clone()),
            Box::new(rate_limit_rejections_total.clone()),
            Box::new(event_processing_duration_seconds.clone()),
            Box::new(coordination_store_latency_seconds.clone()),
        ] {
            registry.register(collector).expect("metric names must be unique");
        }

        Self {
            registry,
            active_connections,
            active_rooms,
            room_participant_count,
            circuit_breaker_state,
            circuit_breaker_failures_total,
            events_total,
            rate_limit_rejections_total,
            event_processing_duration_seconds,
            coordination_store_latency_seconds,
        }
    }

    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).expect("metric encoding is infallible");
        String::from_utf8(buffer).expect("prometheus text format is valid utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.active_connections.set(3);
        let output = metrics.encode();
        assert!(output.contains("active_connections 3"));
    }
}
