use opentelemetry::metrics::Counter;

/// Tracker throughput and connection-health counters, built from the global
/// meter.
#[derive(Debug, Clone)]
pub struct TrackerMetrics {
    pub frames_decoded: Counter<u64>,
    pub events_dispatched: Counter<u64>,
    pub deltas_emitted: Counter<u64>,
    pub connection_attempts: Counter<u64>,
    pub connection_failures: Counter<u64>,
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerMetrics {
    pub fn new() -> TrackerMetrics {
        let meter = opentelemetry::global::meter("mesos-tracker");
        let frames_decoded = meter
            .u64_counter("tracker.frames_decoded")
            .with_description("records decoded from the operator event stream")
            .build();
        let events_dispatched = meter
            .u64_counter("tracker.events_dispatched")
            .with_description("operator events dispatched to handlers")
            .build();
        let deltas_emitted = meter
            .u64_counter("tracker.deltas_emitted")
            .with_description("task deltas produced for subscribers")
            .build();
        let connection_attempts = meter
            .u64_counter("tracker.connection_attempts")
            .with_description("subscribe calls issued against the master")
            .build();
        let connection_failures = meter
            .u64_counter("tracker.connection_failures")
            .with_description("connections that ended in an error, redirects included")
            .build();
        TrackerMetrics {
            frames_decoded,
            events_dispatched,
            deltas_emitted,
            connection_attempts,
            connection_failures,
        }
    }
}
