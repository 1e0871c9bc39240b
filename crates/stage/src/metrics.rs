use channel::PostReport;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::time::Duration;

/// Channel instruments exported by the stage binaries.
///
/// With no meter provider installed they are no-ops.
pub struct StageMetrics {
    post_duration: Histogram<f64>,
    posts: Counter<u64>,
    evictions: Counter<u64>,
    reads: Counter<u64>,
    attributes: [KeyValue; 1],
}

impl StageMetrics {
    pub fn new(meter: &Meter, channel: &str) -> Self {
        let latency_buckets = [
            0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.5, 1.0, 5.0,
        ];

        Self {
            post_duration: meter
                .f64_histogram("channel_post_duration_seconds")
                .with_description("Time from taking the write gate to the end of the rendezvous")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            posts: meter
                .u64_counter("channel_posts_total")
                .with_description("Total publish cycles completed by the sink")
                .build(),
            evictions: meter
                .u64_counter("channel_evictions_total")
                .with_description("Total sources evicted for missing the rendezvous")
                .build(),
            reads: meter
                .u64_counter("channel_reads_total")
                .with_description("Total publishes read by a source")
                .build(),
            attributes: [KeyValue::new("channel", channel.to_string())],
        }
    }

    pub fn record_post(&self, report: &PostReport, elapsed: Duration) {
        self.post_duration
            .record(elapsed.as_secs_f64(), &self.attributes);
        self.posts.add(1, &self.attributes);
        if !report.evicted.is_empty() {
            self.evictions
                .add(report.evicted.len() as u64, &self.attributes);
        }
    }

    pub fn record_read(&self) {
        self.reads.add(1, &self.attributes);
    }
}
