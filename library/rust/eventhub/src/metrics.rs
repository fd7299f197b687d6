use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// EventHubMetrics はプロデューサー・コンシューマーパイプラインの Prometheus メトリクス。
/// レジストリはインスタンスごとに保持し、グローバルレジストリは使用しない。
pub struct EventHubMetrics {
    pub producer_queue_depth: IntGaugeVec,
    pub producer_events_sent_total: IntCounterVec,
    pub producer_events_failed_total: IntCounterVec,
    pub producer_backpressure_total: IntCounterVec,
    pub producer_batch_size: HistogramVec,
    pub consumer_events_processed_total: IntCounterVec,
    pub consumer_handler_failures_total: IntCounterVec,
    pub consumer_owned_partitions: IntGaugeVec,
    pub checkpoint_writes_total: IntCounterVec,
    pub checkpoint_failures_total: IntCounterVec,
    pub transport_signals_suppressed_total: IntCounterVec,
    registry: Registry,
}

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

impl EventHubMetrics {
    /// new はメトリクスを初期化して返す。
    /// service_name はメトリクスの service ラベルに使用される。
    pub fn new(service_name: &str) -> Self {
        let registry = Registry::new();

        let producer_queue_depth = IntGaugeVec::new(
            Opts::new(
                "eventhub_producer_queue_depth",
                "Number of envelopes buffered and not yet handed to the transport",
            )
            .const_label("service", service_name),
            &["producer"],
        )
        .expect("failed to create eventhub_producer_queue_depth gauge");

        let producer_events_sent_total = IntCounterVec::new(
            Opts::new(
                "eventhub_producer_events_sent_total",
                "Total number of envelopes delivered to the transport",
            )
            .const_label("service", service_name),
            &["producer", "destination"],
        )
        .expect("failed to create eventhub_producer_events_sent_total counter");

        let producer_events_failed_total = IntCounterVec::new(
            Opts::new(
                "eventhub_producer_events_failed_total",
                "Total number of envelopes reported as delivery failures",
            )
            .const_label("service", service_name),
            &["producer", "destination", "reason"],
        )
        .expect("failed to create eventhub_producer_events_failed_total counter");

        let producer_backpressure_total = IntCounterVec::new(
            Opts::new(
                "eventhub_producer_backpressure_total",
                "Total number of submissions rejected because the buffer was full",
            )
            .const_label("service", service_name),
            &["producer"],
        )
        .expect("failed to create eventhub_producer_backpressure_total counter");

        let producer_batch_size = HistogramVec::new(
            HistogramOpts::new(
                "eventhub_producer_batch_size",
                "Histogram of envelopes per flushed batch",
            )
            .const_label("service", service_name)
            .buckets(BATCH_SIZE_BUCKETS.to_vec()),
            &["producer"],
        )
        .expect("failed to create eventhub_producer_batch_size histogram");

        let consumer_events_processed_total = IntCounterVec::new(
            Opts::new(
                "eventhub_consumer_events_processed_total",
                "Total number of events handed to the registered handler",
            )
            .const_label("service", service_name),
            &["destination", "group"],
        )
        .expect("failed to create eventhub_consumer_events_processed_total counter");

        let consumer_handler_failures_total = IntCounterVec::new(
            Opts::new(
                "eventhub_consumer_handler_failures_total",
                "Total number of handler invocations that returned an error",
            )
            .const_label("service", service_name),
            &["destination", "group"],
        )
        .expect("failed to create eventhub_consumer_handler_failures_total counter");

        let consumer_owned_partitions = IntGaugeVec::new(
            Opts::new(
                "eventhub_consumer_owned_partitions",
                "Number of partitions currently owned by this consumer instance",
            )
            .const_label("service", service_name),
            &["destination", "group"],
        )
        .expect("failed to create eventhub_consumer_owned_partitions gauge");

        let checkpoint_writes_total = IntCounterVec::new(
            Opts::new(
                "eventhub_checkpoint_writes_total",
                "Total number of checkpoint writes by outcome",
            )
            .const_label("service", service_name),
            &["destination", "group", "outcome"],
        )
        .expect("failed to create eventhub_checkpoint_writes_total counter");

        let checkpoint_failures_total = IntCounterVec::new(
            Opts::new(
                "eventhub_checkpoint_failures_total",
                "Total number of failed checkpoint writes",
            )
            .const_label("service", service_name),
            &["destination", "group"],
        )
        .expect("failed to create eventhub_checkpoint_failures_total counter");

        let transport_signals_suppressed_total = IntCounterVec::new(
            Opts::new(
                "eventhub_transport_signals_suppressed_total",
                "Total number of transport signals classified as benign handoff noise",
            )
            .const_label("service", service_name),
            &["rule"],
        )
        .expect("failed to create eventhub_transport_signals_suppressed_total counter");

        registry
            .register(Box::new(producer_queue_depth.clone()))
            .expect("failed to register eventhub_producer_queue_depth");
        registry
            .register(Box::new(producer_events_sent_total.clone()))
            .expect("failed to register eventhub_producer_events_sent_total");
        registry
            .register(Box::new(producer_events_failed_total.clone()))
            .expect("failed to register eventhub_producer_events_failed_total");
        registry
            .register(Box::new(producer_backpressure_total.clone()))
            .expect("failed to register eventhub_producer_backpressure_total");
        registry
            .register(Box::new(producer_batch_size.clone()))
            .expect("failed to register eventhub_producer_batch_size");
        registry
            .register(Box::new(consumer_events_processed_total.clone()))
            .expect("failed to register eventhub_consumer_events_processed_total");
        registry
            .register(Box::new(consumer_handler_failures_total.clone()))
            .expect("failed to register eventhub_consumer_handler_failures_total");
        registry
            .register(Box::new(consumer_owned_partitions.clone()))
            .expect("failed to register eventhub_consumer_owned_partitions");
        registry
            .register(Box::new(checkpoint_writes_total.clone()))
            .expect("failed to register eventhub_checkpoint_writes_total");
        registry
            .register(Box::new(checkpoint_failures_total.clone()))
            .expect("failed to register eventhub_checkpoint_failures_total");
        registry
            .register(Box::new(transport_signals_suppressed_total.clone()))
            .expect("failed to register eventhub_transport_signals_suppressed_total");

        Self {
            producer_queue_depth,
            producer_events_sent_total,
            producer_events_failed_total,
            producer_backpressure_total,
            producer_batch_size,
            consumer_events_processed_total,
            consumer_handler_failures_total,
            consumer_owned_partitions,
            checkpoint_writes_total,
            checkpoint_failures_total,
            transport_signals_suppressed_total,
            registry,
        }
    }

    /// gather_metrics は Prometheus テキストフォーマットでメトリクスを返す。
    /// /metrics エンドポイントのハンドラで使用する。
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for EventHubMetrics {
    fn default() -> Self {
        Self::new("k1s0-eventhub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_series() {
        let metrics = EventHubMetrics::new("order-server");
        metrics
            .producer_events_sent_total
            .with_label_values(&["orders", "orders"])
            .inc_by(3);
        metrics
            .producer_queue_depth
            .with_label_values(&["orders"])
            .set(7);

        let text = metrics.gather_metrics();
        assert!(text.contains("eventhub_producer_events_sent_total"));
        assert!(text.contains("service=\"order-server\""));
        assert!(text.contains("eventhub_producer_queue_depth"));
    }

    #[test]
    fn test_independent_registries() {
        let a = EventHubMetrics::new("a");
        let b = EventHubMetrics::new("b");
        a.producer_backpressure_total
            .with_label_values(&["orders"])
            .inc();
        assert_eq!(
            b.producer_backpressure_total
                .with_label_values(&["orders"])
                .get(),
            0
        );
    }
}
