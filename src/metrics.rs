use {
    crate::queue::QueueStats,
    prometheus::{
        Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
        Registry, TextEncoder,
    },
    std::time::Instant,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub polling_cycles: IntCounter,
    pub processed_messages: IntCounterVec,
    pub message_failures: IntCounterVec,
    pub transient_pauses: IntCounter,
    pub queue_count: IntGaugeVec,
    pub cycle_duration: Histogram,
    pub message_duration: Histogram,
    pub outbound_sends: IntCounterVec,
    pub cert_fetches: IntCounter,
    pub postgres_query_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let polling_cycles = IntCounter::new(
            "relay_polling_cycles",
            "The number of completed queue polling cycles",
        )?;
        registry.register(Box::new(polling_cycles.clone()))?;

        let processed_messages = IntCounterVec::new(
            Opts::new(
                "relay_processed_messages",
                "The number of queue messages processed, by outcome",
            ),
            &["status"],
        )?;
        registry.register(Box::new(processed_messages.clone()))?;

        let message_failures = IntCounterVec::new(
            Opts::new(
                "relay_message_failures",
                "The number of queue messages that failed processing, by error kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(message_failures.clone()))?;

        let transient_pauses = IntCounter::new(
            "relay_transient_pauses",
            "The number of messages still failing transiently after the in-process retry",
        )?;
        registry.register(Box::new(transient_pauses.clone()))?;

        let queue_count = IntGaugeVec::new(
            Opts::new(
                "relay_queue_count",
                "Approximate queue depth, by queue and message state",
            ),
            &["queue", "state"],
        )?;
        registry.register(Box::new(queue_count.clone()))?;

        let cycle_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_cycle_duration_seconds",
            "The wall-clock duration of one polling cycle",
        ))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        let message_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_message_duration_seconds",
            "The time spent processing a single queue message",
        ))?;
        registry.register(Box::new(message_duration.clone()))?;

        let outbound_sends = IntCounterVec::new(
            Opts::new(
                "relay_outbound_sends",
                "The number of outbound mailer calls, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(outbound_sends.clone()))?;

        let cert_fetches = IntCounter::new(
            "relay_cert_fetches",
            "The number of signing-certificate fetches (cache misses)",
        )?;
        registry.register(Box::new(cert_fetches.clone()))?;

        let postgres_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "relay_postgres_query_duration_seconds",
                "The latency of postgres queries, by query name",
            ),
            &["name"],
        )?;
        registry.register(Box::new(postgres_query_duration.clone()))?;

        Ok(Metrics {
            registry,
            polling_cycles,
            processed_messages,
            message_failures,
            transient_pauses,
            queue_count,
            cycle_duration,
            message_duration,
            outbound_sends,
            cert_fetches,
            postgres_query_duration,
        })
    }

    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn queue_stats(&self, queue: &str, stats: &QueueStats) {
        self.queue_count
            .with_label_values(&[queue, "visible"])
            .set(stats.visible as i64);
        self.queue_count
            .with_label_values(&[queue, "delayed"])
            .set(stats.delayed as i64);
        self.queue_count
            .with_label_values(&[queue, "not_visible"])
            .set(stats.not_visible as i64);
    }

    pub fn message_processed(&self, status: &str, start: Instant) {
        self.processed_messages.with_label_values(&[status]).inc();
        self.message_duration.observe(start.elapsed().as_secs_f64());
    }

    pub fn message_failure(&self, kind: &str) {
        self.message_failures.with_label_values(&[kind]).inc();
    }

    pub fn cycle(&self, start: Instant) {
        self.polling_cycles.inc();
        self.cycle_duration.observe(start.elapsed().as_secs_f64());
    }

    pub fn outbound_send(&self, outcome: &str) {
        self.outbound_sends.with_label_values(&[outcome]).inc();
    }

    pub fn postgres_query(&self, name: &str, start: Instant) {
        self.postgres_query_duration
            .with_label_values(&[name])
            .observe(start.elapsed().as_secs_f64());
    }
}
