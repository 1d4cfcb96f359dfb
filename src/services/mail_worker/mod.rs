use {
    crate::{
        mail::{DispatchError, MailDispatcher},
        metrics::Metrics,
        queue::{QueueClient, QueueError, QueueMessage, QueueStats},
        services::healthcheck::{write_healthcheck, HealthcheckDocument},
        sns::{
            classify, verifier::EnvelopeVerifier, verifier::VerifyError, ClassifyError,
            ParseEnvelopeError, RawEnvelope, SnsEvent,
        },
        error::FailureKind,
    },
    chrono::Utc,
    std::{path::PathBuf, sync::Arc, time::{Duration, Instant}},
    thiserror::Error,
    tokio::sync::broadcast::{self, error::TryRecvError},
    tracing::{debug, error, info, instrument, warn},
    url::Url,
};

/// How long to wait before the single in-process retry of a transiently
/// failed message.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

const MIN_BATCH_SIZE: i32 = 1;
const MAX_BATCH_SIZE: i32 = 10;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue_name: String,
    pub batch_size: i32,
    pub wait_seconds: i32,
    pub visibility_seconds: i32,
    pub healthcheck_path: PathBuf,
    /// Permanently failed messages are deleted when set; otherwise their
    /// visibility lapses and the queue's dead-letter policy takes over.
    pub delete_failed_messages: bool,
    /// Optional wall-clock budget; the worker exits cleanly once exceeded.
    pub max_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupt,
    MaxSeconds,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseEnvelopeError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Subscription confirmation failed: {0}")]
    Confirm(String),
}

impl PipelineError {
    /// Verification and classification failures can never succeed on
    /// redelivery; only dispatch knows better, and confirmation fetches
    /// are worth another attempt.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Dispatch(e) => e.kind(),
            Self::Confirm(_) => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    /// Whether the 1-second in-process retry applies. Only outbound
    /// throttling/pause qualifies; every other transient failure waits
    /// for redelivery so side effects run at most once per lease.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Dispatch(e) if e.retryable())
    }

    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "unparseable_body",
            Self::Verify(VerifyError::MalformedEnvelope(_)) => "malformed_envelope",
            Self::Verify(VerifyError::SuspiciousOrigin(_)) => "suspicious_origin",
            Self::Verify(VerifyError::CertUnavailable(_)) => "cert_unavailable",
            Self::Verify(VerifyError::InvalidSignature) => "invalid_signature",
            Self::Classify(_) => "unclassifiable",
            Self::Dispatch(e) => e.metric_kind(),
            Self::Confirm(_) => "confirm_failed",
        }
    }
}

/// Long-polls the queue and drives each message through verify →
/// classify → dispatch, settling it according to the failure taxonomy.
/// One instance per process; scale out by running more processes, the
/// queue's visibility timeout keeps them from overlapping.
pub struct MailWorker {
    queue: Arc<dyn QueueClient>,
    dispatcher: MailDispatcher,
    verifier: Arc<dyn EnvelopeVerifier>,
    http_client: reqwest::Client,
    expected_topic: String,
    options: WorkerOptions,
    metrics: Option<Metrics>,
    shutdown: broadcast::Receiver<()>,
    cycles: u64,
    total_messages: u64,
    failed_messages: u64,
    pause_count: u64,
    last_stats: QueueStats,
}

impl MailWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueClient>,
        dispatcher: MailDispatcher,
        verifier: Arc<dyn EnvelopeVerifier>,
        http_client: reqwest::Client,
        expected_topic: String,
        mut options: WorkerOptions,
        metrics: Option<Metrics>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        options.batch_size = options.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        Self {
            queue,
            dispatcher,
            verifier,
            http_client,
            expected_topic,
            options,
            metrics,
            shutdown,
            cycles: 0,
            total_messages: 0,
            failed_messages: 0,
            pause_count: 0,
            last_stats: QueueStats::default(),
        }
    }

    /// Runs until interrupted or out of budget. Only an unrecoverable
    /// queue-client error escapes as `Err`; message-level failures are
    /// settled per cycle.
    pub async fn run(mut self) -> Result<StopReason, QueueError> {
        let started = Instant::now();
        info!(
            "Starting queue worker on {} (batch_size {})",
            self.options.queue_name, self.options.batch_size
        );

        loop {
            match self.shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Closed) | Err(TryRecvError::Lagged(_)) => {
                    info!("Interrupt received, stopping after {} cycles", self.cycles);
                    return Ok(StopReason::Interrupt);
                }
            }

            if let Some(max_seconds) = self.options.max_seconds {
                if started.elapsed() >= Duration::from_secs(max_seconds) {
                    info!("Max runtime of {max_seconds}s reached, stopping");
                    return Ok(StopReason::MaxSeconds);
                }
            }

            self.run_cycle().await?;
        }
    }

    #[instrument(skip_all, fields(cycle = self.cycles))]
    async fn run_cycle(&mut self) -> Result<(), QueueError> {
        let cycle_start = Instant::now();

        match self.queue.stats().await {
            Ok(stats) => {
                self.last_stats = stats;
                if let Some(metrics) = &self.metrics {
                    metrics.queue_stats(&self.options.queue_name, &stats);
                }
            }
            // Stale gauges are tolerable; a broken receive below is not.
            Err(e) => warn!("Failed to refresh queue statistics: {e}"),
        }

        self.write_healthcheck();

        let messages = self
            .queue
            .receive(
                self.options.batch_size,
                self.options.wait_seconds,
                self.options.visibility_seconds,
            )
            .await?;
        let received = messages.len();

        for message in messages {
            self.handle_message(message).await;
        }

        self.cycles += 1;
        if let Some(metrics) = &self.metrics {
            metrics.cycle(cycle_start);
        }

        if received == 0 {
            debug!("Cycle {} finished with an empty poll", self.cycles);
        } else {
            info!(
                "Cycle {} processed {received} messages in {:?}",
                self.cycles,
                cycle_start.elapsed()
            );
        }
        Ok(())
    }

    fn write_healthcheck(&self) {
        let document = HealthcheckDocument {
            timestamp: Utc::now(),
            cycles: self.cycles,
            total_messages: self.total_messages,
            failed_messages: self.failed_messages,
            pause_count: self.pause_count,
            queue_count: self.last_stats.visible,
            queue_count_delayed: self.last_stats.delayed,
            queue_count_not_visible: self.last_stats.not_visible,
        };
        if let Err(e) = write_healthcheck(&self.options.healthcheck_path, &document) {
            warn!(
                "Failed to write healthcheck to {}: {e}",
                self.options.healthcheck_path.display()
            );
        }
    }

    #[instrument(skip_all, fields(message_id = %message.message_id))]
    async fn handle_message(&mut self, message: QueueMessage) {
        self.total_messages += 1;
        let start = Instant::now();

        let first = match self.process_message(&message).await {
            Ok(status) => {
                self.delete_message(&message).await;
                if let Some(metrics) = &self.metrics {
                    metrics.message_processed(status, start);
                }
                return;
            }
            Err(e) => e,
        };

        if first.retryable() {
            warn!(
                "Transient failure on message {}, retrying in {RETRY_PAUSE:?}: {first}",
                message.message_id
            );
            tokio::time::sleep(RETRY_PAUSE).await;

            match self.process_message(&message).await {
                Ok(status) => {
                    self.delete_message(&message).await;
                    if let Some(metrics) = &self.metrics {
                        metrics.message_processed(status, start);
                    }
                }
                Err(retry_error) => {
                    self.failed_messages += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.message_failure(retry_error.metric_kind());
                    }
                    if retry_error.kind() == FailureKind::Transient {
                        // Give up for this cycle but leave the message; it
                        // returns to visibility and is redelivered.
                        self.pause_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.transient_pauses.inc();
                        }
                        warn!(
                            "Message {} still failing transiently after retry, leaving for redelivery: {retry_error}",
                            message.message_id
                        );
                    } else {
                        error!(
                            "Message {} failed permanently after transient retry: {retry_error}",
                            message.message_id
                        );
                        self.settle_failed(&message).await;
                    }
                }
            }
            return;
        }

        self.failed_messages += 1;
        if let Some(metrics) = &self.metrics {
            metrics.message_failure(first.metric_kind());
        }

        if first.kind() == FailureKind::Transient {
            // One attempt per lease; the message comes back after the
            // visibility timeout.
            warn!(
                "Transient failure on message {}, leaving for redelivery: {first}",
                message.message_id
            );
            return;
        }

        error!(
            "Message {} failed permanently: {first}",
            message.message_id
        );
        self.settle_failed(&message).await;
    }

    async fn process_message(&self, message: &QueueMessage) -> Result<&'static str, PipelineError> {
        let envelope = RawEnvelope::parse(&message.body)?;
        self.verifier.verify(&envelope).await?;

        match classify(&envelope, &self.expected_topic)? {
            SnsEvent::SubscriptionConfirmation { subscribe_url, .. } => {
                self.confirm_subscription(&subscribe_url).await?;
                Ok("confirmed")
            }
            SnsEvent::InboundMail(mail) => {
                let outcome = self.dispatcher.dispatch(&mail).await?;
                Ok(outcome.as_str())
            }
        }
    }

    /// Completes a topic subscription by fetching its confirmation URL,
    /// held to the same host allowlist as certificate fetches.
    async fn confirm_subscription(&self, subscribe_url: &Url) -> Result<(), PipelineError> {
        if subscribe_url.scheme() != "https" || !self.verifier.host_allowed(subscribe_url) {
            return Err(PipelineError::Verify(VerifyError::SuspiciousOrigin(
                subscribe_url.to_string(),
            )));
        }

        self.http_client
            .get(subscribe_url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PipelineError::Confirm(e.to_string()))?;
        info!("Confirmed topic subscription");
        Ok(())
    }

    async fn delete_message(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(&message.receipt_handle).await {
            // The message will be redelivered and reprocessed; dispatch is
            // idempotent enough for that.
            warn!("Failed to delete message {}: {e}", message.message_id);
        }
    }

    /// Applies the permanent-failure policy: delete when configured,
    /// otherwise let visibility lapse for queue-side dead-lettering.
    async fn settle_failed(&self, message: &QueueMessage) {
        if self.options.delete_failed_messages {
            self.delete_message(message).await;
        }
    }
}
