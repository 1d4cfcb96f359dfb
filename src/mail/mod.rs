use {
    crate::{
        blob::{BlobError, BlobStore},
        error::FailureKind,
        mailer::{OutboundEmail, OutboundMailer, SendOutcome},
        metrics::Metrics,
        model::{types::Alias, MailStore, StoreError},
        sns::InboundMail,
    },
    std::sync::Arc,
    thiserror::Error,
    tracing::{info, instrument},
    uuid::Uuid,
};

pub mod filters;
pub mod headers;

/// How a successfully handled message was settled. All three delete the
/// message from the queue; only `Forwarded` produced an outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded,
    Blocked,
    Spam,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Blocked => "blocked",
            Self::Spam => "spam",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Envelope has no destination in the relay domain")]
    NoRelayDestination,

    #[error("No alias matches destination {0}")]
    NoSuchAlias(String),

    #[error("Alias owner {0} does not exist")]
    MissingOwner(Uuid),

    #[error("Envelope carries neither an inline body nor a blob reference")]
    MissingBody,

    #[error("Message body unavailable: {0}")]
    Blob(#[from] BlobError),

    #[error("Outbound send failed with code {code}")]
    Send { code: String, kind: FailureKind },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Blob(BlobError::Transient(_)) | Self::Store(_) => FailureKind::Transient,
            Self::Send { kind, .. } => *kind,
            _ => FailureKind::Permanent,
        }
    }

    /// Only throttled outbound sends are worth an in-process retry. Other
    /// transient failures (blob, store) get exactly one attempt per
    /// delivery; the visibility timeout is their retry envelope.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Send {
                kind: FailureKind::Transient,
                ..
            }
        )
    }

    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::NoRelayDestination => "no_relay_destination",
            Self::NoSuchAlias(_) => "no_such_alias",
            Self::MissingOwner(_) => "missing_owner",
            Self::MissingBody => "missing_body",
            Self::Blob(BlobError::NotFound { .. }) => "blob_not_found",
            Self::Blob(BlobError::Transient(_)) => "blob_transient",
            Self::Send { kind, .. } => match kind {
                FailureKind::Transient => "transient_outbound",
                FailureKind::Permanent => "permanent_outbound",
            },
            Self::Store(_) => "store",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailOptions {
    pub relay_domain: String,
    pub relay_from_address: String,
    pub blocked_senders: Vec<String>,
}

/// Turns a verified inbound-mail event into an outbound forward (or a
/// block/spam decision) and keeps the alias counters current.
pub struct MailDispatcher {
    store: Arc<dyn MailStore>,
    blobs: Arc<dyn BlobStore>,
    mailer: Arc<dyn OutboundMailer>,
    options: MailOptions,
    metrics: Option<Metrics>,
}

impl MailDispatcher {
    pub fn new(
        store: Arc<dyn MailStore>,
        blobs: Arc<dyn BlobStore>,
        mailer: Arc<dyn OutboundMailer>,
        options: MailOptions,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            store,
            blobs,
            mailer,
            options,
            metrics,
        }
    }

    /// Safe to repeat: a redelivered envelope can double-increment counters
    /// (they are non-authoritative) and the outbound mailer dedups by its
    /// own message id.
    #[instrument(skip_all)]
    pub async fn dispatch(&self, mail: &InboundMail) -> Result<DispatchOutcome, DispatchError> {
        let (local_part, subdomain, destination) = mail
            .mail
            .destination
            .iter()
            .find_map(|candidate| {
                headers::split_relay_destination(candidate, &self.options.relay_domain)
                    .map(|(local, sub)| (local, sub, candidate.clone()))
            })
            .ok_or(DispatchError::NoRelayDestination)?;

        let alias = self
            .store
            .get_alias_by_address(&local_part, subdomain.as_deref())
            .await?
            .ok_or(DispatchError::NoSuchAlias(destination))?;

        if !alias.enabled {
            info!("Alias {} is disabled, blocking", alias.id);
            self.store.record_blocked(alias.id).await?;
            return Ok(DispatchOutcome::Blocked);
        }

        let body = self.message_body(mail).await?;

        if filters::sender_blocked(&mail.mail.source, &self.options.blocked_senders) {
            info!("Sender is on the block list, blocking");
            self.store.record_blocked(alias.id).await?;
            return Ok(DispatchOutcome::Blocked);
        }

        if alias.block_list_emails && filters::is_promotional(mail) {
            info!("Alias {} blocks promotional email", alias.id);
            self.store.record_blocked(alias.id).await?;
            return Ok(DispatchOutcome::Blocked);
        }

        if mail
            .receipt
            .as_ref()
            .and_then(|receipt| receipt.spam_verdict.as_ref())
            .is_some_and(|verdict| verdict.failed())
        {
            info!("Spam verdict failed, dropping");
            self.store.record_spam(alias.id).await?;
            return Ok(DispatchOutcome::Spam);
        }

        let (body, trackers_removed) = filters::strip_trackers(&body);
        if trackers_removed > 0 {
            self.store
                .record_trackers_blocked(alias.id, trackers_removed as i64)
                .await?;
        }

        let user = self
            .store
            .get_user(alias.user_id)
            .await?
            .ok_or(DispatchError::MissingOwner(alias.user_id))?;

        let email = self.render_forward(mail, &alias, &user.email, body);
        let outcome = self.mailer.send(&email).await;
        if let Some(metrics) = &self.metrics {
            let label = match &outcome {
                SendOutcome::Delivered { .. } => "delivered",
                SendOutcome::Transient { .. } => "transient",
                SendOutcome::Permanent { .. } => "permanent",
            };
            metrics.outbound_send(label);
        }

        match outcome {
            SendOutcome::Delivered { message_id } => {
                info!("Forwarded as outbound message {message_id}");
                self.store.record_forwarded(alias.id).await?;
                Ok(DispatchOutcome::Forwarded)
            }
            SendOutcome::Transient { code } => Err(DispatchError::Send {
                code,
                kind: FailureKind::Transient,
            }),
            SendOutcome::Permanent { code } => Err(DispatchError::Send {
                code,
                kind: FailureKind::Permanent,
            }),
        }
    }

    /// Inline body when the ingestion service kept it under its spool
    /// threshold, otherwise a single blob read.
    async fn message_body(&self, mail: &InboundMail) -> Result<String, DispatchError> {
        if let Some(content) = &mail.content {
            return Ok(content.clone());
        }

        let action = mail
            .receipt
            .as_ref()
            .and_then(|receipt| receipt.action.as_ref())
            .ok_or(DispatchError::MissingBody)?;
        let bucket = action.bucket_name.as_deref().ok_or(DispatchError::MissingBody)?;
        let key = action.object_key.as_deref().ok_or(DispatchError::MissingBody)?;

        let bytes = self.blobs.get(bucket, key).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn render_forward(
        &self,
        mail: &InboundMail,
        alias: &Alias,
        user_email: &str,
        body: String,
    ) -> OutboundEmail {
        let common = mail.mail.common_headers.as_ref();
        let original_from = common
            .and_then(|headers| headers.from.first().cloned())
            .unwrap_or_else(|| mail.mail.source.clone());
        let subject = common
            .and_then(|headers| headers.subject.clone())
            .unwrap_or_default();

        let mut extra_headers = Vec::new();
        if let Some(message_id) = common.and_then(|headers| headers.message_id.as_deref()) {
            extra_headers.push(("Message-ID".to_owned(), message_id.to_owned()));
        }
        if let Some(references) = common.and_then(|headers| headers.references.as_deref()) {
            extra_headers.push(("References".to_owned(), references.to_owned()));
        }

        OutboundEmail {
            to: user_email.to_owned(),
            from: headers::rewrite_from(&original_from, &self.options.relay_from_address),
            reply_to: Some(alias.address(&self.options.relay_domain)),
            subject,
            html_body: Some(body),
            text_body: None,
            headers: extra_headers,
        }
    }
}
