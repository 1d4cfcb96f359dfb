use {serde::Deserialize, thiserror::Error, url::Url};

pub mod verifier;

pub const TYPE_NOTIFICATION: &str = "Notification";
pub const TYPE_SUBSCRIPTION_CONFIRMATION: &str = "SubscriptionConfirmation";

/// The signed wrapper a queue message body decodes to.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Subject")]
    pub subject: Option<String>,
    #[serde(rename = "Token")]
    pub token: Option<String>,
    #[serde(rename = "SubscribeURL")]
    pub subscribe_url: Option<String>,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "SignatureVersion", default)]
    pub signature_version: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseEnvelopeError {
    #[error("Envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl RawEnvelope {
    pub fn parse(raw_body: &str) -> Result<Self, ParseEnvelopeError> {
        Ok(serde_json::from_str(raw_body)?)
    }

    /// The exact byte sequence the publisher signed: `name\nvalue\n` pairs
    /// in a fixed order that depends on the envelope type. Optional fields
    /// that are absent are skipped, not emitted empty.
    pub fn canonical_string(&self) -> Result<String, verifier::VerifyError> {
        let mut out = String::new();
        let mut push = |name: &str, value: &str| {
            out.push_str(name);
            out.push('\n');
            out.push_str(value);
            out.push('\n');
        };

        match self.kind.as_str() {
            TYPE_NOTIFICATION => {
                push("Message", &self.message);
                push("MessageId", &self.message_id);
                if let Some(subject) = &self.subject {
                    push("Subject", subject);
                }
                push("Timestamp", &self.timestamp);
                push("TopicArn", &self.topic_arn);
                push("Type", &self.kind);
            }
            TYPE_SUBSCRIPTION_CONFIRMATION => {
                let token = self
                    .token
                    .as_deref()
                    .ok_or(verifier::VerifyError::MalformedEnvelope("Token"))?;
                let subscribe_url = self
                    .subscribe_url
                    .as_deref()
                    .ok_or(verifier::VerifyError::MalformedEnvelope("SubscribeURL"))?;
                push("Message", &self.message);
                push("MessageId", &self.message_id);
                push("SubscribeURL", subscribe_url);
                push("Timestamp", &self.timestamp);
                push("Token", token);
                push("TopicArn", &self.topic_arn);
                push("Type", &self.kind);
            }
            _ => return Err(verifier::VerifyError::MalformedEnvelope("Type")),
        }

        Ok(out)
    }
}

/// A verified envelope narrowed to the event the dispatchers act on.
#[derive(Debug)]
pub enum SnsEvent {
    SubscriptionConfirmation { token: String, subscribe_url: Url },
    InboundMail(Box<InboundMail>),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Envelope topic {got} does not match the configured topic")]
    UnexpectedTopic { got: String },

    #[error("Unknown envelope type {0}")]
    UnknownType(String),

    #[error("SubscribeURL is not a valid URL: {0}")]
    InvalidSubscribeUrl(#[from] url::ParseError),

    #[error("Missing envelope field {0}")]
    MissingField(&'static str),

    #[error("Inbound mail payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Narrows a verified envelope to a typed event. All failures here are
/// permanent; the message never becomes processable by retrying.
pub fn classify(envelope: &RawEnvelope, expected_topic: &str) -> Result<SnsEvent, ClassifyError> {
    if envelope.topic_arn != expected_topic {
        return Err(ClassifyError::UnexpectedTopic {
            got: envelope.topic_arn.clone(),
        });
    }

    match envelope.kind.as_str() {
        TYPE_SUBSCRIPTION_CONFIRMATION => {
            let token = envelope
                .token
                .clone()
                .ok_or(ClassifyError::MissingField("Token"))?;
            let subscribe_url = envelope
                .subscribe_url
                .as_deref()
                .ok_or(ClassifyError::MissingField("SubscribeURL"))?
                .parse()?;
            Ok(SnsEvent::SubscriptionConfirmation {
                token,
                subscribe_url,
            })
        }
        TYPE_NOTIFICATION => {
            let mail = serde_json::from_str::<InboundMail>(&envelope.message)?;
            Ok(SnsEvent::InboundMail(Box::new(mail)))
        }
        other => Err(ClassifyError::UnknownType(other.to_owned())),
    }
}

/// The nested payload produced by the mail ingestion service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMail {
    #[serde(default)]
    pub notification_type: Option<String>,
    pub mail: MailMetadata,
    #[serde(default)]
    pub receipt: Option<MailReceipt>,
    /// Inline body, present when the message was under the ingestion
    /// service's spool threshold.
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMetadata {
    pub destination: Vec<String>,
    pub source: String,
    #[serde(default)]
    pub headers: Vec<MailHeader>,
    #[serde(default)]
    pub common_headers: Option<CommonHeaders>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonHeaders {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub references: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailReceipt {
    #[serde(default)]
    pub spam_verdict: Option<Verdict>,
    #[serde(default)]
    pub action: Option<ReceiptAction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Verdict {
    pub status: String,
}

impl Verdict {
    pub fn failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("FAIL")
    }
}

/// Where the ingestion service put the full message when it was too large
/// to inline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptAction {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub object_key: Option<String>,
}

impl InboundMail {
    pub fn find_header(&self, name: &str) -> Option<&str> {
        self.mail
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}
