use {
    crate::error::FailureKind,
    async_trait::async_trait,
    aws_sdk_sesv2::{
        error::ProvideErrorMetadata,
        types::{Body, Content, Destination, EmailContent, Message, MessageHeader},
    },
    tracing::instrument,
};

/// A fully rendered forward, ready for the outbound mailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// Extra headers carried through from the original message, e.g.
    /// Message-ID and References so threading survives the relay.
    pub headers: Vec<(String, String)>,
}

/// What one send attempt produced. The worker switches on the tag; only
/// `Transient` is retried in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: String },
    Transient { code: String },
    Permanent { code: String },
}

impl SendOutcome {
    pub fn from_error_code(code: &str) -> Self {
        match classify_send_error(code) {
            FailureKind::Transient => Self::Transient {
                code: code.to_owned(),
            },
            FailureKind::Permanent => Self::Permanent {
                code: code.to_owned(),
            },
        }
    }
}

/// Providers signal backpressure with throttling/pause codes; everything
/// else means this message will never send.
pub fn classify_send_error(code: &str) -> FailureKind {
    let code = code.to_lowercase();
    if code.contains("throttling") || code.contains("pause") {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

#[async_trait]
pub trait OutboundMailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> SendOutcome;
}

pub struct SesMailer {
    client: aws_sdk_sesv2::Client,
}

impl SesMailer {
    pub fn new(client: aws_sdk_sesv2::Client) -> Self {
        Self { client }
    }

    fn content(email: &OutboundEmail) -> Result<EmailContent, aws_sdk_sesv2::error::BuildError> {
        let subject = Content::builder().data(&email.subject).build()?;

        let mut body = Body::builder();
        if let Some(html) = &email.html_body {
            body = body.html(Content::builder().data(html).build()?);
        }
        if let Some(text) = &email.text_body {
            body = body.text(Content::builder().data(text).build()?);
        }

        let mut message = Message::builder().subject(subject).body(body.build());
        for (name, value) in &email.headers {
            message = message.headers(MessageHeader::builder().name(name).value(value).build()?);
        }

        Ok(EmailContent::builder().simple(message.build()?).build())
    }
}

#[async_trait]
impl OutboundMailer for SesMailer {
    #[instrument(skip_all, fields(to = %email.to))]
    async fn send(&self, email: &OutboundEmail) -> SendOutcome {
        let content = match Self::content(email) {
            Ok(content) => content,
            Err(e) => {
                return SendOutcome::Permanent {
                    code: format!("InvalidContent: {e}"),
                }
            }
        };

        let mut request = self
            .client
            .send_email()
            .from_email_address(&email.from)
            .destination(Destination::builder().to_addresses(&email.to).build())
            .content(content);
        if let Some(reply_to) = &email.reply_to {
            request = request.reply_to_addresses(reply_to);
        }

        match request.send().await {
            Ok(output) => SendOutcome::Delivered {
                message_id: output.message_id.unwrap_or_default(),
            },
            Err(e) => {
                let code = e.code().map(str::to_owned).unwrap_or_else(|| e.to_string());
                SendOutcome::from_error_code(&code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_pause_codes_are_transient() {
        assert_eq!(
            classify_send_error("ThrottlingException"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_send_error("Account sending PAUSED"),
            FailureKind::Transient
        );
        assert_eq!(classify_send_error("pause"), FailureKind::Transient);
    }

    #[test]
    fn other_codes_are_permanent() {
        assert_eq!(
            classify_send_error("MessageRejected"),
            FailureKind::Permanent
        );
        assert_eq!(
            classify_send_error("MailFromDomainNotVerified"),
            FailureKind::Permanent
        );
        assert_eq!(classify_send_error(""), FailureKind::Permanent);
    }

    #[test]
    fn outcome_wraps_the_original_code() {
        assert_eq!(
            SendOutcome::from_error_code("ThrottlingException"),
            SendOutcome::Transient {
                code: "ThrottlingException".to_owned()
            }
        );
        assert_eq!(
            SendOutcome::from_error_code("MessageRejected"),
            SendOutcome::Permanent {
                code: "MessageRejected".to_owned()
            }
        );
    }
}
