use {async_trait::async_trait, thiserror::Error, tracing::{instrument, warn}, url::Url};

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("Vendor rejected the message: {0}")]
    Rejected(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Outbound side of the telephony vendor: sends texts from a relay number
/// (or the vendor's default sender when `from` is `None`).
#[async_trait]
pub trait SmsClient: Send + Sync {
    async fn send_sms(&self, from: Option<&str>, to: &str, body: &str) -> Result<(), SmsError>;
}

pub struct HttpSmsClient {
    http_client: reqwest::Client,
    endpoint: Url,
    auth_token: String,
}

impl HttpSmsClient {
    pub fn new(http_client: reqwest::Client, endpoint: Url, auth_token: String) -> Self {
        Self {
            http_client,
            endpoint,
            auth_token,
        }
    }
}

#[async_trait]
impl SmsClient for HttpSmsClient {
    #[instrument(skip(self, body))]
    async fn send_sms(&self, from: Option<&str>, to: &str, body: &str) -> Result<(), SmsError> {
        let mut form = vec![("To", to), ("Body", body)];
        if let Some(from) = from {
            form.push(("From", from));
        }

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .bearer_auth(&self.auth_token)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(SmsError::Rejected(format!("{status}: {detail}")));
        }
        Ok(())
    }
}

/// Stands in when no vendor endpoint is configured, e.g. local
/// development. Every send is dropped with a warning.
pub struct NoopSmsClient;

#[async_trait]
impl SmsClient for NoopSmsClient {
    async fn send_sms(&self, from: Option<&str>, to: &str, _body: &str) -> Result<(), SmsError> {
        warn!("No telephony vendor configured, dropping SMS from {from:?} to {to}");
        Ok(())
    }
}
