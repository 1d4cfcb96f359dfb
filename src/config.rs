use {
    crate::error::RelayServerError,
    serde::Deserialize,
    std::net::{IpAddr, Ipv4Addr},
    url::Url,
};

/// Environment configuration. Every field maps 1:1 to an upper-cased
/// environment variable, e.g. `queue_url` reads `QUEUE_URL`.
#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    /// URL of the queue holding inbound-mail notifications.
    pub queue_url: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Notifications published to any other topic are rejected.
    pub allowed_topic: String,
    /// Host suffixes a signing-certificate URL may resolve to.
    #[serde(default = "default_cert_url_host_allowlist")]
    pub cert_url_host_allowlist: Vec<String>,

    /// Address outbound forwards are sent from.
    pub relay_from_address: String,
    /// Domain the masks live under, e.g. `relay.example.com`.
    pub relay_domain: String,
    /// Named credentials profile for the outbound mailer; the ambient AWS
    /// chain is used when unset.
    #[serde(default)]
    pub outbound_mailer_credentials: Option<String>,
    /// Bucket large message bodies are spooled to by the ingestion service.
    #[serde(default)]
    pub blob_bucket: Option<String>,
    /// Senders rejected outright, as exact addresses or bare domains.
    #[serde(default)]
    pub blocked_senders: Vec<String>,
    #[serde(default = "default_max_free_aliases")]
    pub max_free_aliases: i64,

    #[serde(default = "default_max_verify_age_minutes")]
    pub max_verify_age_minutes: i64,
    #[serde(default)]
    pub phone_provider_auth_token: Option<String>,
    /// Telephony vendor message endpoint; sends are dropped with a warning
    /// when unset.
    #[serde(default)]
    pub phone_provider_url: Option<Url>,
    #[serde(default = "default_phone_allowed_countries")]
    pub phone_allowed_countries: Vec<String>,
    /// External URL webhooks are delivered to; provider signatures are
    /// computed over it.
    #[serde(default)]
    pub public_url: Option<Url>,

    pub postgres_url: String,
    #[serde(default = "default_postgres_max_connections")]
    pub postgres_max_connections: u32,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_cert_url_host_allowlist() -> Vec<String> {
    vec!["amazonaws.com".to_owned()]
}

fn default_max_free_aliases() -> i64 {
    5
}

fn default_max_verify_age_minutes() -> i64 {
    5
}

fn default_phone_allowed_countries() -> Vec<String> {
    vec!["US".to_owned(), "CA".to_owned()]
}

fn default_postgres_max_connections() -> u32 {
    10
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "WARN,relay_server=INFO".to_owned()
}

pub fn get_configuration() -> Result<Configuration, RelayServerError> {
    Ok(envy::from_env::<Configuration>()?)
}

impl Configuration {
    pub fn max_verify_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_verify_age_minutes)
    }

    /// Short queue name used to tag metrics, i.e. the last path segment of
    /// the queue URL.
    pub fn queue_name(&self) -> &str {
        self.queue_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.queue_url)
    }
}
