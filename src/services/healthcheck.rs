use {
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
    std::{fs, io, path::Path},
    thiserror::Error,
};

/// Rolling liveness document the worker overwrites once per cycle. The
/// probe only needs `timestamp`; the counters are there for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthcheckDocument {
    pub timestamp: DateTime<Utc>,
    pub cycles: u64,
    pub total_messages: u64,
    pub failed_messages: u64,
    pub pause_count: u64,
    pub queue_count: u64,
    pub queue_count_delayed: u64,
    pub queue_count_not_visible: u64,
}

/// Atomic overwrite: write a sibling temp file, then rename over the
/// target so the probe never observes a partial document.
pub fn write_healthcheck(path: &Path, document: &HealthcheckDocument) -> io::Result<()> {
    let serialized = serde_json::to_vec(document)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serialized)?;
    fs::rename(&tmp_path, path)
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Cannot read healthcheck file: {0}")]
    Unreadable(#[from] io::Error),

    #[error("Healthcheck file is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Healthcheck document has no timestamp")]
    MissingTimestamp,

    #[error("Timestamp is not RFC 3339 with a timezone: {0}")]
    InvalidTimestamp(String),

    #[error("Timestamp is too old: {age_seconds}s exceeds max age {max_age_seconds}s")]
    TooOld {
        age_seconds: i64,
        max_age_seconds: i64,
    },
}

/// Checks the worker's healthcheck document for staleness. The timestamp
/// is pulled out of the raw JSON so a malformed value fails here rather
/// than during deserialization.
pub fn check_healthcheck(
    path: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<HealthcheckDocument, ProbeError> {
    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;

    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or(ProbeError::MissingTimestamp)?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| ProbeError::InvalidTimestamp(timestamp.to_owned()))?;

    let age = now.signed_duration_since(timestamp.with_timezone(&Utc));
    if age > max_age {
        return Err(ProbeError::TooOld {
            age_seconds: age.num_seconds(),
            max_age_seconds: max_age.num_seconds(),
        });
    }

    Ok(serde_json::from_value(value)?)
}
