use {
    axum::{response::IntoResponse, Json},
    hyper::StatusCode,
    serde_json::json,
    tracing::{error, warn},
};

pub type Result<T> = std::result::Result<T, RelayServerError>;

/// Whether a pipeline failure should be retried in-process or surfaced to
/// the queue's failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Stable, client-visible error codes. The code string never changes once
/// shipped; clients key translations off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NeedSubdomain,
    AddressNotEditable,
    AddressUnavailable,
    DuplicateAddress,
    FreeTierLimit,
    FreeTierNoSubdomainMasks,
    AccountIsPaused,
    AccountIsInactive,
    ConflictError,
    DomainAddressExists,
    NoPhoneLog,
    NoPreviousSender,
    ShortPrefixMatchesNoSenders,
    FullNumberMatchesNoSenders,
    MultipleNumberMatches,
    NoBodyAfterShortPrefix,
    NoBodyAfterFullNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected with a 4xx.
    Validation,
    /// State conflict, rejected with a 409.
    Conflict,
    /// Failures communicated back to the caller over SMS; the HTTP response
    /// is a 200 with an error payload so the provider does not retry.
    SmsReply,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedSubdomain => "need_subdomain",
            Self::AddressNotEditable => "address_not_editable",
            Self::AddressUnavailable => "address_unavailable",
            Self::DuplicateAddress => "duplicate_address",
            Self::FreeTierLimit => "free_tier_limit",
            Self::FreeTierNoSubdomainMasks => "free_tier_no_subdomain_masks",
            Self::AccountIsPaused => "account_is_paused",
            Self::AccountIsInactive => "account_is_inactive",
            Self::ConflictError => "conflict_error",
            Self::DomainAddressExists => "domain_address_exists",
            Self::NoPhoneLog => "no_phone_log",
            Self::NoPreviousSender => "no_previous_sender",
            Self::ShortPrefixMatchesNoSenders => "short_prefix_matches_no_senders",
            Self::FullNumberMatchesNoSenders => "full_number_matches_no_senders",
            Self::MultipleNumberMatches => "multiple_number_matches",
            Self::NoBodyAfterShortPrefix => "no_body_after_short_prefix",
            Self::NoBodyAfterFullNumber => "no_body_after_full_number",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConflictError | Self::DomainAddressExists => ErrorKind::Conflict,
            Self::NoPhoneLog
            | Self::NoPreviousSender
            | Self::ShortPrefixMatchesNoSenders
            | Self::FullNumberMatchesNoSenders
            | Self::MultipleNumberMatches
            | Self::NoBodyAfterShortPrefix
            | Self::NoBodyAfterFullNumber => ErrorKind::SmsReply,
            _ => ErrorKind::Validation,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::SmsReply => StatusCode::OK,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Self::NeedSubdomain => "Please select a subdomain before creating a custom mask",
            Self::AddressNotEditable => "You cannot edit an existing domain address field",
            Self::AddressUnavailable => "This mask is not available",
            Self::DuplicateAddress => "This mask already exists",
            Self::FreeTierLimit => "You have reached the maximum number of masks for a free account",
            Self::FreeTierNoSubdomainMasks => {
                "Your free account does not include custom subdomain masks"
            }
            Self::AccountIsPaused => "Your account is on pause",
            Self::AccountIsInactive => "Your account is not active",
            Self::ConflictError => "This number is already registered or pending verification",
            Self::DomainAddressExists => "This domain address already exists",
            Self::NoPhoneLog => {
                "Please enable caller and text logs to reply to texts from this number"
            }
            Self::NoPreviousSender => "You can only reply to phone numbers that have sent you a text",
            Self::ShortPrefixMatchesNoSenders => "There is no phone number matching this prefix",
            Self::FullNumberMatchesNoSenders => "There is no phone number matching this number",
            Self::MultipleNumberMatches => "There is more than one phone number matching this prefix",
            Self::NoBodyAfterShortPrefix => "Please include a message after the prefix",
            Self::NoBodyAfterFullNumber => "Please include a message after the phone number",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    #[error("{}", detail.as_deref().unwrap_or_else(|| code.default_message()))]
    Coded {
        code: ErrorCode,
        detail: Option<String>,
    },

    #[error("Invalid provider signature")]
    InvalidProviderSignature,

    #[error("No relay number matches {0}")]
    UnknownRelayNumber(String),

    #[error("This relay number is disabled")]
    NumberDisabled,

    #[error("Telephony vendor rejected the request: {0}")]
    VendorRejected(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] crate::model::StoreError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    #[error(transparent)]
    Envy(#[from] envy::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::error::Error),

    #[error("sqlx migration error: {0}")]
    SqlxMigration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayServerError {
    pub fn coded(code: ErrorCode) -> Self {
        Self::Coded { code, detail: None }
    }

    pub fn coded_detail(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Coded {
            code,
            detail: Some(detail.into()),
        }
    }
}

impl IntoResponse for RelayServerError {
    fn into_response(self) -> axum::response::Response {
        warn!("Error response: {:?}", self);
        match self {
            Self::Coded { code, detail } => {
                let body = Json(json!({
                    "error_code": code.as_str(),
                    "detail": detail.unwrap_or_else(|| code.default_message().to_owned()),
                }));
                (code.status(), body).into_response()
            }
            Self::InvalidProviderSignature => {
                (StatusCode::FORBIDDEN, "Invalid signature").into_response()
            }
            Self::UnknownRelayNumber(_) => {
                (StatusCode::NOT_FOUND, "Unknown relay number").into_response()
            }
            Self::NumberDisabled => {
                (StatusCode::BAD_REQUEST, "This number is disabled").into_response()
            }
            Self::BadRequest(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": e
                })),
            )
                .into_response(),
            error => {
                error!("Unhandled error: {:?}", error);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.").into_response()
            }
        }
    }
}
