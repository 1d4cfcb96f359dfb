use {
    crate::{
        error::{RelayServerError, Result},
        model::types::{RealPhone, RelayNumber},
        state::AppState,
    },
    axum::{extract::State, response::IntoResponse, response::Response, Json},
    chrono::{DateTime, Utc},
    hyper::{HeaderMap, StatusCode},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    uuid::Uuid,
};

/// Set by the authenticating proxy in front of this service; session
/// handling itself lives outside this crate.
pub const USER_HEADER: &str = "X-Relay-User";

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub number: String,
    #[serde(default)]
    pub verification_code: Option<String>,
    /// Client region detected upstream, used to re-parse national-format
    /// numbers.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RealPhoneResponse {
    pub number: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl From<RealPhone> for RealPhoneResponse {
    fn from(record: RealPhone) -> Self {
        Self {
            number: record.number,
            verified: record.verified,
            verified_at: record.verified_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RelayNumberRequest {
    pub number: String,
}

#[derive(Debug, Serialize)]
pub struct RelayNumberResponse {
    pub number: String,
    pub enabled: bool,
    pub remaining_texts: i32,
    pub remaining_seconds: i32,
}

impl From<RelayNumber> for RelayNumberResponse {
    fn from(record: RelayNumber) -> Self {
        Self {
            number: record.number,
            enabled: record.enabled,
            remaining_texts: record.remaining_texts,
            remaining_seconds: record.remaining_seconds,
        }
    }
}

fn request_user(headers: &HeaderMap) -> Result<Uuid> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| RelayServerError::BadRequest("Missing or invalid user header".to_owned()))
}

pub async fn request_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PhoneRequest>,
) -> Result<Response> {
    let user_id = request_user(&headers)?;
    let record = state
        .phones
        .request_verification(user_id, &request.number, request.region.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RealPhoneResponse::from(record)),
    )
        .into_response())
}

pub async fn submit_code(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PhoneRequest>,
) -> Result<Response> {
    let user_id = request_user(&headers)?;
    let code = request.verification_code.as_deref().ok_or_else(|| {
        RelayServerError::BadRequest("verification_code is required".to_owned())
    })?;
    let record = state
        .phones
        .submit_code(user_id, &request.number, request.region.as_deref(), code)
        .await?;
    Ok(Json(RealPhoneResponse::from(record)).into_response())
}

pub async fn provision_relay_number(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RelayNumberRequest>,
) -> Result<Response> {
    let user_id = request_user(&headers)?;
    let record = state
        .phones
        .provision_relay_number(user_id, &request.number)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RelayNumberResponse::from(record)),
    )
        .into_response())
}
