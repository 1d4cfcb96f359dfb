use {
    super::{form_params, form_value, verify_webhook_signature},
    crate::{error::Result, state::AppState},
    axum::{
        extract::{RawForm, State},
        response::{IntoResponse, Response},
    },
    hyper::{header, HeaderMap, StatusCode},
    std::sync::Arc,
    tracing::{info, instrument},
};

pub const PATH: &str = "/hooks/inbound_sms";

/// Empty instruction document; the provider treats it as "accepted,
/// nothing more to do". Blocked contacts get the same answer so callers
/// cannot probe the block list.
const EMPTY_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

#[instrument(skip_all)]
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawForm(body): RawForm,
) -> Result<Response> {
    let params = form_params(&body);
    verify_webhook_signature(&state, &headers, PATH, &params)?;

    let disposition = state
        .phones
        .handle_inbound_sms(
            form_value(&params, "From"),
            form_value(&params, "To"),
            form_value(&params, "Body"),
        )
        .await?;
    info!("Inbound SMS settled as {disposition:?}");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        EMPTY_RESPONSE,
    )
        .into_response())
}
