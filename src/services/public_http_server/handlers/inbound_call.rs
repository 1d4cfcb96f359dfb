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

pub const PATH: &str = "/hooks/inbound_call";

#[instrument(skip_all)]
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawForm(body): RawForm,
) -> Result<Response> {
    let params = form_params(&body);
    verify_webhook_signature(&state, &headers, PATH, &params)?;

    let instruction = state
        .phones
        .handle_inbound_call(form_value(&params, "From"), form_value(&params, "To"))
        .await?;

    let xml = match instruction {
        Some(instruction) => {
            info!("Dialing through relay number");
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?><Response><Dial callerId="{}">{}</Dial></Response>"#,
                instruction.caller_id, instruction.dial_to
            )
        }
        None => {
            info!("Caller is blocked, rejecting");
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Reject/></Response>"#.to_owned()
        }
    };

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], xml).into_response())
}
