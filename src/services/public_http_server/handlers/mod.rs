use {
    crate::{
        error::{RelayServerError, Result},
        phones::signature::validate_provider_signature,
        state::AppState,
    },
    hyper::header::HeaderMap,
    tracing::warn,
};

pub mod health;
pub mod inbound_call;
pub mod inbound_sms;
pub mod metrics;
pub mod phones;

pub const PROVIDER_SIGNATURE_HEADER: &str = "X-Provider-Signature";

pub(crate) fn form_params(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

pub(crate) fn form_value<'a>(params: &'a [(String, String)], name: &str) -> &'a str {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .unwrap_or("")
}

/// Recomputes the provider signature for this webhook and rejects the
/// request when it does not match. Requires both the shared token and the
/// external URL to be configured.
pub(crate) fn verify_webhook_signature(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    params: &[(String, String)],
) -> Result<()> {
    let Some(auth_token) = state.config.phone_provider_auth_token.as_deref() else {
        warn!("Rejecting webhook: PHONE_PROVIDER_AUTH_TOKEN is not configured");
        return Err(RelayServerError::InvalidProviderSignature);
    };
    let Some(public_url) = &state.config.public_url else {
        warn!("Rejecting webhook: PUBLIC_URL is not configured");
        return Err(RelayServerError::InvalidProviderSignature);
    };

    let provided = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(RelayServerError::InvalidProviderSignature)?;

    let url = public_url.join(path)?;
    validate_provider_signature(auth_token, url.as_str(), params, provided)
        .map_err(|_| RelayServerError::InvalidProviderSignature)
}
