use {
    base64::Engine,
    hmac::{Hmac, Mac},
    itertools::Itertools,
    sha1::Sha1,
    thiserror::Error,
};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error)]
#[error("Provider signature does not verify")]
pub struct ProviderSignatureError;

fn provider_mac(auth_token: &str, url: &str, params: &[(String, String)]) -> HmacSha1 {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(url.as_bytes());
    for (name, value) in params.iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    mac
}

/// Validates the signature the telephony provider sends with each webhook:
/// base64(HMAC-SHA1(token, url + sorted form parameters)). The comparison
/// is constant time.
pub fn validate_provider_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> Result<(), ProviderSignatureError> {
    let provided = base64::engine::general_purpose::STANDARD
        .decode(provided)
        .map_err(|_| ProviderSignatureError)?;
    provider_mac(auth_token, url, params)
        .verify_slice(&provided)
        .map_err(|_| ProviderSignatureError)
}

/// The signature the provider would attach to the given request. Used by
/// tests and the local webhook smoke tooling.
pub fn compute_provider_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
) -> String {
    let digest = provider_mac(auth_token, url, params).finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(digest)
}
