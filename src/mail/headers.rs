/// Splits an RFC 5322 mailbox like `Jane Doe <jane@example.com>` into its
/// display name and address. Bare addresses yield no display name.
pub fn parse_address(raw: &str) -> (Option<String>, String) {
    let raw = raw.trim();
    if let Some(open) = raw.rfind('<') {
        if let Some(close) = raw.rfind('>') {
            if close > open {
                let address = raw[open + 1..close].trim().to_owned();
                let name = raw[..open].trim().trim_matches('"').trim();
                let name = (!name.is_empty()).then(|| name.to_owned());
                return (name, address);
            }
        }
    }
    (None, raw.to_owned())
}

/// Rewrites the From header so the forward originates from the relay while
/// keeping the original sender recognizable. The original display name is
/// preserved; a bare address becomes the display name itself.
pub fn rewrite_from(original_from: &str, relay_from_address: &str) -> String {
    let (name, address) = parse_address(original_from);
    let display = name.unwrap_or(address);
    format!("\"{} via Relay\" <{}>", display.replace('"', ""), relay_from_address)
}

/// Matches a destination against the relay domain. `mask@relay.test` is a
/// random mask; `mask@sub.relay.test` is a custom mask under `sub`. Other
/// domains, and anything nested deeper than one label, are not ours.
pub fn split_relay_destination(
    address: &str,
    relay_domain: &str,
) -> Option<(String, Option<String>)> {
    let address = address.trim().to_lowercase();
    let relay_domain = relay_domain.to_lowercase();
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() {
        return None;
    }

    if domain == relay_domain {
        return Some((local.to_owned(), None));
    }

    let subdomain = domain.strip_suffix(&format!(".{relay_domain}"))?;
    if subdomain.is_empty() || subdomain.contains('.') {
        return None;
    }
    Some((local.to_owned(), Some(subdomain.to_owned())))
}
