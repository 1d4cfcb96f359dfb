use {
    crate::{mail::headers::parse_address, sns::InboundMail},
    once_cell::sync::Lazy,
    regex::Regex,
};

/// Open-tracker hosts stripped from forwarded HTML. Level 1 covers the
/// single-pixel "did they open it" trackers.
const LEVEL_ONE_TRACKER_HOSTS: &[&str] = &[
    "mailtrack.io",
    "readnotify.com",
    "getnotify.com",
    "bananatag.com",
    "yesware.com",
    "streak.com",
    "mixmax.com",
];

static IMG_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<img\b[^>]*?src\s*=\s*["']?https?://([^"'\s/>]+)[^>]*>"#)
        .expect("static regex compiles")
});

/// Whether the sender is on the operator block list, either as an exact
/// address or as a bare domain covering the sender's domain and its
/// subdomains.
pub fn sender_blocked(source: &str, blocked_senders: &[String]) -> bool {
    let (_, address) = parse_address(source);
    let address = address.to_lowercase();
    let domain = address.rsplit_once('@').map(|(_, domain)| domain);

    blocked_senders.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry.contains('@') {
            address == entry
        } else {
            domain.is_some_and(|domain| {
                domain == entry || domain.ends_with(&format!(".{entry}"))
            })
        }
    })
}

/// Promotional mail declares an unsubscribe mechanism; masks with
/// `block_list_emails` set drop it.
pub fn is_promotional(mail: &InboundMail) -> bool {
    mail.find_header("List-Unsubscribe").is_some()
}

/// Removes tracker images from an HTML body, returning the rewritten body
/// and how many trackers were stripped.
pub fn strip_trackers(html: &str) -> (String, usize) {
    let mut removed = 0;
    let rewritten = IMG_TAG.replace_all(html, |captures: &regex::Captures| {
        let host = captures[1].to_lowercase();
        let tracked = LEVEL_ONE_TRACKER_HOSTS
            .iter()
            .any(|tracker| host == *tracker || host.ends_with(&format!(".{tracker}")));
        if tracked {
            removed += 1;
            String::new()
        } else {
            captures[0].to_owned()
        }
    });
    (rewritten.into_owned(), removed)
}
