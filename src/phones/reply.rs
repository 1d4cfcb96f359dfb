/// How the owner addressed an outgoing reply: nothing (last sender), a
/// full number prefix like `+15551234567: thanks`, or the last four digits
/// of a logged sender like `4567: thanks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyAddressing {
    LastSender { text: String },
    FullNumber { number: String, text: String },
    ShortPrefix { digits: String, text: String },
}

const SHORT_PREFIX_DIGITS: usize = 4;

pub fn parse_reply(body: &str) -> ReplyAddressing {
    let trimmed = body.trim();

    if let Some(rest) = trimmed.strip_prefix('+') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 7 {
            let text = rest[digits.len()..]
                .trim_start_matches(':')
                .trim()
                .to_owned();
            return ReplyAddressing::FullNumber {
                number: format!("+{digits}"),
                text,
            };
        }
    }

    let first_token: String = trimmed
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if first_token.len() == SHORT_PREFIX_DIGITS && first_token.chars().all(|c| c.is_ascii_digit())
    {
        let text = trimmed[first_token.len()..]
            .trim_start_matches(':')
            .trim()
            .to_owned();
        return ReplyAddressing::ShortPrefix {
            digits: first_token,
            text,
        };
    }

    ReplyAddressing::LastSender {
        text: trimmed.to_owned(),
    }
}
