use {
    chrono::{DateTime, Duration, Utc},
    sqlx::FromRow,
    uuid::Uuid,
};

// See /migrations for the table definitions.

#[derive(Debug, Clone, FromRow)]
pub struct RelayUser {
    pub id: Uuid,
    pub email: String,
    pub premium: bool,
    pub store_phone_log: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A disposable destination address. Random masks live directly under the
/// relay domain; custom masks live under a user-owned subdomain.
#[derive(Debug, Clone, FromRow)]
pub struct Alias {
    pub id: Uuid,
    pub user_id: Uuid,
    pub local_part: String,
    pub subdomain: Option<String>,
    pub enabled: bool,
    pub block_list_emails: bool,
    pub num_forwarded: i32,
    pub num_blocked: i32,
    pub num_spam: i32,
    pub num_replied: i32,
    pub num_level_one_trackers_blocked: i32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Alias {
    pub fn address(&self, relay_domain: &str) -> String {
        match &self.subdomain {
            Some(subdomain) => format!("{}@{}.{}", self.local_part, subdomain, relay_domain),
            None => format!("{}@{}", self.local_part, relay_domain),
        }
    }
}

/// A user's real number and its verification lifecycle.
#[derive(Debug, Clone, FromRow)]
pub struct RealPhone {
    pub id: Uuid,
    pub user_id: Uuid,
    pub number: String,
    pub verification_code: String,
    pub verification_sent_at: DateTime<Utc>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl RealPhone {
    /// A code is only good for the verification window after it was sent.
    pub fn code_expired(&self, now: DateTime<Utc>, max_verify_age: Duration) -> bool {
        now - self.verification_sent_at > max_verify_age
    }

    /// Unverified and still inside the verification window; blocks a second
    /// record for the same number.
    pub fn pending(&self, now: DateTime<Utc>, max_verify_age: Duration) -> bool {
        !self.verified && !self.code_expired(now, max_verify_age)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RelayNumber {
    pub id: Uuid,
    pub user_id: Uuid,
    pub number: String,
    pub vcard_lookup_key: String,
    pub enabled: bool,
    pub vendor: String,
    pub num_texts: i32,
    pub num_texts_blocked: i32,
    pub num_calls: i32,
    pub num_calls_blocked: i32,
    pub remaining_texts: i32,
    pub remaining_seconds: i32,
    pub created_at: DateTime<Utc>,
}

/// One distinct external number that has contacted a relay number. Only
/// kept while the owning user has phone logging enabled.
#[derive(Debug, Clone, FromRow)]
pub struct InboundContact {
    pub id: Uuid,
    pub relay_number_id: Uuid,
    pub inbound_number: String,
    pub blocked: bool,
    pub num_calls: i32,
    pub num_texts: i32,
    pub num_calls_blocked: i32,
    pub num_texts_blocked: i32,
    pub last_inbound_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_phone(verified: bool, sent_secs_ago: i64) -> RealPhone {
        RealPhone {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            number: "+15551234567".to_owned(),
            verification_code: "123456".to_owned(),
            verification_sent_at: Utc::now() - Duration::seconds(sent_secs_ago),
            verified,
            verified_at: None,
        }
    }

    #[test]
    fn pending_window_is_bounded_by_max_verify_age() {
        let now = Utc::now();
        let max_age = Duration::minutes(5);

        assert!(real_phone(false, 60).pending(now, max_age));
        assert!(!real_phone(false, 6 * 60).pending(now, max_age));
        assert!(!real_phone(true, 60).pending(now, max_age));
    }

    #[test]
    fn custom_mask_address_includes_subdomain() {
        let alias = Alias {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            local_part: "orders".to_owned(),
            subdomain: Some("lena".to_owned()),
            enabled: true,
            block_list_emails: false,
            num_forwarded: 0,
            num_blocked: 0,
            num_spam: 0,
            num_replied: 0,
            num_level_one_trackers_blocked: 0,
            created_at: Utc::now(),
            last_used_at: None,
        };
        assert_eq!(alias.address("relay.example.com"), "orders@lena.relay.example.com");
    }
}
