use {
    crate::error::{ErrorCode, RelayServerError},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    thiserror::Error,
    uuid::Uuid,
};

pub mod helpers;
pub mod types;

use types::{Alias, InboundContact, RealPhone, RelayNumber, RelayUser};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("store backend failed: {0}")]
    Backend(String),
}

/// Persistence the mail pipeline needs. Counter updates are single atomic
/// increments so concurrent workers and redeliveries never lose updates.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn get_alias_by_address(
        &self,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Option<Alias>, StoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError>;

    async fn count_user_aliases(&self, user_id: Uuid) -> Result<i64, StoreError>;

    async fn insert_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Alias, StoreError>;

    /// Removes the alias after archiving a sha256 of its address together
    /// with its final counters.
    async fn delete_alias(&self, alias_id: Uuid, address_hash: &str) -> Result<(), StoreError>;

    async fn record_forwarded(&self, alias_id: Uuid) -> Result<(), StoreError>;

    async fn record_blocked(&self, alias_id: Uuid) -> Result<(), StoreError>;

    async fn record_spam(&self, alias_id: Uuid) -> Result<(), StoreError>;

    async fn record_trackers_blocked(&self, alias_id: Uuid, count: i64) -> Result<(), StoreError>;
}

/// Persistence for the telephony side: real-number verification records,
/// relay numbers, and the inbound-contact log.
#[async_trait]
pub trait PhoneStore: Send + Sync {
    async fn get_phone_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError>;

    async fn get_verified_real_phone(&self, user_id: Uuid)
        -> Result<Option<RealPhone>, StoreError>;

    async fn get_real_phone_by_number(
        &self,
        user_id: Uuid,
        number: &str,
    ) -> Result<Option<RealPhone>, StoreError>;

    async fn create_real_phone(
        &self,
        user_id: Uuid,
        number: &str,
        verification_code: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<RealPhone, StoreError>;

    /// Re-arms an expired pending record with a fresh code.
    async fn refresh_real_phone_code(
        &self,
        real_phone_id: Uuid,
        verification_code: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_real_phone_verified(
        &self,
        real_phone_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_relay_number_by_number(
        &self,
        number: &str,
    ) -> Result<Option<RelayNumber>, StoreError>;

    async fn get_relay_number_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RelayNumber>, StoreError>;

    async fn create_relay_number(
        &self,
        user_id: Uuid,
        number: &str,
        vcard_lookup_key: &str,
    ) -> Result<RelayNumber, StoreError>;

    async fn upsert_inbound_contact(
        &self,
        relay_number_id: Uuid,
        inbound_number: &str,
        at: DateTime<Utc>,
    ) -> Result<InboundContact, StoreError>;

    async fn record_contact_text(&self, contact_id: Uuid, blocked: bool)
        -> Result<(), StoreError>;

    async fn record_contact_call(&self, contact_id: Uuid, blocked: bool)
        -> Result<(), StoreError>;

    async fn record_relay_text(
        &self,
        relay_number_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError>;

    async fn record_relay_call(
        &self,
        relay_number_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError>;

    async fn list_inbound_contacts(
        &self,
        relay_number_id: Uuid,
    ) -> Result<Vec<InboundContact>, StoreError>;

    async fn last_inbound_contact(
        &self,
        relay_number_id: Uuid,
    ) -> Result<Option<InboundContact>, StoreError>;
}

/// Creates a mask for a user, enforcing tier limits and uniqueness. Kept
/// out of the HTTP layer so the checks hold for every caller.
pub async fn create_alias(
    store: &dyn MailStore,
    user_id: Uuid,
    local_part: &str,
    subdomain: Option<&str>,
    max_free_aliases: i64,
) -> Result<Alias, RelayServerError> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| RelayServerError::coded(ErrorCode::AccountIsInactive))?;
    if !user.active {
        return Err(RelayServerError::coded(ErrorCode::AccountIsInactive));
    }

    if !user.premium {
        if subdomain.is_some() {
            return Err(RelayServerError::coded(ErrorCode::FreeTierNoSubdomainMasks));
        }
        if store.count_user_aliases(user_id).await? >= max_free_aliases {
            return Err(RelayServerError::coded(ErrorCode::FreeTierLimit));
        }
    }

    if store
        .get_alias_by_address(local_part, subdomain)
        .await?
        .is_some()
    {
        return Err(RelayServerError::coded(ErrorCode::DuplicateAddress));
    }

    Ok(store.insert_alias(user_id, local_part, subdomain).await?)
}

/// Deletes a mask, archiving `sha256(address)` and its final counters.
pub async fn delete_alias(
    store: &dyn MailStore,
    alias: &Alias,
    relay_domain: &str,
) -> Result<(), RelayServerError> {
    let address_hash = sha256::digest(alias.address(relay_domain));
    store.delete_alias(alias.id, &address_hash).await?;
    Ok(())
}
