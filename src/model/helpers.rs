use {
    super::{
        types::{Alias, InboundContact, RealPhone, RelayNumber, RelayUser},
        MailStore, PhoneStore, StoreError,
    },
    crate::metrics::Metrics,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{PgPool, Postgres},
    std::time::Instant,
    tracing::instrument,
    uuid::Uuid,
};

pub struct PostgresStore {
    postgres: PgPool,
    metrics: Option<Metrics>,
}

impl PostgresStore {
    pub fn new(postgres: PgPool, metrics: Option<Metrics>) -> Self {
        Self { postgres, metrics }
    }
}

#[instrument(skip(postgres, metrics))]
pub async fn get_alias_by_address(
    local_part: &str,
    subdomain: Option<&str>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<Alias>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM relay_address
        WHERE local_part=$1 AND subdomain IS NOT DISTINCT FROM $2
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, Alias>(query)
        .bind(local_part)
        .bind(subdomain)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_alias_by_address", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn get_user(
    user_id: Uuid,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<RelayUser>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM relay_user
        WHERE id=$1
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RelayUser>(query)
        .bind(user_id)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_user", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn count_user_aliases(
    user_id: Uuid,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<i64, sqlx::error::Error> {
    let query = "
        SELECT COUNT(*)
        FROM relay_address
        WHERE user_id=$1
    ";
    let start = Instant::now();
    let result = sqlx::query_scalar::<Postgres, i64>(query)
        .bind(user_id)
        .fetch_one(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("count_user_aliases", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn insert_alias(
    user_id: Uuid,
    local_part: &str,
    subdomain: Option<&str>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Alias, sqlx::error::Error> {
    let query = "
        INSERT INTO relay_address (user_id, local_part, subdomain)
        VALUES ($1, $2, $3)
        RETURNING *
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, Alias>(query)
        .bind(user_id)
        .bind(local_part)
        .bind(subdomain)
        .fetch_one(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("insert_alias", start);
    }
    result
}

/// Deletes the alias and archives the address hash plus final counter
/// values in the same statement.
#[instrument(skip(postgres, metrics))]
pub async fn delete_alias(
    alias_id: Uuid,
    address_hash: &str,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    let query = "
        WITH deleted AS (
            DELETE FROM relay_address
            WHERE id=$1
            RETURNING num_forwarded, num_blocked, num_spam, num_replied,
                num_level_one_trackers_blocked
        )
        INSERT INTO deleted_address (
            address_hash, num_forwarded, num_blocked, num_spam, num_replied,
            num_level_one_trackers_blocked
        )
        SELECT $2, num_forwarded, num_blocked, num_spam, num_replied,
            num_level_one_trackers_blocked
        FROM deleted
    ";
    let start = Instant::now();
    let result = sqlx::query(query)
        .bind(alias_id)
        .bind(address_hash)
        .execute(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("delete_alias", start);
    }
    result.map(|_| ())
}

/// Counter updates are single atomic increments; concurrent workers and
/// queue redeliveries can only ever add.
#[instrument(skip(postgres, metrics))]
pub async fn increment_alias_counter(
    alias_id: Uuid,
    counter: &'static str,
    by: i64,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    // `counter` is always a compile-time column name, never input.
    let query = match counter {
        "num_forwarded" => {
            "UPDATE relay_address
             SET num_forwarded = num_forwarded + $2, last_used_at = now()
             WHERE id=$1"
        }
        "num_blocked" => "UPDATE relay_address SET num_blocked = num_blocked + $2 WHERE id=$1",
        "num_spam" => "UPDATE relay_address SET num_spam = num_spam + $2 WHERE id=$1",
        "num_level_one_trackers_blocked" => {
            "UPDATE relay_address
             SET num_level_one_trackers_blocked = num_level_one_trackers_blocked + $2
             WHERE id=$1"
        }
        _ => unreachable!("unknown alias counter {counter}"),
    };
    let start = Instant::now();
    let result = sqlx::query(query)
        .bind(alias_id)
        .bind(by)
        .execute(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query(counter, start);
    }
    result.map(|_| ())
}

#[instrument(skip(postgres, metrics))]
pub async fn get_verified_real_phone(
    user_id: Uuid,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<RealPhone>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM real_phone
        WHERE user_id=$1 AND verified
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RealPhone>(query)
        .bind(user_id)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_verified_real_phone", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn get_real_phone_by_number(
    user_id: Uuid,
    number: &str,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<RealPhone>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM real_phone
        WHERE user_id=$1 AND number=$2
        ORDER BY verification_sent_at DESC
        LIMIT 1
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RealPhone>(query)
        .bind(user_id)
        .bind(number)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_real_phone_by_number", start);
    }
    result
}

#[instrument(skip(verification_code, postgres, metrics))]
pub async fn create_real_phone(
    user_id: Uuid,
    number: &str,
    verification_code: &str,
    sent_at: DateTime<Utc>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<RealPhone, sqlx::error::Error> {
    let query = "
        INSERT INTO real_phone (user_id, number, verification_code, verification_sent_at)
        VALUES ($1, $2, $3, $4)
        RETURNING *
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RealPhone>(query)
        .bind(user_id)
        .bind(number)
        .bind(verification_code)
        .bind(sent_at)
        .fetch_one(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("create_real_phone", start);
    }
    result
}

#[instrument(skip(verification_code, postgres, metrics))]
pub async fn refresh_real_phone_code(
    real_phone_id: Uuid,
    verification_code: &str,
    sent_at: DateTime<Utc>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    let query = "
        UPDATE real_phone
        SET verification_code=$2, verification_sent_at=$3
        WHERE id=$1 AND NOT verified
    ";
    let start = Instant::now();
    let result = sqlx::query(query)
        .bind(real_phone_id)
        .bind(verification_code)
        .bind(sent_at)
        .execute(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("refresh_real_phone_code", start);
    }
    result.map(|_| ())
}

#[instrument(skip(postgres, metrics))]
pub async fn mark_real_phone_verified(
    real_phone_id: Uuid,
    verified_at: DateTime<Utc>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    let query = "
        UPDATE real_phone
        SET verified=true, verified_at=$2
        WHERE id=$1
    ";
    let start = Instant::now();
    let result = sqlx::query(query)
        .bind(real_phone_id)
        .bind(verified_at)
        .execute(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("mark_real_phone_verified", start);
    }
    result.map(|_| ())
}

#[instrument(skip(postgres, metrics))]
pub async fn get_relay_number_by_number(
    number: &str,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<RelayNumber>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM relay_number
        WHERE number=$1
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RelayNumber>(query)
        .bind(number)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_relay_number_by_number", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn get_relay_number_for_user(
    user_id: Uuid,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Option<RelayNumber>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM relay_number
        WHERE user_id=$1
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RelayNumber>(query)
        .bind(user_id)
        .fetch_optional(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("get_relay_number_for_user", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn create_relay_number(
    user_id: Uuid,
    number: &str,
    vcard_lookup_key: &str,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<RelayNumber, sqlx::error::Error> {
    let query = "
        INSERT INTO relay_number (user_id, number, vcard_lookup_key)
        VALUES ($1, $2, $3)
        RETURNING *
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, RelayNumber>(query)
        .bind(user_id)
        .bind(number)
        .bind(vcard_lookup_key)
        .fetch_one(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("create_relay_number", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn upsert_inbound_contact(
    relay_number_id: Uuid,
    inbound_number: &str,
    at: DateTime<Utc>,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<InboundContact, sqlx::error::Error> {
    let query = "
        INSERT INTO inbound_contact (relay_number_id, inbound_number, last_inbound_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (relay_number_id, inbound_number) DO UPDATE SET
            last_inbound_at=$3
        RETURNING *
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, InboundContact>(query)
        .bind(relay_number_id)
        .bind(inbound_number)
        .bind(at)
        .fetch_one(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("upsert_inbound_contact", start);
    }
    result
}

#[instrument(skip(postgres, metrics))]
pub async fn increment_contact_counter(
    contact_id: Uuid,
    call: bool,
    blocked: bool,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    let (name, query) = match (call, blocked) {
        (false, false) => (
            "contact_num_texts",
            "UPDATE inbound_contact SET num_texts = num_texts + 1 WHERE id=$1",
        ),
        (false, true) => (
            "contact_num_texts_blocked",
            "UPDATE inbound_contact SET num_texts_blocked = num_texts_blocked + 1 WHERE id=$1",
        ),
        (true, false) => (
            "contact_num_calls",
            "UPDATE inbound_contact SET num_calls = num_calls + 1 WHERE id=$1",
        ),
        (true, true) => (
            "contact_num_calls_blocked",
            "UPDATE inbound_contact SET num_calls_blocked = num_calls_blocked + 1 WHERE id=$1",
        ),
    };
    let start = Instant::now();
    let result = sqlx::query(query).bind(contact_id).execute(postgres).await;
    if let Some(metrics) = metrics {
        metrics.postgres_query(name, start);
    }
    result.map(|_| ())
}

#[instrument(skip(postgres, metrics))]
pub async fn increment_relay_number_counter(
    relay_number_id: Uuid,
    call: bool,
    blocked: bool,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<(), sqlx::error::Error> {
    let (name, query) = match (call, blocked) {
        (false, false) => (
            "relay_num_texts",
            "UPDATE relay_number
             SET num_texts = num_texts + 1, remaining_texts = remaining_texts - 1
             WHERE id=$1",
        ),
        (false, true) => (
            "relay_num_texts_blocked",
            "UPDATE relay_number SET num_texts_blocked = num_texts_blocked + 1 WHERE id=$1",
        ),
        (true, false) => (
            "relay_num_calls",
            "UPDATE relay_number SET num_calls = num_calls + 1 WHERE id=$1",
        ),
        (true, true) => (
            "relay_num_calls_blocked",
            "UPDATE relay_number SET num_calls_blocked = num_calls_blocked + 1 WHERE id=$1",
        ),
    };
    let start = Instant::now();
    let result = sqlx::query(query)
        .bind(relay_number_id)
        .execute(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query(name, start);
    }
    result.map(|_| ())
}

#[instrument(skip(postgres, metrics))]
pub async fn list_inbound_contacts(
    relay_number_id: Uuid,
    postgres: &PgPool,
    metrics: Option<&Metrics>,
) -> Result<Vec<InboundContact>, sqlx::error::Error> {
    let query = "
        SELECT *
        FROM inbound_contact
        WHERE relay_number_id=$1
        ORDER BY last_inbound_at DESC
    ";
    let start = Instant::now();
    let result = sqlx::query_as::<Postgres, InboundContact>(query)
        .bind(relay_number_id)
        .fetch_all(postgres)
        .await;
    if let Some(metrics) = metrics {
        metrics.postgres_query("list_inbound_contacts", start);
    }
    result
}

#[async_trait]
impl MailStore for PostgresStore {
    async fn get_alias_by_address(
        &self,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Option<Alias>, StoreError> {
        Ok(get_alias_by_address(local_part, subdomain, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError> {
        Ok(get_user(user_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn count_user_aliases(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(count_user_aliases(user_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn insert_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Alias, StoreError> {
        Ok(insert_alias(
            user_id,
            local_part,
            subdomain,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn delete_alias(&self, alias_id: Uuid, address_hash: &str) -> Result<(), StoreError> {
        Ok(delete_alias(alias_id, address_hash, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn record_forwarded(&self, alias_id: Uuid) -> Result<(), StoreError> {
        Ok(increment_alias_counter(
            alias_id,
            "num_forwarded",
            1,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_blocked(&self, alias_id: Uuid) -> Result<(), StoreError> {
        Ok(increment_alias_counter(
            alias_id,
            "num_blocked",
            1,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_spam(&self, alias_id: Uuid) -> Result<(), StoreError> {
        Ok(
            increment_alias_counter(alias_id, "num_spam", 1, &self.postgres, self.metrics.as_ref())
                .await?,
        )
    }

    async fn record_trackers_blocked(&self, alias_id: Uuid, count: i64) -> Result<(), StoreError> {
        Ok(increment_alias_counter(
            alias_id,
            "num_level_one_trackers_blocked",
            count,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }
}

#[async_trait]
impl PhoneStore for PostgresStore {
    async fn get_phone_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError> {
        Ok(get_user(user_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn get_verified_real_phone(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RealPhone>, StoreError> {
        Ok(get_verified_real_phone(user_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn get_real_phone_by_number(
        &self,
        user_id: Uuid,
        number: &str,
    ) -> Result<Option<RealPhone>, StoreError> {
        Ok(
            get_real_phone_by_number(user_id, number, &self.postgres, self.metrics.as_ref())
                .await?,
        )
    }

    async fn create_real_phone(
        &self,
        user_id: Uuid,
        number: &str,
        verification_code: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<RealPhone, StoreError> {
        Ok(create_real_phone(
            user_id,
            number,
            verification_code,
            sent_at,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn refresh_real_phone_code(
        &self,
        real_phone_id: Uuid,
        verification_code: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(refresh_real_phone_code(
            real_phone_id,
            verification_code,
            sent_at,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn mark_real_phone_verified(
        &self,
        real_phone_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(mark_real_phone_verified(
            real_phone_id,
            verified_at,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn get_relay_number_by_number(
        &self,
        number: &str,
    ) -> Result<Option<RelayNumber>, StoreError> {
        Ok(get_relay_number_by_number(number, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn get_relay_number_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RelayNumber>, StoreError> {
        Ok(get_relay_number_for_user(user_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn create_relay_number(
        &self,
        user_id: Uuid,
        number: &str,
        vcard_lookup_key: &str,
    ) -> Result<RelayNumber, StoreError> {
        Ok(create_relay_number(
            user_id,
            number,
            vcard_lookup_key,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn upsert_inbound_contact(
        &self,
        relay_number_id: Uuid,
        inbound_number: &str,
        at: DateTime<Utc>,
    ) -> Result<InboundContact, StoreError> {
        Ok(upsert_inbound_contact(
            relay_number_id,
            inbound_number,
            at,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_contact_text(
        &self,
        contact_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError> {
        Ok(increment_contact_counter(
            contact_id,
            false,
            blocked,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_contact_call(
        &self,
        contact_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError> {
        Ok(increment_contact_counter(
            contact_id,
            true,
            blocked,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_relay_text(
        &self,
        relay_number_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError> {
        Ok(increment_relay_number_counter(
            relay_number_id,
            false,
            blocked,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn record_relay_call(
        &self,
        relay_number_id: Uuid,
        blocked: bool,
    ) -> Result<(), StoreError> {
        Ok(increment_relay_number_counter(
            relay_number_id,
            true,
            blocked,
            &self.postgres,
            self.metrics.as_ref(),
        )
        .await?)
    }

    async fn list_inbound_contacts(
        &self,
        relay_number_id: Uuid,
    ) -> Result<Vec<InboundContact>, StoreError> {
        Ok(list_inbound_contacts(relay_number_id, &self.postgres, self.metrics.as_ref()).await?)
    }

    async fn last_inbound_contact(
        &self,
        relay_number_id: Uuid,
    ) -> Result<Option<InboundContact>, StoreError> {
        Ok(
            list_inbound_contacts(relay_number_id, &self.postgres, self.metrics.as_ref())
                .await?
                .into_iter()
                .next(),
        )
    }
}
