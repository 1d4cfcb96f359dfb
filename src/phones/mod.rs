use {
    crate::{
        error::{ErrorCode, RelayServerError},
        model::{
            types::{InboundContact, RealPhone, RelayNumber},
            PhoneStore,
        },
    },
    chrono::{Duration, Utc},
    rand::Rng,
    std::{str::FromStr, sync::Arc},
    tracing::{info, instrument},
    uuid::Uuid,
};

pub mod reply;
pub mod signature;
pub mod vendor;

use {reply::ReplyAddressing, vendor::SmsClient};

/// How an inbound text was settled. All three are 200s to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsDisposition {
    Relayed,
    BlockedContact,
    Replied,
}

/// What to tell the telephony vendor to do with an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInstruction {
    pub dial_to: String,
    pub caller_id: String,
}

#[derive(Debug, Clone)]
pub struct PhoneOptions {
    pub max_verify_age: Duration,
    pub allowed_countries: Vec<String>,
}

/// Owns the real-number verification lifecycle and inbound SMS/voice
/// relaying, including per-contact accept/block policy.
pub struct PhoneService {
    store: Arc<dyn PhoneStore>,
    sms: Arc<dyn SmsClient>,
    options: PhoneOptions,
}

impl PhoneService {
    pub fn new(store: Arc<dyn PhoneStore>, sms: Arc<dyn SmsClient>, options: PhoneOptions) -> Self {
        Self {
            store,
            sms,
            options,
        }
    }

    /// Starts verification of a user's real number. At most one verified
    /// record per user, and one pending record per number, may exist.
    #[instrument(skip(self))]
    pub async fn request_verification(
        &self,
        user_id: Uuid,
        raw_number: &str,
        region: Option<&str>,
    ) -> Result<RealPhone, RelayServerError> {
        let user = self
            .store
            .get_phone_user(user_id)
            .await?
            .ok_or_else(|| RelayServerError::coded(ErrorCode::AccountIsInactive))?;
        if !user.active {
            return Err(RelayServerError::coded(ErrorCode::AccountIsInactive));
        }

        let number = parse_phone_number(raw_number, region, &self.options.allowed_countries)?;

        if self.store.get_verified_real_phone(user_id).await?.is_some() {
            return Err(RelayServerError::coded(ErrorCode::ConflictError));
        }

        let now = Utc::now();
        let code = generate_verification_code();

        if let Some(existing) = self.store.get_real_phone_by_number(user_id, &number).await? {
            if existing.pending(now, self.options.max_verify_age) {
                return Err(RelayServerError::coded(ErrorCode::ConflictError));
            }
            // Expired pending record: re-arm it rather than growing a
            // second row for the same number.
            self.store
                .refresh_real_phone_code(existing.id, &code, now)
                .await?;
            self.send_verification_sms(&number, &code).await?;
            return Ok(RealPhone {
                verification_code: code,
                verification_sent_at: now,
                ..existing
            });
        }

        let record = self
            .store
            .create_real_phone(user_id, &number, &code, now)
            .await?;
        self.send_verification_sms(&number, &code).await?;
        Ok(record)
    }

    /// Completes verification. Wrong or expired codes are surfaced as 400s
    /// and never touch the stored record.
    #[instrument(skip(self, code))]
    pub async fn submit_code(
        &self,
        user_id: Uuid,
        raw_number: &str,
        region: Option<&str>,
        code: &str,
    ) -> Result<RealPhone, RelayServerError> {
        let number = parse_phone_number(raw_number, region, &self.options.allowed_countries)?;

        let record = self
            .store
            .get_real_phone_by_number(user_id, &number)
            .await?
            .ok_or_else(|| {
                RelayServerError::BadRequest("This number has no pending verification".to_owned())
            })?;

        if record.verified {
            return Ok(record);
        }

        let now = Utc::now();
        if record.code_expired(now, self.options.max_verify_age) {
            return Err(RelayServerError::BadRequest(
                "The verification code has expired, request a new code".to_owned(),
            ));
        }
        if record.verification_code != code {
            return Err(RelayServerError::BadRequest(
                "The verification code is wrong".to_owned(),
            ));
        }

        self.store.mark_real_phone_verified(record.id, now).await?;
        info!("Verified real number for user {user_id}");
        Ok(RealPhone {
            verified: true,
            verified_at: Some(now),
            ..record
        })
    }

    /// Hands the user a relay number once their real number is verified.
    /// One per user.
    #[instrument(skip(self))]
    pub async fn provision_relay_number(
        &self,
        user_id: Uuid,
        number: &str,
    ) -> Result<RelayNumber, RelayServerError> {
        if self.store.get_verified_real_phone(user_id).await?.is_none() {
            return Err(RelayServerError::BadRequest(
                "Verify your real number before claiming a relay number".to_owned(),
            ));
        }
        if self
            .store
            .get_relay_number_for_user(user_id)
            .await?
            .is_some()
        {
            return Err(RelayServerError::coded(ErrorCode::ConflictError));
        }

        let vcard_lookup_key = Uuid::new_v4().simple().to_string();
        Ok(self
            .store
            .create_relay_number(user_id, number, &vcard_lookup_key)
            .await?)
    }

    /// Relays one inbound text, applying the contact block policy and
    /// keeping the per-contact and per-number counters current. A text
    /// from the owner's own real number is a reply and routes back out.
    #[instrument(skip(self, body))]
    pub async fn handle_inbound_sms(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<SmsDisposition, RelayServerError> {
        if from.is_empty() || to.is_empty() || body.is_empty() {
            return Err(RelayServerError::BadRequest(
                "Message missing From, To or Body".to_owned(),
            ));
        }

        let relay_number = self
            .store
            .get_relay_number_by_number(to)
            .await?
            .ok_or_else(|| RelayServerError::UnknownRelayNumber(to.to_owned()))?;
        if !relay_number.enabled {
            return Err(RelayServerError::NumberDisabled);
        }

        let real_phone = self
            .store
            .get_verified_real_phone(relay_number.user_id)
            .await?
            .ok_or(RelayServerError::NumberDisabled)?;

        if from == real_phone.number {
            return self.handle_reply(&relay_number, body).await;
        }

        let user = self
            .store
            .get_phone_user(relay_number.user_id)
            .await?
            .ok_or(RelayServerError::NumberDisabled)?;

        if user.store_phone_log {
            let contact = self
                .store
                .upsert_inbound_contact(relay_number.id, from, Utc::now())
                .await?;
            if contact.blocked {
                info!("Contact is blocked, not relaying");
                self.store.record_contact_text(contact.id, true).await?;
                self.store.record_relay_text(relay_number.id, true).await?;
                return Ok(SmsDisposition::BlockedContact);
            }
            self.store.record_contact_text(contact.id, false).await?;
        }

        self.store.record_relay_text(relay_number.id, false).await?;
        self.sms
            .send_sms(
                Some(&relay_number.number),
                &real_phone.number,
                &format!("[Relay {from}] {body}"),
            )
            .await
            .map_err(|e| RelayServerError::VendorRejected(e.to_string()))?;

        Ok(SmsDisposition::Relayed)
    }

    /// Routes a reply from the owner back out through the relay number,
    /// resolving the recipient from the inbound-contact log.
    async fn handle_reply(
        &self,
        relay_number: &RelayNumber,
        body: &str,
    ) -> Result<SmsDisposition, RelayServerError> {
        let user = self
            .store
            .get_phone_user(relay_number.user_id)
            .await?
            .ok_or(RelayServerError::NumberDisabled)?;
        if !user.store_phone_log {
            return Err(RelayServerError::coded(ErrorCode::NoPhoneLog));
        }

        let contacts = self.store.list_inbound_contacts(relay_number.id).await?;
        let (recipient, text) = resolve_reply(&contacts, reply::parse_reply(body))?;

        self.sms
            .send_sms(Some(&relay_number.number), &recipient, &text)
            .await
            .map_err(|e| RelayServerError::VendorRejected(e.to_string()))?;

        Ok(SmsDisposition::Replied)
    }

    /// Resolves an inbound call to a dial instruction for the vendor,
    /// applying the same contact policy as texts.
    #[instrument(skip(self))]
    pub async fn handle_inbound_call(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Option<CallInstruction>, RelayServerError> {
        if from.is_empty() || to.is_empty() {
            return Err(RelayServerError::BadRequest(
                "Call missing From or To".to_owned(),
            ));
        }

        let relay_number = self
            .store
            .get_relay_number_by_number(to)
            .await?
            .ok_or_else(|| RelayServerError::UnknownRelayNumber(to.to_owned()))?;
        if !relay_number.enabled {
            return Err(RelayServerError::NumberDisabled);
        }

        let real_phone = self
            .store
            .get_verified_real_phone(relay_number.user_id)
            .await?
            .ok_or(RelayServerError::NumberDisabled)?;

        let user = self
            .store
            .get_phone_user(relay_number.user_id)
            .await?
            .ok_or(RelayServerError::NumberDisabled)?;

        if user.store_phone_log {
            let contact = self
                .store
                .upsert_inbound_contact(relay_number.id, from, Utc::now())
                .await?;
            if contact.blocked {
                info!("Contact is blocked, rejecting call");
                self.store.record_contact_call(contact.id, true).await?;
                self.store.record_relay_call(relay_number.id, true).await?;
                return Ok(None);
            }
            self.store.record_contact_call(contact.id, false).await?;
        }

        self.store.record_relay_call(relay_number.id, false).await?;
        Ok(Some(CallInstruction {
            dial_to: real_phone.number,
            caller_id: relay_number.number.clone(),
        }))
    }

    async fn send_verification_sms(&self, to: &str, code: &str) -> Result<(), RelayServerError> {
        self.sms
            .send_sms(
                None,
                to,
                &format!("Your Relay verification code is {code}"),
            )
            .await
            .map_err(|e| RelayServerError::VendorRejected(e.to_string()))
    }
}

fn generate_verification_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Picks the reply recipient from the contact log per the addressing mode.
fn resolve_reply(
    contacts: &[InboundContact],
    addressing: ReplyAddressing,
) -> Result<(String, String), RelayServerError> {
    match addressing {
        ReplyAddressing::LastSender { text } => {
            let contact = contacts
                .first()
                .ok_or_else(|| RelayServerError::coded(ErrorCode::NoPreviousSender))?;
            Ok((contact.inbound_number.clone(), text))
        }
        ReplyAddressing::FullNumber { number, text } => {
            if text.is_empty() {
                return Err(RelayServerError::coded(ErrorCode::NoBodyAfterFullNumber));
            }
            let contact = contacts
                .iter()
                .find(|contact| contact.inbound_number == number)
                .ok_or_else(|| {
                    RelayServerError::coded(ErrorCode::FullNumberMatchesNoSenders)
                })?;
            Ok((contact.inbound_number.clone(), text))
        }
        ReplyAddressing::ShortPrefix { digits, text } => {
            if text.is_empty() {
                return Err(RelayServerError::coded(ErrorCode::NoBodyAfterShortPrefix));
            }
            let matches: Vec<_> = contacts
                .iter()
                .filter(|contact| contact.inbound_number.ends_with(&digits))
                .collect();
            match matches.as_slice() {
                [] => Err(RelayServerError::coded(
                    ErrorCode::ShortPrefixMatchesNoSenders,
                )),
                [contact] => Ok((contact.inbound_number.clone(), text)),
                _ => Err(RelayServerError::coded(ErrorCode::MultipleNumberMatches)),
            }
        }
    }
}

/// Parses a submitted number. E.164 is accepted directly; a number that
/// fails with a missing country code is re-parsed as a national number in
/// the client's detected region. The resolved country must be allowed.
pub fn parse_phone_number(
    raw: &str,
    region: Option<&str>,
    allowed_countries: &[String],
) -> Result<String, RelayServerError> {
    let number = match phonenumber::parse(None, raw) {
        Ok(number) => number,
        Err(phonenumber::error::Parse::InvalidCountryCode) => {
            let region_id = region
                .and_then(|region| phonenumber::country::Id::from_str(&region.to_uppercase()).ok())
                .ok_or_else(|| {
                    RelayServerError::BadRequest(
                        "Enter the number in E.164 format, e.g. +15551234567".to_owned(),
                    )
                })?;
            phonenumber::parse(Some(region_id), raw).map_err(|_| {
                RelayServerError::BadRequest("This is not a valid phone number".to_owned())
            })?
        }
        Err(_) => {
            return Err(RelayServerError::BadRequest(
                "This is not a valid phone number".to_owned(),
            ))
        }
    };

    if !phonenumber::is_valid(&number) {
        return Err(RelayServerError::BadRequest(
            "This is not a valid phone number".to_owned(),
        ));
    }

    let country = number
        .country()
        .id()
        .map(|id| id.as_ref().to_owned())
        .unwrap_or_default();
    if !allowed_countries.iter().any(|allowed| *allowed == country) {
        return Err(RelayServerError::BadRequest(format!(
            "Relay is not available in {country}"
        )));
    }

    Ok(number.format().mode(phonenumber::Mode::E164).to_string())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::{ErrorCode, RelayServerError},
            model::{
                types::{RealPhone, RelayNumber, RelayUser},
                StoreError,
            },
        },
        async_trait::async_trait,
        chrono::DateTime,
        std::sync::Mutex,
    };

    #[derive(Default)]
    struct MemoryState {
        users: Vec<RelayUser>,
        real_phones: Vec<RealPhone>,
        relay_numbers: Vec<RelayNumber>,
        contacts: Vec<InboundContact>,
    }

    #[derive(Default)]
    struct MemoryPhoneStore {
        state: Mutex<MemoryState>,
    }

    impl MemoryPhoneStore {
        fn add_user(&self, store_phone_log: bool) -> Uuid {
            let id = Uuid::new_v4();
            self.state.lock().unwrap().users.push(RelayUser {
                id,
                email: format!("{id}@example.com"),
                premium: true,
                store_phone_log,
                active: true,
                created_at: Utc::now(),
            });
            id
        }

        fn add_relay_number(&self, user_id: Uuid, number: &str, enabled: bool) -> Uuid {
            let id = Uuid::new_v4();
            self.state.lock().unwrap().relay_numbers.push(RelayNumber {
                id,
                user_id,
                number: number.to_owned(),
                vcard_lookup_key: "key".to_owned(),
                enabled,
                vendor: "test".to_owned(),
                num_texts: 0,
                num_texts_blocked: 0,
                num_calls: 0,
                num_calls_blocked: 0,
                remaining_texts: 75,
                remaining_seconds: 3000,
                created_at: Utc::now(),
            });
            id
        }

        fn add_verified_phone(&self, user_id: Uuid, number: &str) {
            self.state.lock().unwrap().real_phones.push(RealPhone {
                id: Uuid::new_v4(),
                user_id,
                number: number.to_owned(),
                verification_code: "000000".to_owned(),
                verification_sent_at: Utc::now(),
                verified: true,
                verified_at: Some(Utc::now()),
            });
        }

        fn add_contact(&self, relay_number_id: Uuid, inbound_number: &str, blocked: bool) {
            let mut state = self.state.lock().unwrap();
            let age = state.contacts.len() as i64;
            state.contacts.push(InboundContact {
                id: Uuid::new_v4(),
                relay_number_id,
                inbound_number: inbound_number.to_owned(),
                blocked,
                num_calls: 0,
                num_texts: 0,
                num_calls_blocked: 0,
                num_texts_blocked: 0,
                // Later insertions are older so `first()` is the newest.
                last_inbound_at: Utc::now() - Duration::seconds(age),
            });
        }

        fn age_verification(&self, user_id: Uuid, by: Duration) {
            let mut state = self.state.lock().unwrap();
            for phone in &mut state.real_phones {
                if phone.user_id == user_id {
                    phone.verification_sent_at -= by;
                }
            }
        }

        fn verification_code(&self, user_id: Uuid) -> String {
            self.state
                .lock()
                .unwrap()
                .real_phones
                .iter()
                .find(|phone| phone.user_id == user_id)
                .unwrap()
                .verification_code
                .clone()
        }
    }

    #[async_trait]
    impl PhoneStore for MemoryPhoneStore {
        async fn get_phone_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .users
                .iter()
                .find(|user| user.id == user_id)
                .cloned())
        }

        async fn get_verified_real_phone(
            &self,
            user_id: Uuid,
        ) -> Result<Option<RealPhone>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .real_phones
                .iter()
                .find(|phone| phone.user_id == user_id && phone.verified)
                .cloned())
        }

        async fn get_real_phone_by_number(
            &self,
            user_id: Uuid,
            number: &str,
        ) -> Result<Option<RealPhone>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .real_phones
                .iter()
                .find(|phone| phone.user_id == user_id && phone.number == number)
                .cloned())
        }

        async fn create_real_phone(
            &self,
            user_id: Uuid,
            number: &str,
            verification_code: &str,
            sent_at: DateTime<Utc>,
        ) -> Result<RealPhone, StoreError> {
            let record = RealPhone {
                id: Uuid::new_v4(),
                user_id,
                number: number.to_owned(),
                verification_code: verification_code.to_owned(),
                verification_sent_at: sent_at,
                verified: false,
                verified_at: None,
            };
            self.state.lock().unwrap().real_phones.push(record.clone());
            Ok(record)
        }

        async fn refresh_real_phone_code(
            &self,
            real_phone_id: Uuid,
            verification_code: &str,
            sent_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for phone in &mut state.real_phones {
                if phone.id == real_phone_id && !phone.verified {
                    phone.verification_code = verification_code.to_owned();
                    phone.verification_sent_at = sent_at;
                }
            }
            Ok(())
        }

        async fn mark_real_phone_verified(
            &self,
            real_phone_id: Uuid,
            verified_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for phone in &mut state.real_phones {
                if phone.id == real_phone_id {
                    phone.verified = true;
                    phone.verified_at = Some(verified_at);
                }
            }
            Ok(())
        }

        async fn get_relay_number_by_number(
            &self,
            number: &str,
        ) -> Result<Option<RelayNumber>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .relay_numbers
                .iter()
                .find(|relay| relay.number == number)
                .cloned())
        }

        async fn get_relay_number_for_user(
            &self,
            user_id: Uuid,
        ) -> Result<Option<RelayNumber>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .relay_numbers
                .iter()
                .find(|relay| relay.user_id == user_id)
                .cloned())
        }

        async fn create_relay_number(
            &self,
            user_id: Uuid,
            number: &str,
            vcard_lookup_key: &str,
        ) -> Result<RelayNumber, StoreError> {
            let record = RelayNumber {
                id: Uuid::new_v4(),
                user_id,
                number: number.to_owned(),
                vcard_lookup_key: vcard_lookup_key.to_owned(),
                enabled: true,
                vendor: "test".to_owned(),
                num_texts: 0,
                num_texts_blocked: 0,
                num_calls: 0,
                num_calls_blocked: 0,
                remaining_texts: 75,
                remaining_seconds: 3000,
                created_at: Utc::now(),
            };
            self.state
                .lock()
                .unwrap()
                .relay_numbers
                .push(record.clone());
            Ok(record)
        }

        async fn upsert_inbound_contact(
            &self,
            relay_number_id: Uuid,
            inbound_number: &str,
            at: DateTime<Utc>,
        ) -> Result<InboundContact, StoreError> {
            let mut state = self.state.lock().unwrap();
            if let Some(contact) = state
                .contacts
                .iter_mut()
                .find(|c| c.relay_number_id == relay_number_id && c.inbound_number == inbound_number)
            {
                contact.last_inbound_at = at;
                return Ok(contact.clone());
            }
            let contact = InboundContact {
                id: Uuid::new_v4(),
                relay_number_id,
                inbound_number: inbound_number.to_owned(),
                blocked: false,
                num_calls: 0,
                num_texts: 0,
                num_calls_blocked: 0,
                num_texts_blocked: 0,
                last_inbound_at: at,
            };
            state.contacts.push(contact.clone());
            Ok(contact)
        }

        async fn record_contact_text(
            &self,
            contact_id: Uuid,
            blocked: bool,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for contact in &mut state.contacts {
                if contact.id == contact_id {
                    if blocked {
                        contact.num_texts_blocked += 1;
                    } else {
                        contact.num_texts += 1;
                    }
                }
            }
            Ok(())
        }

        async fn record_contact_call(
            &self,
            contact_id: Uuid,
            blocked: bool,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for contact in &mut state.contacts {
                if contact.id == contact_id {
                    if blocked {
                        contact.num_calls_blocked += 1;
                    } else {
                        contact.num_calls += 1;
                    }
                }
            }
            Ok(())
        }

        async fn record_relay_text(
            &self,
            relay_number_id: Uuid,
            blocked: bool,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for relay in &mut state.relay_numbers {
                if relay.id == relay_number_id {
                    if blocked {
                        relay.num_texts_blocked += 1;
                    } else {
                        relay.num_texts += 1;
                    }
                }
            }
            Ok(())
        }

        async fn record_relay_call(
            &self,
            relay_number_id: Uuid,
            blocked: bool,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            for relay in &mut state.relay_numbers {
                if relay.id == relay_number_id {
                    if blocked {
                        relay.num_calls_blocked += 1;
                    } else {
                        relay.num_calls += 1;
                    }
                }
            }
            Ok(())
        }

        async fn list_inbound_contacts(
            &self,
            relay_number_id: Uuid,
        ) -> Result<Vec<InboundContact>, StoreError> {
            let mut contacts: Vec<_> = self
                .state
                .lock()
                .unwrap()
                .contacts
                .iter()
                .filter(|c| c.relay_number_id == relay_number_id)
                .cloned()
                .collect();
            contacts.sort_by(|a, b| b.last_inbound_at.cmp(&a.last_inbound_at));
            Ok(contacts)
        }

        async fn last_inbound_contact(
            &self,
            relay_number_id: Uuid,
        ) -> Result<Option<InboundContact>, StoreError> {
            Ok(self
                .list_inbound_contacts(relay_number_id)
                .await?
                .into_iter()
                .next())
        }
    }

    #[derive(Default)]
    struct RecordingSmsClient {
        sent: Mutex<Vec<(Option<String>, String, String)>>,
    }

    #[async_trait]
    impl SmsClient for RecordingSmsClient {
        async fn send_sms(
            &self,
            from: Option<&str>,
            to: &str,
            body: &str,
        ) -> Result<(), vendor::SmsError> {
            self.sent.lock().unwrap().push((
                from.map(str::to_owned),
                to.to_owned(),
                body.to_owned(),
            ));
            Ok(())
        }
    }

    fn service(
        store: Arc<MemoryPhoneStore>,
        sms: Arc<RecordingSmsClient>,
    ) -> PhoneService {
        PhoneService::new(
            store,
            sms,
            PhoneOptions {
                max_verify_age: Duration::minutes(5),
                allowed_countries: vec!["US".to_owned(), "CA".to_owned()],
            },
        )
    }

    fn assert_code(err: RelayServerError, expected: ErrorCode) {
        match err {
            RelayServerError::Coded { code, .. } => assert_eq!(code, expected),
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verification_happy_path() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        let service = service(store.clone(), sms.clone());

        let record = service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        assert!(!record.verified);
        assert_eq!(record.verification_code.len(), 6);

        // The code went out over SMS.
        let sent = sms.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2.contains(&record.verification_code));

        let code = store.verification_code(user_id);
        let verified = service
            .submit_code(user_id, "+12025551234", None, &code)
            .await
            .unwrap();
        assert!(verified.verified);

        // A second verification for a different number now conflicts.
        let err = service
            .request_verification(user_id, "+12025559876", None)
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::ConflictError);
    }

    #[tokio::test]
    async fn pending_record_blocks_duplicate_request() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        let service = service(store.clone(), sms);

        service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        let err = service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::ConflictError);
    }

    #[tokio::test]
    async fn expired_pending_record_is_rearmed() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        let service = service(store.clone(), sms);

        let first = service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        store.age_verification(user_id, Duration::minutes(10));

        let second = service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn wrong_code_leaves_record_pending() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        let service = service(store.clone(), sms);

        service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        let err = service
            .submit_code(user_id, "+12025551234", None, "999999x")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayServerError::BadRequest(_)));
        assert!(store
            .get_verified_real_phone(user_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn elapsed_window_rejects_the_code() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        let service = service(store.clone(), sms);

        service
            .request_verification(user_id, "+12025551234", None)
            .await
            .unwrap();
        let code = store.verification_code(user_id);
        store.age_verification(user_id, Duration::minutes(6));

        let err = service
            .submit_code(user_id, "+12025551234", None, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn inbound_sms_is_relayed_with_prefix() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        store.add_relay_number(user_id, "+15559990000", true);
        let service = service(store.clone(), sms.clone());

        let disposition = service
            .handle_inbound_sms("+15552223333", "+15559990000", "hello")
            .await
            .unwrap();
        assert_eq!(disposition, SmsDisposition::Relayed);

        let sent = sms.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_deref(), Some("+15559990000"));
        assert_eq!(sent[0].1, "+15550001111");
        assert_eq!(sent[0].2, "[Relay +15552223333] hello");
    }

    #[tokio::test]
    async fn blocked_contact_is_not_relayed() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        let relay_id = store.add_relay_number(user_id, "+15559990000", true);
        store.add_contact(relay_id, "+15552223333", true);
        let service = service(store.clone(), sms.clone());

        let disposition = service
            .handle_inbound_sms("+15552223333", "+15559990000", "hello")
            .await
            .unwrap();
        assert_eq!(disposition, SmsDisposition::BlockedContact);
        assert!(sms.sent.lock().unwrap().is_empty());

        let state = store.state.lock().unwrap();
        assert_eq!(state.contacts[0].num_texts_blocked, 1);
        assert_eq!(state.relay_numbers[0].num_texts_blocked, 1);
        assert_eq!(state.relay_numbers[0].num_texts, 0);
    }

    #[tokio::test]
    async fn disabled_relay_number_rejects() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        store.add_relay_number(user_id, "+15559990000", false);
        let service = service(store, sms);

        let err = service
            .handle_inbound_sms("+15552223333", "+15559990000", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayServerError::NumberDisabled));
    }

    #[tokio::test]
    async fn reply_without_phone_log_fails() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(false);
        store.add_verified_phone(user_id, "+15550001111");
        store.add_relay_number(user_id, "+15559990000", true);
        let service = service(store, sms);

        let err = service
            .handle_inbound_sms("+15550001111", "+15559990000", "hi back")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::NoPhoneLog);
    }

    #[tokio::test]
    async fn reply_goes_to_last_sender() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        let relay_id = store.add_relay_number(user_id, "+15559990000", true);
        store.add_contact(relay_id, "+15552223333", false);
        store.add_contact(relay_id, "+15554445555", false);
        let service = service(store, sms.clone());

        let disposition = service
            .handle_inbound_sms("+15550001111", "+15559990000", "hi back")
            .await
            .unwrap();
        assert_eq!(disposition, SmsDisposition::Replied);

        let sent = sms.sent.lock().unwrap().clone();
        // First contact added is the most recent one.
        assert_eq!(sent[0].1, "+15552223333");
        assert_eq!(sent[0].2, "hi back");
    }

    #[tokio::test]
    async fn reply_with_no_contacts_fails() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        store.add_relay_number(user_id, "+15559990000", true);
        let service = service(store, sms);

        let err = service
            .handle_inbound_sms("+15550001111", "+15559990000", "hi back")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::NoPreviousSender);
    }

    #[tokio::test]
    async fn short_prefix_reply_resolution() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        let relay_id = store.add_relay_number(user_id, "+15559990000", true);
        store.add_contact(relay_id, "+15552223333", false);
        store.add_contact(relay_id, "+15554443333", false);
        store.add_contact(relay_id, "+15554445555", false);
        let service = service(store, sms.clone());

        // Two contacts end in 3333.
        let err = service
            .handle_inbound_sms("+15550001111", "+15559990000", "3333 hello")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::MultipleNumberMatches);

        // Exactly one ends in 5555.
        let disposition = service
            .handle_inbound_sms("+15550001111", "+15559990000", "5555 hello")
            .await
            .unwrap();
        assert_eq!(disposition, SmsDisposition::Replied);
        assert_eq!(sms.sent.lock().unwrap()[0].1, "+15554445555");

        // No contact ends in 0000.
        let err = service
            .handle_inbound_sms("+15550001111", "+15559990000", "0000 hello")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::ShortPrefixMatchesNoSenders);

        // A prefix with no message is rejected before resolution.
        let err = service
            .handle_inbound_sms("+15550001111", "+15559990000", "5555")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::NoBodyAfterShortPrefix);
    }

    #[tokio::test]
    async fn inbound_call_dials_the_real_number() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        store.add_relay_number(user_id, "+15559990000", true);
        let service = service(store.clone(), sms);

        let instruction = service
            .handle_inbound_call("+15552223333", "+15559990000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instruction.dial_to, "+15550001111");
        assert_eq!(instruction.caller_id, "+15559990000");

        let state = store.state.lock().unwrap();
        assert_eq!(state.relay_numbers[0].num_calls, 1);
        assert_eq!(state.contacts[0].num_calls, 1);
    }

    #[tokio::test]
    async fn relay_number_is_one_per_user() {
        let store = Arc::new(MemoryPhoneStore::default());
        let sms = Arc::new(RecordingSmsClient::default());
        let user_id = store.add_user(true);
        store.add_verified_phone(user_id, "+15550001111");
        let service = service(store, sms);

        service
            .provision_relay_number(user_id, "+15559990000")
            .await
            .unwrap();
        let err = service
            .provision_relay_number(user_id, "+15558880000")
            .await
            .unwrap_err();
        assert_code(err, ErrorCode::ConflictError);
    }

    #[test]
    fn e164_parsing_with_region_fallback() {
        let allowed = vec!["US".to_owned(), "CA".to_owned()];

        assert_eq!(
            parse_phone_number("+1 202 555 1234", None, &allowed).unwrap(),
            "+12025551234"
        );
        assert_eq!(
            parse_phone_number("202-555-1234", Some("us"), &allowed).unwrap(),
            "+12025551234"
        );
        // National format with no detected region cannot be resolved.
        assert!(parse_phone_number("202-555-1234", None, &allowed).is_err());
    }

    #[test]
    fn disallowed_country_is_rejected() {
        let allowed = vec!["US".to_owned()];
        // A valid UK number resolves, but the country is not allowed.
        assert!(parse_phone_number("+442071838750", None, &allowed).is_err());
    }
}
