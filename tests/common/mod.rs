#![allow(dead_code)]

use {
    async_trait::async_trait,
    chrono::Utc,
    relay_server::{
        blob::{BlobError, BlobStore},
        mail::{MailDispatcher, MailOptions},
        mailer::{OutboundEmail, OutboundMailer, SendOutcome},
        model::{
            types::{Alias, RelayUser},
            MailStore, StoreError,
        },
        queue::{QueueClient, QueueError, QueueMessage, QueueStats},
        sns::{
            verifier::{EnvelopeVerifier, VerifyError},
            RawEnvelope,
        },
    },
    serde_json::json,
    std::{
        collections::{HashMap, VecDeque},
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Mutex,
        },
    },
    tokio::sync::broadcast,
    url::Url,
    uuid::Uuid,
};

pub const TOPIC: &str = "arn:test:topic";

/// Scripted queue: each `receive` pops one batch; once the script runs
/// dry it signals shutdown so the worker stops at the next cycle
/// boundary.
pub struct ScriptedQueue {
    batches: Mutex<VecDeque<Vec<QueueMessage>>>,
    pub deleted: Mutex<Vec<String>>,
    pub stats: QueueStats,
    shutdown_tx: broadcast::Sender<()>,
}

impl ScriptedQueue {
    pub fn new(batches: Vec<Vec<QueueMessage>>) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        (
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                deleted: Mutex::new(Vec::new()),
                stats: QueueStats {
                    visible: 4,
                    delayed: 1,
                    not_visible: 2,
                },
                shutdown_tx,
            }),
            shutdown_rx,
        )
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for ScriptedQueue {
    async fn receive(
        &self,
        _batch_size: i32,
        _wait_seconds: i32,
        _visibility_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        match self.batches.lock().unwrap().pop_front() {
            Some(batch) => Ok(batch),
            None => {
                let _ = self.shutdown_tx.send(());
                Ok(vec![])
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.deleted.lock().unwrap().push(receipt_handle.to_owned());
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.stats)
    }
}

#[derive(Default)]
pub struct MemoryMailState {
    pub users: HashMap<Uuid, RelayUser>,
    pub aliases: Vec<Alias>,
    pub deleted: Vec<(Uuid, String)>,
}

/// In-memory alias store mirroring the atomic-increment behavior of the
/// real one.
#[derive(Default)]
pub struct MemoryMailStore {
    pub state: Mutex<MemoryMailState>,
}

impl MemoryMailStore {
    pub fn add_user(&self, email: &str, premium: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().users.insert(
            id,
            RelayUser {
                id,
                email: email.to_owned(),
                premium,
                store_phone_log: false,
                active: true,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn add_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        subdomain: Option<&str>,
        enabled: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().aliases.push(Alias {
            id,
            user_id,
            local_part: local_part.to_owned(),
            subdomain: subdomain.map(str::to_owned),
            enabled,
            block_list_emails: false,
            num_forwarded: 0,
            num_blocked: 0,
            num_spam: 0,
            num_replied: 0,
            num_level_one_trackers_blocked: 0,
            created_at: Utc::now(),
            last_used_at: None,
        });
        id
    }

    pub fn alias(&self, alias_id: Uuid) -> Alias {
        self.state
            .lock()
            .unwrap()
            .aliases
            .iter()
            .find(|alias| alias.id == alias_id)
            .cloned()
            .expect("alias exists")
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn get_alias_by_address(
        &self,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Option<Alias>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .aliases
            .iter()
            .find(|alias| {
                alias.local_part == local_part && alias.subdomain.as_deref() == subdomain
            })
            .cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<RelayUser>, StoreError> {
        Ok(self.state.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn count_user_aliases(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .aliases
            .iter()
            .filter(|alias| alias.user_id == user_id)
            .count() as i64)
    }

    async fn insert_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        subdomain: Option<&str>,
    ) -> Result<Alias, StoreError> {
        let alias_id = self.add_alias(user_id, local_part, subdomain, true);
        Ok(self.alias(alias_id))
    }

    async fn delete_alias(&self, alias_id: Uuid, address_hash: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.aliases.retain(|alias| alias.id != alias_id);
        state.deleted.push((alias_id, address_hash.to_owned()));
        Ok(())
    }

    async fn record_forwarded(&self, alias_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for alias in &mut state.aliases {
            if alias.id == alias_id {
                alias.num_forwarded += 1;
                alias.last_used_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn record_blocked(&self, alias_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for alias in &mut state.aliases {
            if alias.id == alias_id {
                alias.num_blocked += 1;
            }
        }
        Ok(())
    }

    async fn record_spam(&self, alias_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for alias in &mut state.aliases {
            if alias.id == alias_id {
                alias.num_spam += 1;
            }
        }
        Ok(())
    }

    async fn record_trackers_blocked(&self, alias_id: Uuid, count: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for alias in &mut state.aliases {
            if alias.id == alias_id {
                alias.num_level_one_trackers_blocked += count as i32;
            }
        }
        Ok(())
    }
}

/// Mailer with a scripted outcome per send; defaults to delivered once
/// the script runs out.
#[derive(Default)]
pub struct ScriptedMailer {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    pub sent: Mutex<Vec<OutboundEmail>>,
}

impl ScriptedMailer {
    pub fn new(outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl OutboundMailer for ScriptedMailer {
    async fn send(&self, email: &OutboundEmail) -> SendOutcome {
        self.sent.lock().unwrap().push(email.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Delivered {
                message_id: "out-1".to_owned(),
            })
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub fail_transiently: AtomicBool,
    pub gets: AtomicU32,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_transiently.load(Ordering::SeqCst) {
            return Err(BlobError::Transient("storage timed out".to_owned()));
        }
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }
}

/// Verifier stub: accepts everything, or rejects everything with
/// `InvalidSignature`.
pub struct StubVerifier {
    pub accept: bool,
}

#[async_trait]
impl EnvelopeVerifier for StubVerifier {
    async fn verify(&self, _envelope: &RawEnvelope) -> Result<(), VerifyError> {
        if self.accept {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }

    fn host_allowed(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| host.ends_with("amazonaws.com"))
    }
}

pub fn dispatcher(
    store: Arc<MemoryMailStore>,
    blobs: Arc<MemoryBlobStore>,
    mailer: Arc<ScriptedMailer>,
) -> MailDispatcher {
    MailDispatcher::new(
        store,
        blobs,
        mailer,
        MailOptions {
            relay_domain: "relay.test".to_owned(),
            relay_from_address: "replies@relay.test".to_owned(),
            blocked_senders: vec!["blocked.example".to_owned()],
        },
        None,
    )
}

pub fn inbound_mail_message(destination: &str, content: &str) -> serde_json::Value {
    json!({
        "notificationType": "Received",
        "mail": {
            "destination": [destination],
            "source": "sender@example.com",
            "headers": [
                {"name": "Message-ID", "value": "<orig@example.com>"}
            ],
            "commonHeaders": {
                "from": ["Sender <sender@example.com>"],
                "subject": "hello subject",
                "messageId": "<orig@example.com>"
            }
        },
        "content": content
    })
}

pub fn envelope_body(message: &serde_json::Value) -> String {
    json!({
        "Type": "Notification",
        "MessageId": Uuid::new_v4().to_string(),
        "Timestamp": "2024-05-01T00:00:00.000Z",
        "TopicArn": TOPIC,
        "Message": message.to_string(),
        "Subject": "Amazon SES Email Receipt Notification",
        "Signature": "c2lnbmF0dXJl",
        "SigningCertURL": "https://sns.us-east-1.amazonaws.com/cert.pem",
        "SignatureVersion": "1"
    })
    .to_string()
}

pub fn queue_message(id: &str, body: String) -> QueueMessage {
    QueueMessage {
        message_id: id.to_owned(),
        receipt_handle: format!("rh-{id}"),
        body,
    }
}

pub fn scratch_healthcheck_path() -> PathBuf {
    std::env::temp_dir().join(format!("relay-pipeline-health-{}.json", Uuid::new_v4()))
}
