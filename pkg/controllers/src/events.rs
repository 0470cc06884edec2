use chrono::Utc;
use pkg_state::Client;
use pkg_types::event::{Event, EventType};
use pkg_types::meta::{ObjectMeta, ObjectReference, OwnerReference};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

// Reasons recorded against a UnitedDeployment. Each is prefixed with
// `Successful` or `Failed`.
pub const POOLS_UPDATE: &str = "PoolsUpdate";
pub const REVISION_PROVISION: &str = "RevisionProvision";
pub const FIND_POOLS: &str = "FindPools";
pub const DUP_POOLS_DELETE: &str = "DupPoolsDelete";
pub const TEMPLATE_CONTROLLER: &str = "TemplateController";

const EVENT_WRITE_ATTEMPTS: usize = 5;

pub fn successful(reason: &str) -> String {
    format!("Successful{}", reason)
}

pub fn failed(reason: &str) -> String {
    format!("Failed{}", reason)
}

/// Fire-and-forget sink for events about an object.
pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str);
}

/// Persists events through the object client. Writes happen off the
/// caller's task; failures are only logged.
///
/// Repeats of the same event about the same object share one stored Event
/// whose `count` grows. Each stored Event is owned by the object it is
/// about, so deleting that object collects its events.
pub struct StoreRecorder {
    client: Client,
}

impl StoreRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EventRecorder for StoreRecorder {
    fn record(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        match type_ {
            EventType::Normal => info!(
                "{} {}/{}: {}: {}",
                object.kind, object.namespace, object.name, reason, message
            ),
            EventType::Warning => warn!(
                "{} {}/{}: {}: {}",
                object.kind, object.namespace, object.name, reason, message
            ),
        }

        let event = new_event(object, type_, reason, message);
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = write_event(&client, &event).await {
                warn!("failed to record event {}: {}", event.reason, e);
            }
        });
    }
}

/// Stable name for an event, so that repeats land on the same object.
fn event_name(object: &ObjectReference, type_: EventType, reason: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [object.uid.as_str(), object.name.as_str(), reason, message] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(match type_ {
        EventType::Normal => b"Normal".as_slice(),
        EventType::Warning => b"Warning".as_slice(),
    });
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("{}.{:016x}", object.name, u64::from_be_bytes(prefix))
}

fn new_event(object: &ObjectReference, type_: EventType, reason: &str, message: &str) -> Event {
    let now = Utc::now();
    let mut metadata =
        ObjectMeta::new(&object.namespace, &event_name(object, type_, reason, message));
    if !object.uid.is_empty() {
        metadata.owner_references.push(OwnerReference {
            api_version: object.api_version.clone(),
            kind: object.kind.clone(),
            name: object.name.clone(),
            uid: object.uid.clone(),
            controller: false,
            block_owner_deletion: false,
        });
    }
    Event {
        metadata,
        involved_object: object.clone(),
        type_,
        reason: reason.to_string(),
        message: message.to_string(),
        first_timestamp: now,
        last_timestamp: now,
        count: 1,
    }
}

/// Create `event`, or bump the count of the stored event with the same
/// name. Lost create or update races are retried.
async fn write_event(client: &Client, event: &Event) -> anyhow::Result<()> {
    let namespace = &event.metadata.namespace;
    let name = &event.metadata.name;
    for _ in 0..EVENT_WRITE_ATTEMPTS {
        match client.get::<Event>(namespace, name).await {
            Ok(mut existing) => {
                existing.count = existing.count.saturating_add(1);
                existing.last_timestamp = event.last_timestamp;
                match client.update(&existing).await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.is_conflict() || e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) if e.is_not_found() => match client.create(event).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_already_exists() => continue,
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!(
        "event {}/{} still contended after {} attempts",
        namespace,
        name,
        EVENT_WRITE_ATTEMPTS
    )
}

/// One recorded event, as seen by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory for tests.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, _object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                type_,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        }
    }
}
