//! The chronicle document wrapper.

use automerge::sync::{self, SyncDoc};
use automerge::transaction::Transactable;
use automerge::{ActorId, AutoCommit, ReadDoc};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

use tessera_events::EventBus;

use crate::doc::{flatten_doc, mutator_error, unflatten_doc, DocDraft};
use crate::{ChronicleError, Result};

/// Origin tag carried by changes committed locally.
pub const LOCAL_SOURCE: &str = "local";

/// Topic on which committed changes are announced.
pub const STATE_CHANGED_TOPIC: &str = "state:changed";

/// Observability counters for a chronicle.
#[derive(Debug, Clone, Default)]
pub struct ChronicleMetrics {
    /// Changes committed to the document.
    pub change_count: u64,
    /// Sync messages generated.
    pub sync_messages_sent: u64,
    /// Sync messages applied.
    pub sync_messages_received: u64,
    /// Bytes across generated sync messages.
    pub sync_bytes_sent: u64,
    /// Bytes across applied sync messages.
    pub sync_bytes_received: u64,
    /// Size of the most recent save.
    pub last_save_size: u64,
}

/// Opaque per-peer sync state.
///
/// One cursor per remote peer; feeding the same sync frame through a cursor
/// twice is a no-op because the cursor advances on first delivery.
pub struct SyncCursor(sync::State);

impl SyncCursor {
    /// A fresh cursor, as used for a newly connected peer.
    pub fn new() -> Self {
        Self(sync::State::new())
    }
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// The CRDT document and its event surface.
///
/// Holds an Automerge document whose root map stores the flat key form of
/// the game document (see [`crate::doc`]). All local mutation goes through
/// [`Chronicle::change`]; remote state arrives through [`Chronicle::apply_sync`]
/// or [`Chronicle::merge`]. Every committed change emits `state:changed`
/// exactly once, tagged with its origin.
pub struct Chronicle {
    doc: Mutex<AutoCommit>,
    actor_id: String,
    bus: EventBus,
    metrics: Mutex<ChronicleMetrics>,
}

impl Chronicle {
    /// Creates an empty document with a stable actor identity.
    pub fn new(actor_id: &str, bus: EventBus) -> Self {
        let actor = ActorId::from(actor_id.as_bytes());
        Self {
            doc: Mutex::new(AutoCommit::new().with_actor(actor)),
            actor_id: actor_id.to_string(),
            bus,
            metrics: Mutex::new(ChronicleMetrics::default()),
        }
    }

    /// Creates a document and records a single bootstrap change.
    pub fn with_initial(
        actor_id: &str,
        bus: EventBus,
        initial: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let chronicle = Self::new(actor_id, bus);
        chronicle.change("init", |draft| {
            draft.replace_with(initial);
            Ok(())
        })?;
        Ok(chronicle)
    }

    /// Loads a document from its binary save form.
    pub fn load(bytes: &[u8], actor_id: &str, bus: EventBus) -> Result<Self> {
        let actor = ActorId::from(actor_id.as_bytes());
        let doc = AutoCommit::load(bytes)
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?
            .with_actor(actor);
        Ok(Self {
            doc: Mutex::new(doc),
            actor_id: actor_id.to_string(),
            bus,
            metrics: Mutex::new(ChronicleMetrics::default()),
        })
    }

    /// Loads a document from its base64 textual form.
    pub fn load_base64(text: &str, actor_id: &str, bus: EventBus) -> Result<Self> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?;
        Self::load(&bytes, actor_id, bus)
    }

    /// The actor identity used for CRDT operations.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// The bus on which `state:changed` events are emitted.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Opens a mutation scope, passes a draft to `mutator`, and commits.
    ///
    /// The draft starts as a copy of the committed flat document. A mutator
    /// returning `Err` (or panicking) discards the draft and leaves state
    /// unchanged. On success the draft is diffed against the committed
    /// state; a non-empty diff commits one change and emits one
    /// `state:changed {source: "local", label}` event.
    pub fn change<R, F>(&self, label: &str, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut DocDraft) -> Result<R>,
    {
        self.change_with(label, mutator)
    }

    /// Like [`Chronicle::change`], but the mutator may fail with any error
    /// type convertible from [`ChronicleError`]. Domain layers use this to
    /// surface their own error kinds while keeping discard-on-error
    /// semantics.
    pub fn change_with<R, E, F>(&self, label: &str, mutator: F) -> std::result::Result<R, E>
    where
        E: From<ChronicleError>,
        F: FnOnce(&mut DocDraft) -> std::result::Result<R, E>,
    {
        let mut doc = self.doc.lock();
        let before = read_flat(&doc);
        let mut draft = DocDraft::new(before.clone());

        let outcome = catch_unwind(AssertUnwindSafe(|| mutator(&mut draft)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(err),
            Err(panic) => return Err(E::from(mutator_error(panic_message(&panic)))),
        };

        let after = draft.into_flat();
        let changed = apply_diff(&mut doc, &before, &after).map_err(E::from)?;
        if changed {
            doc.commit();
            self.metrics.lock().change_count += 1;
        }
        drop(doc);

        if changed {
            debug!(label = %label, "chronicle change committed");
            self.emit_changed(LOCAL_SOURCE, Some(label));
        }
        Ok(result)
    }

    /// Replaces the document wholesale; emits `state:changed {source}`.
    pub fn update(
        &self,
        new_doc: &serde_json::Map<String, serde_json::Value>,
        source: &str,
    ) -> Result<()> {
        let flat_new = flatten_doc(new_doc);
        let mut doc = self.doc.lock();
        let before = read_flat(&doc);
        let changed = apply_diff(&mut doc, &before, &flat_new)?;
        if changed {
            doc.commit();
            self.metrics.lock().change_count += 1;
        }
        drop(doc);

        if changed {
            self.emit_changed(source, None);
        }
        Ok(())
    }

    /// Op-level merge of another chronicle's document into this one.
    ///
    /// Any two peers applying the same set of changes in any order converge.
    pub fn merge(&self, other: &Chronicle) -> Result<bool> {
        if std::ptr::eq(self, other) {
            return Ok(false);
        }
        let mut doc = self.doc.lock();
        let before = read_flat(&doc);
        {
            let mut other_doc = other.doc.lock();
            doc.merge(&mut other_doc)
                .map_err(|e| ChronicleError::Corrupt(e.to_string()))?;
        }
        let after = read_flat(&doc);
        drop(doc);

        let changed = before != after;
        if changed {
            self.metrics.lock().change_count += 1;
            self.emit_changed("merge", None);
        }
        Ok(changed)
    }

    /// A read-only view of the current nested document.
    pub fn state(&self) -> serde_json::Value {
        let doc = self.doc.lock();
        serde_json::Value::Object(unflatten_doc(&read_flat(&doc)))
    }

    /// Reads a typed record stored under a flat document key.
    pub fn get_record<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let doc = self.doc.lock();
        let flat = read_flat(&doc);
        match flat.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Serializes the document to its native binary format.
    pub fn save(&self) -> Vec<u8> {
        let bytes = self.doc.lock().save();
        self.metrics.lock().last_save_size = bytes.len() as u64;
        bytes
    }

    /// Serializes the document to base64 text.
    pub fn save_base64(&self) -> String {
        BASE64.encode(self.save())
    }

    /// Replaces the document in place from a binary save.
    ///
    /// Used to restore an engine snapshot; emits `state:changed
    /// {source: "restore"}`. Existing sync cursors become invalid.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let actor = ActorId::from(self.actor_id.as_bytes());
        let restored = AutoCommit::load(bytes)
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?
            .with_actor(actor);
        *self.doc.lock() = restored;
        self.emit_changed("restore", None);
        Ok(())
    }

    /// Saves and reloads the document to discard op history.
    ///
    /// Bounds document growth in long sessions. Existing sync cursors refer
    /// to the discarded history; peers must restart from fresh cursors
    /// afterwards (the consensus layer does this on reconnect).
    pub fn compact(&self) -> Result<()> {
        let mut doc = self.doc.lock();
        let bytes = doc.save();
        let actor = ActorId::from(self.actor_id.as_bytes());
        *doc = AutoCommit::load(&bytes)
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?
            .with_actor(actor);
        self.metrics.lock().last_save_size = bytes.len() as u64;
        Ok(())
    }

    /// Generates the next sync message for a peer cursor.
    ///
    /// Returns `None` when the peer is up to date.
    pub fn generate_sync(&self, cursor: &mut SyncCursor) -> Option<Vec<u8>> {
        let mut doc = self.doc.lock();
        let message = doc
            .sync()
            .generate_sync_message(&mut cursor.0)
            .map(|m| m.encode());
        if let Some(ref bytes) = message {
            let mut metrics = self.metrics.lock();
            metrics.sync_messages_sent += 1;
            metrics.sync_bytes_sent += bytes.len() as u64;
        }
        message
    }

    /// Applies a sync message received from a peer.
    ///
    /// Emits `state:changed {source}` when the document advanced; applying
    /// the same frame twice is a no-op. Malformed bytes fail with
    /// [`ChronicleError::Corrupt`] and leave state unchanged.
    pub fn apply_sync(
        &self,
        cursor: &mut SyncCursor,
        bytes: &[u8],
        source: &str,
    ) -> Result<bool> {
        let message = sync::Message::decode(bytes)
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?;

        let mut doc = self.doc.lock();
        let before = read_flat(&doc);
        doc.sync()
            .receive_sync_message(&mut cursor.0, message)
            .map_err(|e| ChronicleError::Corrupt(e.to_string()))?;
        let after = read_flat(&doc);
        drop(doc);

        {
            let mut metrics = self.metrics.lock();
            metrics.sync_messages_received += 1;
            metrics.sync_bytes_received += bytes.len() as u64;
        }

        let changed = before != after;
        if changed {
            self.emit_changed(source, None);
        }
        Ok(changed)
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> ChronicleMetrics {
        self.metrics.lock().clone()
    }

    fn emit_changed(&self, source: &str, label: Option<&str>) {
        let mut payload = serde_json::json!({ "source": source });
        if let Some(label) = label {
            payload["label"] = serde_json::Value::String(label.to_string());
        }
        self.bus.emit(STATE_CHANGED_TOPIC, payload);
    }
}

/// Reads the flat key map out of the CRDT root.
fn read_flat(doc: &AutoCommit) -> BTreeMap<String, String> {
    doc.map_range(automerge::ROOT, ..)
        .filter_map(|item| value_to_string(&item.value).map(|v| (item.key.to_string(), v)))
        .collect()
}

/// Writes the difference between two flat maps into the document.
fn apply_diff(
    doc: &mut AutoCommit,
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Result<bool> {
    let mut changed = false;
    for (key, value) in after {
        if before.get(key) != Some(value) {
            doc.put(automerge::ROOT, key.as_str(), value.clone())
                .map_err(|e| ChronicleError::Backend(e.to_string()))?;
            changed = true;
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            doc.delete(automerge::ROOT, key.as_str())
                .map_err(|e| ChronicleError::Backend(e.to_string()))?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Extracts a string from an Automerge value.
fn value_to_string(value: &automerge::Value<'_>) -> Option<String> {
    match value {
        automerge::Value::Scalar(s) => match s.as_ref() {
            automerge::ScalarValue::Str(s) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
