//! Versioned snapshots of session state.
//!
//! ## Record format
//!
//! ```text
//! { "schema_version": 3, "state": { ...SessionState... } }
//! ```
//!
//! Loading fails closed: a record is either fully migrated, parsed, and
//! validated, or rejected with [`ContextError::VersionMismatch`] /
//! [`ContextError::PersistenceCorruption`]. Nothing partial is returned.
//!
//! ## Migrations
//!
//! | from | change |
//! |------|--------|
//! | 1 | messages gain `agent_scope`; manual items gain `updated_at`; `summaries` becomes `compactions` |
//! | 2 | the caller key/value map `state` is added, empty |

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::constants::{DEFAULT_SCOPE, MIN_SCHEMA_VERSION, SCHEMA_VERSION};
use crate::errors::{ContextError, Result};
use crate::types::SessionState;

/// Self-describing snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Schema version of `state`.
    pub schema_version: u32,
    /// Session state.
    pub state: SessionState,
}

impl VersionedRecord {
    /// Wrap `state` at the current schema version.
    pub fn current(state: SessionState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            state,
        }
    }
}

// =============================================================================
// Backing stores
// =============================================================================

/// Byte-addressable target for snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored bytes. Readers never observe a partial write.
    fn write_atomic(&self, bytes: &[u8]) -> Result<()>;
    /// Stored bytes, or `None` if nothing has been saved.
    fn read(&self) -> Result<Option<Vec<u8>>>;
    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// File target: write a sibling temp file, fsync, rename over the target.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store at `path`. The parent directory is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        let _ = tmp.persist(&self.path).map_err(|e| e.error)?;

        #[cfg(unix)]
        std::fs::File::open(&parent)?.sync_all()?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory target, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemorySnapshotStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `bytes`.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        *self.bytes.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().clone())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

// =============================================================================
// Encode / decode
// =============================================================================

/// Serialize a record as pretty JSON.
pub fn encode(record: &VersionedRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(record)?)
}

/// Parse, migrate, and validate a stored record.
pub fn decode(bytes: &[u8]) -> Result<VersionedRecord> {
    let mut root: Value = serde_json::from_slice(bytes)
        .map_err(|e| ContextError::PersistenceCorruption(format!("not valid JSON: {e}")))?;

    let found = root
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ContextError::PersistenceCorruption("missing or non-numeric schema_version".into())
        })?;
    let found = u32::try_from(found).unwrap_or(u32::MAX);
    if !(MIN_SCHEMA_VERSION..=SCHEMA_VERSION).contains(&found) {
        return Err(ContextError::VersionMismatch {
            found,
            min: MIN_SCHEMA_VERSION,
            supported: SCHEMA_VERSION,
        });
    }

    let state = root
        .get_mut("state")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ContextError::PersistenceCorruption("missing state object".into()))?;
    for version in found..SCHEMA_VERSION {
        migrate(version, state)?;
        info!(from = version, to = version + 1, "migrated session record");
    }

    let state: SessionState = serde_json::from_value(root["state"].take())
        .map_err(|e| ContextError::PersistenceCorruption(format!("invalid state: {e}")))?;
    validate_state(&state).map_err(ContextError::PersistenceCorruption)?;

    Ok(VersionedRecord::current(state))
}

fn migrate(from: u32, state: &mut Map<String, Value>) -> Result<()> {
    match from {
        1 => {
            migrate_v1_to_v2(state);
            Ok(())
        }
        2 => {
            let _ = state
                .entry("state")
                .or_insert_with(|| Value::Object(Map::new()));
            Ok(())
        }
        _ => Err(ContextError::VersionMismatch {
            found: from,
            min: MIN_SCHEMA_VERSION,
            supported: SCHEMA_VERSION,
        }),
    }
}

fn migrate_v1_to_v2(state: &mut Map<String, Value>) {
    let scope = state
        .get("agent_scope")
        .cloned()
        .unwrap_or_else(|| Value::String(DEFAULT_SCOPE.to_owned()));
    let _ = state.entry("agent_scope").or_insert_with(|| scope.clone());

    if let Some(Value::Array(messages)) = state.get_mut("messages") {
        for message in messages.iter_mut().filter_map(Value::as_object_mut) {
            let _ = message
                .entry("agent_scope")
                .or_insert_with(|| Value::String(DEFAULT_SCOPE.to_owned()));
        }
    }

    if let Some(Value::Array(items)) = state.get_mut("manual_items") {
        for item in items.iter_mut().filter_map(Value::as_object_mut) {
            if !item.contains_key("updated_at") {
                let created = item.get("created_at").cloned().unwrap_or(Value::Null);
                let _ = item.insert("updated_at".into(), created);
            }
        }
    }

    if let Some(Value::Array(summaries)) = state.remove("summaries") {
        let compactions: Vec<Value> = summaries
            .into_iter()
            .filter_map(|s| {
                let s = s.as_object()?;
                Some(serde_json::json!({
                    "summary": s.get("summary").cloned().unwrap_or(Value::String(String::new())),
                    "tokens_before": s.get("tokens_before").cloned().unwrap_or(Value::from(0)),
                    "tokens_after": s.get("tokens_after").cloned().unwrap_or(Value::from(0)),
                    "at": s.get("timestamp").cloned().unwrap_or(Value::Null),
                }))
            })
            .collect();
        let _ = state.insert("compactions".into(), Value::Array(compactions));
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Check every structural invariant of a state. Returns the first violation.
pub fn validate_state(state: &SessionState) -> std::result::Result<(), String> {
    if state.max_tokens == 0 {
        return Err("max_tokens must be positive".into());
    }
    let ratio = state.summarization_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(format!("summarization_ratio {ratio} outside (0, 1]"));
    }

    let mut message_ids = HashSet::new();
    for m in &state.messages {
        if !message_ids.insert(&m.id) {
            return Err(format!("duplicate message id {}", m.id));
        }
        if m.content.trim().is_empty() {
            return Err(format!("message {} has empty content", m.id));
        }
    }

    let mut labels = HashSet::new();
    for item in &state.manual_items {
        if !labels.insert(item.label.as_str()) {
            return Err(format!("duplicate manual context label '{}'", item.label));
        }
    }

    let mut keys = HashSet::new();
    for (id, entity) in &state.entities {
        if id != &entity.id {
            return Err(format!("entity stored under {id} has id {}", entity.id));
        }
        if !keys.insert((entity.normalized_text.as_str(), entity.label)) {
            return Err(format!(
                "duplicate entity '{}' ({})",
                entity.normalized_text, entity.label
            ));
        }
        if !(0.0..=1.0).contains(&entity.confidence) {
            return Err(format!("entity {id} confidence out of range"));
        }
        if let Some(r) = entity
            .relationships
            .iter()
            .find(|r| !state.entities.contains_key(&r.target))
        {
            return Err(format!("entity {id} has dangling edge to {}", r.target));
        }
    }

    let total: u64 = state.messages.iter().map(|m| m.token_cost).sum::<u64>()
        + state.manual_items.iter().map(|i| i.token_cost).sum::<u64>();
    if total != state.token_count {
        return Err(format!(
            "token_count {} does not match component total {total}",
            state.token_count
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentScope, Message, Role};
    use assert_matches::assert_matches;
    use mnemo_core::ids::SessionId;

    fn state() -> SessionState {
        let m = Message::new(Role::User, "hello", 2, AgentScope::default(), Vec::new());
        SessionState {
            session_id: SessionId::new(),
            messages: vec![m],
            entities: std::collections::BTreeMap::new(),
            manual_items: Vec::new(),
            token_count: 2,
            max_tokens: 100,
            summarization_ratio: 0.8,
            agent_scope: AgentScope::default(),
            compactions: Vec::new(),
            diagnostics: Vec::new(),
            state: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = VersionedRecord::current(state());
        let back = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut value = serde_json::to_value(VersionedRecord::current(state())).unwrap();
        value["schema_version"] = Value::from(SCHEMA_VERSION + 1);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_matches!(
            decode(&bytes),
            Err(ContextError::VersionMismatch { found, .. }) if found == SCHEMA_VERSION + 1
        );
    }

    #[test]
    fn version_zero_is_rejected() {
        let bytes = br#"{"schema_version": 0, "state": {}}"#;
        assert_matches!(decode(bytes), Err(ContextError::VersionMismatch { found: 0, .. }));
    }

    #[test]
    fn garbage_is_corruption() {
        assert_matches!(decode(b"{not json"), Err(ContextError::PersistenceCorruption(_)));
        assert_matches!(
            decode(br#"{"state": {}}"#),
            Err(ContextError::PersistenceCorruption(_))
        );
        assert_matches!(
            decode(br#"{"schema_version": 2, "state": {"messages": 3}}"#),
            Err(ContextError::PersistenceCorruption(_))
        );
    }

    #[test]
    fn token_drift_is_corruption() {
        let mut s = state();
        s.token_count = 99;
        let bytes = encode(&VersionedRecord::current(s)).unwrap();
        assert_matches!(decode(&bytes), Err(ContextError::PersistenceCorruption(msg)) if msg.contains("token_count"));
    }

    #[test]
    fn v1_record_is_migrated() {
        let v1 = serde_json::json!({
            "schema_version": 1,
            "state": {
                "session_id": "s-1",
                "messages": [{
                    "id": "m-1",
                    "role": "user",
                    "content": "hi there",
                    "token_cost": 2,
                    "timestamp": "2025-01-01T00:00:00Z"
                }],
                "entities": {},
                "manual_items": [{
                    "label": "notes",
                    "source": "user",
                    "content": "remember",
                    "token_cost": 2,
                    "created_at": "2025-01-01T00:00:00Z"
                }],
                "token_count": 4,
                "max_tokens": 100,
                "summarization_ratio": 0.8,
                "agent_scope": "default",
                "summaries": [{
                    "summary": "earlier",
                    "tokens_before": 90,
                    "tokens_after": 10,
                    "timestamp": "2025-01-01T00:00:00Z"
                }]
            }
        });
        let record = decode(&serde_json::to_vec(&v1).unwrap()).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        let s = record.state;
        assert_eq!(s.messages[0].agent_scope, AgentScope::default());
        assert_eq!(s.manual_items[0].updated_at, s.manual_items[0].created_at);
        assert_eq!(s.compactions.len(), 1);
        assert_eq!(s.compactions[0].tokens_before, 90);
        assert!(s.compactions[0].summary_message_id.is_none());
    }

    #[test]
    fn v2_record_gains_empty_caller_state() {
        let mut value = serde_json::to_value(VersionedRecord::current(state())).unwrap();
        value["schema_version"] = Value::from(2);
        let _ = value["state"].as_object_mut().unwrap().remove("state");

        let record = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(record.schema_version, 3);
        assert!(record.state.state.is_empty());
        assert_eq!(record.state.messages.len(), 1);
    }

    #[test]
    fn caller_state_survives_encode() {
        let mut s = state();
        let _ = s
            .state
            .insert("cursor".into(), serde_json::json!({"line": 4}));
        let back = decode(&encode(&VersionedRecord::current(s)).unwrap()).unwrap();
        assert_eq!(back.state.state["cursor"]["line"], 4);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySnapshotStore::new();
        assert!(store.read().unwrap().is_none());
        store.write_atomic(b"abc").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"abc");
    }

    #[test]
    fn file_store_writes_atomically_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let store = FileSnapshotStore::new(&path);
        assert!(store.read().unwrap().is_none());

        store.write_atomic(b"first").unwrap();
        store.write_atomic(b"second").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"second");

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("session.json")]);
    }
}
