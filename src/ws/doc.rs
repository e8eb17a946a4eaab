use loro::{ExportMode, LoroDoc, ToJson};

/// A failure inside the CRDT engine.
#[derive(Debug)]
pub enum DocError {
    Apply(String),
    Encode(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::Apply(e) => write!(f, "failed to apply update: {}", e),
            DocError::Encode(e) => write!(f, "failed to encode document: {}", e),
        }
    }
}

impl std::error::Error for DocError {}

/// The in-memory document of one room.
///
/// Updates are opaque bytes to every layer above this one; the loro engine
/// merges them commutatively. All access is funnelled through the room's
/// owner task, so the wrapper itself carries no locking.
pub struct RoomDoc {
    doc: LoroDoc,
}

impl RoomDoc {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Build a document seeded from a persisted snapshot payload.
    pub fn from_snapshot(payload: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new();
        doc.apply(payload)?;
        Ok(doc)
    }

    /// Merge one binary update into the document.
    pub fn apply(&self, update: &[u8]) -> Result<(), DocError> {
        self.doc
            .import(update)
            .map(|_| ())
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Serialize the full current state.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, DocError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocError::Encode(e.to_string()))
    }

    /// Serialize the version vector of the current state.
    pub fn state_vector(&self) -> Result<Vec<u8>, DocError> {
        serde_json::to_vec(&self.doc.state_vv()).map_err(|e| DocError::Encode(e.to_string()))
    }

    /// JSON view of the document value, for equality checks and export.
    pub fn to_json(&self) -> serde_json::Value {
        self.doc.get_deep_value().to_json_value()
    }
}

impl Default for RoomDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_with_text(key: &str, text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.get_text(key).insert(0, text).unwrap();
        doc.export(ExportMode::Snapshot).unwrap()
    }

    #[test]
    fn applies_merge_in_any_order() {
        let a = update_with_text("left", "hello");
        let b = update_with_text("right", "world");

        let first = RoomDoc::new();
        first.apply(&a).unwrap();
        first.apply(&b).unwrap();

        let second = RoomDoc::new();
        second.apply(&b).unwrap();
        second.apply(&a).unwrap();

        assert_eq!(first.to_json(), second.to_json());
    }

    #[test]
    fn snapshot_round_trips_state() {
        let doc = RoomDoc::new();
        doc.apply(&update_with_text("t", "whiteboard")).unwrap();

        let snapshot = doc.encode_snapshot().unwrap();
        let restored = RoomDoc::from_snapshot(&snapshot).unwrap();
        assert_eq!(doc.to_json(), restored.to_json());
    }

    #[test]
    fn duplicate_apply_is_idempotent() {
        let update = update_with_text("t", "once");
        let doc = RoomDoc::new();
        doc.apply(&update).unwrap();
        let before = doc.to_json();
        doc.apply(&update).unwrap();
        assert_eq!(before, doc.to_json());
    }

    #[test]
    fn garbage_update_is_rejected() {
        let doc = RoomDoc::new();
        assert!(doc.apply(&[0x00, 0x01, 0x02]).is_err());
    }
}
