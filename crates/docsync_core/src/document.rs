//! Documents and their revision metadata.

use crate::types::{RevisionFlags, SequenceNumber, DEFAULT_COLLECTION};
use serde_json::Value;
use uuid::Uuid;

/// The body of a document: an opaque structured value.
pub type Properties = serde_json::Map<String, Value>;

/// A document revision as seen by the application.
///
/// A `Document` read from a database remembers which database and collection it came
/// from, its revision ID, and its sequence. A document created with [`Document::new`]
/// belongs to no database until it is saved.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    collection: String,
    database: Option<Uuid>,
    rev_id: Option<String>,
    sequence: SequenceNumber,
    flags: RevisionFlags,
    properties: Properties,
}

impl Document {
    /// Creates a new, unsaved document with an empty body.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_properties(id, Properties::new())
    }

    /// Creates a new, unsaved document with the given body.
    pub fn with_properties(id: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            collection: DEFAULT_COLLECTION.to_string(),
            database: None,
            rev_id: None,
            sequence: SequenceNumber::ZERO,
            flags: RevisionFlags::NONE,
            properties,
        }
    }

    /// Creates a document describing a stored revision.
    ///
    /// Used by [`DocumentStore`](crate::DocumentStore) implementations.
    pub fn from_revision(
        database: Uuid,
        collection: impl Into<String>,
        id: impl Into<String>,
        rev_id: impl Into<String>,
        sequence: SequenceNumber,
        flags: RevisionFlags,
        properties: Properties,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            database: Some(database),
            rev_id: Some(rev_id.into()),
            sequence,
            flags,
            properties,
        }
    }

    /// Returns the document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the UUID of the database this document was read from, if any.
    pub fn database(&self) -> Option<Uuid> {
        self.database
    }

    /// Returns the revision ID, or `None` for an unsaved document.
    pub fn revision_id(&self) -> Option<&str> {
        self.rev_id.as_deref()
    }

    /// Returns the sequence of this revision.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Returns the revision flags.
    pub fn flags(&self) -> RevisionFlags {
        self.flags
    }

    /// Returns true if this revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }

    /// Returns the document body.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Returns the document body for modification.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Replaces the document body.
    pub fn set_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    /// Returns a single property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Sets a single property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Approximate encoded size of the body in bytes.
    pub fn body_size(&self) -> u64 {
        body_size(&self.properties)
    }

    /// Makes `base` the revision the next save builds on.
    pub(crate) fn rebase(&mut self, base: Option<&Document>) {
        self.rev_id = base.and_then(|doc| doc.rev_id.clone());
        if let Some(doc) = base {
            self.sequence = doc.sequence;
        }
    }
}

/// Approximate encoded size of a body in bytes.
pub(crate) fn body_size(properties: &Properties) -> u64 {
    serde_json::to_vec(properties)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}
