//! Core type definitions for docsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Name of the collection every database starts with.
pub const DEFAULT_COLLECTION: &str = "_default";

/// Sequence number assigned to every document mutation.
///
/// Sequence numbers are per-database and strictly increasing, so they double as a
/// resumable position in the change history.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The sequence before any mutation.
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for SequenceNumber {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Engine-level flags of a single revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RevisionFlags(u8);

impl RevisionFlags {
    /// No flags.
    pub const NONE: RevisionFlags = RevisionFlags(0);
    /// The revision is a deletion tombstone.
    pub const DELETED: RevisionFlags = RevisionFlags(0x01);
    /// The document lost its access grant and was purged locally.
    pub const PURGED: RevisionFlags = RevisionFlags(0x02);
    /// The revision is an unresolved conflicting leaf.
    pub const CONFLICT: RevisionFlags = RevisionFlags(0x04);
    /// The revision references blobs.
    pub const HAS_ATTACHMENTS: RevisionFlags = RevisionFlags(0x08);

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: RevisionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the deleted flag is set.
    #[must_use]
    pub const fn is_deleted(self) -> bool {
        self.contains(Self::DELETED)
    }

    /// Returns true if the conflict flag is set.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        self.contains(Self::CONFLICT)
    }

    /// Returns these flags with `other` removed.
    #[must_use]
    pub const fn without(self, other: RevisionFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for RevisionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RevisionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Flags reported to applications for a replicated document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DocumentFlags(u8);

impl DocumentFlags {
    /// No flags.
    pub const NONE: DocumentFlags = DocumentFlags(0);
    /// The document was deleted.
    pub const DELETED: DocumentFlags = DocumentFlags(0x01);
    /// The document lost its access on the remote side.
    pub const ACCESS_REMOVED: DocumentFlags = DocumentFlags(0x02);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DocumentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<RevisionFlags> for DocumentFlags {
    fn from(flags: RevisionFlags) -> Self {
        let mut out = DocumentFlags::NONE;
        if flags.contains(RevisionFlags::DELETED) {
            out = out | DocumentFlags::DELETED;
        }
        if flags.contains(RevisionFlags::PURGED) {
            out = out | DocumentFlags::ACCESS_REMOVED;
        }
        out
    }
}

/// Returns the generation prefix of a revision ID (`"3-abcd"` -> 3).
///
/// Malformed IDs count as generation 0.
#[must_use]
pub fn revision_generation(rev_id: &str) -> u64 {
    rev_id
        .split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

/// Creates a fresh revision ID with the given generation.
#[must_use]
pub fn new_revision_id(generation: u64) -> String {
    let digest = uuid::Uuid::new_v4().simple().to_string();
    format!("{generation}-{}", &digest[..16])
}
