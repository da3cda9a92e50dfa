//! Stable identity types for geographic primitives.
//!
//! Ids are namespaced by [`PrimitiveKind`]: a point and a line may carry the
//! same numeric id without referring to the same entity. Negative ids denote
//! primitives created locally that the server has not numbered yet.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The three primitive variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    Point,
    Line,
    Relation,
}

impl PrimitiveKind {
    /// Returns `true` for kinds that reference other primitives.
    pub fn is_composite(self) -> bool {
        !matches!(self, PrimitiveKind::Point)
    }

    /// Upload/creation rank: points before lines before relations.
    pub fn rank(self) -> u8 {
        match self {
            PrimitiveKind::Point => 0,
            PrimitiveKind::Line => 1,
            PrimitiveKind::Relation => 2,
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveKind::Point => "point",
            PrimitiveKind::Line => "line",
            PrimitiveKind::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// Identity of a primitive within one DataSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimitiveId {
    pub kind: PrimitiveKind,
    pub id: i64,
}

impl PrimitiveId {
    pub fn new(kind: PrimitiveKind, id: i64) -> Self {
        PrimitiveId { kind, id }
    }

    pub fn point(id: i64) -> Self {
        Self::new(PrimitiveKind::Point, id)
    }

    pub fn line(id: i64) -> Self {
        Self::new(PrimitiveKind::Line, id)
    }

    pub fn relation(id: i64) -> Self {
        Self::new(PrimitiveKind::Relation, id)
    }

    /// Locally created and never assigned a server id.
    pub fn is_new(&self) -> bool {
        self.id < 0
    }
}

// Kind first, then numeric id. Gives snapshots and upload plans a stable order.
impl Ord for PrimitiveId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .rank()
            .cmp(&other.kind.rank())
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for PrimitiveId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Version number supplied by the authoritative store. `0` = never synced.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u32);

impl Version {
    pub const UNSYNCED: Version = Version(0);

    pub fn is_synced(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
