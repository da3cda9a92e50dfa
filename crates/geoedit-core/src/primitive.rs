//! The primitive model: points, lines and relations.
//!
//! A [`Primitive`] carries identity, version, tags, state flags and a
//! [`Geometry`] holding the variant-specific payload. Fields are private;
//! every mutation goes through [`DataSet`](crate::dataset::DataSet) so the
//! reference index can never drift from the member lists.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::coord::LatLon;
use crate::id::{PrimitiveId, PrimitiveKind, Version};
use crate::tags::Tags;

/// A relation member: a role string plus the referenced primitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub role: String,
    pub target: PrimitiveId,
}

impl Member {
    pub fn new(role: impl Into<String>, target: PrimitiveId) -> Self {
        Member {
            role: role.into(),
            target,
        }
    }
}

/// Variant payload of a primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    /// `coord: None` means the point was referenced but never downloaded.
    Point { coord: Option<LatLon> },
    /// Ordered point references. Repeats allowed (closed shapes).
    Line { nodes: Vec<PrimitiveId> },
    /// Ordered `(role, member)` pairs.
    Relation { members: Vec<Member> },
}

impl Geometry {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Geometry::Point { .. } => PrimitiveKind::Point,
            Geometry::Line { .. } => PrimitiveKind::Line,
            Geometry::Relation { .. } => PrimitiveKind::Relation,
        }
    }

    /// Empty payload for the given kind.
    pub fn empty(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::Point => Geometry::Point { coord: None },
            PrimitiveKind::Line => Geometry::Line { nodes: Vec::new() },
            PrimitiveKind::Relation => Geometry::Relation {
                members: Vec::new(),
            },
        }
    }

    /// Direct references, in list order and with repeats.
    pub fn references(&self) -> Vec<PrimitiveId> {
        match self {
            Geometry::Point { .. } => Vec::new(),
            Geometry::Line { nodes } => nodes.clone(),
            Geometry::Relation { members } => members.iter().map(|m| m.target).collect(),
        }
    }

    fn content_equals(&self, other: &Geometry) -> bool {
        match (self, other) {
            (Geometry::Point { coord: a }, Geometry::Point { coord: b }) => match (a, b) {
                (Some(a), Some(b)) => a.equals_epsilon(b),
                (None, None) => true,
                _ => false,
            },
            (Geometry::Line { nodes: a }, Geometry::Line { nodes: b }) => a == b,
            (Geometry::Relation { members: a }, Geometry::Relation { members: b }) => a == b,
            _ => false,
        }
    }
}

/// An addressable geographic entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    id: PrimitiveId,
    #[serde(default)]
    version: Version,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    modified: bool,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    incomplete: bool,
    geometry: Geometry,
}

impl Primitive {
    /// Creates a complete point.
    pub fn point(id: i64, coord: LatLon) -> Self {
        Self::with_geometry(
            PrimitiveId::point(id),
            Geometry::Point { coord: Some(coord) },
        )
    }

    /// Creates a line over the given point ids.
    pub fn line(id: i64, nodes: impl IntoIterator<Item = i64>) -> Self {
        Self::with_geometry(
            PrimitiveId::line(id),
            Geometry::Line {
                nodes: nodes.into_iter().map(PrimitiveId::point).collect(),
            },
        )
    }

    /// Creates a relation with the given members.
    pub fn relation(id: i64, members: Vec<Member>) -> Self {
        Self::with_geometry(PrimitiveId::relation(id), Geometry::Relation { members })
    }

    /// A placeholder for a primitive known only as a reference target.
    pub fn incomplete(id: PrimitiveId) -> Self {
        Primitive {
            id,
            version: Version::UNSYNCED,
            tags: Tags::new(),
            modified: false,
            deleted: false,
            incomplete: true,
            geometry: Geometry::empty(id.kind),
        }
    }

    /// Builds a primitive from an explicit id and payload. The payload kind
    /// wins if the two disagree.
    pub fn with_geometry(id: PrimitiveId, geometry: Geometry) -> Self {
        let id = PrimitiveId::new(geometry.kind(), id.id);
        Primitive {
            id,
            version: Version::UNSYNCED,
            tags: Tags::new(),
            modified: false,
            deleted: false,
            incomplete: false,
            geometry,
        }
    }

    // -----------------------------------------------------------------------
    // Builder-style setters for constructing detached primitives
    // -----------------------------------------------------------------------

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn with_modified(mut self, modified: bool) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> PrimitiveId {
        self.id
    }

    pub fn kind(&self) -> PrimitiveKind {
        self.id.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_new(&self) -> bool {
        self.id.is_new()
    }

    /// `true` for a primitive whose full data has not been fetched.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete || matches!(self.geometry, Geometry::Point { coord: None })
    }

    /// Coordinate of a complete point.
    pub fn coord(&self) -> Option<LatLon> {
        match &self.geometry {
            Geometry::Point { coord } => *coord,
            _ => None,
        }
    }

    /// Node list of a line; empty for other kinds.
    pub fn nodes(&self) -> &[PrimitiveId] {
        match &self.geometry {
            Geometry::Line { nodes } => nodes,
            _ => &[],
        }
    }

    /// Member list of a relation; empty for other kinds.
    pub fn members(&self) -> &[Member] {
        match &self.geometry {
            Geometry::Relation { members } => members,
            _ => &[],
        }
    }

    /// `true` for a line whose first and last node coincide.
    pub fn is_closed(&self) -> bool {
        let nodes = self.nodes();
        nodes.len() > 2 && nodes.first() == nodes.last()
    }

    /// Distinct primitives referenced directly by this one.
    pub fn referenced_ids(&self) -> BTreeSet<PrimitiveId> {
        self.geometry.references().into_iter().collect()
    }

    /// Content comparison used for diffing against a server version:
    /// tags, geometry/membership, coordinate within epsilon and deleted state.
    /// Version and the modified flag are not content.
    pub fn content_equals(&self, other: &Primitive) -> bool {
        self.id == other.id
            && self.deleted == other.deleted
            && self.tags == other.tags
            && self.geometry.content_equals(&other.geometry)
    }

    // -----------------------------------------------------------------------
    // Crate-private mutators, only reachable through DataSet
    // -----------------------------------------------------------------------

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_tags(&mut self, tags: Tags) -> Tags {
        std::mem::replace(&mut self.tags, tags)
    }

    pub(crate) fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    pub(crate) fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub(crate) fn set_geometry(&mut self, geometry: Geometry) -> Geometry {
        std::mem::replace(&mut self.geometry, geometry)
    }

    pub(crate) fn set_incomplete(&mut self, incomplete: bool) {
        self.incomplete = incomplete;
    }

    pub(crate) fn set_id(&mut self, id: PrimitiveId) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        assert_eq!(Primitive::point(1, LatLon::new(0.0, 0.0)).kind(), PrimitiveKind::Point);
        assert_eq!(Primitive::line(1, [1, 2]).kind(), PrimitiveKind::Line);
        assert_eq!(Primitive::relation(1, vec![]).kind(), PrimitiveKind::Relation);
    }

    #[test]
    fn with_geometry_trusts_payload_kind() {
        let p = Primitive::with_geometry(PrimitiveId::point(4), Geometry::Line { nodes: vec![] });
        assert_eq!(p.id(), PrimitiveId::line(4));
    }

    #[test]
    fn incomplete_detection() {
        assert!(Primitive::incomplete(PrimitiveId::line(3)).is_incomplete());
        let bare = Primitive::with_geometry(PrimitiveId::point(2), Geometry::Point { coord: None });
        assert!(bare.is_incomplete());
        assert!(!Primitive::point(2, LatLon::new(1.0, 1.0)).is_incomplete());
    }

    #[test]
    fn closed_line_repeats_first_node() {
        assert!(Primitive::line(1, [1, 2, 3, 1]).is_closed());
        assert!(!Primitive::line(1, [1, 2, 3]).is_closed());
        assert!(!Primitive::line(1, [1, 1]).is_closed());
    }

    #[test]
    fn referenced_ids_are_distinct() {
        let line = Primitive::line(1, [1, 2, 3, 1]);
        assert_eq!(line.referenced_ids().len(), 3);
        let rel = Primitive::relation(
            9,
            vec![
                Member::new("outer", PrimitiveId::line(1)),
                Member::new("inner", PrimitiveId::line(1)),
                Member::new("", PrimitiveId::point(5)),
            ],
        );
        assert_eq!(rel.referenced_ids().len(), 2);
    }

    #[test]
    fn content_equality_uses_epsilon() {
        let a = Primitive::point(1, LatLon::new(10.0, 20.0)).with_tag("amenity", "cafe");
        let b = Primitive::point(1, LatLon::new(10.0 + 1e-8, 20.0))
            .with_tag("amenity", "cafe")
            .with_version(Version(7))
            .with_modified(true);
        assert!(a.content_equals(&b));
        let c = b.clone().with_tag("name", "Bean");
        assert!(!a.content_equals(&c));
    }

    #[test]
    fn content_equality_includes_deleted_state() {
        let a = Primitive::line(1, [1, 2]);
        let b = a.clone().with_deleted(true);
        assert!(!a.content_equals(&b));
    }

    #[test]
    fn serde_roundtrip_with_defaults() {
        let json = r#"{"id":{"kind":"point","id":5},"geometry":{"type":"point","coord":{"lat":1.0,"lon":2.0}}}"#;
        let p: Primitive = serde_json::from_str(json).unwrap();
        assert_eq!(p.version(), Version::UNSYNCED);
        assert!(p.tags().is_empty());
        assert_eq!(p.coord(), Some(LatLon::new(1.0, 2.0)));

        let line = Primitive::line(3, [1, 2]).with_tag("highway", "path");
        let back: Primitive = serde_json::from_str(&serde_json::to_string(&line).unwrap()).unwrap();
        assert_eq!(back, line);
    }
}
