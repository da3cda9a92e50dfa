//! Back-reference index: which composites mention a given primitive.
//!
//! [`ReferenceIndex`] replaces embedded back-pointers with an id-keyed map
//! owned by the DataSet. Entries are kept sorted and deduplicated, so a line
//! that visits the same point twice is listed once.

use std::collections::{BTreeSet, HashMap};

use smallvec::SmallVec;

use crate::id::PrimitiveId;
use crate::primitive::Primitive;

type Referrers = SmallVec<[PrimitiveId; 2]>;

/// Maps a primitive id to the composites currently referencing it.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    referrers: HashMap<PrimitiveId, Referrers>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composites referencing `id`, sorted. Empty slice if none.
    pub fn referrers(&self, id: PrimitiveId) -> &[PrimitiveId] {
        self.referrers.get(&id).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn is_referenced(&self, id: PrimitiveId) -> bool {
        !self.referrers(id).is_empty()
    }

    /// Records `referrer` as referencing every id in `targets`.
    pub fn link<'a>(&mut self, referrer: PrimitiveId, targets: impl IntoIterator<Item = &'a PrimitiveId>) {
        for target in targets {
            let entry = self.referrers.entry(*target).or_default();
            if let Err(pos) = entry.binary_search(&referrer) {
                entry.insert(pos, referrer);
            }
        }
    }

    /// Removes `referrer` from the entries of every id in `targets`.
    pub fn unlink<'a>(&mut self, referrer: PrimitiveId, targets: impl IntoIterator<Item = &'a PrimitiveId>) {
        for target in targets {
            if let Some(entry) = self.referrers.get_mut(target) {
                if let Ok(pos) = entry.binary_search(&referrer) {
                    entry.remove(pos);
                }
                if entry.is_empty() {
                    self.referrers.remove(target);
                }
            }
        }
    }

    /// Applies the difference between an old and new member set.
    pub fn relink(
        &mut self,
        referrer: PrimitiveId,
        old: &BTreeSet<PrimitiveId>,
        new: &BTreeSet<PrimitiveId>,
    ) {
        self.unlink(referrer, old.difference(new));
        self.link(referrer, new.difference(old));
    }

    /// Moves all entries recorded under `old` to `new`, used when a primitive
    /// receives its server id.
    pub fn rename_target(&mut self, old: PrimitiveId, new: PrimitiveId) {
        if let Some(entry) = self.referrers.remove(&old) {
            self.referrers.insert(new, entry);
        }
    }

    /// Full recomputation from a primitive set. Only used at load time.
    pub fn rebuild<'a>(primitives: impl IntoIterator<Item = &'a Primitive>) -> Self {
        let mut index = ReferenceIndex::new();
        for p in primitives {
            let refs = p.referenced_ids();
            index.link(p.id(), refs.iter());
        }
        index
    }

    /// Compares this index against a fresh rebuild. Returns the first
    /// mismatching target id, if any.
    pub fn verify<'a>(&self, primitives: impl IntoIterator<Item = &'a Primitive>) -> Option<PrimitiveId> {
        let fresh = Self::rebuild(primitives);
        for (id, referrers) in &self.referrers {
            if fresh.referrers(*id) != referrers.as_slice() {
                return Some(*id);
            }
        }
        fresh
            .referrers
            .keys()
            .find(|id| !self.referrers.contains_key(id))
            .copied()
    }

    /// Number of primitives that have at least one referrer.
    pub fn len(&self) -> usize {
        self.referrers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::LatLon;
    use crate::primitive::Member;

    fn ids(v: &[i64]) -> BTreeSet<PrimitiveId> {
        v.iter().map(|&i| PrimitiveId::point(i)).collect()
    }

    #[test]
    fn link_is_idempotent_and_sorted() {
        let mut index = ReferenceIndex::new();
        let p = PrimitiveId::point(1);
        index.link(PrimitiveId::line(5), [p].iter());
        index.link(PrimitiveId::line(2), [p].iter());
        index.link(PrimitiveId::line(5), [p].iter());
        assert_eq!(index.referrers(p), &[PrimitiveId::line(2), PrimitiveId::line(5)]);
    }

    #[test]
    fn unlink_drops_empty_entries() {
        let mut index = ReferenceIndex::new();
        let p = PrimitiveId::point(1);
        index.link(PrimitiveId::line(5), [p].iter());
        index.unlink(PrimitiveId::line(5), [p].iter());
        assert!(!index.is_referenced(p));
        assert!(index.is_empty());
    }

    #[test]
    fn relink_applies_difference() {
        let mut index = ReferenceIndex::new();
        let line = PrimitiveId::line(1);
        index.link(line, ids(&[1, 2, 3]).iter());
        index.relink(line, &ids(&[1, 2, 3]), &ids(&[2, 3, 4]));
        assert!(!index.is_referenced(PrimitiveId::point(1)));
        assert_eq!(index.referrers(PrimitiveId::point(4)), &[line]);
        assert_eq!(index.referrers(PrimitiveId::point(2)), &[line]);
    }

    #[test]
    fn rebuild_and_verify() {
        let prims = vec![
            Primitive::point(1, LatLon::new(0.0, 0.0)),
            Primitive::point(2, LatLon::new(0.0, 1.0)),
            Primitive::line(10, [1, 2, 1]),
            Primitive::relation(20, vec![Member::new("outer", PrimitiveId::line(10))]),
        ];
        let index = ReferenceIndex::rebuild(&prims);
        assert_eq!(index.referrers(PrimitiveId::point(1)), &[PrimitiveId::line(10)]);
        assert_eq!(index.referrers(PrimitiveId::line(10)), &[PrimitiveId::relation(20)]);
        assert_eq!(index.verify(&prims), None);

        let mut stale = index.clone();
        stale.unlink(PrimitiveId::line(10), [PrimitiveId::point(2)].iter());
        assert_eq!(stale.verify(&prims), Some(PrimitiveId::point(2)));
    }
}
