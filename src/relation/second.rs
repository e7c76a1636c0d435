//! Complement-aware membership set for one `first` key.

use crate::error::{Result, StoreError};

use super::IdSet;

/// Indicator byte for a complemented set in shard files.
pub const COMPLEMENT_BYTE: u8 = b'C';
/// Indicator byte for a direct set in shard files.
pub const DIRECT_BYTE: u8 = b'N';

/// Membership of one `first` key.
///
/// `physical` holds the members when `complement` is false, and the
/// non-members (within the universe) when it is true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPairSecond {
    physical: IdSet,
    complement: bool,
}

#[inline]
fn exceeds(physical_len: usize, universe_len: usize, threshold: f64) -> bool {
    physical_len as f64 > threshold * universe_len as f64
}

impl IdPairSecond {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(physical: IdSet, complement: bool) -> Self {
        Self { physical, complement }
    }

    /// Membership of `id`. A complemented set only holds universe ids.
    #[inline]
    pub fn contains(&self, id: u64, universe: &IdSet) -> bool {
        if self.complement {
            universe.contains(&id) && !self.physical.contains(&id)
        } else {
            self.physical.contains(&id)
        }
    }

    /// Logical member count against a universe of `universe_len` ids.
    #[inline]
    pub fn len(&self, universe_len: usize) -> usize {
        if self.complement {
            universe_len.saturating_sub(self.physical.len())
        } else {
            self.physical.len()
        }
    }

    #[inline]
    pub fn is_complement(&self) -> bool {
        self.complement
    }

    #[inline]
    pub fn physical(&self) -> &IdSet {
        &self.physical
    }

    #[inline]
    pub fn physical_len(&self) -> usize {
        self.physical.len()
    }

    pub fn complement_indicator(&self) -> u8 {
        if self.complement {
            COMPLEMENT_BYTE
        } else {
            DIRECT_BYTE
        }
    }

    /// Add `id` as a member. Returns false if it already was one.
    pub fn insert(&mut self, id: u64, universe: &IdSet, threshold: f64) -> bool {
        let changed = if self.complement {
            self.physical.remove(&id)
        } else {
            self.physical.insert(id)
        };
        if changed {
            self.rebalance(universe, threshold);
        }
        changed
    }

    /// Remove `id` as a member. Returns false if it was not one.
    pub fn remove(&mut self, id: u64, universe: &IdSet, threshold: f64) -> bool {
        let changed = if self.complement {
            self.physical.insert(id)
        } else {
            self.physical.remove(&id)
        };
        if changed {
            self.rebalance(universe, threshold);
        }
        changed
    }

    /// Flip `id` in the physical set without changing representation.
    /// For universe ids this flips `contains` in either mode, which is
    /// what diff replay relies on.
    pub fn toggle_physical(&mut self, id: u64) {
        if !self.physical.remove(&id) {
            self.physical.insert(id);
        }
    }

    /// Switch representation if the physical set has grown past
    /// `threshold * |universe|`. Returns true if it flipped.
    pub fn rebalance(&mut self, universe: &IdSet, threshold: f64) -> bool {
        if !exceeds(self.physical.len(), universe.len(), threshold) {
            return false;
        }
        let physical = &self.physical;
        let flipped: IdSet = universe
            .iter()
            .copied()
            .filter(|id| !physical.contains(id))
            .collect();
        self.physical = flipped;
        self.complement = !self.complement;
        true
    }

    /// Record a newly admitted universe id as a non-member.
    pub fn insert_complement(&mut self, id: u64) -> Result<()> {
        if !self.complement {
            return Err(StoreError::ComplementPropagation(format!(
                "insert_complement({id}) on a direct set"
            )));
        }
        if !self.physical.insert(id) {
            return Err(StoreError::ComplementPropagation(format!(
                "insert_complement({id}) applied twice"
            )));
        }
        Ok(())
    }

    /// Forget a universe id that has been removed.
    pub fn delete_complement(&mut self, id: u64) -> Result<()> {
        if !self.complement {
            return Err(StoreError::ComplementPropagation(format!(
                "delete_complement({id}) on a direct set"
            )));
        }
        if !self.physical.remove(&id) {
            return Err(StoreError::ComplementPropagation(format!(
                "delete_complement({id}) applied twice"
            )));
        }
        Ok(())
    }

    /// Iterate members. Complemented sets walk the universe.
    pub fn iter<'a>(&'a self, universe: &'a IdSet) -> impl Iterator<Item = u64> + 'a {
        let source = if self.complement { universe } else { &self.physical };
        source.iter().copied().filter(move |id| self.contains(*id, universe))
    }
}
