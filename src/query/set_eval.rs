//! Lazily complemented subsets of a universe.
//!
//! A `SetEvaluation` is a concrete id set plus a complement flag. Binary
//! operators rewrite complemented operands with De Morgan identities so
//! a full complement is only built by `release_result`.

use std::borrow::Cow;

use crate::relation::IdSet;

#[derive(Debug, Clone)]
pub struct SetEvaluation<'u> {
    universe: &'u IdSet,
    items: Cow<'u, IdSet>,
    complement: bool,
}

// ── Concrete set primitives ──────────────────────────────────────────

fn intersect_sets<'u>(a: Cow<'u, IdSet>, b: Cow<'u, IdSet>) -> Cow<'u, IdSet> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    match small {
        Cow::Owned(mut set) => {
            set.retain(|id| large.contains(id));
            Cow::Owned(set)
        }
        Cow::Borrowed(set) => Cow::Owned(set.iter().copied().filter(|id| large.contains(id)).collect()),
    }
}

fn union_sets<'u>(a: Cow<'u, IdSet>, b: Cow<'u, IdSet>) -> Cow<'u, IdSet> {
    let (small, mut large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if small.is_empty() {
        return large;
    }
    large.to_mut().extend(small.iter().copied());
    large
}

/// `a - b`
fn difference_sets<'u>(a: Cow<'u, IdSet>, b: Cow<'u, IdSet>) -> Cow<'u, IdSet> {
    if b.is_empty() {
        return a;
    }
    match a {
        Cow::Owned(mut set) => {
            if b.len() < set.len() {
                for id in b.iter() {
                    set.remove(id);
                }
            } else {
                set.retain(|id| !b.contains(id));
            }
            Cow::Owned(set)
        }
        Cow::Borrowed(set) => Cow::Owned(set.iter().copied().filter(|id| !b.contains(id)).collect()),
    }
}

fn symmetric_difference_sets<'u>(a: Cow<'u, IdSet>, b: Cow<'u, IdSet>) -> Cow<'u, IdSet> {
    let (small, mut large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if small.is_empty() {
        return large;
    }
    let set = large.to_mut();
    for &id in small.iter() {
        if !set.remove(&id) {
            set.insert(id);
        }
    }
    large
}

// ── SetEvaluation ────────────────────────────────────────────────────

impl<'u> SetEvaluation<'u> {
    pub fn owned(universe: &'u IdSet, items: IdSet, complement: bool) -> Self {
        Self {
            universe,
            items: Cow::Owned(items),
            complement,
        }
    }

    pub fn borrowed(universe: &'u IdSet, items: &'u IdSet, complement: bool) -> Self {
        Self {
            universe,
            items: Cow::Borrowed(items),
            complement,
        }
    }

    /// The whole universe.
    pub fn universe(universe: &'u IdSet) -> Self {
        Self::owned(universe, IdSet::new(), true)
    }

    pub fn empty(universe: &'u IdSet) -> Self {
        Self::owned(universe, IdSet::new(), false)
    }

    #[inline]
    pub fn is_complement(&self) -> bool {
        self.complement
    }

    pub fn len(&self) -> usize {
        if self.complement {
            self.universe.len().saturating_sub(self.items.len())
        } else {
            self.items.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.items.contains(&id) != self.complement
    }

    pub fn complement(mut self) -> Self {
        self.complement = !self.complement;
        self
    }

    /// Borrowing copy, for reusing one operand in several operations.
    pub fn view(&self) -> SetEvaluation<'_> {
        SetEvaluation {
            universe: self.universe,
            items: Cow::Borrowed(self.items.as_ref()),
            complement: self.complement,
        }
    }

    /// Materialize the subset, building the complement if needed.
    pub fn release_result(self) -> IdSet {
        if self.complement {
            let items = self.items;
            self.universe
                .iter()
                .copied()
                .filter(|id| !items.contains(id))
                .collect()
        } else {
            self.items.into_owned()
        }
    }

    /// Iterate members without materializing.
    pub fn iter(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        if self.complement {
            Box::new(self.universe.iter().copied().filter(|id| !self.items.contains(id)))
        } else {
            Box::new(self.items.iter().copied())
        }
    }

    fn check_universe(&self, rhs: &SetEvaluation<'_>) {
        assert!(
            std::ptr::eq(self.universe, rhs.universe),
            "set operands must share one universe"
        );
    }

    fn with(self, items: Cow<'u, IdSet>, complement: bool) -> Self {
        Self {
            universe: self.universe,
            items,
            complement,
        }
    }

    pub fn intersect(self, rhs: SetEvaluation<'u>) -> Self {
        self.check_universe(&rhs);
        let (a, b) = (self.complement, rhs.complement);
        let universe = self.universe;
        let (lhs, rhs) = (self.items, rhs.items);
        let base = Self::empty(universe);
        match (a, b) {
            (false, false) => base.with(intersect_sets(lhs, rhs), false),
            (false, true) => base.with(difference_sets(lhs, rhs), false),
            (true, false) => base.with(difference_sets(rhs, lhs), false),
            (true, true) => base.with(union_sets(lhs, rhs), true),
        }
    }

    pub fn union(self, rhs: SetEvaluation<'u>) -> Self {
        self.check_universe(&rhs);
        let (a, b) = (self.complement, rhs.complement);
        let universe = self.universe;
        let (lhs, rhs) = (self.items, rhs.items);
        let base = Self::empty(universe);
        match (a, b) {
            (false, false) => base.with(union_sets(lhs, rhs), false),
            (false, true) => base.with(difference_sets(rhs, lhs), true),
            (true, false) => base.with(difference_sets(lhs, rhs), true),
            (true, true) => base.with(intersect_sets(lhs, rhs), true),
        }
    }

    /// `self - rhs`
    pub fn difference(self, rhs: SetEvaluation<'u>) -> Self {
        self.check_universe(&rhs);
        let (a, b) = (self.complement, rhs.complement);
        let universe = self.universe;
        let (lhs, rhs) = (self.items, rhs.items);
        let base = Self::empty(universe);
        match (a, b) {
            (false, false) => base.with(difference_sets(lhs, rhs), false),
            (false, true) => base.with(intersect_sets(lhs, rhs), false),
            (true, false) => base.with(union_sets(lhs, rhs), true),
            (true, true) => base.with(difference_sets(rhs, lhs), false),
        }
    }

    pub fn symmetric_difference(self, rhs: SetEvaluation<'u>) -> Self {
        self.check_universe(&rhs);
        let complement = self.complement != rhs.complement;
        let universe = self.universe;
        Self::empty(universe).with(symmetric_difference_sets(self.items, rhs.items), complement)
    }

    /// Discard the running value and take `rhs`.
    pub fn right_hand_side(self, rhs: SetEvaluation<'u>) -> Self {
        self.check_universe(&rhs);
        rhs
    }
}
