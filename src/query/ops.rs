//! Search wire format: bytes, operators, comparators and an encoder.
//!
//! ```text
//! expr      := [op] operand (op operand)*
//! op        := '|' | '&' | '-' | '^'
//! operand   := ['~'] ( 'T' id | 'L' n id*n | '(' expr ')' | 'U' | 'E' | aggregate )
//! aggregate := 'A' n tag*n clause* ')'
//! clause    := 'C' cmp u64 expr ')'
//!            | 'P' cmp f32 expr ')'
//!            | 'F' cmp f32 expr ')' expr ')'
//! cmp       := "< " | "<=" | "> " | ">="
//! ```
//!
//! Ids and counts are big-endian u64, percentages little-endian f32.

use crate::codec::{put_f32, put_u64, put_u8};

use super::set_eval::SetEvaluation;

pub const OP_UNION: u8 = b'|';
pub const OP_INTERSECT: u8 = b'&';
pub const OP_DIFFERENCE: u8 = b'-';
pub const OP_SYMMETRIC_DIFFERENCE: u8 = b'^';

pub const OPERAND_TAG: u8 = b'T';
pub const OPERAND_LIST: u8 = b'L';
pub const OPERAND_AGGREGATE: u8 = b'A';
pub const OPERAND_UNIVERSE: u8 = b'U';
pub const OPERAND_EMPTY: u8 = b'E';
pub const GROUP_OPEN: u8 = b'(';
pub const GROUP_CLOSE: u8 = b')';
pub const COMPLEMENT: u8 = b'~';

pub const CLAUSE_COUNT: u8 = b'C';
pub const CLAUSE_PERCENTAGE: u8 = b'P';
pub const CLAUSE_FILTERED_PERCENTAGE: u8 = b'F';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// Implicit operator of a leading operand.
    RightHandSide,
    Union,
    Intersect,
    Difference,
    SymmetricDifference,
}

impl SetOp {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            OP_UNION => Some(SetOp::Union),
            OP_INTERSECT => Some(SetOp::Intersect),
            OP_DIFFERENCE => Some(SetOp::Difference),
            OP_SYMMETRIC_DIFFERENCE => Some(SetOp::SymmetricDifference),
            _ => None,
        }
    }

    pub fn byte(self) -> Option<u8> {
        match self {
            SetOp::RightHandSide => None,
            SetOp::Union => Some(OP_UNION),
            SetOp::Intersect => Some(OP_INTERSECT),
            SetOp::Difference => Some(OP_DIFFERENCE),
            SetOp::SymmetricDifference => Some(OP_SYMMETRIC_DIFFERENCE),
        }
    }

    pub fn apply<'u>(self, lhs: SetEvaluation<'u>, rhs: SetEvaluation<'u>) -> SetEvaluation<'u> {
        match self {
            SetOp::RightHandSide => lhs.right_hand_side(rhs),
            SetOp::Union => lhs.union(rhs),
            SetOp::Intersect => lhs.intersect(rhs),
            SetOp::Difference => lhs.difference(rhs),
            SetOp::SymmetricDifference => lhs.symmetric_difference(rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Comparator {
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        match &bytes {
            b"< " => Some(Comparator::Less),
            b"<=" => Some(Comparator::LessEqual),
            b"> " => Some(Comparator::Greater),
            b">=" => Some(Comparator::GreaterEqual),
            _ => None,
        }
    }

    pub fn bytes(self) -> [u8; 2] {
        match self {
            Comparator::Less => *b"< ",
            Comparator::LessEqual => *b"<=",
            Comparator::Greater => *b"> ",
            Comparator::GreaterEqual => *b">=",
        }
    }

    /// `lhs <cmp> rhs`. NaN never compares true.
    pub fn compare<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Comparator::Less => lhs < rhs,
            Comparator::LessEqual => lhs <= rhs,
            Comparator::Greater => lhs > rhs,
            Comparator::GreaterEqual => lhs >= rhs,
        }
    }

    /// Outcome of `count <cmp> n` for any count no larger than `bound`,
    /// when that alone decides it.
    pub fn decided_by_upper_bound(self, bound: u64, n: u64) -> Option<bool> {
        match self {
            Comparator::Less if bound < n => Some(true),
            Comparator::LessEqual if bound <= n => Some(true),
            Comparator::Greater if bound <= n => Some(false),
            Comparator::GreaterEqual if bound < n => Some(false),
            _ => None,
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────────

/// One operand of a search expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Tag(u64),
    List(Vec<u64>),
    Universe,
    Empty,
    Group(QueryBuilder),
    Aggregate(Aggregate),
    Complement(Box<Operand>),
}

impl Operand {
    pub fn complement(self) -> Self {
        Operand::Complement(Box::new(self))
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Operand::Tag(id) => {
                put_u8(buf, OPERAND_TAG);
                put_u64(buf, *id);
            }
            Operand::List(ids) => {
                put_u8(buf, OPERAND_LIST);
                put_u64(buf, ids.len() as u64);
                for &id in ids {
                    put_u64(buf, id);
                }
            }
            Operand::Universe => put_u8(buf, OPERAND_UNIVERSE),
            Operand::Empty => put_u8(buf, OPERAND_EMPTY),
            Operand::Group(inner) => {
                put_u8(buf, GROUP_OPEN);
                inner.write(buf);
                put_u8(buf, GROUP_CLOSE);
            }
            Operand::Aggregate(aggregate) => aggregate.write(buf),
            Operand::Complement(inner) => {
                put_u8(buf, COMPLEMENT);
                inner.write(buf);
            }
        }
    }
}

/// Builds the byte form of a search expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuilder {
    terms: Vec<(SetOp, Operand)>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expression consisting of one operand.
    pub fn with(operand: Operand) -> Self {
        Self::new().then(SetOp::RightHandSide, operand)
    }

    /// Union of tags. No tags gives the empty set.
    pub fn any_tag(tags: impl IntoIterator<Item = u64>) -> Self {
        let query = Self::join(SetOp::Union, tags.into_iter().map(Operand::Tag));
        if query.terms.is_empty() {
            return Self::with(Operand::Empty);
        }
        query
    }

    /// Intersection of tags. No tags gives the universe.
    pub fn all_tags(tags: impl IntoIterator<Item = u64>) -> Self {
        Self::join(SetOp::Intersect, tags.into_iter().map(Operand::Tag))
    }

    /// Operands combined left to right with one operator.
    pub fn join(op: SetOp, operands: impl IntoIterator<Item = Operand>) -> Self {
        operands
            .into_iter()
            .fold(Self::new(), |query, operand| query.then(op, operand))
    }

    /// Append `op operand`. `RightHandSide` discards the terms so far.
    pub fn then(mut self, op: SetOp, operand: Operand) -> Self {
        if op == SetOp::RightHandSide {
            self.terms.clear();
        }
        self.terms.push((op, operand));
        self
    }

    pub fn union(self, operand: Operand) -> Self {
        self.then(SetOp::Union, operand)
    }

    pub fn intersect(self, operand: Operand) -> Self {
        self.then(SetOp::Intersect, operand)
    }

    pub fn difference(self, operand: Operand) -> Self {
        self.then(SetOp::Difference, operand)
    }

    pub fn symmetric_difference(self, operand: Operand) -> Self {
        self.then(SetOp::SymmetricDifference, operand)
    }

    /// Wrap as a parenthesized operand.
    pub fn group(self) -> Operand {
        Operand::Group(self)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    fn write(&self, buf: &mut Vec<u8>) {
        for (i, (op, operand)) in self.terms.iter().enumerate() {
            // The leading operand's operator is implicit.
            if i > 0 {
                if let Some(byte) = op.byte() {
                    put_u8(buf, byte);
                }
            }
            operand.write(buf);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// `|tag ∩ expr| <cmp> n`
    Count {
        cmp: Comparator,
        n: u64,
        expr: QueryBuilder,
    },
    /// `|tag ∩ expr| / |tag| <cmp> ratio`
    Percentage {
        cmp: Comparator,
        ratio: f32,
        expr: QueryBuilder,
    },
    /// Percentage over `tag ∩ filter` instead of the whole tag.
    FilteredPercentage {
        cmp: Comparator,
        ratio: f32,
        filter: QueryBuilder,
        expr: QueryBuilder,
    },
}

/// Tag group filtered by clauses; evaluates to the union of surviving tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    tags: Vec<u64>,
    clauses: Vec<Clause>,
}

impl Aggregate {
    pub fn new(tags: impl IntoIterator<Item = u64>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            clauses: Vec::new(),
        }
    }

    pub fn count(mut self, cmp: Comparator, n: u64, expr: QueryBuilder) -> Self {
        self.clauses.push(Clause::Count { cmp, n, expr });
        self
    }

    pub fn percentage(mut self, cmp: Comparator, ratio: f32, expr: QueryBuilder) -> Self {
        self.clauses.push(Clause::Percentage { cmp, ratio, expr });
        self
    }

    pub fn filtered_percentage(
        mut self,
        cmp: Comparator,
        ratio: f32,
        filter: QueryBuilder,
        expr: QueryBuilder,
    ) -> Self {
        self.clauses.push(Clause::FilteredPercentage {
            cmp,
            ratio,
            filter,
            expr,
        });
        self
    }

    pub fn operand(self) -> Operand {
        Operand::Aggregate(self)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        put_u8(buf, OPERAND_AGGREGATE);
        put_u64(buf, self.tags.len() as u64);
        for &tag in &self.tags {
            put_u64(buf, tag);
        }
        for clause in &self.clauses {
            match clause {
                Clause::Count { cmp, n, expr } => {
                    put_u8(buf, CLAUSE_COUNT);
                    buf.extend_from_slice(&cmp.bytes());
                    put_u64(buf, *n);
                    expr.write(buf);
                    put_u8(buf, GROUP_CLOSE);
                }
                Clause::Percentage { cmp, ratio, expr } => {
                    put_u8(buf, CLAUSE_PERCENTAGE);
                    buf.extend_from_slice(&cmp.bytes());
                    put_f32(buf, *ratio);
                    expr.write(buf);
                    put_u8(buf, GROUP_CLOSE);
                }
                Clause::FilteredPercentage {
                    cmp,
                    ratio,
                    filter,
                    expr,
                } => {
                    put_u8(buf, CLAUSE_FILTERED_PERCENTAGE);
                    buf.extend_from_slice(&cmp.bytes());
                    put_f32(buf, *ratio);
                    filter.write(buf);
                    put_u8(buf, GROUP_CLOSE);
                    expr.write(buf);
                    put_u8(buf, GROUP_CLOSE);
                }
            }
        }
        put_u8(buf, GROUP_CLOSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_of_tags_bytes() {
        let bytes = QueryBuilder::any_tag([1, 2]).encode();
        let mut expected = vec![b'T'];
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.push(b'|');
        expected.push(b'T');
        expected.extend_from_slice(&2u64.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_complemented_group_bytes() {
        let bytes = QueryBuilder::with(QueryBuilder::all_tags([7]).group().complement()).encode();
        assert_eq!(bytes[..2], [b'~', b'(']);
        assert_eq!(bytes[2], b'T');
        assert_eq!(*bytes.last().unwrap(), b')');
    }

    #[test]
    fn test_aggregate_bytes() {
        let aggregate = Aggregate::new([1, 2])
            .count(Comparator::GreaterEqual, 3, QueryBuilder::with(Operand::Universe))
            .operand();
        let bytes = QueryBuilder::with(aggregate).encode();

        let mut expected = vec![b'A'];
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(b"C>=");
        expected.extend_from_slice(&3u64.to_be_bytes());
        expected.extend_from_slice(b"U))");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_comparator_bytes_roundtrip() {
        for cmp in [
            Comparator::Less,
            Comparator::LessEqual,
            Comparator::Greater,
            Comparator::GreaterEqual,
        ] {
            assert_eq!(Comparator::from_bytes(cmp.bytes()), Some(cmp));
        }
        assert_eq!(Comparator::from_bytes(*b"=="), None);
    }

    #[test]
    fn test_upper_bound_short_circuit() {
        // size 2 < 3 decides "< 3" without intersecting
        assert_eq!(Comparator::Less.decided_by_upper_bound(2, 3), Some(true));
        assert_eq!(Comparator::Less.decided_by_upper_bound(3, 3), None);
        assert_eq!(Comparator::LessEqual.decided_by_upper_bound(3, 3), Some(true));
        assert_eq!(Comparator::Greater.decided_by_upper_bound(3, 3), Some(false));
        assert_eq!(Comparator::Greater.decided_by_upper_bound(4, 3), None);
        assert_eq!(Comparator::GreaterEqual.decided_by_upper_bound(2, 3), Some(false));
        assert_eq!(Comparator::GreaterEqual.decided_by_upper_bound(3, 3), None);
    }

    #[test]
    fn test_nan_never_compares_true() {
        assert!(!Comparator::Less.compare(f64::NAN, 0.5));
        assert!(!Comparator::GreaterEqual.compare(f64::NAN, 0.5));
    }
}
