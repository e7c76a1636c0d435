//! Search evaluator
//!
//! Recursive descent over the byte form described in `query::ops`,
//! evaluated left to right against a running `SetEvaluation` seeded
//! with the taggable universe.

use crate::codec::{ByteReader, Truncated};
use crate::error::{Result, StoreError};
use crate::relation::{IdPairSecond, IdSet};

use super::ops::*;
use super::set_eval::SetEvaluation;

/// Nesting limit for groups and clause sub-expressions.
pub const MAX_DEPTH: usize = 128;

/// Tag → taggable lookup used while evaluating.
pub trait RelationLookup {
    fn first_contents(&self, first: u64) -> Option<&IdPairSecond>;
}

pub struct Evaluator<'a> {
    relations: &'a dyn RelationLookup,
    universe: &'a IdSet,
    reader: ByteReader<'a>,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(relations: &'a dyn RelationLookup, universe: &'a IdSet, query: &'a [u8]) -> Self {
        Evaluator {
            relations,
            universe,
            reader: ByteReader::new(query),
            depth: 0,
        }
    }

    /// Evaluate the whole input as one expression.
    pub fn evaluate(mut self) -> Result<SetEvaluation<'a>> {
        self.expression(false)
    }

    fn error(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Query {
            offset: self.reader.offset(),
            reason: reason.into(),
        }
    }

    fn truncated(t: Truncated) -> StoreError {
        StoreError::Query {
            offset: t.offset,
            reason: format!("query ends early, {} more bytes needed", t.needed),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.reader.read_u8().map_err(Self::truncated)
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.reader.read_u64().map_err(Self::truncated)
    }

    fn read_f32(&mut self) -> Result<f32> {
        self.reader.read_f32().map_err(Self::truncated)
    }

    fn read_comparator(&mut self) -> Result<Comparator> {
        let bytes = self.reader.read_pair().map_err(Self::truncated)?;
        Comparator::from_bytes(bytes).ok_or_else(|| {
            self.error(format!(
                "unknown comparator {:?}",
                String::from_utf8_lossy(&bytes)
            ))
        })
    }

    /// `op operand` pairs until the end of input, or until `)` when
    /// `closed` is set.
    fn expression(&mut self, closed: bool) -> Result<SetEvaluation<'a>> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }

        let mut context = SetEvaluation::universe(self.universe);
        let mut first = true;
        loop {
            let op = match self.reader.peek_u8() {
                None if closed => return Err(self.error("missing ')'")),
                None => break,
                Some(GROUP_CLOSE) if closed => {
                    self.reader.read_u8().map_err(Self::truncated)?;
                    break;
                }
                Some(GROUP_CLOSE) => return Err(self.error("unmatched ')'")),
                Some(byte) => match SetOp::from_byte(byte) {
                    Some(_) if first => return Err(self.error("operator before the first operand")),
                    Some(op) => {
                        self.read_u8()?;
                        op
                    }
                    None if first => SetOp::RightHandSide,
                    None => {
                        return Err(self.error(format!("expected set operator, found 0x{byte:02x}")))
                    }
                },
            };
            first = false;
            let operand = self.operand()?;
            context = op.apply(context, operand);
        }

        self.depth -= 1;
        Ok(context)
    }

    fn operand(&mut self) -> Result<SetEvaluation<'a>> {
        let mut complement = false;
        while self.reader.eat(COMPLEMENT) {
            complement = !complement;
        }

        let start = self.reader.offset();
        let value = match self.read_u8()? {
            OPERAND_TAG => {
                let tag = self.read_u64()?;
                self.tag_members(tag)
            }
            OPERAND_LIST => {
                let count = self.read_u64()?;
                let mut ids = IdSet::new();
                for _ in 0..count {
                    let id = self.read_u64()?;
                    if self.universe.contains(&id) {
                        ids.insert(id);
                    }
                }
                SetEvaluation::owned(self.universe, ids, false)
            }
            GROUP_OPEN => self.expression(true)?,
            OPERAND_UNIVERSE => SetEvaluation::universe(self.universe),
            OPERAND_EMPTY => SetEvaluation::empty(self.universe),
            OPERAND_AGGREGATE => self.aggregate()?,
            other => {
                return Err(StoreError::Query {
                    offset: start,
                    reason: format!("unknown operand 0x{other:02x}"),
                })
            }
        };
        Ok(if complement { value.complement() } else { value })
    }

    fn tag_members(&self, tag: u64) -> SetEvaluation<'a> {
        match self.relations.first_contents(tag) {
            Some(second) => {
                SetEvaluation::borrowed(self.universe, second.physical(), second.is_complement())
            }
            None => SetEvaluation::empty(self.universe),
        }
    }

    /// `A n tag*n clause* )`: drop tags failing any clause, then union
    /// what is left.
    fn aggregate(&mut self) -> Result<SetEvaluation<'a>> {
        let count = self.read_u64()?;
        let mut tags = Vec::new();
        for _ in 0..count {
            tags.push(self.read_u64()?);
        }

        loop {
            let start = self.reader.offset();
            match self.read_u8()? {
                GROUP_CLOSE => break,
                CLAUSE_COUNT => {
                    let cmp = self.read_comparator()?;
                    let n = self.read_u64()?;
                    let expr = self.expression(true)?;
                    tags.retain(|&tag| self.count_passes(tag, cmp, n, &expr));
                }
                CLAUSE_PERCENTAGE => {
                    let cmp = self.read_comparator()?;
                    let ratio = self.read_f32()?;
                    let expr = self.expression(true)?;
                    tags.retain(|&tag| {
                        let members = self.tag_members(tag);
                        percentage_passes(members, cmp, ratio, &expr)
                    });
                }
                CLAUSE_FILTERED_PERCENTAGE => {
                    let cmp = self.read_comparator()?;
                    let ratio = self.read_f32()?;
                    let filter = self.expression(true)?;
                    let expr = self.expression(true)?;
                    tags.retain(|&tag| {
                        let filtered = filter.view().intersect(self.tag_members(tag));
                        percentage_passes(filtered, cmp, ratio, &expr)
                    });
                }
                other => {
                    return Err(StoreError::Query {
                        offset: start,
                        reason: format!("unknown aggregate clause 0x{other:02x}"),
                    })
                }
            }
        }

        Ok(tags
            .into_iter()
            .fold(SetEvaluation::empty(self.universe), |acc, tag| {
                acc.union(self.tag_members(tag))
            }))
    }

    fn count_passes(&self, tag: u64, cmp: Comparator, n: u64, expr: &SetEvaluation<'a>) -> bool {
        let members = self.tag_members(tag);
        if let Some(decided) = cmp.decided_by_upper_bound(members.len() as u64, n) {
            return decided;
        }
        let matched = members.intersect(expr.view()).len() as u64;
        cmp.compare(matched, n)
    }
}

/// `|base ∩ expr| / |base| <cmp> ratio`. An empty base never passes.
fn percentage_passes(base: SetEvaluation<'_>, cmp: Comparator, ratio: f32, expr: &SetEvaluation<'_>) -> bool {
    let total = base.len();
    let matched = base.intersect(expr.view()).len();
    let share = matched as f64 / total as f64;
    cmp.compare(share, f64::from(ratio))
}

/// Evaluate `query` against the tag → taggable relation.
pub fn search<'a>(
    relations: &'a dyn RelationLookup,
    universe: &'a IdSet,
    query: &'a [u8],
) -> Result<SetEvaluation<'a>> {
    Evaluator::new(relations, universe, query).evaluate()
}
