//! Search queries: set algebra, wire format and evaluator.

pub mod ops;
pub mod search;
pub mod set_eval;

pub use ops::{Aggregate, Clause, Comparator, Operand, QueryBuilder, SetOp};
pub use search::{search, Evaluator, RelationLookup};
pub use set_eval::SetEvaluation;
