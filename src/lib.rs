//! Treequery: pattern matching over dependency-annotated corpora
//!
//! Compiles a textual pattern describing a fragment of a dependency tree
//! (word-level attributes, dominance/transitive/precedence relations,
//! negation, disjunction) into an executable matcher plan, then runs that
//! plan against per-sentence dependency structures to decide, for each
//! sentence, whether the pattern occurs.
//!
//! Pipeline: query text -> [`parser`] -> pattern graph -> [`compiler`]
//! (consulting the constraint [`registry`]) -> matcher plan. Separately,
//! each corpus sentence -> [`target`] tree. The [`search`] orchestrator
//! drives plan x tree through the [`engine`] and collects hit indices.

pub mod compiler; // Pattern graph lowering to matcher plans
pub mod constraint; // Operators and raw constraints
pub mod corpus; // Sentence record capability
pub mod engine; // Backtracking plan execution
pub mod graph; // Pattern graph model
pub mod parser; // Query language parser and serializer
pub mod registry; // Constraint token registry
pub mod search; // Corpus scan orchestration
pub mod target; // Per-sentence target trees

// Re-exports for convenience
pub use compiler::{CompileError, MatcherPlan, compile};
pub use constraint::{IntOp, RawConstraint, SearchOp, Value};
pub use corpus::{HEAD_ROOT, HEAD_UNDEFINED, Sentence, SentenceRecord};
pub use engine::{Engine, MatchBinding};
pub use graph::{EdgeType, NodeType, PatternGraph, RootOp};
pub use parser::{ParseError, QueryParser};
pub use registry::{CompiledConstraint, ConstraintFactory, ConstraintKind, ConstraintRegistry};
pub use search::{Orientation, Search, SearchError, SearchMode, SearchOptions, SearchState};
pub use target::TargetTree;
