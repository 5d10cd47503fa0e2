//! Rules evaluator (C5): a sandboxed boolean-expression DSL with velocity
//! counters and allow/deny list lookups.
//!
//! Pipeline: `scanner` → `parser` (load-time whitelist enforcement) →
//! `set` (whole-document compile + hot reload) → `eval` (pure short-circuit
//! evaluation over a prefetched context).

pub mod eval;
pub mod parser;
pub mod scanner;
pub mod set;
pub mod value;

pub use eval::{RuleContext, Skip, VelocityReading};
pub use parser::{parse, Call, CmpOp, Expr, ParseError, PrefetchPlan};
pub use set::{
    ActiveRules, CompileErrors, CompileFailure, CompiledRuleSet, RuleHit, RulesOutcome,
    SkippedRule,
};
pub use value::Value;
