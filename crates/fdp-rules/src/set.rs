//! Compiled rule sets and the hot-reload handle.
//!
//! A rule document compiles as a whole or not at all: one bad condition
//! rejects the entire set and the active set stays untouched. Compiled ASTs
//! are held behind an `ArcSwap`, so readers never lock and in-flight
//! evaluations keep the set they started with.

use crate::eval::{eval_condition, RuleContext, Skip};
use crate::parser::{parse, PrefetchPlan};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use fdp_config::VelocityRegistry;
use fdp_schemas::{ActionHint, Rule, RuleSetDoc, Severity};
use serde::Serialize;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Compile errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileFailure {
    pub rule_id: String,
    pub message: String,
}

/// All failures in a rejected document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors {
    pub failures: Vec<CompileFailure>,
}

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule set rejected ({} bad rules):", self.failures.len())?;
        for fail in &self.failures {
            write!(f, " [{}] {};", fail.rule_id, fail.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

// ---------------------------------------------------------------------------
// Compiled set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    expr: crate::parser::Expr,
}

#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    /// Stable evaluation order: priority ascending, then rule_id.
    rules: Vec<CompiledRule>,
    /// Union of I/O the enabled rules can touch.
    pub plan: PrefetchPlan,
    pub loaded_at: DateTime<Utc>,
}

impl CompiledRuleSet {
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            plan: PrefetchPlan::default(),
            loaded_at: Utc::now(),
        }
    }

    /// Compile a whole document. Every rule must parse (enabled or not) and
    /// every velocity field must be declared in the registry; otherwise the
    /// document is rejected whole.
    pub fn compile(doc: &RuleSetDoc, registry: &VelocityRegistry) -> Result<Self, CompileErrors> {
        let mut failures = Vec::new();
        let mut compiled = Vec::with_capacity(doc.rules.len());

        for rule in &doc.rules {
            if !(0.0..=1.0).contains(&rule.score) {
                failures.push(CompileFailure {
                    rule_id: rule.rule_id.clone(),
                    message: format!("score {} outside [0, 1]", rule.score),
                });
                continue;
            }
            match parse(&rule.condition) {
                Ok(expr) => {
                    let mut rule_plan = PrefetchPlan::default();
                    rule_plan.collect(&expr);
                    let unknown: Vec<_> = rule_plan
                        .velocity
                        .iter()
                        .filter(|(_, field)| registry.kind_of(field).is_none())
                        .map(|(_, field)| field.clone())
                        .collect();
                    if !unknown.is_empty() {
                        failures.push(CompileFailure {
                            rule_id: rule.rule_id.clone(),
                            message: format!(
                                "velocity fields not declared in registry: {}",
                                unknown.join(", ")
                            ),
                        });
                        continue;
                    }
                    compiled.push(CompiledRule {
                        rule: rule.clone(),
                        expr,
                    });
                }
                Err(e) => failures.push(CompileFailure {
                    rule_id: rule.rule_id.clone(),
                    message: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            return Err(CompileErrors { failures });
        }

        compiled.sort_by(|a, b| {
            (a.rule.priority, a.rule.rule_id.as_str())
                .cmp(&(b.rule.priority, b.rule.rule_id.as_str()))
        });

        let mut plan = PrefetchPlan::default();
        for cr in compiled.iter().filter(|cr| cr.rule.enabled) {
            plan.collect(&cr.expr);
        }

        Ok(Self {
            rules: compiled,
            plan,
            loaded_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|cr| &cr.rule)
    }

    /// Evaluate every enabled rule against the resolved context.
    ///
    /// Evaluation continues through ALL rules: the score is the max across
    /// triggered rules, and hits keep the stable (priority, rule_id) order.
    pub fn evaluate(&self, ctx: &RuleContext) -> RulesOutcome {
        let mut outcome = RulesOutcome::default();

        for cr in &self.rules {
            if !cr.rule.enabled {
                continue;
            }
            let (res, flags) = eval_condition(&cr.expr, ctx);
            if flags.velocity_timeout {
                outcome.velocity_timeout = true;
            }
            match res {
                Ok(true) => outcome.hits.push(RuleHit {
                    rule_id: cr.rule.rule_id.clone(),
                    name: cr.rule.human_name().to_string(),
                    score: cr.rule.score,
                    severity: cr.rule.severity,
                    action_hint: cr.rule.action_hint,
                    velocity_timeout: flags.velocity_timeout,
                }),
                Ok(false) => {}
                Err(skip) => {
                    let reason = match &skip {
                        Skip::MissingIdent(_) => "missing_identifier",
                        Skip::TypeMismatch(_) => "type_mismatch",
                    };
                    tracing::warn!(rule_id = %cr.rule.rule_id, %skip, "rule skipped");
                    outcome.skipped.push(SkippedRule {
                        rule_id: cr.rule.rule_id.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        outcome.score = outcome
            .hits
            .iter()
            .map(|h| h.score)
            .fold(0.0_f64, f64::max);
        outcome.max_severity = outcome.hits.iter().map(|h| h.severity).max();
        outcome.hint = outcome
            .hits
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|h| h.action_hint);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Evaluation outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleHit {
    pub rule_id: String,
    /// Human-readable name used in decision reasons.
    pub name: String,
    pub score: f64,
    pub severity: Severity,
    pub action_hint: ActionHint,
    /// This rule read a velocity counter that timed out.
    pub velocity_timeout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRule {
    pub rule_id: String,
    pub reason: String,
}

/// `{score, hits[], max_severity, hint}` handed to the fuser.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RulesOutcome {
    /// Max score across triggered rules; 0 when nothing triggered.
    pub score: f64,
    /// Stable by (priority, rule_id).
    pub hits: Vec<RuleHit>,
    pub max_severity: Option<Severity>,
    /// Hint of the highest-scoring hit.
    pub hint: Option<ActionHint>,
    pub skipped: Vec<SkippedRule>,
    pub velocity_timeout: bool,
}

impl RulesOutcome {
    pub fn has_critical(&self) -> bool {
        self.max_severity == Some(Severity::Critical)
    }

    /// Rule ids in hit order.
    pub fn hit_ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.rule_id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Hot reload handle
// ---------------------------------------------------------------------------

/// Process-wide active rule set. Readers `load()` (lock-free); reload
/// `swap()`s the whole bundle atomically.
pub struct ActiveRules {
    inner: ArcSwap<CompiledRuleSet>,
}

impl ActiveRules {
    pub fn new(set: CompiledRuleSet) -> Self {
        Self {
            inner: ArcSwap::from_pointee(set),
        }
    }

    pub fn load(&self) -> Arc<CompiledRuleSet> {
        self.inner.load_full()
    }

    pub fn swap(&self, set: CompiledRuleSet) {
        let count = set.len();
        self.inner.store(Arc::new(set));
        tracing::info!(rules = count, "active rule set swapped");
    }
}

impl Default for ActiveRules {
    fn default() -> Self {
        Self::new(CompiledRuleSet::empty())
    }
}
