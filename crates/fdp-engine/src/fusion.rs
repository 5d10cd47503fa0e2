//! Decision fusion: the deterministic combination of the ML score and the
//! rules outcome into a verdict.
//!
//! Pure function over its inputs so every branch is table-testable. Fusion
//! rules apply in order, first match wins:
//!
//! 1. any critical rule hit        → DENY
//! 2. any deny-list hit            → DENY
//! 3. ML absent AND rules absent   → CHALLENGE (fail-safe)
//! 4. threshold ladder on max(ml, rules.score)

use fdp_config::Thresholds;
use fdp_rules::RulesOutcome;
use fdp_schemas::{ListKind, Severity, Verdict};
use fdp_scorer::MlScore;

/// List memberships resolved for the event's own subjects (ip, device, user,
/// card, country). Independent of what the rules reference: fusion consults
/// these even when no rule mentions a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListHits {
    pub deny: Vec<ListKind>,
    pub allow: Vec<ListKind>,
}

impl ListHits {
    pub fn any_deny(&self) -> bool {
        !self.deny.is_empty()
    }

    pub fn any_allow(&self) -> bool {
        !self.allow.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FusionInput<'a> {
    pub ml: Option<&'a MlScore>,
    /// Reason string when the score is absent (`ml_timeout`, `ml_error`,
    /// `ml_circuit_open`).
    pub ml_failure: Option<&'static str>,
    pub rules: &'a RulesOutcome,
    /// All velocity/list reads failed; the outcome carries no signal.
    pub rules_unavailable: bool,
    pub lists: &'a ListHits,
    pub has_initial_2fa: bool,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub verdict: Verdict,
    pub score: f64,
    /// Rule ids in hit order; critical hits first when rule 1 fired.
    pub rule_hits: Vec<String>,
    pub reasons: Vec<String>,
    pub requires_2fa: bool,
    pub degraded: bool,
}

/// Fuse one request's branch results. See module docs for rule order.
pub fn fuse(input: &FusionInput<'_>) -> Fused {
    let ml_score = input.ml.map(|m| m.score);
    let rules = input.rules;
    let degraded = ml_score.is_none() || input.rules_unavailable || rules.velocity_timeout;

    // Effective score: the more pessimistic of the two branches.
    let effective = f64::max(ml_score.unwrap_or(0.0), rules.score);

    // Rule 1: critical severity forces DENY regardless of score.
    if rules.max_severity == Some(Severity::Critical) {
        let (rule_hits, mut reasons) = hits_critical_first(rules);
        append_ml_reasons(&mut reasons, input);
        append_degradation_reasons(&mut reasons, input);
        return Fused {
            verdict: Verdict::Deny,
            score: f64::max(1.0, ml_score.unwrap_or(0.0)).min(1.0),
            rule_hits,
            reasons,
            requires_2fa: false,
            degraded,
        };
    }

    // Rule 2: deny-list membership forces DENY.
    if input.lists.any_deny() {
        let mut reasons: Vec<String> = rules.hits.iter().map(|h| h.name.clone()).collect();
        for kind in &input.lists.deny {
            reasons.push(format!("deny_list_hit:{}", kind.as_str()));
        }
        append_ml_reasons(&mut reasons, input);
        append_degradation_reasons(&mut reasons, input);
        return Fused {
            verdict: Verdict::Deny,
            score: effective,
            rule_hits: rules.hit_ids(),
            reasons,
            requires_2fa: false,
            degraded,
        };
    }

    // Rule 3: both branches gone — fail safe to CHALLENGE.
    if ml_score.is_none() && input.rules_unavailable {
        let mut reasons = vec!["scoring_degraded".to_string()];
        append_degradation_reasons(&mut reasons, input);
        return Fused {
            verdict: Verdict::Challenge,
            score: 0.0,
            rule_hits: Vec::new(),
            reasons,
            requires_2fa: true,
            degraded: true,
        };
    }

    // Rule 4: threshold ladder.
    let verdict = if effective > input.thresholds.high {
        Verdict::Deny
    } else if effective >= input.thresholds.low {
        if input.has_initial_2fa {
            Verdict::Allow
        } else {
            Verdict::Challenge
        }
    } else {
        Verdict::Allow
    };

    let mut reasons: Vec<String> = rules.hits.iter().map(|h| h.name.clone()).collect();
    if verdict == Verdict::Allow && effective < input.thresholds.low && input.lists.any_allow() {
        reasons.push("allow_list_hit".to_string());
    }
    append_ml_reasons(&mut reasons, input);
    append_degradation_reasons(&mut reasons, input);

    Fused {
        verdict,
        score: effective,
        rule_hits: rules.hit_ids(),
        reasons,
        requires_2fa: verdict == Verdict::Challenge,
        degraded,
    }
}

/// Hit ids and reason names with critical hits moved to the front, stable
/// within each group.
fn hits_critical_first(rules: &RulesOutcome) -> (Vec<String>, Vec<String>) {
    let (critical, rest): (Vec<_>, Vec<_>) = rules
        .hits
        .iter()
        .partition(|h| h.severity == Severity::Critical);

    let rule_hits = critical
        .iter()
        .chain(rest.iter())
        .map(|h| h.rule_id.clone())
        .collect();
    let reasons = critical
        .iter()
        .chain(rest.iter())
        .map(|h| h.name.clone())
        .collect();
    (rule_hits, reasons)
}

/// Up to three top-weight ML feature explanations.
fn append_ml_reasons(reasons: &mut Vec<String>, input: &FusionInput<'_>) {
    if let Some(ml) = input.ml {
        for fw in ml.top_features.iter().take(3) {
            reasons.push(format!("ml:{}", fw.name));
        }
    }
}

fn append_degradation_reasons(reasons: &mut Vec<String>, input: &FusionInput<'_>) {
    if input.ml.is_none() {
        reasons.push("ml_degraded".to_string());
        if let Some(specific) = input.ml_failure {
            reasons.push(specific.to_string());
        }
    }
    if input.rules_unavailable {
        reasons.push("rules_degraded".to_string());
    }
    if input.rules.velocity_timeout {
        reasons.push("velocity_timeout".to_string());
    }
}
