//! The decision orchestrator (C6).
//!
//! `score` is the single choke-point for every scoring request. Steps are
//! strictly ordered: validate → idempotency reserve → durable event write →
//! concurrent fan-out (scorer ∥ rules) → fuse → decision write + publish →
//! velocity update → idempotency finalize. Degradations never cascade: each
//! failed collaborator collapses to a reason on the decision.

use crate::error::ScoreError;
use crate::fusion::{fuse, FusionInput, ListHits};
use crate::metrics::EngineMetrics;
use chrono::Utc;
use fdp_config::{PlatformConfig, VelocityKind, WINDOW_1H_SECS, WINDOW_24H_SECS};
use fdp_db::DecisionRepo;
use fdp_kv::{CounterStore, Finalized, IdempotencyStore, ListStore, Reservation};
use fdp_publisher::Publisher;
use fdp_rules::{ActiveRules, CompiledRuleSet, RuleContext, RulesOutcome, VelocityReading};
use fdp_schemas::{Decision, DecisionEnvelope, ListKind, ListType, TransactionEvent};
use fdp_schemas::validate::validate_event;
use fdp_scorer::{FeatureVector, MlScore, Scorer, ScorerFailure};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Collaborator handles. Everything is a trait object so the daemon wires
/// Redis/Postgres/HTTP and the tests wire the in-memory twins.
pub struct EngineDeps {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub counters: Arc<dyn CounterStore>,
    pub lists: Arc<dyn ListStore>,
    pub repo: Arc<dyn DecisionRepo>,
    pub scorer: Arc<dyn Scorer>,
    pub rules: Arc<ActiveRules>,
    pub publisher: Arc<Publisher>,
}

pub struct DecisionEngine {
    deps: EngineDeps,
    cfg: Arc<PlatformConfig>,
    metrics: EngineMetrics,
}

/// Per-component readiness, surfaced by GET /v1/ready.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Readiness {
    pub kv: bool,
    pub db: bool,
    pub scorer: bool,
    pub rules: bool,
}

impl Readiness {
    pub fn all(&self) -> bool {
        self.kv && self.db && self.scorer && self.rules
    }
}

impl DecisionEngine {
    pub fn new(deps: EngineDeps, cfg: Arc<PlatformConfig>, metrics: EngineMetrics) -> Self {
        Self { deps, cfg, metrics }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn rules(&self) -> &ActiveRules {
        &self.deps.rules
    }

    pub fn publisher(&self) -> &Publisher {
        &self.deps.publisher
    }

    pub async fn readiness(&self) -> Readiness {
        Readiness {
            kv: self.deps.idempotency.ready().await,
            db: self.deps.repo.ready().await,
            scorer: self.deps.scorer.ready().await,
            rules: true, // process-local; an empty set is still a valid set
        }
    }

    // -----------------------------------------------------------------------
    // score: the 8-step request flow
    // -----------------------------------------------------------------------

    pub async fn score(&self, event: TransactionEvent) -> Result<Decision, ScoreError> {
        let started = Instant::now();
        self.metrics.requests_total.inc();

        // 1. Validate before any side effect.
        if let Err(e) = validate_event(&event) {
            self.metrics.error("invalid_request");
            return Err(ScoreError::InvalidRequest(e));
        }

        let ttl = Duration::from_secs(self.cfg.idempotency_ttl_secs);
        let scope = event.idempotency_scope();

        // 2. Idempotency reserve. Unreachable store degrades to fail-open.
        let reservation = match timeout(
            self.cfg.deadlines.kv_op(),
            self.deps.idempotency.reserve(&scope, ttl),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Reservation::Unavailable,
        };

        let mut reserved = false;
        match reservation {
            Reservation::Existing(prior_id) => {
                if let Some(prior) = self.load_canonical(prior_id, &event.event_id).await {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.metrics.idempotent_replays_total.inc();
                    self.observe(&prior, started);
                    // Same decision, this call's latency.
                    return Ok(Decision {
                        latency_ms,
                        ..prior
                    });
                }
                // Record exists but the audit row is gone: rescore.
                tracing::warn!(%scope, "idempotency record without decision row; rescoring");
                reserved = true;
            }
            Reservation::Fresh => reserved = true,
            Reservation::Unavailable => {
                self.metrics.error("idempotency_unavailable");
                tracing::warn!(%scope, "idempotency store unavailable; failing open");
            }
        }

        // 3. Event write before any external scoring call: audit is durable
        //    even when the rest of the flow degrades.
        if let Err(e) = self.deps.repo.insert_event(&event).await {
            self.metrics.error("persistence_event");
            return Err(ScoreError::Persistence(e.to_string()));
        }

        // 4. Fan-out: scorer ∥ rules, joined under one barrier deadline.
        let remaining = self
            .cfg
            .deadlines
            .total()
            .saturating_sub(started.elapsed());
        let fanout_budget = remaining.min(self.cfg.deadlines.fanout_cap());

        let ml_deadline = self.cfg.deadlines.ml().min(fanout_budget).max(Duration::from_millis(1));
        let rules_deadline = self
            .cfg
            .deadlines
            .rules()
            .min(fanout_budget)
            .max(Duration::from_millis(1));

        let features = FeatureVector::project(&event);
        let ml_branch = async {
            match timeout(ml_deadline, self.deps.scorer.predict(&features, ml_deadline)).await {
                Ok(res) => res,
                Err(_) => Err(ScorerFailure::Timeout),
            }
        };

        let rule_set = self.deps.rules.load();
        let rules_branch = async {
            match timeout(rules_deadline, self.evaluate_rules(&event, &rule_set)).await {
                Ok(r) => r,
                Err(_) => RulesBranch {
                    outcome: RulesOutcome::default(),
                    lists: ListHits::default(),
                    unavailable: true,
                },
            }
        };

        let (ml_result, rules_result) = tokio::join!(ml_branch, rules_branch);

        let (ml, ml_failure): (Option<MlScore>, Option<&'static str>) = match ml_result {
            Ok(score) => (Some(score), None),
            Err(f) => {
                self.metrics.error("ml_degraded");
                (None, Some(f.reason()))
            }
        };
        if rules_result.unavailable {
            self.metrics.error("rules_degraded");
        }

        // 5. Fuse — pure over the branch results.
        let fused = fuse(&FusionInput {
            ml: ml.as_ref(),
            ml_failure,
            rules: &rules_result.outcome,
            rules_unavailable: rules_result.unavailable,
            lists: &rules_result.lists,
            has_initial_2fa: event.has_initial_2fa.unwrap_or(false),
            thresholds: self.cfg.thresholds,
        });

        let over_budget = started.elapsed() > self.cfg.deadlines.total();
        if over_budget {
            self.metrics.error("budget_exceeded");
        }

        let decision = Decision {
            decision_id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            tenant_id: event.tenant_id.clone(),
            verdict: fused.verdict,
            score: fused.score,
            model_version: ml
                .as_ref()
                .map(|m| m.model_version.clone())
                .unwrap_or_else(|| "unavailable".to_string()),
            rule_hits: fused.rule_hits,
            reasons: fused.reasons,
            latency_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
            requires_2fa: fused.requires_2fa,
            degraded: fused.degraded || over_budget,
        };

        // 6. Decision write + publish before responding. A failed write does
        //    not fail the response: the in-memory decision is returned and a
        //    repair write queued.
        if let Err(e) = self.deps.repo.insert_decision(&decision).await {
            self.metrics.error("persistence_decision");
            tracing::warn!(decision_id = %decision.decision_id, error = %e, "decision write failed; repair queued");
            self.spawn_repair(decision.clone());
        }
        if let Err(e) = self.deps.publisher.enqueue(&DecisionEnvelope::from(&decision)) {
            self.metrics.error("publish");
            tracing::warn!(decision_id = %decision.decision_id, error = %e, "publish enqueue failed");
        }

        // 7. Velocity counters advance only here, post-decision and off the
        //    critical path.
        self.spawn_velocity_update(&event);

        // 8. Finalize: CAS the sentinel to the real id. A lost race adopts
        //    the canonical decision.
        if reserved {
            match self
                .deps
                .idempotency
                .finalize(&scope, decision.decision_id, ttl)
                .await
            {
                Finalized::Canonical(winner) if winner != decision.decision_id => {
                    if let Some(canonical) = self.load_canonical(winner, &event.event_id).await {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        self.observe(&canonical, started);
                        return Ok(Decision {
                            latency_ms,
                            ..canonical
                        });
                    }
                }
                Finalized::Canonical(_) => {}
                Finalized::Unavailable => self.metrics.error("idempotency_unavailable"),
            }
        }

        self.observe(&decision, started);
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Rules branch: prefetch + pure evaluation
    // -----------------------------------------------------------------------

    async fn evaluate_rules(&self, event: &TransactionEvent, set: &CompiledRuleSet) -> RulesBranch {
        let mut ctx = RuleContext::from_event(event);
        let now = Utc::now();
        let mut reads = 0usize;
        let mut failed = 0usize;

        // List membership for the event's own subjects, both list types.
        // Fusion consults these even when no rule references a list.
        let mut lists = ListHits::default();
        for list_type in [ListType::Deny, ListType::Allow] {
            for kind in ListKind::ALL {
                let Some(value) = list_subject(event, kind) else {
                    continue;
                };
                reads += 1;
                let member = match timeout(
                    self.cfg.deadlines.kv_op(),
                    self.deps.lists.is_member(list_type, kind, value, now),
                )
                .await
                {
                    Ok(Ok(m)) => m,
                    Ok(Err(_)) | Err(_) => {
                        failed += 1;
                        false
                    }
                };
                ctx.set_membership(list_type, kind, member);
                if member {
                    match list_type {
                        ListType::Deny => lists.deny.push(kind),
                        ListType::Allow => lists.allow.push(kind),
                    }
                }
            }
        }

        // Velocity reads per the compiled prefetch plan. Card-centric: the
        // counters a rule sees are the card subject's. The in-flight event is
        // part of its own window (a card's third transaction reads a count of
        // 3), even though the durable counter only advances post-decision.
        let card_subject = format!("card:{}", event.card.card_id);
        for (window_secs, field) in &set.plan.velocity {
            reads += 1;
            let kind = self
                .cfg
                .velocity
                .kind_of(field)
                .unwrap_or(VelocityKind::Count);
            let own_delta = match kind {
                VelocityKind::Sum => event.amount,
                VelocityKind::Count => 1.0,
            };
            let reading = match timeout(
                self.cfg.deadlines.velocity_read(),
                self.deps
                    .counters
                    .read(&card_subject, field, *window_secs, kind, now),
            )
            .await
            {
                Ok(Ok(v)) => VelocityReading::Value(v + own_delta),
                Ok(Err(_)) | Err(_) => {
                    failed += 1;
                    VelocityReading::TimedOut
                }
            };
            ctx.set_velocity(*window_secs, field.clone(), reading);
        }

        let unavailable = reads > 0 && failed == reads;
        let outcome = set.evaluate(&ctx);

        RulesBranch {
            outcome,
            lists,
            unavailable,
        }
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Retry a failed decision write until it lands or attempts run out.
    fn spawn_repair(&self, decision: Decision) {
        let repo = Arc::clone(&self.deps.repo);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut wait = Duration::from_millis(100);
            for attempt in 1..=5u32 {
                tokio::time::sleep(wait).await;
                match repo.insert_decision(&decision).await {
                    Ok(()) => {
                        tracing::info!(decision_id = %decision.decision_id, attempt, "repair write landed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(decision_id = %decision.decision_id, attempt, error = %e, "repair write failed");
                        metrics.error("persistence_decision");
                    }
                }
                wait = (wait * 2).min(Duration::from_secs(5));
            }
            tracing::error!(decision_id = %decision.decision_id, "repair write abandoned");
        });
    }

    /// Advance the sliding-window counters for both subjects and all
    /// registered fields, across both windows.
    fn spawn_velocity_update(&self, event: &TransactionEvent) {
        let counters = Arc::clone(&self.deps.counters);
        let metrics = self.metrics.clone();
        let registry = self.cfg.velocity.clone();
        let at = event.timestamp;
        let amount = event.amount;
        let subjects = [
            format!("card:{}", event.card.card_id),
            format!("user:{}", event.card.user_id),
        ];

        tokio::spawn(async move {
            for (field, kind) in registry.fields() {
                let delta = match kind {
                    VelocityKind::Sum => amount,
                    VelocityKind::Count => 1.0,
                };
                for subject in &subjects {
                    for window in [WINDOW_1H_SECS, WINDOW_24H_SECS] {
                        if let Err(e) = counters.record(subject, field, window, at, delta).await {
                            metrics.error("velocity_update");
                            tracing::warn!(subject = %subject, field, window, error = %e, "velocity update failed");
                        }
                    }
                }
            }
        });
    }

    /// Canonical decision for a finalized key: by id first, then by event —
    /// the id's row can be the discarded side of a duplicate-request race.
    async fn load_canonical(&self, decision_id: Uuid, event_id: &str) -> Option<Decision> {
        match self.deps.repo.get_decision(decision_id).await {
            Ok(Some(found)) => return Some(found),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%decision_id, error = %e, "prior decision load failed");
                return None;
            }
        }
        match self.deps.repo.get_decision_by_event(event_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "prior decision load by event failed");
                None
            }
        }
    }

    fn observe(&self, decision: &Decision, started: Instant) {
        self.metrics
            .decisions_total
            .with_label_values(&[decision.verdict.as_str()])
            .inc();
        self.metrics
            .latency_seconds
            .observe(started.elapsed().as_secs_f64());
    }
}

struct RulesBranch {
    outcome: RulesOutcome,
    lists: ListHits,
    unavailable: bool,
}

/// The event field a list kind matches against.
fn list_subject(event: &TransactionEvent, kind: ListKind) -> Option<&str> {
    match kind {
        ListKind::Ip => event.context.ip.as_deref(),
        ListKind::Device => event.context.device_id.as_deref(),
        ListKind::User => Some(&event.card.user_id),
        ListKind::Card => Some(&event.card.card_id),
        ListKind::Country => Some(&event.merchant.country),
    }
}
