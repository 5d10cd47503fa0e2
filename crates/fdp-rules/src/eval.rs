//! Short-circuit evaluation of compiled conditions over a resolved context.
//!
//! Evaluation is pure and CPU-bounded: every velocity read and list lookup
//! was prefetched by the orchestrator according to the set's `PrefetchPlan`.
//! A rule that touches anything unresolvable is skipped, never failed.

use crate::parser::{Call, CmpOp, Expr};
use crate::value::Value;
use fdp_schemas::{ListKind, ListType, TransactionEvent};
use std::collections::BTreeMap;

/// Result of one prefetched velocity read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VelocityReading {
    Value(f64),
    /// Read missed the hard timeout: evaluates as 0 and annotates the rule.
    TimedOut,
}

/// Fully resolved evaluation context: primitive event fields plus the
/// prefetched velocity readings and list membership answers.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    vars: BTreeMap<String, Value>,
    velocity: BTreeMap<(u64, String), VelocityReading>,
    memberships: BTreeMap<(ListType, ListKind), bool>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard variable mapping for an event. Optional fields that are
    /// absent map to `Missing`, which skips any rule that touches them.
    pub fn from_event(event: &TransactionEvent) -> Self {
        use chrono::{Datelike, Timelike};

        let mut ctx = Self::new();
        let hour = event.timestamp.hour();
        let dow = event.timestamp.weekday().num_days_from_monday();

        let is_international = match event.context.geo.as_deref() {
            Some(geo) => !geo.eq_ignore_ascii_case(&event.merchant.country),
            None => false,
        };

        ctx.set_var("amount", Value::Num(event.amount));
        ctx.set_var("currency", Value::Str(event.currency.clone()));
        ctx.set_var("mcc", Value::Str(event.merchant.mcc.clone()));
        ctx.set_var("merchant_id", Value::Str(event.merchant.id.clone()));
        ctx.set_var(
            "merchant_country",
            Value::Str(event.merchant.country.clone()),
        );
        ctx.set_var("card_id", Value::Str(event.card.card_id.clone()));
        ctx.set_var("user_id", Value::Str(event.card.user_id.clone()));
        ctx.set_var(
            "card_type",
            Value::Str(
                match event.card.card_type {
                    fdp_schemas::CardType::Physical => "physical",
                    fdp_schemas::CardType::Virtual => "virtual",
                }
                .to_string(),
            ),
        );
        ctx.set_var(
            "channel",
            Value::Str(
                match event.context.channel {
                    fdp_schemas::Channel::App => "app",
                    fdp_schemas::Channel::Web => "web",
                    fdp_schemas::Channel::Pos => "pos",
                    fdp_schemas::Channel::Atm => "atm",
                }
                .to_string(),
            ),
        );
        ctx.set_var(
            "auth_method",
            Value::Str(event.security.auth_method.as_str().to_string()),
        );
        ctx.set_var("aml_flag", Value::Bool(event.security.aml_flag));
        ctx.set_var("hour", Value::Num(hour as f64));
        ctx.set_var("day_of_week", Value::Num(dow as f64));
        ctx.set_var("is_night", Value::Bool(hour < 6 || hour >= 22));
        ctx.set_var("is_weekend", Value::Bool(dow >= 5));
        ctx.set_var("is_international", Value::Bool(is_international));

        ctx.set_var("ip", opt_str(event.context.ip.as_deref()));
        ctx.set_var("geo", opt_str(event.context.geo.as_deref()));
        ctx.set_var("device_id", opt_str(event.context.device_id.as_deref()));
        ctx.set_var(
            "has_device_id",
            Value::Bool(event.context.device_id.is_some()),
        );
        ctx.set_var(
            "has_initial_2fa",
            match event.has_initial_2fa {
                Some(b) => Value::Bool(b),
                None => Value::Missing,
            },
        );

        ctx
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn set_velocity(&mut self, window_secs: u64, field: impl Into<String>, r: VelocityReading) {
        self.velocity.insert((window_secs, field.into()), r);
    }

    pub fn set_membership(&mut self, list_type: ListType, kind: ListKind, member: bool) {
        self.memberships.insert((list_type, kind), member);
    }

    pub fn membership(&self, list_type: ListType, kind: ListKind) -> bool {
        self.memberships
            .get(&(list_type, kind))
            .copied()
            .unwrap_or(false)
    }
}

fn opt_str(v: Option<&str>) -> Value {
    match v {
        Some(s) => Value::Str(s.to_string()),
        None => Value::Missing,
    }
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

/// Why a single rule was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    MissingIdent(String),
    TypeMismatch(String),
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Skip::MissingIdent(name) => write!(f, "identifier {name:?} is missing"),
            Skip::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
        }
    }
}

/// Per-rule evaluation annotations.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalFlags {
    pub velocity_timeout: bool,
}

/// Evaluate one condition to its boolean outcome.
pub fn eval_condition(expr: &Expr, ctx: &RuleContext) -> (Result<bool, Skip>, EvalFlags) {
    let mut flags = EvalFlags::default();
    let res = match eval_expr(expr, ctx, &mut flags) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(other) => Err(Skip::TypeMismatch(format!(
            "condition evaluates to {}, expected bool",
            other.type_name()
        ))),
        Err(skip) => Err(skip),
    };
    (res, flags)
}

fn eval_expr(expr: &Expr, ctx: &RuleContext, flags: &mut EvalFlags) -> Result<Value, Skip> {
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::ListLit(items) => {
            let mut vals = Vec::with_capacity(items.len());
            for item in items {
                vals.push(eval_expr(item, ctx, flags)?);
            }
            Ok(Value::List(vals))
        }
        Expr::Ident(name) => match ctx.vars.get(name) {
            Some(v) if !v.is_missing() => Ok(v.clone()),
            _ => Err(Skip::MissingIdent(name.clone())),
        },
        Expr::Not(inner) => {
            let v = eval_expr(inner, ctx, flags)?;
            match v.as_bool() {
                Some(b) => Ok(Value::Bool(!b)),
                None => Err(Skip::TypeMismatch(format!(
                    "NOT applied to {}",
                    v.type_name()
                ))),
            }
        }
        Expr::And(l, r) => {
            let lv = eval_expr(l, ctx, flags)?;
            match lv.as_bool() {
                // Short-circuit: the right side is not evaluated.
                Some(false) => Ok(Value::Bool(false)),
                Some(true) => {
                    let rv = eval_expr(r, ctx, flags)?;
                    rv.as_bool().map(Value::Bool).ok_or_else(|| {
                        Skip::TypeMismatch(format!("AND right side is {}", rv.type_name()))
                    })
                }
                None => Err(Skip::TypeMismatch(format!(
                    "AND left side is {}",
                    lv.type_name()
                ))),
            }
        }
        Expr::Or(l, r) => {
            let lv = eval_expr(l, ctx, flags)?;
            match lv.as_bool() {
                Some(true) => Ok(Value::Bool(true)),
                Some(false) => {
                    let rv = eval_expr(r, ctx, flags)?;
                    rv.as_bool().map(Value::Bool).ok_or_else(|| {
                        Skip::TypeMismatch(format!("OR right side is {}", rv.type_name()))
                    })
                }
                None => Err(Skip::TypeMismatch(format!(
                    "OR left side is {}",
                    lv.type_name()
                ))),
            }
        }
        Expr::Cmp(op, l, r) => {
            let lv = eval_expr(l, ctx, flags)?;
            let rv = eval_expr(r, ctx, flags)?;
            eval_cmp(*op, &lv, &rv).map(Value::Bool)
        }
        Expr::InList(l, items) => {
            let lv = eval_expr(l, ctx, flags)?;
            let mut vals = Vec::with_capacity(items.len());
            for item in items {
                vals.push(eval_expr(item, ctx, flags)?);
            }
            membership_test(&lv, &vals).map(Value::Bool)
        }
        Expr::InNamed(l, name) => {
            let lv = eval_expr(l, ctx, flags)?;
            match ctx.vars.get(name) {
                Some(Value::List(vals)) => membership_test(&lv, vals).map(Value::Bool),
                Some(v) if !v.is_missing() => Err(Skip::TypeMismatch(format!(
                    "IN target {name:?} is {}, expected list",
                    v.type_name()
                ))),
                _ => Err(Skip::MissingIdent(name.clone())),
            }
        }
        Expr::Call(call) => eval_call(call, ctx, flags),
    }
}

fn eval_cmp(op: CmpOp, lv: &Value, rv: &Value) -> Result<bool, Skip> {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let eq = lv.scalar_eq(rv).ok_or_else(|| {
                Skip::TypeMismatch(format!(
                    "cannot compare {} to {}",
                    lv.type_name(),
                    rv.type_name()
                ))
            })?;
            Ok(if op == CmpOp::Eq { eq } else { !eq })
        }
        // Ordering comparisons require both sides numeric.
        _ => {
            let (a, b) = match (lv.as_num(), rv.as_num()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(Skip::TypeMismatch(format!(
                        "ordering comparison on {} and {}",
                        lv.type_name(),
                        rv.type_name()
                    )))
                }
            };
            Ok(match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

fn membership_test(needle: &Value, haystack: &[Value]) -> Result<bool, Skip> {
    let mut comparable = false;
    for item in haystack {
        match needle.scalar_eq(item) {
            Some(true) => return Ok(true),
            Some(false) => comparable = true,
            None => {}
        }
    }
    if comparable {
        Ok(false)
    } else {
        Err(Skip::TypeMismatch(format!(
            "{} is not comparable to any list member",
            needle.type_name()
        )))
    }
}

fn eval_call(call: &Call, ctx: &RuleContext, flags: &mut EvalFlags) -> Result<Value, Skip> {
    match call {
        Call::Velocity1h(field) => velocity_value(ctx, fdp_config::WINDOW_1H_SECS, field, flags),
        Call::Velocity24h(field) => velocity_value(ctx, fdp_config::WINDOW_24H_SECS, field, flags),
        Call::MemberOf(list_type, kind) => Ok(Value::Bool(ctx.membership(*list_type, *kind))),
    }
}

fn velocity_value(
    ctx: &RuleContext,
    window_secs: u64,
    field: &str,
    flags: &mut EvalFlags,
) -> Result<Value, Skip> {
    match ctx.velocity.get(&(window_secs, field.to_string())) {
        Some(VelocityReading::Value(v)) => Ok(Value::Num(*v)),
        // Timed-out (or never-resolved) reads count as 0 and annotate.
        Some(VelocityReading::TimedOut) | None => {
            flags.velocity_timeout = true;
            Ok(Value::Num(0.0))
        }
    }
}
