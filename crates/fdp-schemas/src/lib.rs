//! Shared domain and wire types for the fraud decision platform.
//!
//! Everything here is plain data: serde structs and enums consumed by every
//! other crate. No I/O, no business logic beyond request validation
//! (`validate` module).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod validate;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Transaction channel the event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    App,
    Web,
    Pos,
    Atm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Physical,
    Virtual,
}

/// Authentication method used for the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[serde(rename = "3ds")]
    ThreeDs,
    Pin,
    Biometric,
    Nfc,
    None,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ThreeDs => "3ds",
            AuthMethod::Pin => "pin",
            AuthMethod::Biometric => "biometric",
            AuthMethod::Nfc => "nfc",
            AuthMethod::None => "none",
        }
    }
}

/// Final categorical decision.
///
/// Ordering is restrictiveness: `Allow < Challenge < Deny`. The threshold
/// monotonicity property is stated directly in terms of this `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    Challenge,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Challenge => "CHALLENGE",
            Verdict::Deny => "DENY",
        }
    }
}

/// What the rule author suggests when the rule fires. Advisory only; the
/// fuser owns the final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionHint {
    Allow,
    Review,
    Challenge,
    Deny,
}

/// Rule severity. `Critical` forces DENY regardless of score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    Allow,
    Deny,
}

impl ListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListType::Allow => "allow",
            ListType::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(ListType::Allow),
            "deny" => Some(ListType::Deny),
            _ => None,
        }
    }
}

/// The subject dimension an allow/deny list keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Ip,
    Device,
    User,
    Card,
    Country,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Ip => "ip",
            ListKind::Device => "device",
            ListKind::User => "user",
            ListKind::Card => "card",
            ListKind::Country => "country",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(ListKind::Ip),
            "device" => Some(ListKind::Device),
            "user" => Some(ListKind::User),
            "card" => Some(ListKind::Card),
            "country" => Some(ListKind::Country),
            _ => None,
        }
    }

    pub const ALL: [ListKind; 5] = [
        ListKind::Ip,
        ListKind::Device,
        ListKind::User,
        ListKind::Card,
        ListKind::Country,
    ];
}

// ---------------------------------------------------------------------------
// TransactionEvent (input, immutable once accepted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: String,
    pub mcc: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub card_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub card_type: CardType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub auth_method: AuthMethod,
    pub aml_flag: bool,
}

/// One incoming transaction to score. Client-supplied, immutable once
/// accepted. Unknown extra fields (e.g. `kyc.*` blocks some gateways attach)
/// are tolerated and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub amount: f64,
    /// ISO-4217 three-letter code, uppercase.
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub merchant: Merchant,
    pub card: Card,
    pub context: RequestContext,
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_initial_2fa: Option<bool>,
}

impl TransactionEvent {
    /// Idempotency record key: `{tenant_id}:{idempotency_key}`.
    pub fn idempotency_scope(&self) -> String {
        format!("{}:{}", self.tenant_id, self.idempotency_key)
    }
}

// ---------------------------------------------------------------------------
// Decision (output, immutable)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub event_id: String,
    pub tenant_id: String,
    pub verdict: Verdict,
    pub score: f64,
    pub model_version: String,
    /// Triggered rule identifiers, stable by (priority, rule_id).
    pub rule_hits: Vec<String>,
    /// Human-readable reasons, ordered.
    pub reasons: Vec<String>,
    /// Total server time for THIS call (replays re-measure).
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
    pub requires_2fa: bool,
    /// True when at least one input component was unavailable.
    #[serde(default)]
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Decision event envelope (published to `decision_events`)
// ---------------------------------------------------------------------------

/// Fixed downstream schema. Key = `decision_id`; consumers treat the topic
/// as a set keyed by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    pub decision_id: Uuid,
    pub event_id: String,
    pub tenant_id: String,
    pub verdict: Verdict,
    pub score: f64,
    pub rule_hits: Vec<String>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
}

impl From<&Decision> for DecisionEnvelope {
    fn from(d: &Decision) -> Self {
        Self {
            decision_id: d.decision_id,
            event_id: d.event_id.clone(),
            tenant_id: d.tenant_id.clone(),
            verdict: d.verdict,
            score: d.score,
            rule_hits: d.rule_hits.clone(),
            model_version: d.model_version.clone(),
            created_at: d.created_at,
            degraded: if d.degraded { Some(true) } else { None },
        }
    }
}

// ---------------------------------------------------------------------------
// Rule (configuration)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub version: u32,
    pub enabled: bool,
    /// Lower fires first on tie-break.
    pub priority: i32,
    /// DSL condition source.
    pub condition: String,
    pub score: f64,
    pub action_hint: ActionHint,
    pub severity: Severity,
    #[serde(default)]
    pub metadata: Value,
}

impl Rule {
    /// Display name: `metadata.name` when present, else the rule id.
    pub fn human_name(&self) -> &str {
        self.metadata
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.rule_id)
    }
}

/// Rule configuration document: `{rules: [Rule, …]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetDoc {
    pub rules: Vec<Rule>,
}

// ---------------------------------------------------------------------------
// ListEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub list_type: ListType,
    pub kind: ListKind,
    pub value: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_3ds_round_trips() {
        let s = serde_json::to_string(&AuthMethod::ThreeDs).unwrap();
        assert_eq!(s, "\"3ds\"");
        let back: AuthMethod = serde_json::from_str(&s).unwrap();
        assert_eq!(back, AuthMethod::ThreeDs);
    }

    #[test]
    fn verdict_orders_by_restrictiveness() {
        assert!(Verdict::Allow < Verdict::Challenge);
        assert!(Verdict::Challenge < Verdict::Deny);
    }

    #[test]
    fn card_type_field_serializes_as_type() {
        let card = Card {
            card_id: "c-1".into(),
            user_id: "u-1".into(),
            card_type: CardType::Virtual,
        };
        let v = serde_json::to_value(&card).unwrap();
        assert_eq!(v["type"], "virtual");
    }

    #[test]
    fn event_tolerates_unknown_fields() {
        let raw = serde_json::json!({
            "event_id": "evt-1",
            "tenant_id": "t-1",
            "idempotency_key": "k-1",
            "amount": 45.50,
            "currency": "EUR",
            "timestamp": "2025-06-01T10:00:00Z",
            "merchant": {"id": "m-1", "mcc": "5411", "country": "FR"},
            "card": {"card_id": "c-1", "user_id": "u-1", "type": "physical"},
            "context": {"channel": "pos"},
            "security": {"auth_method": "pin", "aml_flag": false},
            "kyc": {"level": "full"}
        });
        let ev: TransactionEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.event_id, "evt-1");
        assert_eq!(ev.context.channel, Channel::Pos);
    }

    #[test]
    fn envelope_omits_degraded_when_clean() {
        let d = Decision {
            decision_id: Uuid::new_v4(),
            event_id: "evt-1".into(),
            tenant_id: "t-1".into(),
            verdict: Verdict::Allow,
            score: 0.1,
            model_version: "mv-1".into(),
            rule_hits: vec![],
            reasons: vec![],
            latency_ms: 3,
            created_at: Utc::now(),
            requires_2fa: false,
            degraded: false,
        };
        let v = serde_json::to_value(DecisionEnvelope::from(&d)).unwrap();
        assert!(v.get("degraded").is_none());
    }
}
