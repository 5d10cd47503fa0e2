//! Request validation for `TransactionEvent`.
//!
//! Validation runs BEFORE any downstream call; a failure here has no side
//! effects. Field problems are collected (not first-error-wins) so the 400
//! response can report all of them at once.

use crate::TransactionEvent;
use serde::{Deserialize, Serialize};

/// One field-level problem, serialized into the 400 `details` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// All problems found in one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    pub details: Vec<FieldError>,
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation failed:")?;
        for d in &self.details {
            write!(f, " {}: {};", d.field, d.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate an accepted-shape event against the domain invariants.
///
/// Shape errors (wrong types, missing required fields, out-of-enum values)
/// are already rejected by serde at the transport layer; this checks the
/// constraints serde cannot express.
pub fn validate_event(ev: &TransactionEvent) -> Result<(), ValidationErrors> {
    let mut details = Vec::new();

    require_non_empty(&mut details, "event_id", &ev.event_id);
    require_non_empty(&mut details, "tenant_id", &ev.tenant_id);
    require_non_empty(&mut details, "idempotency_key", &ev.idempotency_key);
    require_non_empty(&mut details, "merchant.id", &ev.merchant.id);
    require_non_empty(&mut details, "merchant.mcc", &ev.merchant.mcc);
    require_non_empty(&mut details, "merchant.country", &ev.merchant.country);
    require_non_empty(&mut details, "card.card_id", &ev.card.card_id);
    require_non_empty(&mut details, "card.user_id", &ev.card.user_id);

    if !(ev.amount.is_finite() && ev.amount > 0.0) {
        details.push(FieldError {
            field: "amount".into(),
            message: "must be a finite number greater than zero".into(),
        });
    }

    if !is_iso4217(&ev.currency) {
        details.push(FieldError {
            field: "currency".into(),
            message: "must be a three-letter uppercase ISO-4217 code".into(),
        });
    }

    if let Some(lat) = ev.merchant.lat {
        if !(-90.0..=90.0).contains(&lat) {
            details.push(FieldError {
                field: "merchant.lat".into(),
                message: "must be within [-90, 90]".into(),
            });
        }
    }
    if let Some(lon) = ev.merchant.lon {
        if !(-180.0..=180.0).contains(&lon) {
            details.push(FieldError {
                field: "merchant.lon".into(),
                message: "must be within [-180, 180]".into(),
            });
        }
    }

    if details.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors { details })
    }
}

fn require_non_empty(details: &mut Vec<FieldError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        details.push(FieldError {
            field: field.into(),
            message: "must be non-empty".into(),
        });
    }
}

fn is_iso4217(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthMethod, Card, CardType, Channel, Merchant, RequestContext, Security};
    use chrono::Utc;

    fn sample() -> TransactionEvent {
        TransactionEvent {
            event_id: "evt-1".into(),
            tenant_id: "t-1".into(),
            idempotency_key: "idem-1".into(),
            amount: 45.50,
            currency: "EUR".into(),
            timestamp: Utc::now(),
            merchant: Merchant {
                id: "m-1".into(),
                mcc: "5411".into(),
                country: "FR".into(),
                lat: None,
                lon: None,
            },
            card: Card {
                card_id: "c-1".into(),
                user_id: "u-1".into(),
                card_type: CardType::Physical,
            },
            context: RequestContext {
                ip: None,
                geo: Some("FR".into()),
                device_id: None,
                channel: Channel::Pos,
                user_agent: None,
            },
            security: Security {
                auth_method: AuthMethod::Pin,
                aml_flag: false,
            },
            has_initial_2fa: None,
        }
    }

    #[test]
    fn valid_event_passes() {
        assert!(validate_event(&sample()).is_ok());
    }

    #[test]
    fn zero_amount_rejected() {
        let mut ev = sample();
        ev.amount = 0.0;
        let err = validate_event(&ev).unwrap_err();
        assert_eq!(err.details.len(), 1);
        assert_eq!(err.details[0].field, "amount");
    }

    #[test]
    fn nan_amount_rejected() {
        let mut ev = sample();
        ev.amount = f64::NAN;
        assert!(validate_event(&ev).is_err());
    }

    #[test]
    fn lowercase_currency_rejected() {
        let mut ev = sample();
        ev.currency = "eur".into();
        let err = validate_event(&ev).unwrap_err();
        assert_eq!(err.details[0].field, "currency");
    }

    #[test]
    fn multiple_problems_all_reported() {
        let mut ev = sample();
        ev.event_id = "".into();
        ev.idempotency_key = "  ".into();
        ev.amount = -3.0;
        let err = validate_event(&ev).unwrap_err();
        let fields: Vec<_> = err.details.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"event_id"));
        assert!(fields.contains(&"idempotency_key"));
        assert!(fields.contains(&"amount"));
    }

    #[test]
    fn out_of_range_lat_rejected() {
        let mut ev = sample();
        ev.merchant.lat = Some(120.0);
        let err = validate_event(&ev).unwrap_err();
        assert_eq!(err.details[0].field, "merchant.lat");
    }
}
