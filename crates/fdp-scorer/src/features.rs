//! Deterministic projection of a `TransactionEvent` into the feature vector
//! shared with the model. The projection must stay byte-stable across
//! releases; the model is trained against these exact keys.

use chrono::{Datelike, Timelike};
use fdp_schemas::TransactionEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub amount: f64,
    /// Hour of day, UTC, 0-23.
    pub hour: u32,
    /// 0 = Monday … 6 = Sunday.
    pub day_of_week: u32,
    pub merchant_mcc: String,
    pub card_type: String,
    pub channel: String,
    pub is_international: bool,
    pub is_night: bool,
    pub is_weekend: bool,
    pub amount_bucket: u32,
    /// Present only when merchant coordinates and the user's home location
    /// are both known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_bucket: Option<u32>,
    /// Present only when a geo lookup succeeded upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city_population: Option<u64>,
}

impl FeatureVector {
    pub fn project(event: &TransactionEvent) -> Self {
        Self::project_with_home(event, None)
    }

    /// Projection with an optional `(lat, lon)` user-home location, when a
    /// profile source supplies one.
    pub fn project_with_home(event: &TransactionEvent, home: Option<(f64, f64)>) -> Self {
        let hour = event.timestamp.hour();
        let day_of_week = event.timestamp.weekday().num_days_from_monday();

        let is_international = match event.context.geo.as_deref() {
            Some(geo) => !geo.eq_ignore_ascii_case(&event.merchant.country),
            None => false,
        };

        let distance_bucket = match (event.merchant.lat, event.merchant.lon, home) {
            (Some(lat), Some(lon), Some((home_lat, home_lon))) => {
                Some(distance_bucket(haversine_km(lat, lon, home_lat, home_lon)))
            }
            _ => None,
        };

        Self {
            amount: event.amount,
            hour,
            day_of_week,
            merchant_mcc: event.merchant.mcc.clone(),
            card_type: match event.card.card_type {
                fdp_schemas::CardType::Physical => "physical".to_string(),
                fdp_schemas::CardType::Virtual => "virtual".to_string(),
            },
            channel: match event.context.channel {
                fdp_schemas::Channel::App => "app".to_string(),
                fdp_schemas::Channel::Web => "web".to_string(),
                fdp_schemas::Channel::Pos => "pos".to_string(),
                fdp_schemas::Channel::Atm => "atm".to_string(),
            },
            is_international,
            is_night: hour < 6 || hour >= 22,
            is_weekend: day_of_week >= 5,
            amount_bucket: amount_bucket(event.amount),
            distance_bucket,
            city_population: None,
        }
    }
}

fn amount_bucket(amount: f64) -> u32 {
    match amount {
        a if a < 10.0 => 0,
        a if a < 50.0 => 1,
        a if a < 100.0 => 2,
        a if a < 500.0 => 3,
        a if a < 1_000.0 => 4,
        a if a < 5_000.0 => 5,
        _ => 6,
    }
}

fn distance_bucket(km: f64) -> u32 {
    match km {
        d if d < 10.0 => 0,
        d if d < 100.0 => 1,
        d if d < 500.0 => 2,
        d if d < 2_000.0 => 3,
        _ => 4,
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6_371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdp_schemas::{
        AuthMethod, Card, CardType, Channel, Merchant, RequestContext, Security,
    };

    fn event_at(iso: &str, amount: f64) -> TransactionEvent {
        TransactionEvent {
            event_id: "evt-1".into(),
            tenant_id: "t-1".into(),
            idempotency_key: "k-1".into(),
            amount,
            currency: "EUR".into(),
            timestamp: iso.parse().unwrap(),
            merchant: Merchant {
                id: "m-1".into(),
                mcc: "5732".into(),
                country: "DE".into(),
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
                channel: Channel::Web,
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
    fn night_and_weekend_flags() {
        // 2025-06-07 is a Saturday; 03:42 is night.
        let fv = FeatureVector::project(&event_at("2025-06-07T03:42:00Z", 899.0));
        assert!(fv.is_night);
        assert!(fv.is_weekend);
        assert_eq!(fv.hour, 3);
        assert_eq!(fv.day_of_week, 5);

        // Tuesday mid-day is neither.
        let fv = FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 899.0));
        assert!(!fv.is_night);
        assert!(!fv.is_weekend);
    }

    #[test]
    fn international_flag_compares_geo_to_merchant_country() {
        let mut ev = event_at("2025-06-03T13:00:00Z", 10.0);
        assert!(FeatureVector::project(&ev).is_international); // FR vs DE

        ev.context.geo = Some("DE".into());
        assert!(!FeatureVector::project(&ev).is_international);

        ev.context.geo = None;
        assert!(!FeatureVector::project(&ev).is_international);
    }

    #[test]
    fn amount_buckets_are_stable() {
        assert_eq!(FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 5.0)).amount_bucket, 0);
        assert_eq!(FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 45.5)).amount_bucket, 1);
        assert_eq!(FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 899.0)).amount_bucket, 4);
        assert_eq!(
            FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 9_999.0)).amount_bucket,
            6
        );
    }

    #[test]
    fn distance_bucket_needs_both_coordinates_and_home() {
        let mut ev = event_at("2025-06-03T13:00:00Z", 10.0);
        assert_eq!(FeatureVector::project(&ev).distance_bucket, None);

        ev.merchant.lat = Some(52.52); // Berlin
        ev.merchant.lon = Some(13.405);
        assert_eq!(FeatureVector::project(&ev).distance_bucket, None);

        // Paris home: ~880 km from Berlin → bucket 3.
        let fv = FeatureVector::project_with_home(&ev, Some((48.8566, 2.3522)));
        assert_eq!(fv.distance_bucket, Some(3));
    }

    #[test]
    fn projection_is_deterministic() {
        let ev = event_at("2025-06-07T03:42:00Z", 899.0);
        assert_eq!(FeatureVector::project(&ev), FeatureVector::project(&ev));
    }

    #[test]
    fn absent_optionals_are_omitted_from_wire_form() {
        let fv = FeatureVector::project(&event_at("2025-06-03T13:00:00Z", 10.0));
        let v = serde_json::to_value(&fv).unwrap();
        assert!(v.get("distance_bucket").is_none());
        assert!(v.get("city_population").is_none());
    }
}
