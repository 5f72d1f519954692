use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use crate::actions::{ActionKind, ProofStatus};
use crate::crypto::{canonical_json, Signer};
use crate::error::{PipelineError, Result};

/// Arbitrary structured action payload. Keys are kept sorted.
pub type Payload = Map<String, Value>;

/// Open metadata map attached to a record.
pub type Metadata = Map<String, Value>;

/// Payload key holding the geolocation sub-map.
pub const GPS_KEY: &str = "gps";

pub const MAX_TAG_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt: None }
    }

    /// Read a `{lat, lon, alt?}` map. Missing or non-numeric coordinates yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        Some(Self {
            lat: map.get("lat")?.as_f64()?,
            lon: map.get("lon")?.as_f64()?,
            alt: map.get("alt").and_then(Value::as_f64),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("lat".into(), json!(self.lat));
        map.insert("lon".into(), json!(self.lon));
        if let Some(alt) = self.alt {
            map.insert("alt".into(), json!(alt));
        }
        Value::Object(map)
    }
}

/// One persisted, signed work event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub actor_id: String,
    pub kind: ActionKind,
    pub payload: Payload,
    /// Unix seconds
    pub timestamp: i64,
    /// Hex-encoded signature over [`ActionRecord::signing_bytes`]
    pub signature: String,
    pub status: ProofStatus,
    pub tx_ref: Option<String>,
    pub proof_ref: Option<String>,
    pub batch_ref: Option<String>,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    /// Canonical bytes covered by the signature: `{id, kind, payload, timestamp}` with sorted keys.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        signing_bytes(&self.id, self.kind, &self.payload, self.timestamp)
    }

    pub fn verify_signature(&self, signer: &dyn Signer) -> bool {
        let Ok(signature) = hex::decode(&self.signature) else {
            return false;
        };
        match self.signing_bytes() {
            Ok(bytes) => signer.verify(&bytes, &signature),
            Err(_) => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProofStatus::Pending
    }

    pub fn is_verified(&self) -> bool {
        self.status == ProofStatus::Verified
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn age_seconds(&self, now: i64) -> i64 {
        now - self.timestamp
    }

    pub fn geolocation(&self) -> Option<GeoPoint> {
        self.payload.get(GPS_KEY).and_then(GeoPoint::from_value)
    }
}

pub(crate) fn signing_bytes(
    id: &str,
    kind: ActionKind,
    payload: &Payload,
    timestamp: i64,
) -> Result<Vec<u8>> {
    canonical_json(&json!({
        "id": id,
        "kind": kind.code(),
        "payload": payload,
        "timestamp": timestamp,
    }))
}

/// Input to `ActionStore::append`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub payload: Payload,
    /// Unix seconds; the store clock is used when absent.
    pub timestamp: Option<i64>,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
}

impl NewAction {
    pub fn new(kind: ActionKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            timestamp: None,
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
        }
    }

    /// Build from a JSON value. Non-object values are rejected.
    pub fn from_json(kind: ActionKind, payload: Value) -> Result<Self> {
        match payload {
            Value::Object(map) => Ok(Self::new(kind, map)),
            other => Err(PipelineError::validation(format!(
                "payload must be an object, got {}",
                other
            ))),
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_location(mut self, point: GeoPoint) -> Self {
        self.payload.insert(GPS_KEY.into(), point.to_value());
        self
    }
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(PipelineError::validation("tag must not be empty"));
    }
    if tag.len() > MAX_TAG_BYTES {
        return Err(PipelineError::validation(format!(
            "tag exceeds {} bytes",
            MAX_TAG_BYTES
        )));
    }
    if tag.chars().any(char::is_control) {
        return Err(PipelineError::validation("tag contains control characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Signer;

    fn record(payload: Value) -> ActionRecord {
        ActionRecord {
            id: "act_000000000000000000000001".into(),
            actor_id: "did:worklog:test".into(),
            kind: ActionKind::DeliveryComplete,
            payload: payload.as_object().cloned().unwrap_or_default(),
            timestamp: 1000,
            signature: String::new(),
            status: ProofStatus::Pending,
            tx_ref: None,
            proof_ref: None,
            batch_ref: None,
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_geolocation_from_payload() {
        let rec = record(json!({"gps": {"lat": 37.7749, "lon": -122.4194}, "speed": 2.5}));
        let point = rec.geolocation().unwrap();
        assert_eq!(point.lat, 37.7749);
        assert_eq!(point.lon, -122.4194);
        assert!(point.alt.is_none());

        assert!(record(json!({"gps": {"lat": 1.0}})).geolocation().is_none());
        assert!(record(json!({})).geolocation().is_none());
    }

    #[test]
    fn test_signature_round_trip() {
        let signer = Ed25519Signer::from_seed(&[3u8; 32]);
        let mut rec = record(json!({"package_id": "PKG-1"}));
        rec.signature = hex::encode(signer.sign(&rec.signing_bytes().unwrap()));
        assert!(rec.verify_signature(&signer));

        rec.payload.insert("package_id".into(), json!("PKG-2"));
        assert!(!rec.verify_signature(&signer));
    }

    #[test]
    fn test_signing_bytes_ignore_mutable_fields() {
        let mut rec = record(json!({"a": 1}));
        let before = rec.signing_bytes().unwrap();
        rec.status = ProofStatus::Verified;
        rec.tx_ref = Some("tx1".into());
        rec.tags.insert("urgent".into());
        assert_eq!(before, rec.signing_bytes().unwrap());
    }

    #[test]
    fn test_new_action_builder() {
        let action = NewAction::from_json(ActionKind::ItemPicked, json!({"sku": "A-1"}))
            .unwrap()
            .at(1234)
            .with_tags(["zone-a", "shift-1"])
            .with_metadata("operator", json!("op-7"))
            .with_location(GeoPoint::new(1.5, 2.5));

        assert_eq!(action.timestamp, Some(1234));
        assert_eq!(action.tags.len(), 2);
        assert_eq!(action.payload["gps"]["lat"], json!(1.5));
        assert!(NewAction::from_json(ActionKind::ItemPicked, json!([1, 2])).is_err());
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_tag("zone-a").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag(&"x".repeat(65)).is_err());
        assert!(validate_tag("bad\ntag").is_err());
    }
}
