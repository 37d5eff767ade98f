//! Wire forms of the transit and shipments.
//!
//! Each direction carries two opaque blobs: the transit binary form and
//! the shipments binary form. Text transports carry them base64-encoded,
//! one header per blob; binary transports embed the raw bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use super::carrier::Ctx;
use super::shipment::{Shipment, Shipments};
use super::transit::Transit;

/// Header carrying the base64 transit blob.
pub const TRANSIT_HEADER: &str = "context-transit-bin";
/// Header carrying the base64 shipments blob.
pub const SHIPMENTS_HEADER: &str = "context-shipments-bin";

/// Errors decoding inbound sideband data.
#[derive(Debug, Error)]
pub enum SidebandError {
    #[error("sideband frame is truncated")]
    Truncated,
    #[error("sideband frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("unsupported transit version {0}")]
    UnsupportedVersion(u8),
    #[error("transit id is empty")]
    EmptyTransitId,
    #[error("transit id is not valid utf-8")]
    InvalidTransitId,
    #[error("stepper index {index} out of range for {depth} levels")]
    InvalidStepper { index: usize, depth: usize },
    #[error("failed to decode base64 sideband: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("sideband carries {0} shipments, over the limit")]
    TooManyShipments(usize),
    #[error("failed to decode shipments: {0}")]
    Shipments(#[from] serde_json::Error),
}

/// The captured outbound context of one call.
///
/// Capturing copies the current state; later changes to the carrier do
/// not reach an already-captured sideband.
#[derive(Debug, Clone, Default)]
pub struct Sideband {
    pub transit: Option<Vec<u8>>,
    pub shipments: Vec<u8>,
}

impl Sideband {
    /// Capture the carrier for an outbound call.
    ///
    /// The forwarded transit is a child of the current one so the callee
    /// continues the chain one level deeper under the same identifier.
    pub fn capture(ctx: &Ctx) -> Self {
        Self {
            transit: ctx.transit().map(|tr| tr.child().encode()),
            shipments: encode_shipments(ctx.shipments()),
        }
    }

    /// Text-safe form: `(transit_header_value, shipments_header_value)`.
    pub fn to_text(&self) -> (Option<String>, String) {
        (
            self.transit.as_ref().map(|t| STANDARD.encode(t)),
            STANDARD.encode(&self.shipments),
        )
    }

    /// Parse the text-safe form. Absent or empty values decode to empty blobs.
    pub fn from_text(transit: Option<&str>, shipments: Option<&str>) -> Result<Self, SidebandError> {
        let transit = match transit.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Some(STANDARD.decode(t)?),
            None => None,
        };
        let shipments = match shipments.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => STANDARD.decode(s)?,
            None => Vec::new(),
        };
        Ok(Self { transit, shipments })
    }

    /// Merge into `parent`: decode the transit (or mint one when absent) and
    /// layer every shipment on top of the parent's set.
    pub fn apply(&self, parent: &Ctx) -> Result<Ctx, SidebandError> {
        let ctx = match self.transit.as_deref().filter(|t| !t.is_empty()) {
            Some(bytes) => parent.with_transit(Transit::decode(bytes)?),
            None => parent.with_new_transit(),
        };
        let shipments = decode_shipments(&self.shipments)?;
        Ok(shipments
            .to_write_order()
            .into_iter()
            .fold(ctx, |ctx, s| ctx.with_shipment(s.key, s.value)))
    }
}

/// Upper bound on decoded shipment entries.
pub const MAX_SHIPMENTS: usize = 1024;

/// Binary shipments: a JSON array of `[key, value]` pairs, oldest first.
pub fn encode_shipments(shipments: &Shipments) -> Vec<u8> {
    let pairs: Vec<(String, serde_json::Value)> = shipments
        .to_write_order()
        .into_iter()
        .map(|s| (s.key, s.value))
        .collect();
    // Serialising strings and JSON values into memory cannot fail.
    serde_json::to_vec(&pairs).unwrap_or_default()
}

/// Decode the binary shipments form. An empty blob is an empty set.
pub fn decode_shipments(data: &[u8]) -> Result<Shipments, SidebandError> {
    if data.is_empty() {
        return Ok(Shipments::new());
    }
    let pairs: Vec<(String, serde_json::Value)> = serde_json::from_slice(data)?;
    if pairs.len() > MAX_SHIPMENTS {
        return Err(SidebandError::TooManyShipments(pairs.len()));
    }
    Ok(Shipments::from_write_order(
        pairs.into_iter().map(|(key, value)| Shipment { key, value }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shipments_keep_order_and_duplicates() {
        let s = Shipments::new().with("a", 1).with("b", "two").with("a", json!([3]));
        let decoded = decode_shipments(&encode_shipments(&s)).unwrap();
        let keys: Vec<&str> = decoded.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
        assert_eq!(decoded.get("a"), Some(&json!([3])));
    }

    #[test]
    fn oversized_shipments_are_rejected() {
        let pairs: Vec<(String, u8)> = (0..=MAX_SHIPMENTS).map(|_| (String::new(), 0)).collect();
        let data = serde_json::to_vec(&pairs).unwrap();
        assert!(matches!(
            decode_shipments(&data),
            Err(SidebandError::TooManyShipments(n)) if n == MAX_SHIPMENTS + 1
        ));

        let at_cap = serde_json::to_vec(&pairs[..MAX_SHIPMENTS]).unwrap();
        assert_eq!(decode_shipments(&at_cap).unwrap().len(), MAX_SHIPMENTS);
    }

    #[test]
    fn capture_is_a_snapshot() {
        let ctx = Ctx::background().with_new_transit().with_shipment("k", "v");
        let captured = Sideband::capture(&ctx);
        let _later = ctx.with_shipment("late", "x");

        let decoded = decode_shipments(&captured.shipments).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.get("late").is_none());
    }

    #[test]
    fn apply_continues_the_chain() {
        let ctx = Ctx::background().with_new_transit().with_shipment("user", "42");
        let (transit, shipments) = Sideband::capture(&ctx).to_text();

        let inbound = Sideband::from_text(transit.as_deref(), Some(&shipments)).unwrap();
        let callee = inbound.apply(&Ctx::background()).unwrap();

        let caller_tr = ctx.transit().unwrap();
        let callee_tr = callee.transit().unwrap();
        assert_eq!(callee_tr.id(), caller_tr.id());
        assert_eq!(callee_tr.stepper().depth(), caller_tr.stepper().depth() + 1);
        assert_eq!(callee.shipments().get("user"), Some(&json!("42")));
    }

    #[test]
    fn missing_transit_mints_a_new_one() {
        let inbound = Sideband::from_text(None, None).unwrap();
        let ctx = inbound.apply(&Ctx::background()).unwrap();
        assert!(ctx.transit().is_some());
        assert!(ctx.shipments().is_empty());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(matches!(
            Sideband::from_text(Some("***"), None),
            Err(SidebandError::Base64(_))
        ));

        let garbage = Sideband {
            transit: Some(vec![1, 2, 3]),
            shipments: Vec::new(),
        };
        assert!(garbage.apply(&Ctx::background()).is_err());

        let bad_shipments = Sideband {
            transit: None,
            shipments: b"{not json".to_vec(),
        };
        assert!(matches!(
            bad_shipments.apply(&Ctx::background()),
            Err(SidebandError::Shipments(_))
        ));
    }
}
