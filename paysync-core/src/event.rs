//! Parsing of raw provider webhook payloads into typed events.
//!
//! The provider delivers JSON of the shape
//! `{"id": "evt_...", "type": "subscription.created", "data": {"object": {...}}}`.
//! Only the event types that drive ledger mutations are modelled; everything
//! else parses to [`ProviderEvent::Unhandled`], which the ingestor
//! acknowledges without touching the ledger. A structurally broken payload is
//! a [`ParseError`] and is never retried.

use serde_json::Value;

use crate::model::{NaturalKey, PurchaseType, SubscriptionStatus};

/// Normalized fields shared by every ledger-mutating event.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDetails {
    pub subscription_id: String,
    pub account_id: String,
    pub product_id: String,
    pub amount_cents: i64,
    pub status: SubscriptionStatus,
    pub purchase_type: PurchaseType,
}

impl SubscriptionDetails {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::derive(&self.account_id, &self.product_id)
    }
}

/// A provider notification after parsing. Closed set: new provider event
/// types land in `Unhandled` rather than failing.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    SubscriptionCreated(SubscriptionDetails),
    SubscriptionUpdated(SubscriptionDetails),
    PaymentSucceeded(SubscriptionDetails),
    PaymentFailed(SubscriptionDetails),
    SubscriptionCanceled(SubscriptionDetails),
    Unhandled { event_type: String },
}

impl ProviderEvent {
    /// The details payload, if this event carries one.
    pub fn details(&self) -> Option<&SubscriptionDetails> {
        match self {
            ProviderEvent::SubscriptionCreated(d)
            | ProviderEvent::SubscriptionUpdated(d)
            | ProviderEvent::PaymentSucceeded(d)
            | ProviderEvent::PaymentFailed(d)
            | ProviderEvent::SubscriptionCanceled(d) => Some(d),
            ProviderEvent::Unhandled { .. } => None,
        }
    }
}

/// Structural failure while parsing a payload. Distinct from an unhandled
/// event type, which is a valid payload we choose not to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    Json(String),
    MissingField(&'static str),
    InvalidValue { field: &'static str, value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Json(msg) => write!(f, "payload is not valid JSON: {msg}"),
            ParseError::MissingField(field) => write!(f, "payload missing field '{field}'"),
            ParseError::InvalidValue { field, value } => {
                write!(f, "payload field '{field}' has invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parsed envelope: the provider event id, the raw type string (stored
/// verbatim for auditing), and the typed event.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event_id: String,
    pub event_type: String,
    pub event: ProviderEvent,
}

/// Parse a raw webhook body into a [`ParsedEvent`].
///
/// `id` and `type` are mandatory for every payload. The `data.object` fields
/// are only required when the type is one we act on; unhandled types are
/// accepted with whatever body they carry.
pub fn parse_event(raw: &[u8]) -> Result<ParsedEvent, ParseError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ParseError::Json(e.to_string()))?;

    let event_id = require_str(&value, "id")?.to_string();
    let event_type = require_str(&value, "type")?.to_string();

    let event = match event_type.as_str() {
        "subscription.created" => {
            ProviderEvent::SubscriptionCreated(parse_details(&value)?)
        }
        "subscription.updated" => {
            ProviderEvent::SubscriptionUpdated(parse_details(&value)?)
        }
        "payment.succeeded" => ProviderEvent::PaymentSucceeded(parse_details(&value)?),
        "payment.failed" => ProviderEvent::PaymentFailed(parse_details(&value)?),
        "subscription.canceled" => {
            ProviderEvent::SubscriptionCanceled(parse_details(&value)?)
        }
        _ => ProviderEvent::Unhandled {
            event_type: event_type.clone(),
        },
    };

    Ok(ParsedEvent {
        event_id,
        event_type,
        event,
    })
}

fn require_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(ParseError::InvalidValue {
            field,
            value: other.to_string(),
        }),
    }
}

fn parse_details(value: &Value) -> Result<SubscriptionDetails, ParseError> {
    let object = value
        .get("data")
        .and_then(|d| d.get("object"))
        .ok_or(ParseError::MissingField("data.object"))?;

    let subscription_id = require_str(object, "id")?.to_string();
    let account_id = require_str(object, "account")?.to_string();
    let product_id = require_str(object, "product")?.to_string();

    let amount_cents = match object.get("amount") {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| ParseError::InvalidValue {
            field: "amount",
            value: n.to_string(),
        })?,
        None | Some(Value::Null) => 0,
        Some(other) => {
            return Err(ParseError::InvalidValue {
                field: "amount",
                value: other.to_string(),
            })
        }
    };

    let status_str = require_str(object, "status")?;
    let status =
        SubscriptionStatus::parse(status_str).ok_or_else(|| ParseError::InvalidValue {
            field: "status",
            value: status_str.to_string(),
        })?;

    let purchase_type = match object.get("purchase_type") {
        None | Some(Value::Null) => PurchaseType::Subscription,
        Some(Value::String(s)) => {
            PurchaseType::parse(s).ok_or_else(|| ParseError::InvalidValue {
                field: "purchase_type",
                value: s.clone(),
            })?
        }
        Some(other) => {
            return Err(ParseError::InvalidValue {
                field: "purchase_type",
                value: other.to_string(),
            })
        }
    };

    Ok(SubscriptionDetails {
        subscription_id,
        account_id,
        product_id,
        amount_cents,
        status,
        purchase_type,
    })
}
