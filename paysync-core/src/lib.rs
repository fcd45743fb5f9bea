//! Domain types and pure logic shared between the paysync service and its
//! tests: the data model for webhook events and purchase records, the
//! provider event parser, the retry backoff policy, and the health scorer.
//!
//! Nothing in this crate performs I/O; everything here is deterministic and
//! directly unit-testable.

pub mod backoff;
pub mod event;
pub mod health;
pub mod model;

pub use backoff::RetryPolicy;
pub use event::{parse_event, ParseError, ParsedEvent, ProviderEvent, SubscriptionDetails};
pub use health::{score, HealthReport};
pub use model::{
    AuditActor, AuditEntry, Discrepancy, DiscrepancyKind, DiscrepancyResolution, EventStatus,
    NaturalKey, PurchaseRecord, PurchaseSource, PurchaseType, SubscriptionStatus, WebhookEvent,
};
