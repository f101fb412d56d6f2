//! Payment and subscription lifecycle engine
//!
//! Order creation and gateway signature verification, the subscription
//! state machine with proration, partner commission accounting, coupon
//! redemption, payment retry/dunning, and the revenue ledger. Services
//! own a `PgPool` and expose async operations; the worker crate drives
//! the time-based pieces.

pub mod client;
pub mod commission;
pub mod coupons;
pub mod dunning;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod orders;
pub mod proration;
pub mod subscriptions;

pub use client::{GatewayClient, GatewayConfig};
pub use commission::{CommissionCalculator, CommissionService};
pub use coupons::CouponService;
pub use dunning::{DunningEngine, ErrorClassifier};
pub use error::{BillingError, BillingResult};
pub use ledger::RevenueLedger;
pub use notify::{NotificationKind, NotificationOutbox};
pub use orders::OrderService;
pub use proration::{ChangeMode, ProrationCalculator};
pub use subscriptions::SubscriptionService;
