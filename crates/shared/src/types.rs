//! Common types used across the Pawket payment engine

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Dog profile ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DogId(pub Uuid);

impl DogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DogId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DogId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Partner (service provider) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartnerId(pub Uuid);

impl PartnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PartnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PartnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PartnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Money helpers
// =============================================================================

/// Round a rupee amount to the currency's minor unit (two decimal places).
///
/// All monetary amounts leaving a calculator go through this so repeated
/// conversions cannot accumulate sub-paisa drift.
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a rupee amount to integer paise for the gateway wire format.
pub fn to_minor_units(amount: Decimal) -> i64 {
    (round2(amount) * dec!(100)).to_i64().unwrap_or(0)
}

/// Convert integer paise back to a rupee amount.
pub fn from_minor_units(paise: i64) -> Decimal {
    Decimal::from(paise) / dec!(100)
}

// =============================================================================
// Enums
// =============================================================================

/// Billing cycle for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "annual" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// Fixed cycle length used for proration and pro-rata refunds.
    pub fn cycle_days(&self) -> i64 {
        match self {
            Self::Monthly => 30,
            Self::Yearly => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Product line a subscription belongs to. The one-active-subscription
/// rule is scoped per (user, product line).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProductLine {
    /// Dog-owner membership plans
    Membership,
    /// Partner (service provider) listing plans
    Partner,
}

impl std::fmt::Display for ProductLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Membership => write!(f, "membership"),
            Self::Partner => write!(f, "partner"),
        }
    }
}

/// Subscription lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    /// Non-retryable payment failure (expired/blocked card). The user must
    /// update their payment method before billing can resume.
    PaymentMethodRequired,
    Paused,
    Cancelling,
    Cancelled,
    Suspended,
}

impl SubscriptionStatus {
    /// Whether this subscription currently grants access to paid features.
    pub fn is_current(&self) -> bool {
        matches!(
            self,
            Self::Trialing
                | Self::Active
                | Self::PastDue
                | Self::PaymentMethodRequired
                | Self::Paused
                | Self::Cancelling
        )
    }

    /// Terminal states require creating a new subscription (or, for
    /// suspended, a manual reactivation) to get back to active.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::PaymentMethodRequired => "payment_method_required",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment order states. An order transitions `created -> completed`
/// exactly once; `refunded` is only reachable from `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentOrderStatus {
    Created,
    Completed,
    Failed,
    Refunded,
}

impl std::fmt::Display for PaymentOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        };
        write!(f, "{}", s)
    }
}

/// Settled or attempted charge states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    RetryPending,
}

/// Closed set of payment types. Side-effect dispatch matches on this enum,
/// so a new payment type cannot silently fall through to a no-op: it must
/// be added here and handled everywhere the compiler points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    PremiumService,
    DogId,
    Appointment,
    PartnerSubscription,
    CommissionPayout,
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Subscription => "subscription",
            Self::PremiumService => "premium_service",
            Self::DogId => "dog_id",
            Self::Appointment => "appointment",
            Self::PartnerSubscription => "partner_subscription",
            Self::CommissionPayout => "commission_payout",
        };
        write!(f, "{}", s)
    }
}

/// Payment retry attempt states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Scheduled,
    Attempting,
    Succeeded,
    Failed,
}

/// Dunning campaign states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Completed,
    Cancelled,
}

/// Partner commission payout states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Processing,
    Paid,
}

/// Coupon discount types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    Percentage,
    FixedAmount,
    FreeTrialExtension,
}

// =============================================================================
// Plan catalog
// =============================================================================

/// Typed per-plan limits. Stored alongside the subscription as a versioned
/// snapshot so historical rows keep the limits they were sold with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Dog profiles covered by the plan
    pub max_dogs: u32,
    /// Household members sharing the plan
    pub max_members: u32,
    /// Premium vet-chat consultations per cycle
    pub consultations_per_cycle: u32,
}

/// Subscription plan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Stable plan identifier, e.g. "buddy_monthly"
    pub id: String,
    pub name: String,
    pub product_line: ProductLine,
    /// Price per billing cycle in rupees
    pub price: Decimal,
    pub billing_cycle: BillingCycle,
    pub trial_days: i64,
    /// Family plans can be paused mid-cycle
    pub pausable: bool,
    pub limits: PlanLimits,
}

/// Immutable plan catalog injected into the services that need it.
/// Per-environment overrides and test fixtures construct their own.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    /// Production plan catalog. Yearly prices carry the two-months-free
    /// discount baked in.
    pub fn default_catalog() -> Self {
        let buddy_limits = PlanLimits {
            max_dogs: 2,
            max_members: 1,
            consultations_per_cycle: 2,
        };
        let family_limits = PlanLimits {
            max_dogs: 6,
            max_members: 5,
            consultations_per_cycle: 6,
        };
        Self::new(vec![
            Plan {
                id: "buddy_monthly".to_string(),
                name: "Buddy".to_string(),
                product_line: ProductLine::Membership,
                price: dec!(99),
                billing_cycle: BillingCycle::Monthly,
                trial_days: 7,
                pausable: false,
                limits: buddy_limits.clone(),
            },
            Plan {
                id: "buddy_yearly".to_string(),
                name: "Buddy (yearly)".to_string(),
                product_line: ProductLine::Membership,
                price: dec!(990),
                billing_cycle: BillingCycle::Yearly,
                trial_days: 7,
                pausable: false,
                limits: buddy_limits,
            },
            Plan {
                id: "family_monthly".to_string(),
                name: "Family".to_string(),
                product_line: ProductLine::Membership,
                price: dec!(199),
                billing_cycle: BillingCycle::Monthly,
                trial_days: 14,
                pausable: true,
                limits: family_limits.clone(),
            },
            Plan {
                id: "family_yearly".to_string(),
                name: "Family (yearly)".to_string(),
                product_line: ProductLine::Membership,
                price: dec!(1990),
                billing_cycle: BillingCycle::Yearly,
                trial_days: 14,
                pausable: true,
                limits: family_limits,
            },
        ])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_round2_midpoint_away_from_zero() {
        assert_eq!(round2(dec!(271.2328)), dec!(271.23));
        assert_eq!(round2(dec!(25.005)), dec!(25.01));
        assert_eq!(round2(dec!(-25.005)), dec!(-25.01));
    }

    #[test]
    fn test_minor_unit_round_trip() {
        assert_eq!(to_minor_units(dec!(99)), 9900);
        assert_eq!(to_minor_units(dec!(271.23)), 27123);
        assert_eq!(from_minor_units(27123), dec!(271.23));
    }

    #[test]
    fn test_cycle_days() {
        assert_eq!(BillingCycle::Monthly.cycle_days(), 30);
        assert_eq!(BillingCycle::Yearly.cycle_days(), 365);
    }

    #[test]
    fn test_billing_cycle_from_str() {
        assert_eq!(BillingCycle::from_str("annual"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::from_str("MONTH"), Some(BillingCycle::Monthly));
        assert_eq!(BillingCycle::from_str("weekly"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(SubscriptionStatus::Trialing.is_current());
        assert!(SubscriptionStatus::PastDue.is_current());
        assert!(SubscriptionStatus::Cancelling.is_current());
        assert!(!SubscriptionStatus::Cancelled.is_current());
        assert!(SubscriptionStatus::Suspended.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_default_catalog_lookup() {
        let catalog = PlanCatalog::default_catalog();
        let plan = catalog.get("buddy_monthly").unwrap();
        assert_eq!(plan.price, dec!(99));
        assert_eq!(plan.billing_cycle, BillingCycle::Monthly);
        assert!(!plan.pausable);
        assert!(catalog.get("family_monthly").unwrap().pausable);
        assert!(catalog.get("unknown_plan").is_none());
    }
}
