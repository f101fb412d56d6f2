//! Proration for mid-cycle plan changes
//!
//! Computes the signed monetary delta when a subscription switches plans
//! before its next billing date: the unused value of the old plan is
//! credited against the remaining-period cost of the new one. Pure
//! arithmetic over `Decimal`, no I/O.

use pawket_shared::{round2, Plan};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// When a plan change takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Switch now; charge or credit the prorated difference
    Immediate,
    /// Switch at the next billing date; no proration
    NextCycle,
}

/// Result of a proration calculation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationQuote {
    /// Signed amount rounded to two decimal places.
    /// Positive = additional charge, negative = credit.
    pub amount: Decimal,
    /// Whole days until the next billing date (ceiling)
    pub days_until_billing: i64,
    /// Fixed cycle length used for the calculation
    pub cycle_days: i64,
}

impl ProrationQuote {
    pub fn is_charge(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_credit(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    fn zero(cycle_days: i64) -> Self {
        Self {
            amount: Decimal::ZERO,
            days_until_billing: 0,
            cycle_days,
        }
    }
}

/// Proration calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct ProrationCalculator;

impl ProrationCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Quote the proration for changing `current` to `new_plan` at `now`,
    /// given the subscription's next billing date.
    ///
    /// The cycle length comes from the current plan's billing interval
    /// (30 for monthly, 365 for yearly). Days are counted with a ceiling
    /// so a partial day still counts as unused.
    pub fn quote(
        &self,
        current: &Plan,
        new_plan: &Plan,
        next_billing_date: OffsetDateTime,
        now: OffsetDateTime,
        mode: ChangeMode,
    ) -> ProrationQuote {
        let cycle_days = current.billing_cycle.cycle_days();

        if mode == ChangeMode::NextCycle {
            return ProrationQuote::zero(cycle_days);
        }

        let days_until_billing = days_until(next_billing_date, now).clamp(0, cycle_days);
        if days_until_billing == 0 {
            return ProrationQuote::zero(cycle_days);
        }

        let days = Decimal::from(days_until_billing);
        let cycle = Decimal::from(cycle_days);
        let unused = current.price * days / cycle;
        let new_portion = new_plan.price * days / cycle;

        ProrationQuote {
            amount: round2(new_portion - unused),
            days_until_billing,
            cycle_days,
        }
    }
}

/// Whole days between `now` and `until`, rounded up. Negative spans
/// (billing date already passed) return 0.
pub fn days_until(until: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (until - now).whole_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 86_399) / 86_400
}

/// Pro-rata refund for an immediate cancellation: the paid amount scaled
/// by remaining days over the cycle length, rounded to two places.
pub fn prorata_refund(amount_paid: Decimal, remaining_days: i64, cycle_days: i64) -> Decimal {
    if cycle_days <= 0 || remaining_days <= 0 {
        return Decimal::ZERO;
    }
    let remaining = remaining_days.min(cycle_days);
    round2(amount_paid * Decimal::from(remaining) / Decimal::from(cycle_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawket_shared::{BillingCycle, PlanLimits, ProductLine};
    use rust_decimal_macros::dec;
    use time::Duration;

    fn plan(id: &str, price: Decimal, cycle: BillingCycle) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            product_line: ProductLine::Membership,
            price,
            billing_cycle: cycle,
            trial_days: 7,
            pausable: false,
            limits: PlanLimits {
                max_dogs: 2,
                max_members: 1,
                consultations_per_cycle: 2,
            },
        }
    }

    #[test]
    fn test_upgrade_half_cycle() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);
        let new_plan = plan("family_monthly", dec!(149), BillingCycle::Monthly);

        // 15 of 30 days remaining: 149*15/30 - 99*15/30 = 25.00
        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::days(15),
            now,
            ChangeMode::Immediate,
        );
        assert_eq!(quote.amount, dec!(25.00));
        assert_eq!(quote.days_until_billing, 15);
        assert!(quote.is_charge());
    }

    #[test]
    fn test_downgrade_is_credit() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("family_monthly", dec!(199), BillingCycle::Monthly);
        let new_plan = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);

        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::days(10),
            now,
            ChangeMode::Immediate,
        );
        // (99-199)*10/30 = -33.33... -> -33.33
        assert_eq!(quote.amount, dec!(-33.33));
        assert!(quote.is_credit());
    }

    #[test]
    fn test_next_cycle_mode_is_zero() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);
        let new_plan = plan("family_monthly", dec!(199), BillingCycle::Monthly);

        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::days(15),
            now,
            ChangeMode::NextCycle,
        );
        assert_eq!(quote.amount, Decimal::ZERO);
    }

    #[test]
    fn test_zero_days_remaining() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);
        let new_plan = plan("family_monthly", dec!(199), BillingCycle::Monthly);

        // Billing date already reached: nothing to prorate
        let quote = calc.quote(&current, &new_plan, now, now, ChangeMode::Immediate);
        assert_eq!(quote.amount, Decimal::ZERO);
        assert_eq!(quote.days_until_billing, 0);
    }

    #[test]
    fn test_partial_day_counts_as_full() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);
        let new_plan = plan("family_monthly", dec!(199), BillingCycle::Monthly);

        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::hours(6),
            now,
            ChangeMode::Immediate,
        );
        assert_eq!(quote.days_until_billing, 1);
        // (199-99)*1/30 = 3.333... -> 3.33
        assert_eq!(quote.amount, dec!(3.33));
    }

    #[test]
    fn test_full_cycle_remaining() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_monthly", dec!(99), BillingCycle::Monthly);
        let new_plan = plan("family_monthly", dec!(199), BillingCycle::Monthly);

        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::days(30),
            now,
            ChangeMode::Immediate,
        );
        assert_eq!(quote.days_until_billing, 30);
        // Full-price difference at the cycle boundary
        assert_eq!(quote.amount, dec!(100.00));
    }

    #[test]
    fn test_yearly_cycle_uses_365_days() {
        let calc = ProrationCalculator::new();
        let now = OffsetDateTime::now_utc();
        let current = plan("buddy_yearly", dec!(990), BillingCycle::Yearly);
        let new_plan = plan("family_yearly", dec!(1990), BillingCycle::Yearly);

        let quote = calc.quote(
            &current,
            &new_plan,
            now + Duration::days(100),
            now,
            ChangeMode::Immediate,
        );
        assert_eq!(quote.cycle_days, 365);
        // (1990-990)*100/365 = 273.97
        assert_eq!(quote.amount, dec!(273.97));
    }

    #[test]
    fn test_prorata_refund() {
        // Yearly sub paid 990, 100 of 365 days remaining: 271.23
        assert_eq!(prorata_refund(dec!(990), 100, 365), dec!(271.23));
        assert_eq!(prorata_refund(dec!(990), 0, 365), Decimal::ZERO);
        // Remaining days capped at the cycle
        assert_eq!(prorata_refund(dec!(990), 400, 365), dec!(990));
    }
}
