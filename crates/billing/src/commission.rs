//! Partner commission calculation and payout tracking
//!
//! Commission for a partner transaction is computed once from an immutable
//! rate table, recorded, and never recomputed. Payout is a separate status
//! machine over the recorded row: pending -> processing -> paid.

use pawket_shared::{round2, CommissionStatus, PartnerId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// How commission is computed for a matching rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKind {
    /// Fraction of the transaction amount, e.g. 0.15 for 15%
    Percentage(Decimal),
    /// Fixed amount per transaction
    Flat(Decimal),
}

/// One rate table entry. `partner_type = None` is the wildcard row for a
/// service type; a row with a concrete partner type takes precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionRule {
    pub service_type: String,
    pub partner_type: Option<String>,
    pub rate: RateKind,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
}

/// Immutable commission rate table, injected at construction.
#[derive(Debug, Clone)]
pub struct CommissionRateTable {
    rules: Vec<CommissionRule>,
}

impl CommissionRateTable {
    pub fn new(rules: Vec<CommissionRule>) -> Self {
        Self { rules }
    }

    /// Production rates
    pub fn default_table() -> Self {
        Self::new(vec![
            CommissionRule {
                service_type: "grooming".to_string(),
                partner_type: None,
                rate: RateKind::Percentage(Decimal::new(15, 2)),
                min_amount: Some(Decimal::from(50)),
                max_amount: Some(Decimal::from(2000)),
            },
            CommissionRule {
                service_type: "vet_consult".to_string(),
                partner_type: None,
                rate: RateKind::Percentage(Decimal::new(10, 2)),
                min_amount: Some(Decimal::from(30)),
                max_amount: Some(Decimal::from(1500)),
            },
            CommissionRule {
                service_type: "boarding".to_string(),
                partner_type: None,
                rate: RateKind::Percentage(Decimal::new(12, 2)),
                min_amount: None,
                max_amount: Some(Decimal::from(5000)),
            },
            CommissionRule {
                service_type: "training".to_string(),
                partner_type: Some("certified".to_string()),
                rate: RateKind::Percentage(Decimal::new(8, 2)),
                min_amount: None,
                max_amount: None,
            },
            CommissionRule {
                service_type: "training".to_string(),
                partner_type: None,
                rate: RateKind::Percentage(Decimal::new(12, 2)),
                min_amount: None,
                max_amount: None,
            },
            CommissionRule {
                service_type: "adoption_listing".to_string(),
                partner_type: None,
                rate: RateKind::Flat(Decimal::from(99)),
                min_amount: None,
                max_amount: None,
            },
        ])
    }

    fn lookup(&self, service_type: &str, partner_type: &str) -> Option<&CommissionRule> {
        self.rules
            .iter()
            .find(|r| {
                r.service_type == service_type && r.partner_type.as_deref() == Some(partner_type)
            })
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|r| r.service_type == service_type && r.partner_type.is_none())
            })
    }
}

/// Result of a commission calculation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionQuote {
    pub rate: RateKind,
    /// Rounded to two decimal places, clamped to the rule's min/max
    pub commission_amount: Decimal,
}

/// Recorded commission row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PartnerCommission {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub service_type: String,
    pub base_amount: Decimal,
    pub commission_rate: serde_json::Value,
    pub commission_amount: Decimal,
    pub status: CommissionStatus,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
}

/// Commission calculator over an injected rate table. Deterministic,
/// pure, no I/O.
#[derive(Debug, Clone)]
pub struct CommissionCalculator {
    table: CommissionRateTable,
}

impl CommissionCalculator {
    pub fn new(table: CommissionRateTable) -> Self {
        Self { table }
    }

    pub fn calculate(
        &self,
        amount: Decimal,
        service_type: &str,
        partner_type: &str,
    ) -> BillingResult<CommissionQuote> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "Commission base amount must be positive, got {}",
                amount
            )));
        }

        let rule = self.table.lookup(service_type, partner_type).ok_or_else(|| {
            BillingError::Validation(format!("No commission rule for service type '{}'", service_type))
        })?;

        let raw = match rule.rate {
            RateKind::Percentage(rate) => amount * rate,
            RateKind::Flat(flat) => flat,
        };

        let mut commission = round2(raw);
        if let Some(min) = rule.min_amount {
            commission = commission.max(min);
        }
        if let Some(max) = rule.max_amount {
            commission = commission.min(max);
        }

        Ok(CommissionQuote {
            rate: rule.rate,
            commission_amount: commission,
        })
    }
}

/// Service recording commissions and driving payout status
pub struct CommissionService {
    pool: PgPool,
    calculator: CommissionCalculator,
}

impl CommissionService {
    pub fn new(pool: PgPool, calculator: CommissionCalculator) -> Self {
        Self { pool, calculator }
    }

    pub fn calculator(&self) -> &CommissionCalculator {
        &self.calculator
    }

    /// Compute and record commission for a settled partner transaction.
    /// The amount is derived exactly once; later payout steps only touch
    /// the status column.
    pub async fn record(
        &self,
        partner_id: PartnerId,
        service_type: &str,
        partner_type: &str,
        base_amount: Decimal,
    ) -> BillingResult<PartnerCommission> {
        let quote = self
            .calculator
            .calculate(base_amount, service_type, partner_type)?;

        let rate_json = serde_json::to_value(quote.rate)
            .map_err(|e| BillingError::Internal(format!("Failed to encode rate: {}", e)))?;

        let commission: PartnerCommission = sqlx::query_as(
            r#"
            INSERT INTO partner_commissions
                (partner_id, service_type, base_amount, commission_rate, commission_amount, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id, partner_id, service_type, base_amount, commission_rate,
                      commission_amount, status, created_at, paid_at
            "#,
        )
        .bind(partner_id.0)
        .bind(service_type)
        .bind(base_amount)
        .bind(rate_json)
        .bind(quote.commission_amount)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            partner_id = %partner_id,
            commission_id = %commission.id,
            service_type = %service_type,
            base_amount = %base_amount,
            commission_amount = %quote.commission_amount,
            "Recorded partner commission"
        );

        Ok(commission)
    }

    /// Move a pending commission into payout processing
    pub async fn mark_processing(&self, commission_id: Uuid) -> BillingResult<()> {
        self.transition(commission_id, CommissionStatus::Pending, CommissionStatus::Processing)
            .await
    }

    /// Mark a processing commission as paid out
    pub async fn mark_paid(&self, commission_id: Uuid) -> BillingResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE partner_commissions
            SET status = 'paid', paid_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(commission_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::StateConflict(format!(
                "Commission {} is not in processing state",
                commission_id
            )));
        }

        tracing::info!(commission_id = %commission_id, "Commission paid out");
        Ok(())
    }

    async fn transition(
        &self,
        commission_id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
    ) -> BillingResult<()> {
        let rows = sqlx::query(
            "UPDATE partner_commissions SET status = $1 WHERE id = $2 AND status = $3",
        )
        .bind(to)
        .bind(commission_id)
        .bind(from)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::StateConflict(format!(
                "Commission {} is not in {:?} state",
                commission_id, from
            )));
        }

        Ok(())
    }

    /// Pending commissions awaiting payout for a partner
    pub async fn pending_for_partner(
        &self,
        partner_id: PartnerId,
    ) -> BillingResult<Vec<PartnerCommission>> {
        let commissions: Vec<PartnerCommission> = sqlx::query_as(
            r#"
            SELECT id, partner_id, service_type, base_amount, commission_rate,
                   commission_amount, status, created_at, paid_at
            FROM partner_commissions
            WHERE partner_id = $1 AND status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .bind(partner_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(commissions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn calculator() -> CommissionCalculator {
        CommissionCalculator::new(CommissionRateTable::default_table())
    }

    #[test]
    fn test_percentage_commission() {
        let quote = calculator()
            .calculate(dec!(1000), "grooming", "individual")
            .unwrap();
        assert_eq!(quote.commission_amount, dec!(150.00));
    }

    #[test]
    fn test_min_clamp() {
        // 15% of 100 = 15, clamped up to the rule minimum of 50
        let quote = calculator()
            .calculate(dec!(100), "grooming", "individual")
            .unwrap();
        assert_eq!(quote.commission_amount, dec!(50));
    }

    #[test]
    fn test_max_clamp() {
        // 15% of 20000 = 3000, clamped down to 2000
        let quote = calculator()
            .calculate(dec!(20000), "grooming", "individual")
            .unwrap();
        assert_eq!(quote.commission_amount, dec!(2000));
    }

    #[test]
    fn test_partner_type_override_precedence() {
        let calc = calculator();
        let certified = calc.calculate(dec!(1000), "training", "certified").unwrap();
        let other = calc.calculate(dec!(1000), "training", "hobbyist").unwrap();
        assert_eq!(certified.commission_amount, dec!(80.00));
        assert_eq!(other.commission_amount, dec!(120.00));
    }

    #[test]
    fn test_flat_rate() {
        let quote = calculator()
            .calculate(dec!(5000), "adoption_listing", "shelter")
            .unwrap();
        assert_eq!(quote.commission_amount, dec!(99));
    }

    #[test]
    fn test_unknown_service_type() {
        assert!(matches!(
            calculator().calculate(dec!(100), "dog_walking", "individual"),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        assert!(matches!(
            calculator().calculate(dec!(0), "grooming", "individual"),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_rounding_to_minor_unit() {
        // 10% of 333.33 = 33.333 -> 33.33
        let quote = calculator()
            .calculate(dec!(333.33), "vet_consult", "clinic")
            .unwrap();
        assert_eq!(quote.commission_amount, dec!(33.33));
    }
}
