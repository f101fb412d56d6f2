//! Coupon validation and redemption
//!
//! Validation runs a fixed sequence of checks and reports the first
//! failure, so callers get one actionable rejection reason at a time.
//! Redemption re-validates under a row lock on the coupon, which
//! serializes concurrent claims against the global usage cap.

use pawket_shared::{round2, CouponType, UserId};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub coupon_type: CouponType,
    /// Percentage (0-100), fixed amount in rupees, or trial days
    pub value: Decimal,
    pub active: bool,
    pub valid_from: Option<OffsetDateTime>,
    pub valid_until: Option<OffsetDateTime>,
    pub minimum_order_amount: Option<Decimal>,
    pub maximum_discount_amount: Option<Decimal>,
    /// When non-empty, the coupon only applies to these plan ids
    pub applicable_plans: Option<Vec<String>>,
    pub first_time_only: bool,
    pub max_uses: Option<i64>,
    pub max_uses_per_user: Option<i64>,
    pub use_count: i64,
    pub created_at: OffsetDateTime,
}

/// Outcome of a successful validation
#[derive(Debug, Clone, Serialize)]
pub struct CouponQuote {
    pub coupon_id: Uuid,
    pub code: String,
    pub coupon_type: CouponType,
    pub discount: Decimal,
    /// Extra trial days granted, for free-trial-extension coupons
    pub trial_extension_days: i64,
}

/// Coupon validation and redemption against the coupon tables
pub struct CouponService {
    pool: PgPool,
}

impl CouponService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validate a coupon code for an order without consuming a use.
    ///
    /// Checks run in a fixed order and short-circuit on the first
    /// failure: active, date window, minimum order amount, plan
    /// applicability, first-time-only, global cap, per-user cap.
    pub async fn validate(
        &self,
        code: &str,
        user_id: UserId,
        order_amount: Decimal,
        plan_id: Option<&str>,
    ) -> BillingResult<CouponQuote> {
        let coupon = self
            .find_by_code(code)
            .await?
            .ok_or_else(|| BillingError::CouponRejected("Coupon not found".to_string()))?;

        let user_uses = self.user_use_count(coupon.id, user_id).await?;
        let has_prior_subscription = self.user_has_subscription(user_id).await?;

        check_coupon(
            &coupon,
            order_amount,
            plan_id,
            user_uses,
            has_prior_subscription,
            OffsetDateTime::now_utc(),
        )?;

        Ok(quote(&coupon, order_amount))
    }

    /// Consume a coupon use inside the caller's transaction.
    ///
    /// Locks the coupon row, re-runs validation so the global cap is
    /// checked against a current count, then bumps `use_count` and
    /// records the usage.
    pub async fn apply_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
        user_id: UserId,
        order_id: Uuid,
        order_amount: Decimal,
        plan_id: Option<&str>,
    ) -> BillingResult<CouponQuote> {
        let coupon: Option<Coupon> = sqlx::query_as(
            r#"
            SELECT id, code, coupon_type, value, active, valid_from, valid_until,
                   minimum_order_amount, maximum_discount_amount, applicable_plans,
                   first_time_only, max_uses, max_uses_per_user, use_count, created_at
            FROM coupons
            WHERE code = $1
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;

        let coupon =
            coupon.ok_or_else(|| BillingError::CouponRejected("Coupon not found".to_string()))?;

        let user_uses: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM coupon_usages WHERE coupon_id = $1 AND user_id = $2",
        )
        .bind(coupon.id)
        .bind(user_id.0)
        .fetch_one(&mut **tx)
        .await?;

        // First-time means no subscription of any status. The count runs
        // before the completing order's own subscription effect, so a
        // first purchase does not disqualify itself.
        let prior_subs: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_one(&mut **tx)
                .await?;

        check_coupon(
            &coupon,
            order_amount,
            plan_id,
            user_uses.0,
            prior_subs.0 > 0,
            OffsetDateTime::now_utc(),
        )?;

        sqlx::query("UPDATE coupons SET use_count = use_count + 1 WHERE id = $1")
            .bind(coupon.id)
            .execute(&mut **tx)
            .await?;

        let q = quote(&coupon, order_amount);

        sqlx::query(
            r#"
            INSERT INTO coupon_usages (coupon_id, user_id, order_id, discount_amount)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(coupon.id)
        .bind(user_id.0)
        .bind(order_id)
        .bind(q.discount)
        .execute(&mut **tx)
        .await?;

        tracing::info!(
            coupon_code = %coupon.code,
            user_id = %user_id,
            order_id = %order_id,
            discount = %q.discount,
            "Applied coupon"
        );

        Ok(q)
    }

    async fn find_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let coupon: Option<Coupon> = sqlx::query_as(
            r#"
            SELECT id, code, coupon_type, value, active, valid_from, valid_until,
                   minimum_order_amount, maximum_discount_amount, applicable_plans,
                   first_time_only, max_uses, max_uses_per_user, use_count, created_at
            FROM coupons
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(coupon)
    }

    async fn user_use_count(&self, coupon_id: Uuid, user_id: UserId) -> BillingResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM coupon_usages WHERE coupon_id = $1 AND user_id = $2",
        )
        .bind(coupon_id)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    /// A subscription of any status counts against first-time-only
    async fn user_has_subscription(&self, user_id: UserId) -> BillingResult<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0 > 0)
    }
}

fn check_coupon(
    coupon: &Coupon,
    order_amount: Decimal,
    plan_id: Option<&str>,
    user_uses: i64,
    has_prior_subscription: bool,
    now: OffsetDateTime,
) -> BillingResult<()> {
    if !coupon.active {
        return Err(BillingError::CouponRejected(
            "Coupon is no longer active".to_string(),
        ));
    }

    if let Some(from) = coupon.valid_from {
        if now < from {
            return Err(BillingError::CouponRejected(
                "Coupon is not yet valid".to_string(),
            ));
        }
    }
    if let Some(until) = coupon.valid_until {
        if now > until {
            return Err(BillingError::CouponRejected(
                "Coupon has expired".to_string(),
            ));
        }
    }

    if let Some(min) = coupon.minimum_order_amount {
        if order_amount < min {
            return Err(BillingError::CouponRejected(format!(
                "Order amount below minimum of {}",
                min
            )));
        }
    }

    if let Some(plans) = &coupon.applicable_plans {
        if !plans.is_empty() {
            let applies = plan_id.map(|p| plans.iter().any(|a| a == p)).unwrap_or(false);
            if !applies {
                return Err(BillingError::CouponRejected(
                    "Coupon does not apply to this plan".to_string(),
                ));
            }
        }
    }

    if coupon.first_time_only && has_prior_subscription {
        return Err(BillingError::CouponRejected(
            "Coupon is for first-time subscribers only".to_string(),
        ));
    }

    if let Some(max) = coupon.max_uses {
        if coupon.use_count >= max {
            return Err(BillingError::CouponRejected(
                "Coupon usage limit reached".to_string(),
            ));
        }
    }

    if let Some(max) = coupon.max_uses_per_user {
        if user_uses >= max {
            return Err(BillingError::CouponRejected(
                "You have already used this coupon".to_string(),
            ));
        }
    }

    Ok(())
}

fn quote(coupon: &Coupon, order_amount: Decimal) -> CouponQuote {
    let (discount, trial_days) = match coupon.coupon_type {
        CouponType::Percentage => {
            let raw = round2(order_amount * coupon.value / dec!(100));
            (raw, 0)
        }
        CouponType::FixedAmount => (coupon.value.min(order_amount), 0),
        CouponType::FreeTrialExtension => {
            (Decimal::ZERO, coupon.value.trunc().to_i64().unwrap_or(0))
        }
    };

    let discount = match coupon.maximum_discount_amount {
        Some(cap) => discount.min(cap),
        None => discount,
    };

    CouponQuote {
        coupon_id: coupon.id,
        code: coupon.code.clone(),
        coupon_type: coupon.coupon_type,
        discount: round2(discount),
        trial_extension_days: trial_days,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    fn test_coupon() -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            code: "WELCOME20".to_string(),
            coupon_type: CouponType::Percentage,
            value: dec!(20),
            active: true,
            valid_from: None,
            valid_until: None,
            minimum_order_amount: None,
            maximum_discount_amount: None,
            applicable_plans: None,
            first_time_only: false,
            max_uses: None,
            max_uses_per_user: None,
            use_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_percentage_discount() {
        let q = quote(&test_coupon(), dec!(199));
        assert_eq!(q.discount, dec!(39.80));
    }

    #[test]
    fn test_fixed_discount_capped_at_order_amount() {
        let mut c = test_coupon();
        c.coupon_type = CouponType::FixedAmount;
        c.value = dec!(500);
        let q = quote(&c, dec!(99));
        assert_eq!(q.discount, dec!(99));
    }

    #[test]
    fn test_maximum_discount_cap() {
        let mut c = test_coupon();
        c.value = dec!(50);
        c.maximum_discount_amount = Some(dec!(100));
        let q = quote(&c, dec!(1990));
        assert_eq!(q.discount, dec!(100));
    }

    #[test]
    fn test_trial_extension_has_no_discount() {
        let mut c = test_coupon();
        c.coupon_type = CouponType::FreeTrialExtension;
        c.value = dec!(7);
        let q = quote(&c, dec!(199));
        assert_eq!(q.discount, Decimal::ZERO);
        assert_eq!(q.trial_extension_days, 7);
    }

    #[test]
    fn test_inactive_rejected_first() {
        let mut c = test_coupon();
        c.active = false;
        // Also expired, but the active check fires first
        c.valid_until = Some(OffsetDateTime::now_utc() - time::Duration::days(1));
        let err = check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc())
            .unwrap_err();
        assert!(err.to_string().contains("no longer active"));
    }

    #[test]
    fn test_expired_rejected() {
        let mut c = test_coupon();
        c.valid_until = Some(OffsetDateTime::now_utc() - time::Duration::days(1));
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_not_yet_valid_rejected() {
        let mut c = test_coupon();
        c.valid_from = Some(OffsetDateTime::now_utc() + time::Duration::days(1));
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_minimum_order_amount() {
        let mut c = test_coupon();
        c.minimum_order_amount = Some(dec!(500));
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_err());
        assert!(check_coupon(&c, dec!(500), None, 0, false, OffsetDateTime::now_utc()).is_ok());
    }

    #[test]
    fn test_plan_applicability() {
        let mut c = test_coupon();
        c.applicable_plans = Some(vec!["family_monthly".to_string()]);
        assert!(check_coupon(
            &c,
            dec!(199),
            Some("buddy_monthly"),
            0,
            false,
            OffsetDateTime::now_utc()
        )
        .is_err());
        assert!(check_coupon(
            &c,
            dec!(199),
            Some("family_monthly"),
            0,
            false,
            OffsetDateTime::now_utc()
        )
        .is_ok());
        // Order without a plan cannot use a plan-restricted coupon
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_first_time_only() {
        let mut c = test_coupon();
        c.first_time_only = true;
        assert!(check_coupon(&c, dec!(199), None, 0, true, OffsetDateTime::now_utc()).is_err());
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_ok());
    }

    #[test]
    fn test_global_cap() {
        let mut c = test_coupon();
        c.max_uses = Some(100);
        c.use_count = 100;
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_per_user_cap() {
        let mut c = test_coupon();
        c.max_uses_per_user = Some(1);
        assert!(check_coupon(&c, dec!(199), None, 1, false, OffsetDateTime::now_utc()).is_err());
        assert!(check_coupon(&c, dec!(199), None, 0, false, OffsetDateTime::now_utc()).is_ok());
    }

    async fn try_apply(pool: PgPool, code: String, order_id: Uuid) -> bool {
        let service = CouponService::new(pool.clone());
        let mut tx = pool.begin().await.expect("tx");
        match service
            .apply_tx(&mut tx, &code, UserId(Uuid::new_v4()), order_id, dec!(199), None)
            .await
        {
            Ok(_) => {
                tx.commit().await.expect("commit");
                true
            }
            Err(BillingError::CouponRejected(_)) => {
                tx.rollback().await.expect("rollback");
                false
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_global_cap_holds_under_concurrent_redemption() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = pawket_shared::create_pool(&url).await.expect("pool");

        let code = format!("CAP{}", Uuid::new_v4().simple());
        let coupon_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO coupons (code, coupon_type, value, active, max_uses)
            VALUES ($1, 'percentage', 10, TRUE, 1)
            RETURNING id
            "#,
        )
        .bind(&code)
        .fetch_one(&pool)
        .await
        .expect("seed coupon");

        let mut order_ids = Vec::new();
        for _ in 0..2 {
            let id: (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO payment_orders
                    (gateway_order_id, receipt, amount, base_amount, currency, status,
                     payment_type, user_id, service_ref)
                VALUES ($1, 'rcpt_test', 118.00, 100.00, 'INR', 'created',
                        'appointment', $2, 'appt_1')
                RETURNING id
                "#,
            )
            .bind(format!("order_{}", Uuid::new_v4().simple()))
            .bind(Uuid::new_v4())
            .fetch_one(&pool)
            .await
            .expect("seed order");
            order_ids.push(id.0);
        }

        // The row lock in apply_tx serializes the two claims; the loser
        // re-validates against the bumped count and is rejected
        let (a, b) = tokio::join!(
            try_apply(pool.clone(), code.clone(), order_ids[0]),
            try_apply(pool.clone(), code.clone(), order_ids[1]),
        );
        assert!(a != b, "exactly one of two concurrent applies must win");

        let use_count: (i64,) =
            sqlx::query_as("SELECT use_count FROM coupons WHERE id = $1")
                .bind(coupon_id.0)
                .fetch_one(&pool)
                .await
                .expect("use count");
        assert_eq!(use_count.0, 1);
    }
}
