//! Subscription lifecycle manager
//!
//! Owns the subscription state machine:
//!
//! ```text
//! trialing -> active <-> past_due -> (suspended | active)
//! active -> cancelling -> cancelled
//! active <-> paused              (pausable plans only)
//! past_due -> payment_method_required
//! ```
//!
//! `cancelled` and `suspended` are terminal; `suspended` requires
//! manual reactivation. One active-or-trialing subscription per user
//! per product line, enforced with a row lock here and a partial
//! unique index in the schema.

use pawket_shared::{
    round2, BillingCycle, Plan, PlanCatalog, ProductLine, SubscriptionStatus, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notify::{NotificationKind, NotificationOutbox};
use crate::proration::{days_until, prorata_refund, ChangeMode, ProrationCalculator, ProrationQuote};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub product_line: ProductLine,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub amount_paid: Decimal,
    pub start_date: OffsetDateTime,
    pub trial_end_date: Option<OffsetDateTime>,
    pub next_billing_date: OffsetDateTime,
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub paused_until: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    /// Gateway-side customer and saved token for off-session charges
    pub gateway_customer_id: Option<String>,
    pub gateway_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Result of `change_plan`
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub subscription_id: Uuid,
    pub new_plan_id: String,
    pub mode: ChangeMode,
    /// Signed adjustment; positive is a charge, negative a credit.
    /// Zero for next-cycle changes.
    pub proration: ProrationQuote,
    /// When a next-cycle change takes effect
    pub effective_at: Option<OffsetDateTime>,
}

/// Result of `cancel`
#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub end_date: OffsetDateTime,
    /// Pro-rata refund due for immediate cancellation, zero at period end
    pub refund_due: Decimal,
}

const SELECT_COLUMNS: &str = "id, user_id, plan_id, product_line, status, billing_cycle, \
     amount_paid, start_date, trial_end_date, next_billing_date, end_date, auto_renew, \
     paused_until, cancel_reason, gateway_customer_id, gateway_token, created_at, updated_at";

/// Subscription lifecycle service
pub struct SubscriptionService {
    pool: PgPool,
    catalog: PlanCatalog,
    outbox: NotificationOutbox,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self {
            outbox: NotificationOutbox::new(pool.clone()),
            pool,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Create a new subscription in `trialing` (or `active` when the
    /// plan has no trial). Rejects if the user already holds a current
    /// subscription on the same product line.
    pub async fn subscribe(&self, user_id: UserId, plan_id: &str) -> BillingResult<Subscription> {
        let plan = self.plan(plan_id)?.clone();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid, SubscriptionStatus)> = sqlx::query_as(
            r#"
            SELECT id, status FROM subscriptions
            WHERE user_id = $1 AND product_line = $2
              AND status IN ('trialing', 'active', 'past_due', 'payment_method_required', 'paused', 'cancelling')
            FOR UPDATE
            "#,
        )
        .bind(user_id.0)
        .bind(plan.product_line)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id, status)) = existing {
            tx.rollback().await?;
            return Err(BillingError::StateConflict(format!(
                "Subscription {} already {:?}; use change_plan instead",
                id, status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let (status, trial_end, next_billing) = initial_schedule(&plan, now);

        let sub: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, product_line, status, billing_cycle, amount_paid,
                 start_date, trial_end_date, next_billing_date, auto_renew)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, TRUE)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(user_id.0)
        .bind(&plan.id)
        .bind(plan.product_line)
        .bind(status)
        .bind(plan.billing_cycle)
        .bind(now)
        .bind(trial_end)
        .bind(next_billing)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            plan_id = %plan.id,
            status = ?sub.status,
            "Created subscription"
        );

        self.outbox
            .enqueue(
                user_id,
                NotificationKind::SubscriptionStarted,
                json!({ "plan_id": plan.id, "trial_end": trial_end }),
            )
            .await;

        Ok(sub)
    }

    /// Change plan mid-cycle.
    ///
    /// `immediate` applies the new plan now and returns the signed
    /// proration amount, recorded as a pending payment. `next_cycle`
    /// schedules the change for the current next-billing date and
    /// leaves the subscription untouched.
    pub async fn change_plan(
        &self,
        user_id: UserId,
        new_plan_id: &str,
        mode: ChangeMode,
    ) -> BillingResult<PlanChangeOutcome> {
        let new_plan = self.plan(new_plan_id)?.clone();

        let mut tx = self.pool.begin().await?;
        let sub = self
            .lock_current(&mut tx, user_id, new_plan.product_line)
            .await?;

        // An unpaid balance must be settled before the plan can move,
        // so a downgrade cannot mask it
        if matches!(
            sub.status,
            SubscriptionStatus::PastDue | SubscriptionStatus::PaymentMethodRequired
        ) {
            tx.rollback().await?;
            return Err(BillingError::PaymentRequired);
        }
        if !matches!(
            sub.status,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active
        ) {
            tx.rollback().await?;
            return Err(BillingError::StateConflict(format!(
                "Cannot change plan while {:?}",
                sub.status
            )));
        }
        if sub.plan_id == new_plan.id {
            tx.rollback().await?;
            return Err(BillingError::Validation(format!(
                "Subscription is already on plan {}",
                new_plan.id
            )));
        }

        let current_plan = self.plan(&sub.plan_id)?.clone();
        let now = OffsetDateTime::now_utc();
        let quote = ProrationCalculator::new().quote(
            &current_plan,
            &new_plan,
            sub.next_billing_date,
            now,
            mode,
        );

        let outcome = match mode {
            ChangeMode::Immediate => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET plan_id = $2, billing_cycle = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(sub.id)
                .bind(&new_plan.id)
                .bind(new_plan.billing_cycle)
                .execute(&mut *tx)
                .await?;

                if !quote.amount.is_zero() {
                    sqlx::query(
                        r#"
                        INSERT INTO payments (subscription_id, amount, currency, status)
                        VALUES ($1, $2, 'INR', 'pending')
                        "#,
                    )
                    .bind(sub.id)
                    .bind(quote.amount)
                    .execute(&mut *tx)
                    .await?;
                }

                PlanChangeOutcome {
                    subscription_id: sub.id,
                    new_plan_id: new_plan.id.clone(),
                    mode,
                    proration: quote,
                    effective_at: None,
                }
            }
            ChangeMode::NextCycle => {
                // One pending change per subscription; a newer request
                // replaces it
                sqlx::query(
                    r#"
                    INSERT INTO scheduled_plan_changes (subscription_id, new_plan_id, effective_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (subscription_id) WHERE NOT applied
                    DO UPDATE SET new_plan_id = $2, effective_at = $3
                    "#,
                )
                .bind(sub.id)
                .bind(&new_plan.id)
                .bind(sub.next_billing_date)
                .execute(&mut *tx)
                .await?;

                PlanChangeOutcome {
                    subscription_id: sub.id,
                    new_plan_id: new_plan.id.clone(),
                    mode,
                    proration: quote,
                    effective_at: Some(sub.next_billing_date),
                }
            }
        };

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            from_plan = %sub.plan_id,
            to_plan = %new_plan.id,
            mode = ?mode,
            proration = %outcome.proration.amount,
            "Changed subscription plan"
        );

        self.outbox
            .enqueue(
                user_id,
                NotificationKind::SubscriptionPlanChanged,
                json!({
                    "from_plan": sub.plan_id,
                    "to_plan": new_plan.id,
                    "proration": outcome.proration.amount,
                    "effective_at": outcome.effective_at,
                }),
            )
            .await;

        Ok(outcome)
    }

    /// Cancel a subscription. At period end the subscription keeps
    /// serving until the boundary with no refund; immediate cancellation
    /// ends it now and computes a pro-rata refund on the unused days.
    pub async fn cancel(
        &self,
        user_id: UserId,
        product_line: ProductLine,
        at_period_end: bool,
        reason: Option<&str>,
    ) -> BillingResult<CancellationOutcome> {
        let mut tx = self.pool.begin().await?;
        let sub = self.lock_current(&mut tx, user_id, product_line).await?;

        if matches!(
            sub.status,
            SubscriptionStatus::Cancelling | SubscriptionStatus::Cancelled
        ) {
            tx.rollback().await?;
            return Err(BillingError::StateConflict(format!(
                "Subscription {} is already cancelled",
                sub.id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let outcome = if at_period_end {
            let end = sub.next_billing_date;
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'cancelling', end_date = $2, auto_renew = FALSE,
                    cancel_reason = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(sub.id)
            .bind(end)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

            CancellationOutcome {
                subscription_id: sub.id,
                status: SubscriptionStatus::Cancelling,
                end_date: end,
                refund_due: Decimal::ZERO,
            }
        } else {
            let cycle_days = sub.billing_cycle.cycle_days();
            let remaining = days_until(sub.next_billing_date, now);
            let refund = prorata_refund(sub.amount_paid, remaining, cycle_days);

            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'cancelled', end_date = $2, auto_renew = FALSE,
                    cancel_reason = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(sub.id)
            .bind(now)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

            if refund > Decimal::ZERO {
                sqlx::query(
                    r#"
                    INSERT INTO payments (subscription_id, amount, currency, status)
                    VALUES ($1, $2, 'INR', 'pending')
                    "#,
                )
                .bind(sub.id)
                .bind(-refund)
                .execute(&mut *tx)
                .await?;
            }

            CancellationOutcome {
                subscription_id: sub.id,
                status: SubscriptionStatus::Cancelled,
                end_date: now,
                refund_due: refund,
            }
        };

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            at_period_end = at_period_end,
            refund_due = %outcome.refund_due,
            "Cancelled subscription"
        );

        self.outbox
            .enqueue(
                user_id,
                NotificationKind::SubscriptionCancelled,
                json!({ "end_date": outcome.end_date, "refund_due": outcome.refund_due }),
            )
            .await;

        Ok(outcome)
    }

    /// Pause an active subscription, permitted only on plans flagged
    /// pausable. Extends the end of the paid period by the pause length.
    pub async fn pause(
        &self,
        user_id: UserId,
        product_line: ProductLine,
        days: i64,
    ) -> BillingResult<Subscription> {
        if days <= 0 {
            return Err(BillingError::Validation(format!(
                "Pause length must be positive, got {} days",
                days
            )));
        }

        let mut tx = self.pool.begin().await?;
        let sub = self.lock_current(&mut tx, user_id, product_line).await?;

        let plan = self.plan(&sub.plan_id)?;
        if !plan.pausable {
            tx.rollback().await?;
            return Err(BillingError::StateConflict(format!(
                "Plan {} cannot be paused",
                plan.id
            )));
        }
        if sub.status != SubscriptionStatus::Active {
            tx.rollback().await?;
            return Err(BillingError::StateConflict(format!(
                "Only active subscriptions can pause, currently {:?}",
                sub.status
            )));
        }

        let resume_at = OffsetDateTime::now_utc() + Duration::days(days);
        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'paused',
                paused_until = $2,
                next_billing_date = next_billing_date + make_interval(days => $3),
                end_date = COALESCE(end_date, next_billing_date) + make_interval(days => $3),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(sub.id)
        .bind(resume_at)
        .bind(days as i32)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            days = days,
            resume_at = %resume_at,
            "Paused subscription"
        );

        self.outbox
            .enqueue(
                user_id,
                NotificationKind::SubscriptionPaused,
                json!({ "resume_at": resume_at }),
            )
            .await;

        Ok(updated)
    }

    /// Return a subscription to `active`. Used by the retry engine
    /// after a successful retry, to resume a pause, and by support to
    /// lift a suspension.
    pub async fn reactivate(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let updated: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'active', paused_until = NULL, updated_at = NOW()
            WHERE id = $1
              AND status IN ('past_due', 'payment_method_required', 'paused', 'suspended')
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let sub = updated.ok_or_else(|| {
            BillingError::StateConflict(format!(
                "Subscription {} is not in a reactivatable state",
                subscription_id
            ))
        })?;

        tracing::info!(subscription_id = %sub.id, "Reactivated subscription");

        self.outbox
            .enqueue_simple(UserId(sub.user_id), NotificationKind::SubscriptionResumed)
            .await;

        Ok(sub)
    }

    /// Terminal suspension after exhausted retries. Manual reactivation
    /// only.
    pub async fn suspend(&self, subscription_id: Uuid, reason: &str) -> BillingResult<()> {
        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'suspended', cancel_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('cancelled', 'suspended')
            RETURNING user_id
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        let user = updated.ok_or_else(|| {
            BillingError::StateConflict(format!(
                "Subscription {} cannot be suspended",
                subscription_id
            ))
        })?;

        tracing::warn!(
            subscription_id = %subscription_id,
            reason = %reason,
            "Suspended subscription"
        );

        self.outbox
            .enqueue(
                UserId(user.0),
                NotificationKind::SubscriptionSuspended,
                json!({ "reason": reason }),
            )
            .await;

        Ok(())
    }

    /// Flag an unpaid subscription while retries run
    pub async fn mark_past_due(&self, subscription_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'trialing')
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-retryable failure escalation: the user must supply a new
    /// payment method
    pub async fn mark_payment_method_required(&self, subscription_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'payment_method_required', updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_for_user(
        &self,
        user_id: UserId,
        product_line: ProductLine,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND product_line = $2
              AND status IN ('trialing', 'active', 'past_due', 'payment_method_required', 'paused', 'cancelling')
            "#
        ))
        .bind(user_id.0)
        .bind(product_line)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn find(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| {
            BillingError::NotFound(format!("Subscription {} not found", subscription_id))
        })
    }

    /// Apply due next-cycle plan changes. Worker entry point; claims a
    /// batch with SKIP LOCKED so concurrent workers never double-apply.
    pub async fn apply_due_plan_changes(&self, limit: i64) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let due: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, new_plan_id
            FROM scheduled_plan_changes
            WHERE NOT applied AND effective_at <= NOW()
            ORDER BY effective_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut applied = 0u64;
        for (change_id, subscription_id, new_plan_id) in due {
            let plan = match self.catalog.get(&new_plan_id) {
                Some(p) => p,
                None => {
                    tracing::error!(
                        change_id = %change_id,
                        plan_id = %new_plan_id,
                        "Scheduled change references unknown plan, skipping"
                    );
                    continue;
                }
            };

            sqlx::query(
                r#"
                UPDATE subscriptions
                SET plan_id = $2, billing_cycle = $3, updated_at = NOW()
                WHERE id = $1 AND status IN ('trialing', 'active', 'paused')
                "#,
            )
            .bind(subscription_id)
            .bind(&plan.id)
            .bind(plan.billing_cycle)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE scheduled_plan_changes SET applied = TRUE, applied_at = NOW() WHERE id = $1",
            )
            .bind(change_id)
            .execute(&mut *tx)
            .await?;

            tracing::info!(
                subscription_id = %subscription_id,
                plan_id = %plan.id,
                "Applied scheduled plan change"
            );
            applied += 1;
        }

        tx.commit().await?;
        Ok(applied)
    }

    /// Move `cancelling` subscriptions past their period boundary to
    /// `cancelled`. Worker entry point.
    pub async fn finalize_due_cancellations(&self, limit: i64) -> BillingResult<u64> {
        let finalized: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM subscriptions
                WHERE status = 'cancelling' AND end_date <= NOW()
                ORDER BY end_date
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in &finalized {
            tracing::info!(subscription_id = %id, "Finalized cancellation at period end");
        }

        Ok(finalized.len() as u64)
    }

    async fn lock_current(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: UserId,
        product_line: ProductLine,
    ) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND product_line = $2
              AND status IN ('trialing', 'active', 'past_due', 'payment_method_required', 'paused', 'cancelling')
            FOR UPDATE
            "#
        ))
        .bind(user_id.0)
        .bind(product_line)
        .fetch_optional(&mut **tx)
        .await?;

        sub.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No current {:?} subscription for user {}",
                product_line, user_id
            ))
        })
    }

    fn plan(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.catalog
            .get(plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("Unknown plan {}", plan_id)))
    }
}

/// Initial status and billing schedule for a fresh subscription
fn initial_schedule(
    plan: &Plan,
    now: OffsetDateTime,
) -> (SubscriptionStatus, Option<OffsetDateTime>, OffsetDateTime) {
    let cycle = Duration::days(plan.billing_cycle.cycle_days());
    if plan.trial_days > 0 {
        let trial_end = now + Duration::days(plan.trial_days);
        (SubscriptionStatus::Trialing, Some(trial_end), trial_end + cycle)
    } else {
        (SubscriptionStatus::Active, None, now + cycle)
    }
}

/// Pro-rata refund for an immediate cancellation, exposed for callers
/// that want to preview before cancelling
pub fn preview_cancellation_refund(
    amount_paid: Decimal,
    next_billing_date: OffsetDateTime,
    cycle: BillingCycle,
    now: OffsetDateTime,
) -> Decimal {
    let remaining = days_until(next_billing_date, now);
    round2(prorata_refund(amount_paid, remaining, cycle.cycle_days()))
}
