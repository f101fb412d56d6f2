//! Payment retry and dunning engine
//!
//! A state machine driven by external time. Failed recurring payments
//! get a fixed retry schedule persisted as `payment_retries` rows; an
//! external scheduler invokes `execute_retry` when `scheduled_at`
//! arrives. No in-process timers, so retries survive restarts. Both
//! entry points are re-entrant: `execute_retry` on a non-scheduled row
//! is a no-op, and attempt numbering is derived from the persisted
//! rows of the current failure episode.

use std::collections::HashSet;

use pawket_shared::{
    to_minor_units, CampaignStatus, PlanCatalog, RetryStatus, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::{CreateRecurringCharge, GatewayClient};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{revenue_stream, RevenueLedger};
use crate::notify::{NotificationKind, NotificationOutbox};
use crate::subscriptions::{Subscription, SubscriptionService};

/// Retry attempts per failure episode before suspension
pub const MAX_RETRY_ATTEMPTS: i64 = 4;

/// Window that bounds one failure episode
pub const EPISODE_WINDOW_DAYS: i64 = 30;

/// How a retry attempt charges the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryMethod {
    SameMethod,
    AlternativeMethod,
    ManualIntervention,
}

/// One slot in the fixed retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub attempt: i64,
    /// Delay from the failure that triggered this attempt
    pub delay_days: i64,
    pub method: RetryMethod,
    /// Whether the subscription keeps serving while this attempt waits
    pub grace_active: bool,
}

/// The fixed per-attempt schedule. Attempt numbers beyond the table
/// mean the episode is exhausted.
pub fn retry_step(attempt: i64) -> Option<RetryStep> {
    match attempt {
        1 => Some(RetryStep { attempt, delay_days: 1, method: RetryMethod::SameMethod, grace_active: true }),
        2 => Some(RetryStep { attempt, delay_days: 3, method: RetryMethod::SameMethod, grace_active: true }),
        3 => Some(RetryStep { attempt, delay_days: 7, method: RetryMethod::AlternativeMethod, grace_active: true }),
        4 => Some(RetryStep { attempt, delay_days: 14, method: RetryMethod::ManualIntervention, grace_active: false }),
        _ => None,
    }
}

/// Classification of a gateway failure code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
    /// Code in neither list. Treated as retryable but flagged so the
    /// deny list can be extended deliberately.
    NeedsReview,
}

/// Allow/deny table for gateway failure codes. Immutable configuration
/// injected into the engine; codes in neither set are never guessed at.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: HashSet<String>,
    non_retryable: HashSet<String>,
}

impl ErrorClassifier {
    pub fn new(
        retryable: impl IntoIterator<Item = String>,
        non_retryable: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            retryable: retryable.into_iter().collect(),
            non_retryable: non_retryable.into_iter().collect(),
        }
    }

    pub fn classify(&self, error_code: &str) -> FailureClass {
        let code = error_code.to_ascii_lowercase();
        if self.non_retryable.contains(&code) {
            FailureClass::NonRetryable
        } else if self.retryable.contains(&code) {
            FailureClass::Retryable
        } else {
            FailureClass::NeedsReview
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(
            [
                "gateway_error",
                "network_error",
                "timeout",
                "bank_unavailable",
                "processing_error",
                "insufficient_funds",
            ]
            .map(str::to_string),
            [
                "card_expired",
                "card_blocked",
                "card_lost",
                "card_stolen",
                "invalid_card",
                "authentication_failed",
                "account_closed",
                "fraud_suspected",
            ]
            .map(str::to_string),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRetry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub attempt_number: i64,
    pub scheduled_at: OffsetDateTime,
    pub attempted_at: Option<OffsetDateTime>,
    pub status: RetryStatus,
    pub retry_method: RetryMethod,
    pub failure_reason: Option<String>,
    pub grace_period_active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DunningCampaign {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub campaign_type: String,
    pub current_step: i32,
    pub total_steps: i32,
    pub next_action_date: Option<OffsetDateTime>,
    pub communications_sent: i32,
    pub response_received: bool,
    pub status: CampaignStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Outcome of `handle_failure`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// A retry was scheduled
    RetryScheduled {
        retry_id: Uuid,
        attempt_number: i64,
        scheduled_at: OffsetDateTime,
        grace_deadline: OffsetDateTime,
    },
    /// Non-retryable failure; the user must replace the payment method
    PaymentMethodRequired,
    /// Episode exhausted; subscription suspended
    Suspended,
}

/// Outcome of `execute_retry`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Retry was not in `scheduled` status; nothing happened
    Noop,
    Succeeded { gateway_payment_id: String },
    /// Charge failed; `next` describes the follow-up
    Failed { next: Box<FailureOutcome> },
}

const RETRY_COLUMNS: &str = "id, subscription_id, payment_id, attempt_number, scheduled_at, \
     attempted_at, status, retry_method, failure_reason, grace_period_active, created_at";

/// Retry and dunning engine
pub struct DunningEngine {
    pool: PgPool,
    gateway: GatewayClient,
    subscriptions: SubscriptionService,
    ledger: RevenueLedger,
    outbox: NotificationOutbox,
    classifier: ErrorClassifier,
}

impl DunningEngine {
    pub fn new(pool: PgPool, gateway: GatewayClient, catalog: PlanCatalog) -> Self {
        Self {
            subscriptions: SubscriptionService::new(pool.clone(), catalog),
            ledger: RevenueLedger::new(pool.clone()),
            outbox: NotificationOutbox::new(pool.clone()),
            pool,
            gateway,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// React to a failed recurring payment: classify the failure,
    /// schedule the next retry per the fixed table or escalate, and
    /// keep the dunning campaign in step. Always notifies the user.
    pub async fn handle_failure(
        &self,
        payment_id: Option<Uuid>,
        subscription_id: Uuid,
        reason: &str,
        error_code: &str,
    ) -> BillingResult<FailureOutcome> {
        let sub = self.subscriptions.find(subscription_id).await?;
        let user_id = UserId(sub.user_id);

        let class = self.classifier.classify(error_code);
        if class == FailureClass::NeedsReview {
            tracing::warn!(
                subscription_id = %subscription_id,
                error_code = %error_code,
                "Unclassified gateway failure code, retrying conservatively"
            );
        }

        if class == FailureClass::NonRetryable {
            self.subscriptions
                .mark_payment_method_required(subscription_id)
                .await?;
            self.cancel_campaign(subscription_id).await?;
            self.outbox
                .enqueue(
                    user_id,
                    NotificationKind::PaymentMethodRequired,
                    json!({ "reason": reason, "error_code": error_code }),
                )
                .await;

            tracing::warn!(
                subscription_id = %subscription_id,
                error_code = %error_code,
                "Non-retryable payment failure"
            );
            return Ok(FailureOutcome::PaymentMethodRequired);
        }

        let now = OffsetDateTime::now_utc();
        let window_start = now - Duration::days(EPISODE_WINDOW_DAYS);

        let (prior_attempts, episode_start): (i64, Option<OffsetDateTime>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM payment_retries
            WHERE subscription_id = $1 AND created_at >= $2
            "#,
        )
        .bind(subscription_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let attempt = prior_attempts + 1;
        let step = match retry_step(attempt) {
            Some(step) => step,
            None => {
                self.subscriptions
                    .suspend(subscription_id, "Payment retries exhausted")
                    .await?;
                self.complete_campaign(subscription_id).await?;

                tracing::warn!(
                    subscription_id = %subscription_id,
                    attempts = prior_attempts,
                    "Retry episode exhausted, subscription suspended"
                );
                return Ok(FailureOutcome::Suspended);
            }
        };

        let scheduled_at = now + Duration::days(step.delay_days);
        let grace_deadline = episode_start.unwrap_or(now) + Duration::days(14);

        let retry: PaymentRetry = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_retries
                (subscription_id, payment_id, attempt_number, scheduled_at, status,
                 retry_method, failure_reason, grace_period_active)
            VALUES ($1, $2, $3, $4, 'scheduled', $5, $6, $7)
            RETURNING {RETRY_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(payment_id)
        .bind(attempt)
        .bind(scheduled_at)
        .bind(step.method)
        .bind(reason)
        .bind(step.grace_active)
        .fetch_one(&self.pool)
        .await?;

        self.subscriptions.mark_past_due(subscription_id).await?;
        self.open_or_advance_campaign(user_id, subscription_id, scheduled_at)
            .await?;

        self.outbox
            .enqueue(
                user_id,
                NotificationKind::PaymentRetryScheduled,
                json!({
                    "attempt": attempt,
                    "retry_date": scheduled_at,
                    "grace_deadline": grace_deadline,
                }),
            )
            .await;

        tracing::info!(
            subscription_id = %subscription_id,
            retry_id = %retry.id,
            attempt = attempt,
            scheduled_at = %scheduled_at,
            method = ?step.method,
            "Scheduled payment retry"
        );

        Ok(FailureOutcome::RetryScheduled {
            retry_id: retry.id,
            attempt_number: attempt,
            scheduled_at,
            grace_deadline,
        })
    }

    /// Execute a due retry. Invoked by the external scheduler; safe to
    /// invoke more than once, the status claim makes re-entry a no-op.
    pub async fn execute_retry(&self, retry_id: Uuid) -> BillingResult<RetryOutcome> {
        // Claim: only a 'scheduled' row can move to 'attempting'
        let claimed: Option<PaymentRetry> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_retries
            SET status = 'attempting', attempted_at = NOW()
            WHERE id = $1 AND status = 'scheduled'
            RETURNING {RETRY_COLUMNS}
            "#
        ))
        .bind(retry_id)
        .fetch_optional(&self.pool)
        .await?;

        let retry = match claimed {
            Some(retry) => retry,
            None => {
                tracing::debug!(retry_id = %retry_id, "Retry already executed, skipping");
                return Ok(RetryOutcome::Noop);
            }
        };

        let sub = self.subscriptions.find(retry.subscription_id).await?;

        match self.attempt_charge(&retry, &sub).await {
            Ok(gateway_payment_id) => {
                self.finish_success(&retry, &sub, &gateway_payment_id).await?;
                Ok(RetryOutcome::Succeeded { gateway_payment_id })
            }
            Err(e) => {
                let code = failure_code(&e);
                sqlx::query(
                    "UPDATE payment_retries SET status = 'failed', failure_reason = $2 WHERE id = $1",
                )
                .bind(retry.id)
                .bind(e.to_string())
                .execute(&self.pool)
                .await?;

                tracing::warn!(
                    retry_id = %retry.id,
                    subscription_id = %retry.subscription_id,
                    attempt = retry.attempt_number,
                    error = %e,
                    "Retry attempt failed"
                );

                let next = self
                    .handle_failure(retry.payment_id, retry.subscription_id, &e.to_string(), code)
                    .await?;
                Ok(RetryOutcome::Failed { next: Box::new(next) })
            }
        }
    }

    async fn attempt_charge(
        &self,
        retry: &PaymentRetry,
        sub: &Subscription,
    ) -> BillingResult<String> {
        let customer_id = sub.gateway_customer_id.clone().ok_or_else(|| {
            BillingError::Gateway("Subscription has no gateway customer".to_string())
        })?;
        let token = sub.gateway_token.clone().ok_or_else(|| {
            BillingError::Gateway("Subscription has no saved payment token".to_string())
        })?;

        // Alternative-method attempts would pick a different saved
        // token; with a single token on file the charge is identical
        let payment = self
            .gateway
            .charge_recurring(CreateRecurringCharge {
                amount: to_minor_units(self.plan_price(sub)?),
                currency: "INR".to_string(),
                customer_id,
                token,
                recurring: "1".to_string(),
                description: Some(format!(
                    "Renewal retry {} for {}",
                    retry.attempt_number, sub.plan_id
                )),
            })
            .await?;

        Ok(payment.id)
    }

    fn plan_price(&self, sub: &Subscription) -> BillingResult<rust_decimal::Decimal> {
        self.subscriptions
            .catalog()
            .get(&sub.plan_id)
            .map(|p| p.price)
            .ok_or_else(|| {
                BillingError::Internal(format!("Unknown plan {} on subscription", sub.plan_id))
            })
    }

    async fn finish_success(
        &self,
        retry: &PaymentRetry,
        sub: &Subscription,
        gateway_payment_id: &str,
    ) -> BillingResult<()> {
        let amount = self.plan_price(sub)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE payment_retries SET status = 'succeeded' WHERE id = $1")
            .bind(retry.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO payments (subscription_id, amount, currency, status, gateway_payment_id)
            VALUES ($1, $2, 'INR', 'paid', $3)
            "#,
        )
        .bind(sub.id)
        .bind(amount)
        .bind(gateway_payment_id)
        .execute(&mut *tx)
        .await?;

        self.ledger
            .record_payment_tx(
                &mut tx,
                revenue_stream::MEMBERSHIPS,
                amount,
                "INR",
                None,
                gateway_payment_id,
                Some(UserId(sub.user_id)),
            )
            .await?;

        tx.commit().await?;

        match self.subscriptions.reactivate(sub.id).await {
            Ok(_) => {}
            Err(BillingError::StateConflict(_)) => {
                // Already active, nothing to restore
            }
            Err(e) => return Err(e),
        }
        self.cancel_campaign(sub.id).await?;

        self.outbox
            .enqueue(
                UserId(sub.user_id),
                NotificationKind::PaymentReceived,
                json!({ "amount": amount, "attempt": retry.attempt_number }),
            )
            .await;

        tracing::info!(
            retry_id = %retry.id,
            subscription_id = %sub.id,
            attempt = retry.attempt_number,
            "Payment retry succeeded, subscription reactivated"
        );

        Ok(())
    }

    /// At most one active campaign per subscription
    async fn open_or_advance_campaign(
        &self,
        user_id: UserId,
        subscription_id: Uuid,
        next_action: OffsetDateTime,
    ) -> BillingResult<()> {
        let advanced = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET current_step = current_step + 1,
                communications_sent = communications_sent + 1,
                next_action_date = $2,
                updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .bind(next_action)
        .execute(&self.pool)
        .await?;

        if advanced.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO dunning_campaigns
                    (user_id, subscription_id, campaign_type, current_step, total_steps,
                     next_action_date, communications_sent, status)
                VALUES ($1, $2, 'payment_recovery', 1, $3, $4, 1, 'active')
                ON CONFLICT (subscription_id) WHERE status = 'active'
                DO NOTHING
                "#,
            )
            .bind(user_id.0)
            .bind(subscription_id)
            .bind(MAX_RETRY_ATTEMPTS as i32)
            .bind(next_action)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn cancel_campaign(&self, subscription_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = 'cancelled', updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_campaign(&self, subscription_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = 'completed', updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Due retries for the scheduler to execute. Overlapping scheduler
    /// runs may both see a row; the status claim in `execute_retry`
    /// makes the loser a no-op.
    pub async fn due_retries(&self, limit: i64) -> BillingResult<Vec<Uuid>> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM payment_retries
            WHERE status = 'scheduled' AND scheduled_at <= NOW()
            ORDER BY scheduled_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(due.into_iter().map(|(id,)| id).collect())
    }

    pub async fn active_campaign(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<DunningCampaign>> {
        let campaign: Option<DunningCampaign> = sqlx::query_as(
            r#"
            SELECT id, user_id, subscription_id, campaign_type, current_step, total_steps,
                   next_action_date, communications_sent, response_received, status,
                   created_at, updated_at
            FROM dunning_campaigns
            WHERE subscription_id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(campaign)
    }
}

/// Map an internal error to a gateway failure code for reclassification
fn failure_code(e: &BillingError) -> &'static str {
    match e {
        BillingError::GatewayTimeout => "timeout",
        BillingError::Gateway(_) => "gateway_error",
        _ => "processing_error",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use crate::client::GatewayConfig;

    #[test]
    fn test_schedule_delays_and_methods() {
        let steps: Vec<_> = (1..=4).filter_map(retry_step).collect();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].delay_days, 1);
        assert_eq!(steps[1].delay_days, 3);
        assert_eq!(steps[2].delay_days, 7);
        assert_eq!(steps[3].delay_days, 14);
        assert_eq!(steps[0].method, RetryMethod::SameMethod);
        assert_eq!(steps[1].method, RetryMethod::SameMethod);
        assert_eq!(steps[2].method, RetryMethod::AlternativeMethod);
        assert_eq!(steps[3].method, RetryMethod::ManualIntervention);
    }

    #[test]
    fn test_grace_ends_on_final_attempt() {
        assert!(retry_step(3).map(|s| s.grace_active).unwrap_or(false));
        assert!(!retry_step(4).map(|s| s.grace_active).unwrap_or(true));
    }

    #[test]
    fn test_fifth_attempt_exhausts_schedule() {
        // Four prior attempts in the episode mean the next failure
        // suspends instead of creating a fifth row
        assert!(retry_step(5).is_none());
        assert!(retry_step(4).is_some());
    }

    #[test]
    fn test_classifier_deny_list_wins() {
        let c = ErrorClassifier::default();
        assert_eq!(c.classify("card_expired"), FailureClass::NonRetryable);
        assert_eq!(c.classify("CARD_EXPIRED"), FailureClass::NonRetryable);
        assert_eq!(c.classify("insufficient_funds"), FailureClass::Retryable);
    }

    #[test]
    fn test_unknown_code_flagged_for_review() {
        let c = ErrorClassifier::default();
        assert_eq!(c.classify("mystery_code_42"), FailureClass::NeedsReview);
    }

    #[test]
    fn test_custom_classifier_tables() {
        let c = ErrorClassifier::new(
            ["soft_fail".to_string()],
            ["hard_fail".to_string()],
        );
        assert_eq!(c.classify("soft_fail"), FailureClass::Retryable);
        assert_eq!(c.classify("hard_fail"), FailureClass::NonRetryable);
        assert_eq!(c.classify("gateway_error"), FailureClass::NeedsReview);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_failure_after_four_attempts_suspends_without_fifth_row() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = pawket_shared::create_pool(&url).await.expect("pool");

        let gateway = GatewayClient::new(GatewayConfig {
            key_id: "test_key".to_string(),
            key_secret: "test_secret".to_string(),
            webhook_secret: "test_webhook_secret".to_string(),
            base_url: "http://localhost:1".to_string(),
            timeout: std::time::Duration::from_secs(1),
        })
        .expect("client");

        let user_id = Uuid::new_v4();
        let sub_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, product_line, status, billing_cycle, next_billing_date)
            VALUES ($1, 'buddy_monthly', 'membership', 'past_due', 'monthly', NOW())
            RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("seed subscription");

        // Four failed attempts already recorded in the current episode
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            sqlx::query(
                r#"
                INSERT INTO payment_retries
                    (subscription_id, attempt_number, scheduled_at, status, retry_method)
                VALUES ($1, $2, NOW(), 'failed', 'same_method')
                "#,
            )
            .bind(sub_id.0)
            .bind(attempt)
            .execute(&pool)
            .await
            .expect("seed retry");
        }

        let engine = DunningEngine::new(pool.clone(), gateway, PlanCatalog::default_catalog());
        let outcome = engine
            .handle_failure(None, sub_id.0, "card declined", "insufficient_funds")
            .await
            .expect("handle failure");
        assert!(matches!(outcome, FailureOutcome::Suspended));

        let status: (String,) =
            sqlx::query_as("SELECT status FROM subscriptions WHERE id = $1")
                .bind(sub_id.0)
                .fetch_one(&pool)
                .await
                .expect("status");
        assert_eq!(status.0, "suspended");

        // The exhausting failure records no fifth retry row
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payment_retries WHERE subscription_id = $1")
                .bind(sub_id.0)
                .fetch_one(&pool)
                .await
                .expect("count");
        assert_eq!(count.0, MAX_RETRY_ATTEMPTS);
    }
}
