//! User notification outbox
//!
//! Billing operations enqueue notifications into an outbox table instead
//! of calling delivery channels directly. A delivery worker drains the
//! table out of band, so a slow or down mail provider never blocks a
//! payment path. Callers treat enqueue as fire-and-forget.

use pawket_shared::UserId;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Outbox message kinds, matched by the delivery worker to channel
/// templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentReceived,
    PaymentFailed,
    PaymentRetryScheduled,
    PaymentMethodRequired,
    SubscriptionStarted,
    SubscriptionPlanChanged,
    SubscriptionCancelled,
    SubscriptionPaused,
    SubscriptionResumed,
    SubscriptionSuspended,
    RefundIssued,
    CommissionPaid,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentReceived => "payment_received",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::PaymentRetryScheduled => "payment_retry_scheduled",
            NotificationKind::PaymentMethodRequired => "payment_method_required",
            NotificationKind::SubscriptionStarted => "subscription_started",
            NotificationKind::SubscriptionPlanChanged => "subscription_plan_changed",
            NotificationKind::SubscriptionCancelled => "subscription_cancelled",
            NotificationKind::SubscriptionPaused => "subscription_paused",
            NotificationKind::SubscriptionResumed => "subscription_resumed",
            NotificationKind::SubscriptionSuspended => "subscription_suspended",
            NotificationKind::RefundIssued => "refund_issued",
            NotificationKind::CommissionPaid => "commission_paid",
        }
    }
}

/// Enqueues notifications for out-of-band delivery
#[derive(Clone)]
pub struct NotificationOutbox {
    pool: PgPool,
}

impl NotificationOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a notification. Errors are logged and swallowed so
    /// notification failures never fail the billing operation that
    /// triggered them.
    pub async fn enqueue(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.try_enqueue(user_id, kind, payload).await {
            tracing::warn!(
                user_id = %user_id,
                kind = %kind.as_str(),
                error = %e,
                "Failed to enqueue notification"
            );
        }
    }

    async fn try_enqueue(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notification_outbox (user_id, kind, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(user_id.0)
        .bind(kind.as_str())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }

    /// Convenience for the common empty payload case
    pub async fn enqueue_simple(&self, user_id: UserId, kind: NotificationKind) {
        self.enqueue(user_id, kind, json!({})).await;
    }
}
