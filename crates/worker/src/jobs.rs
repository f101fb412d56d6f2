//! Scheduled billing jobs
//!
//! Each job is a full pass over its due work. Jobs log and swallow
//! per-item failures so one bad row never stalls the loop, and they
//! tolerate overlapping runs: the underlying operations are guarded by
//! status claims, so a row seen twice is processed once.

use pawket_billing::dunning::RetryOutcome;
use pawket_billing::{DunningEngine, SubscriptionService};
use tracing::{error, info, warn};

const BATCH_SIZE: i64 = 50;

/// Execute payment retries whose scheduled time has arrived
pub async fn process_due_retries(engine: &DunningEngine) {
    let due = match engine.due_retries(BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to fetch due retries");
            return;
        }
    };

    if due.is_empty() {
        return;
    }

    info!(count = due.len(), "Executing due payment retries");

    for retry_id in due {
        match engine.execute_retry(retry_id).await {
            Ok(RetryOutcome::Succeeded { gateway_payment_id }) => {
                info!(
                    retry_id = %retry_id,
                    gateway_payment_id = %gateway_payment_id,
                    "Retry succeeded"
                );
            }
            Ok(RetryOutcome::Failed { next }) => {
                warn!(retry_id = %retry_id, next = ?next, "Retry failed");
            }
            Ok(RetryOutcome::Noop) => {}
            Err(e) => {
                error!(retry_id = %retry_id, error = %e, "Retry execution errored");
            }
        }
    }
}

/// Apply next-cycle plan changes that have reached their billing date
pub async fn apply_scheduled_changes(subscriptions: &SubscriptionService) {
    match subscriptions.apply_due_plan_changes(BATCH_SIZE).await {
        Ok(0) => {}
        Ok(applied) => info!(applied = applied, "Applied scheduled plan changes"),
        Err(e) => error!(error = %e, "Failed to apply scheduled plan changes"),
    }
}

/// Move cancelling subscriptions past their period boundary to cancelled
pub async fn finalize_cancellations(subscriptions: &SubscriptionService) {
    match subscriptions.finalize_due_cancellations(BATCH_SIZE).await {
        Ok(0) => {}
        Ok(finalized) => info!(finalized = finalized, "Finalized cancellations"),
        Err(e) => error!(error = %e, "Failed to finalize cancellations"),
    }
}
