//! Order creation and payment completion
//!
//! Checkout flow: `create_order` prices the request, registers an order
//! with the gateway, and persists a PaymentOrder in `created` status.
//! `verify_and_complete` is the webhook-driven counterpart: it verifies
//! the gateway signature, then flips the order to `completed` exactly
//! once and applies the paid-for effect and the ledger write in the same
//! transaction. Redelivered callbacks observe the already-completed row
//! and return the prior result without side effects.

use pawket_shared::{
    from_minor_units, round2, to_minor_units, BillingCycle, DogId, PartnerId, PaymentOrderStatus,
    PaymentType, Plan, PlanCatalog, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{CreateGatewayOrder, CreateGatewayRefund, GatewayClient};
use crate::coupons::CouponService;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{stream_for_payment_type, RevenueLedger};
use crate::notify::{NotificationKind, NotificationOutbox};

pub const CURRENCY_INR: &str = "INR";

/// Tax and discount knobs applied when pricing an order
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// GST applied on the discounted subtotal
    pub tax_rate: Decimal,
    /// Discount on yearly-billed one-off services (plan prices already
    /// carry their own yearly pricing)
    pub yearly_discount: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.18),
            yearly_discount: dec!(0.10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub receipt: String,
    pub amount: Decimal,
    /// Pre-tax amount coupon validation ran against at checkout
    pub base_amount: Decimal,
    pub discount_amount: Decimal,
    pub currency: String,
    pub status: PaymentOrderStatus,
    pub payment_type: PaymentType,
    pub user_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub dog_id: Option<Uuid>,
    pub service_ref: Option<String>,
    pub plan_id: Option<String>,
    pub billing_cycle: Option<BillingCycle>,
    pub coupon_code: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub refunded_at: Option<OffsetDateTime>,
}

/// Checkout request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub user_id: UserId,
    pub payment_type: PaymentType,
    /// Base amount for service-style payments; ignored for plan-priced
    /// types, which take their price from the catalog
    pub amount: Option<Decimal>,
    pub plan_id: Option<String>,
    pub dog_id: Option<DogId>,
    pub partner_id: Option<PartnerId>,
    pub service_ref: Option<String>,
    pub billing_cycle: Option<BillingCycle>,
    pub coupon_code: Option<String>,
}

/// What the caller hands to the gateway checkout widget
#[derive(Debug, Clone, Serialize)]
pub struct OrderQuote {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub receipt: String,
    pub final_amount: Decimal,
    pub currency: String,
    pub discount: Decimal,
}

/// Result of `verify_and_complete`
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub order: PaymentOrder,
    /// False on redelivery, when the order was already completed
    pub newly_completed: bool,
}

/// Order and payment service
pub struct OrderService {
    pool: PgPool,
    gateway: GatewayClient,
    catalog: PlanCatalog,
    coupons: CouponService,
    ledger: RevenueLedger,
    outbox: NotificationOutbox,
    pricing: PricingConfig,
}

impl OrderService {
    pub fn new(pool: PgPool, gateway: GatewayClient, catalog: PlanCatalog) -> Self {
        Self {
            coupons: CouponService::new(pool.clone()),
            ledger: RevenueLedger::new(pool.clone()),
            outbox: NotificationOutbox::new(pool.clone()),
            pool,
            gateway,
            catalog,
            pricing: PricingConfig::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    /// Price the request, create the gateway order, persist the
    /// PaymentOrder in `created` status.
    pub async fn create_order(&self, req: CreateOrder) -> BillingResult<OrderQuote> {
        let plan = self.resolve_plan(&req)?;
        let base = self.base_amount(&req, plan.as_ref())?;

        let mut discount = Decimal::ZERO;
        if let Some(code) = &req.coupon_code {
            let quote = self
                .coupons
                .validate(code, req.user_id, base, req.plan_id.as_deref())
                .await?;
            discount = quote.discount;
        }

        let final_amount = price_order(
            base,
            discount,
            req.billing_cycle,
            req.payment_type,
            &self.pricing,
        )?;

        let receipt = format!("rcpt_{}", Uuid::new_v4().simple());

        let gateway_order = self
            .gateway
            .create_order(CreateGatewayOrder {
                amount: to_minor_units(final_amount),
                currency: CURRENCY_INR.to_string(),
                receipt: receipt.clone(),
                notes: Some(json!({
                    "user_id": req.user_id.to_string(),
                    "payment_type": req.payment_type,
                })),
            })
            .await?;

        let order_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO payment_orders
                (gateway_order_id, receipt, amount, base_amount, discount_amount, currency,
                 status, payment_type, user_id, partner_id, dog_id, service_ref,
                 plan_id, billing_cycle, coupon_code)
            VALUES ($1, $2, $3, $4, $5, $6, 'created', $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(&gateway_order.id)
        .bind(&receipt)
        .bind(final_amount)
        .bind(base)
        .bind(discount)
        .bind(CURRENCY_INR)
        .bind(req.payment_type)
        .bind(req.user_id.0)
        .bind(req.partner_id.map(|p| p.0))
        .bind(req.dog_id.map(|d| d.0))
        .bind(&req.service_ref)
        .bind(&req.plan_id)
        .bind(req.billing_cycle)
        .bind(&req.coupon_code)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            order_id = %order_id.0,
            gateway_order_id = %gateway_order.id,
            user_id = %req.user_id,
            payment_type = ?req.payment_type,
            amount = %final_amount,
            "Created payment order"
        );

        Ok(OrderQuote {
            order_id: order_id.0,
            gateway_order_id: gateway_order.id,
            receipt,
            final_amount,
            currency: CURRENCY_INR.to_string(),
            discount,
        })
    }

    /// Verify the gateway signature and complete the order exactly once.
    ///
    /// The status flip, the paid-for effect, the coupon redemption, and
    /// the ledger write commit in one transaction. A redelivered
    /// callback finds the row already completed and returns the prior
    /// result with `newly_completed = false`.
    pub async fn verify_and_complete(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> BillingResult<CompletionOutcome> {
        self.gateway
            .verify_payment_signature(gateway_order_id, gateway_payment_id, signature)?;

        let mut tx = self.pool.begin().await?;

        // Atomic claim: only the first delivery sees a 'created' row
        let claimed: Option<PaymentOrder> = sqlx::query_as(
            r#"
            UPDATE payment_orders
            SET status = 'completed', gateway_payment_id = $2, completed_at = NOW()
            WHERE gateway_order_id = $1 AND status = 'created'
            RETURNING id, gateway_order_id, gateway_payment_id, receipt, amount, base_amount, discount_amount, currency,
                      status, payment_type, user_id, partner_id, dog_id, service_ref,
                      plan_id, billing_cycle, coupon_code, created_at, completed_at, refunded_at
            "#,
        )
        .bind(gateway_order_id)
        .bind(gateway_payment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let order = match claimed {
            Some(order) => order,
            None => {
                tx.rollback().await?;
                return self.completion_replay(gateway_order_id).await;
            }
        };

        sqlx::query(
            r#"
            INSERT INTO payments (order_id, amount, currency, status, gateway_payment_id)
            VALUES ($1, $2, $3, 'paid', $4)
            "#,
        )
        .bind(order.id)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(gateway_payment_id)
        .execute(&mut *tx)
        .await?;

        // Redeem before the paid-for effect lands: a first-time check
        // against subscriptions must not see the subscription this very
        // order is about to create. Re-validation runs on the persisted
        // pre-tax base, the same figure checkout validated.
        let coupon_quote = match &order.coupon_code {
            Some(code) => Some(
                self.coupons
                    .apply_tx(
                        &mut tx,
                        code,
                        UserId(order.user_id),
                        order.id,
                        order.base_amount,
                        order.plan_id.as_deref(),
                    )
                    .await?,
            ),
            None => None,
        };

        self.apply_effect(&mut tx, &order).await?;

        if let Some(quote) = &coupon_quote {
            if quote.trial_extension_days > 0 {
                self.extend_trial(&mut tx, &order, quote.trial_extension_days)
                    .await?;
            }
        }

        self.ledger
            .record_payment_tx(
                &mut tx,
                stream_for_payment_type(order.payment_type),
                order.amount,
                &order.currency,
                None,
                gateway_payment_id,
                Some(UserId(order.user_id)),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            gateway_payment_id = %gateway_payment_id,
            payment_type = ?order.payment_type,
            "Completed payment order"
        );

        self.outbox
            .enqueue(
                UserId(order.user_id),
                NotificationKind::PaymentReceived,
                json!({ "order_id": order.id, "amount": order.amount }),
            )
            .await;

        Ok(CompletionOutcome {
            order,
            newly_completed: true,
        })
    }

    /// Verify a raw webhook body against its signature header before any
    /// of the body is trusted.
    pub fn verify_webhook(&self, raw_body: &[u8], signature: &str) -> BillingResult<()> {
        self.gateway.verify_webhook_signature(raw_body, signature)
    }

    /// Refund a completed order. Allowed once; the refunded_at claim
    /// makes a concurrent second refund a `StateConflict`.
    pub async fn refund(
        &self,
        order_id: Uuid,
        amount: Option<Decimal>,
        reason: Option<&str>,
    ) -> BillingResult<()> {
        // Claim before the gateway call so two refund requests cannot
        // both reach the gateway. The claim is the refunded_at marker;
        // the status flip waits for the ledger entry so the order never
        // reads refunded without its negative entry.
        let claimed: Option<PaymentOrder> = sqlx::query_as(
            r#"
            UPDATE payment_orders
            SET refunded_at = NOW()
            WHERE id = $1 AND status = 'completed' AND refunded_at IS NULL
            RETURNING id, gateway_order_id, gateway_payment_id, receipt, amount, base_amount, discount_amount, currency,
                      status, payment_type, user_id, partner_id, dog_id, service_ref,
                      plan_id, billing_cycle, coupon_code, created_at, completed_at, refunded_at
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let order = match claimed {
            Some(order) => order,
            None => {
                let existing: Option<PaymentOrder> = self.find_order(order_id).await?;
                return match existing {
                    None => Err(BillingError::NotFound(format!(
                        "Payment order {} not found",
                        order_id
                    ))),
                    Some(o)
                        if o.status == PaymentOrderStatus::Completed
                            && o.refunded_at.is_some() =>
                    {
                        Err(BillingError::StateConflict(format!(
                            "Refund already in progress for order {}",
                            order_id
                        )))
                    }
                    Some(o) => Err(BillingError::StateConflict(format!(
                        "Cannot refund order in status {:?}",
                        o.status
                    ))),
                };
            }
        };

        let gateway_payment_id = match &order.gateway_payment_id {
            Some(id) => id.clone(),
            None => {
                return Err(BillingError::Internal(
                    "Completed order has no gateway payment id".to_string(),
                ))
            }
        };

        let refund_amount = round2(amount.unwrap_or(order.amount).min(order.amount));

        let gateway_refund = match self
            .gateway
            .refund_payment(
                &gateway_payment_id,
                CreateGatewayRefund {
                    amount: Some(to_minor_units(refund_amount)),
                    notes: reason.map(|r| json!({ "reason": r })),
                },
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // Release the claim so the refund can be retried
                sqlx::query("UPDATE payment_orders SET refunded_at = NULL WHERE id = $1")
                    .bind(order.id)
                    .execute(&self.pool)
                    .await?;
                return Err(e);
            }
        };

        let original_entry = self
            .ledger
            .entry_for_external_id(&gateway_payment_id)
            .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE payment_orders SET status = 'refunded' WHERE id = $1")
            .bind(order.id)
            .execute(&mut *tx)
            .await?;
        self.ledger
            .record_refund_tx(
                &mut tx,
                stream_for_payment_type(order.payment_type),
                gateway_refund
                    .amount
                    .map(from_minor_units)
                    .unwrap_or(refund_amount),
                &order.currency,
                &gateway_refund.id,
                Some(UserId(order.user_id)),
                original_entry.map(|e| e.id),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            refund_id = %gateway_refund.id,
            amount = %refund_amount,
            "Refunded payment order"
        );

        self.outbox
            .enqueue(
                UserId(order.user_id),
                NotificationKind::RefundIssued,
                json!({ "order_id": order.id, "amount": refund_amount }),
            )
            .await;

        Ok(())
    }

    pub async fn find_order(&self, order_id: Uuid) -> BillingResult<Option<PaymentOrder>> {
        let order: Option<PaymentOrder> = sqlx::query_as(
            r#"
            SELECT id, gateway_order_id, gateway_payment_id, receipt, amount, base_amount, discount_amount, currency,
                   status, payment_type, user_id, partner_id, dog_id, service_ref,
                   plan_id, billing_cycle, coupon_code, created_at, completed_at, refunded_at
            FROM payment_orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn completion_replay(&self, gateway_order_id: &str) -> BillingResult<CompletionOutcome> {
        let existing: Option<PaymentOrder> = sqlx::query_as(
            r#"
            SELECT id, gateway_order_id, gateway_payment_id, receipt, amount, base_amount, discount_amount, currency,
                   status, payment_type, user_id, partner_id, dog_id, service_ref,
                   plan_id, billing_cycle, coupon_code, created_at, completed_at, refunded_at
            FROM payment_orders
            WHERE gateway_order_id = $1
            "#,
        )
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => Err(BillingError::NotFound(format!(
                "No payment order for gateway order {}",
                gateway_order_id
            ))),
            Some(order) if order.status == PaymentOrderStatus::Completed => {
                tracing::info!(
                    order_id = %order.id,
                    gateway_order_id = %gateway_order_id,
                    "Duplicate completion callback, returning prior result"
                );
                Ok(CompletionOutcome {
                    order,
                    newly_completed: false,
                })
            }
            Some(order) => Err(BillingError::StateConflict(format!(
                "Cannot complete order in status {:?}",
                order.status
            ))),
        }
    }

    /// The paid-for effect, dispatched on the order's payment type.
    /// Runs inside the completion transaction. Each variant has an
    /// explicit handler so a new type fails review, not silently.
    async fn apply_effect(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        match order.payment_type {
            PaymentType::Subscription => self.extend_membership(tx, order).await,
            PaymentType::PremiumService => self.extend_service_grant(tx, order).await,
            PaymentType::DogId => self.grant_dog_premium(tx, order).await,
            PaymentType::Appointment => Ok(()),
            PaymentType::PartnerSubscription => self.upsert_partner_subscription(tx, order).await,
            PaymentType::CommissionPayout => self.settle_commission(tx, order).await,
        }
    }

    /// Extend the user's membership grant. The new expiry is anchored on
    /// the later of the existing expiry and now, so an early renewal
    /// never shortens the grant. The UPDATE matches every status the
    /// one-current-subscription index counts as current, so a payment
    /// while paused or cancelling resumes the membership instead of
    /// colliding with it on insert.
    async fn extend_membership(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        let plan_id = order.plan_id.as_deref().ok_or_else(|| {
            BillingError::Internal("Subscription order has no plan id".to_string())
        })?;
        let plan = self.catalog.get(plan_id).ok_or_else(|| {
            BillingError::Internal(format!("Unknown plan {} on completed order", plan_id))
        })?;
        let cycle_days = plan.billing_cycle.cycle_days() as i32;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                amount_paid = amount_paid + $2,
                next_billing_date = GREATEST(next_billing_date, NOW()) + make_interval(days => $3),
                end_date = GREATEST(COALESCE(end_date, NOW()), NOW()) + make_interval(days => $3),
                paused_until = NULL,
                updated_at = NOW()
            WHERE user_id = $1
              AND status IN ('trialing', 'active', 'past_due', 'payment_method_required',
                             'paused', 'cancelling')
              AND product_line = 'membership'
            RETURNING id
            "#,
        )
        .bind(order.user_id)
        .bind(order.amount)
        .bind(cycle_days)
        .fetch_optional(&mut **tx)
        .await?;

        if updated.is_none() {
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (user_id, plan_id, product_line, status, billing_cycle, amount_paid,
                     start_date, next_billing_date, end_date, auto_renew)
                VALUES ($1, $2, 'membership', 'active', $3, $4,
                        NOW(), NOW() + make_interval(days => $5),
                        NOW() + make_interval(days => $5), TRUE)
                "#,
            )
            .bind(order.user_id)
            .bind(plan_id)
            .bind(plan.billing_cycle)
            .bind(order.amount)
            .bind(cycle_days)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Push the trial boundary out by the days a free-trial-extension
    /// coupon granted. Only a trialing membership has a trial to extend;
    /// a consumed coupon with nothing to move is logged, not failed.
    async fn extend_trial(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
        days: i64,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET trial_end_date = trial_end_date + make_interval(days => $2),
                next_billing_date = next_billing_date + make_interval(days => $2),
                updated_at = NOW()
            WHERE user_id = $1
              AND status = 'trialing'
              AND product_line = 'membership'
              AND trial_end_date IS NOT NULL
            "#,
        )
        .bind(order.user_id)
        .bind(days as i32)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                order_id = %order.id,
                user_id = %order.user_id,
                days = days,
                "Trial extension coupon applied without a trialing membership"
            );
        } else {
            tracing::info!(
                order_id = %order.id,
                user_id = %order.user_id,
                days = days,
                "Extended membership trial"
            );
        }

        Ok(())
    }

    async fn extend_service_grant(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        let service_ref = order.service_ref.as_deref().ok_or_else(|| {
            BillingError::Internal("Premium service order has no service ref".to_string())
        })?;
        let period_days = order
            .billing_cycle
            .map(|c| c.cycle_days())
            .unwrap_or(30) as i32;

        sqlx::query(
            r#"
            INSERT INTO service_grants (user_id, service_ref, expires_at)
            VALUES ($1, $2, NOW() + make_interval(days => $3))
            ON CONFLICT (user_id, service_ref)
            DO UPDATE SET expires_at =
                GREATEST(service_grants.expires_at, NOW()) + make_interval(days => $3)
            "#,
        )
        .bind(order.user_id)
        .bind(service_ref)
        .bind(period_days)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Dog ID purchase flips the premium flag with a fixed 1-year expiry
    async fn grant_dog_premium(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        let dog_id = order.dog_id.ok_or_else(|| {
            BillingError::Internal("Dog ID order has no dog reference".to_string())
        })?;

        sqlx::query(
            r#"
            INSERT INTO dog_premium (dog_id, premium_until)
            VALUES ($1, NOW() + INTERVAL '1 year')
            ON CONFLICT (dog_id)
            DO UPDATE SET premium_until = NOW() + INTERVAL '1 year'
            "#,
        )
        .bind(dog_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn upsert_partner_subscription(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        let partner_id = order.partner_id.ok_or_else(|| {
            BillingError::Internal("Partner subscription order has no partner".to_string())
        })?;

        sqlx::query(
            r#"
            INSERT INTO partner_subscriptions (partner_id, status, current_period_end)
            VALUES ($1, 'active', NOW() + INTERVAL '30 days')
            ON CONFLICT (partner_id)
            DO UPDATE SET status = 'active', current_period_end = NOW() + INTERVAL '30 days'
            "#,
        )
        .bind(partner_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// A payout settlement order marks the referenced commission paid
    async fn settle_commission(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &PaymentOrder,
    ) -> BillingResult<()> {
        let commission_id: Uuid = order
            .service_ref
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                BillingError::Internal(
                    "Commission payout order has no commission reference".to_string(),
                )
            })?;

        let updated = sqlx::query(
            r#"
            UPDATE partner_commissions
            SET status = 'paid', paid_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(commission_id)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::StateConflict(format!(
                "Commission {} is not awaiting payout",
                commission_id
            )));
        }

        Ok(())
    }

    fn resolve_plan(&self, req: &CreateOrder) -> BillingResult<Option<Plan>> {
        match req.payment_type {
            PaymentType::Subscription => {
                let plan_id = req.plan_id.as_deref().ok_or_else(|| {
                    BillingError::Validation("Subscription order requires a plan id".to_string())
                })?;
                let plan = self.catalog.get(plan_id).ok_or_else(|| {
                    BillingError::NotFound(format!("Unknown plan {}", plan_id))
                })?;
                Ok(Some(plan.clone()))
            }
            _ => Ok(None),
        }
    }

    fn base_amount(&self, req: &CreateOrder, plan: Option<&Plan>) -> BillingResult<Decimal> {
        if let Some(plan) = plan {
            return Ok(plan.price);
        }

        match req.payment_type {
            PaymentType::DogId if req.dog_id.is_none() => Err(BillingError::Validation(
                "Dog ID order requires a dog reference".to_string(),
            )),
            PaymentType::PartnerSubscription | PaymentType::CommissionPayout
                if req.partner_id.is_none() =>
            {
                Err(BillingError::Validation(
                    "Partner order requires a partner reference".to_string(),
                ))
            }
            PaymentType::PremiumService | PaymentType::Appointment
                if req.service_ref.is_none() =>
            {
                Err(BillingError::Validation(
                    "Service order requires a service reference".to_string(),
                ))
            }
            _ => {
                let amount = req.amount.ok_or_else(|| {
                    BillingError::Validation("Order amount is required".to_string())
                })?;
                if amount <= Decimal::ZERO {
                    return Err(BillingError::Validation(format!(
                        "Order amount must be positive, got {}",
                        amount
                    )));
                }
                Ok(amount)
            }
        }
    }
}

/// Pure pricing step: yearly discount on service-style payments, coupon
/// discount, then tax on the discounted subtotal.
pub fn price_order(
    base: Decimal,
    coupon_discount: Decimal,
    billing_cycle: Option<BillingCycle>,
    payment_type: PaymentType,
    pricing: &PricingConfig,
) -> BillingResult<Decimal> {
    let mut subtotal = base;

    // Plan prices already encode yearly pricing; the discount applies
    // to services billed per period
    let yearly_service = billing_cycle == Some(BillingCycle::Yearly)
        && matches!(
            payment_type,
            PaymentType::PremiumService | PaymentType::PartnerSubscription
        );
    if yearly_service {
        subtotal -= round2(base * pricing.yearly_discount);
    }

    subtotal = (subtotal - coupon_discount).max(Decimal::ZERO);

    let total = round2(subtotal * (Decimal::ONE + pricing.tax_rate));
    if total <= Decimal::ZERO {
        return Err(BillingError::Validation(
            "Order total must be positive after discounts".to_string(),
        ));
    }

    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    fn pricing() -> PricingConfig {
        PricingConfig::default()
    }

    #[test]
    fn test_plain_order_gets_taxed() {
        let total = price_order(
            dec!(100),
            Decimal::ZERO,
            None,
            PaymentType::Appointment,
            &pricing(),
        )
        .unwrap();
        assert_eq!(total, dec!(118.00));
    }

    #[test]
    fn test_yearly_service_discount() {
        // 500 - 10% = 450, taxed = 531.00
        let total = price_order(
            dec!(500),
            Decimal::ZERO,
            Some(BillingCycle::Yearly),
            PaymentType::PremiumService,
            &pricing(),
        )
        .unwrap();
        assert_eq!(total, dec!(531.00));
    }

    #[test]
    fn test_yearly_subscription_keeps_catalog_price() {
        // Plan prices carry their own yearly pricing, no extra discount
        let total = price_order(
            dec!(990),
            Decimal::ZERO,
            Some(BillingCycle::Yearly),
            PaymentType::Subscription,
            &pricing(),
        )
        .unwrap();
        assert_eq!(total, dec!(1168.20));
    }

    #[test]
    fn test_coupon_discount_before_tax() {
        // (199 - 39.80) * 1.18 = 187.86 (rounded 2dp, half away from zero)
        let total = price_order(
            dec!(199),
            dec!(39.80),
            Some(BillingCycle::Monthly),
            PaymentType::Subscription,
            &pricing(),
        )
        .unwrap();
        assert_eq!(total, dec!(187.86));
    }

    #[test]
    fn test_fully_discounted_order_rejected() {
        let res = price_order(
            dec!(99),
            dec!(99),
            None,
            PaymentType::Appointment,
            &pricing(),
        );
        assert!(res.is_err());
    }

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        pawket_shared::create_pool(&url).await.expect("pool")
    }

    fn test_gateway() -> GatewayClient {
        GatewayClient::new(crate::client::GatewayConfig {
            key_id: "test_key".to_string(),
            key_secret: "test_secret".to_string(),
            webhook_secret: "test_webhook_secret".to_string(),
            base_url: "http://localhost:1".to_string(),
            timeout: std::time::Duration::from_secs(1),
        })
        .expect("client")
    }

    fn test_service(pool: PgPool, gateway: GatewayClient) -> OrderService {
        OrderService::new(pool, gateway, pawket_shared::PlanCatalog::default_catalog())
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_completion_is_idempotent() {
        let pool = test_pool().await;
        let gateway = test_gateway();

        let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
        let user_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO payment_orders
                (gateway_order_id, receipt, amount, base_amount, currency, status,
                 payment_type, user_id, service_ref)
            VALUES ($1, 'rcpt_test', 118.00, 100.00, 'INR', 'created',
                    'appointment', $2, 'appt_1')
            "#,
        )
        .bind(&gateway_order_id)
        .bind(user_id)
        .execute(&pool)
        .await
        .expect("seed order");

        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let signature = gateway.payment_signature(&gateway_order_id, &payment_id);
        let service = test_service(pool.clone(), gateway);

        let first = service
            .verify_and_complete(&gateway_order_id, &payment_id, &signature)
            .await
            .expect("first completion");
        assert!(first.newly_completed);

        let second = service
            .verify_and_complete(&gateway_order_id, &payment_id, &signature)
            .await
            .expect("second completion");
        assert!(!second.newly_completed);
        assert_eq!(second.order.id, first.order.id);

        // Exactly one ledger entry for the payment
        let entries: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE external_id = $1")
                .bind(&payment_id)
                .fetch_one(&pool)
                .await
                .expect("count");
        assert_eq!(entries.0, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_first_time_coupon_completes_first_purchase() {
        let pool = test_pool().await;
        let gateway = test_gateway();

        let code = format!("FIRST{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO coupons (code, coupon_type, value, active, first_time_only)
            VALUES ($1, 'percentage', 20, TRUE, TRUE)
            "#,
        )
        .bind(&code)
        .execute(&pool)
        .await
        .expect("seed coupon");

        // buddy_monthly at 99: 20% off is 19.80, (99 - 19.80) * 1.18 = 93.46
        let user_id = Uuid::new_v4();
        let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO payment_orders
                (gateway_order_id, receipt, amount, base_amount, discount_amount, currency,
                 status, payment_type, user_id, plan_id, billing_cycle, coupon_code)
            VALUES ($1, 'rcpt_test', 93.46, 99.00, 19.80, 'INR',
                    'created', 'subscription', $2, 'buddy_monthly', 'monthly', $3)
            "#,
        )
        .bind(&gateway_order_id)
        .bind(user_id)
        .bind(&code)
        .execute(&pool)
        .await
        .expect("seed order");

        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let signature = gateway.payment_signature(&gateway_order_id, &payment_id);
        let service = test_service(pool.clone(), gateway);

        // The user's very first purchase must redeem its own coupon
        let outcome = service
            .verify_and_complete(&gateway_order_id, &payment_id, &signature)
            .await
            .expect("first purchase completes");
        assert!(outcome.newly_completed);

        let usages: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM coupon_usages WHERE order_id = $1")
                .bind(outcome.order.id)
                .fetch_one(&pool)
                .await
                .expect("usages");
        assert_eq!(usages.0, 1);

        let status: (String,) = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE user_id = $1 AND product_line = 'membership'",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("subscription");
        assert_eq!(status.0, "active");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_completion_resumes_paused_membership() {
        let pool = test_pool().await;
        let gateway = test_gateway();

        let user_id = Uuid::new_v4();
        let sub_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, product_line, status, billing_cycle,
                 next_billing_date, paused_until)
            VALUES ($1, 'family_monthly', 'membership', 'paused', 'monthly',
                    NOW() + INTERVAL '10 days', NOW() + INTERVAL '10 days')
            RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("seed subscription");

        let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO payment_orders
                (gateway_order_id, receipt, amount, base_amount, currency, status,
                 payment_type, user_id, plan_id, billing_cycle)
            VALUES ($1, 'rcpt_test', 234.82, 199.00, 'INR', 'created',
                    'subscription', $2, 'family_monthly', 'monthly')
            "#,
        )
        .bind(&gateway_order_id)
        .bind(user_id)
        .execute(&pool)
        .await
        .expect("seed order");

        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let signature = gateway.payment_signature(&gateway_order_id, &payment_id);
        let service = test_service(pool.clone(), gateway);

        let outcome = service
            .verify_and_complete(&gateway_order_id, &payment_id, &signature)
            .await
            .expect("renewal while paused completes");
        assert!(outcome.newly_completed);

        let row: (String, Option<OffsetDateTime>) =
            sqlx::query_as("SELECT status, paused_until FROM subscriptions WHERE id = $1")
                .bind(sub_id.0)
                .fetch_one(&pool)
                .await
                .expect("subscription");
        assert_eq!(row.0, "active");
        assert!(row.1.is_none());

        // Extended in place, no second membership row
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&pool)
                .await
                .expect("count");
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_trial_extension_coupon_moves_trial_boundary() {
        let pool = test_pool().await;
        let gateway = test_gateway();

        let user_id = Uuid::new_v4();
        let sub_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, product_line, status, billing_cycle,
                 trial_end_date, next_billing_date)
            VALUES ($1, 'family_monthly', 'membership', 'trialing', 'monthly',
                    NOW() + INTERVAL '14 days', NOW() + INTERVAL '44 days')
            RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("seed subscription");

        let code = format!("TRIAL{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO coupons (code, coupon_type, value, active)
            VALUES ($1, 'free_trial_extension', 7, TRUE)
            "#,
        )
        .bind(&code)
        .execute(&pool)
        .await
        .expect("seed coupon");

        let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO payment_orders
                (gateway_order_id, receipt, amount, base_amount, currency, status,
                 payment_type, user_id, service_ref, coupon_code)
            VALUES ($1, 'rcpt_test', 118.00, 100.00, 'INR', 'created',
                    'appointment', $2, 'appt_1', $3)
            "#,
        )
        .bind(&gateway_order_id)
        .bind(user_id)
        .bind(&code)
        .execute(&pool)
        .await
        .expect("seed order");

        let before: (OffsetDateTime, OffsetDateTime) = sqlx::query_as(
            "SELECT trial_end_date, next_billing_date FROM subscriptions WHERE id = $1",
        )
        .bind(sub_id.0)
        .fetch_one(&pool)
        .await
        .expect("before");

        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let signature = gateway.payment_signature(&gateway_order_id, &payment_id);
        let service = test_service(pool.clone(), gateway);

        service
            .verify_and_complete(&gateway_order_id, &payment_id, &signature)
            .await
            .expect("completion");

        let after: (OffsetDateTime, OffsetDateTime) = sqlx::query_as(
            "SELECT trial_end_date, next_billing_date FROM subscriptions WHERE id = $1",
        )
        .bind(sub_id.0)
        .fetch_one(&pool)
        .await
        .expect("after");

        assert_eq!(after.0 - before.0, time::Duration::days(7));
        assert_eq!(after.1 - before.1, time::Duration::days(7));
    }
}
