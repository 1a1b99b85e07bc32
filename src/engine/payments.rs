//! Money actions and the booking payment state machine.
//!
//! Every action that can move money runs in three phases: open a
//! pending attempt under the booking lock, call the gateway with no
//! locks held, then re-lock and settle the attempt. The pending row is
//! the in-flight guard; a second action on the same booking sees it and
//! backs off instead of racing the gateway.

use std::time::{Duration, Instant};

use ulid::Ulid;

use crate::gateway::{ChargeRequest, GatewayCharge, GatewayError, RefundRequest};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::claim::now_ms;
use super::{apply_to_booking, apply_to_card, pricing, Engine, EngineError};

/// One requested money action. `amount_cents` is accepted for refunds
/// only; every other action computes its amount from the booking.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub booking_id: Ulid,
    pub action: MoneyAction,
    pub amount_cents: Option<i64>,
    pub idempotency_key: Option<String>,
}

/// Notification event name for a settled action.
fn action_event(action: MoneyAction) -> &'static str {
    match action {
        MoneyAction::Complete => "booking_completed",
        MoneyAction::NoShow => "booking_no_show",
        MoneyAction::Cancel => "booking_cancelled",
        MoneyAction::Refund => "booking_refunded",
    }
}

fn outcome_for(b: &BookingState, a: &PaymentAttempt) -> ActionOutcome {
    ActionOutcome {
        booking_id: b.id,
        action: a.action,
        status: b.status,
        payment_status: b.payment_status,
        amount_cents: a.amount_cents,
        attempt_status: Some(a.status),
        external_ref: a.external_ref.clone(),
    }
}

/// True when the gateway definitively refused an attempt. Timeouts,
/// outages, and restart repairs stay uncertain; the charge may exist on
/// the gateway side, so the next try must reuse the same idempotency
/// key and let the gateway dedup it.
fn definitive_failure(a: &PaymentAttempt) -> bool {
    matches!(&a.failure,
        Some(f) if f.starts_with("declined") || f.starts_with("requires action"))
}

/// What phase two will send over the wire, assembled under the lock.
enum GatewayCall {
    Charge(ChargeRequest),
    Refund(RefundRequest),
}

type Flattened = Result<GatewayCharge, (String, EngineError)>;

fn flatten_gateway(
    result: Result<Result<GatewayCharge, GatewayError>, tokio::time::error::Elapsed>,
    booking_id: Ulid,
) -> Flattened {
    match result {
        Ok(Ok(charge)) => Ok(charge),
        Ok(Err(GatewayError::Declined(r))) => {
            Err((format!("declined: {r}"), EngineError::Declined(r)))
        }
        Ok(Err(GatewayError::RequiresAction(r))) => Err((
            format!("requires action: {r}"),
            EngineError::RequiresAction(booking_id),
        )),
        Ok(Err(GatewayError::Unavailable(r))) => Err((
            format!("unavailable: {r}"),
            EngineError::GatewayUnavailable(r),
        )),
        Err(_) => {
            metrics::counter!(observability::GATEWAY_TIMEOUTS_TOTAL).increment(1);
            Err(("gateway timeout".into(), EngineError::GatewayTimeout))
        }
    }
}

impl Engine {
    /// Drive one money action through the state machine.
    ///
    /// Complete, no-show, and cancel are legal from pending or
    /// card_saved; refund is legal from any settled status that holds a
    /// succeeded charge. Repeating an action that already took effect
    /// returns the original outcome. Gateway failures settle the
    /// attempt as failed and leave the booking status untouched.
    pub async fn run_action(&self, req: ActionRequest) -> Result<ActionOutcome, EngineError> {
        if let Some(ref key) = req.idempotency_key {
            if key.is_empty() {
                return Err(EngineError::Validation("idempotency key must not be empty"));
            }
            if key.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("idempotency key too long"));
            }
        }
        if req.amount_cents.is_some() && req.action != MoneyAction::Refund {
            return Err(EngineError::Validation(
                "explicit amounts are only accepted for refunds",
            ));
        }

        let arc = self
            .get_booking(&req.booking_id)
            .ok_or(EngineError::NotFound(req.booking_id))?;
        let mut b = arc.write().await;

        // Replay: a key the booking has seen before answers from the
        // ledger of attempts, not from the gateway.
        if let Some(ref key) = req.idempotency_key
            && let Some(prior) = b.attempt_by_key(key)
        {
            match prior.status {
                AttemptStatus::Succeeded => return Ok(outcome_for(&b, prior)),
                AttemptStatus::Pending => return Err(EngineError::InFlight(b.id)),
                // A definitively failed key may be retried; the gateway
                // replays its verdict if it saw the original.
                AttemptStatus::Failed => {}
            }
        }

        // One attempt in flight per booking, ever.
        if b.attempts.iter().any(|a| a.status == AttemptStatus::Pending) {
            return Err(EngineError::InFlight(b.id));
        }

        // Repeating the action that produced the current status is a
        // no-op returning the original outcome.
        if b.status == req.action.resulting_status() {
            let prior = b
                .attempts
                .iter()
                .rev()
                .find(|a| a.action == req.action && a.status == AttemptStatus::Succeeded);
            return Ok(match prior {
                Some(a) => outcome_for(&b, a),
                None => ActionOutcome {
                    booking_id: b.id,
                    action: req.action,
                    status: b.status,
                    payment_status: b.payment_status,
                    amount_cents: 0,
                    attempt_status: None,
                    external_ref: None,
                },
            });
        }

        let legal = match req.action {
            MoneyAction::Complete | MoneyAction::NoShow | MoneyAction::Cancel => {
                matches!(b.status, BookingStatus::Pending | BookingStatus::CardSaved)
            }
            MoneyAction::Refund => matches!(
                b.status,
                BookingStatus::Completed | BookingStatus::NoShow | BookingStatus::Cancelled
            ),
        };
        if !legal {
            return Err(EngineError::IllegalTransition {
                from: b.status,
                action: req.action,
            });
        }

        // Amount comes from the claim-time snapshot, never the live
        // service or policy tables.
        let mut refund_of: Option<(String, i64)> = None;
        let amount = match req.action {
            MoneyAction::Complete => b.final_price_cents,
            MoneyAction::NoShow => {
                pricing::fee_amount(b.policy.no_show_fee.as_ref(), b.final_price_cents)
            }
            MoneyAction::Cancel => {
                pricing::fee_amount(b.policy.cancel_fee.as_ref(), b.final_price_cents)
            }
            MoneyAction::Refund => {
                let charge = b
                    .succeeded_charge()
                    .ok_or(EngineError::Validation("no charge to refund"))?;
                let charge_ref = charge
                    .external_ref
                    .clone()
                    .ok_or(EngineError::Validation("charge reference missing"))?;
                let amount = match req.amount_cents {
                    None => charge.amount_cents,
                    Some(v) if v <= 0 => {
                        return Err(EngineError::Validation("refund amount must be positive"));
                    }
                    Some(v) if v > charge.amount_cents => {
                        return Err(EngineError::Validation("refund exceeds the charge"));
                    }
                    Some(v) => v,
                };
                refund_of = Some((charge_ref, charge.amount_cents));
                amount
            }
        };

        // Nothing to move: the transition is pure bookkeeping.
        if amount == 0 {
            return self.settle_free(&mut b, req.action).await;
        }

        if req.action != MoneyAction::Refund && b.method_ref.is_none() {
            return Err(EngineError::RequiresAction(b.id));
        }
        if b.attempts.len() >= MAX_ATTEMPTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many payment attempts"));
        }

        let key = match req.idempotency_key {
            Some(ref key) => key.clone(),
            None => {
                let generation = b
                    .attempts
                    .iter()
                    .filter(|a| a.action == req.action && definitive_failure(a))
                    .count();
                format!("{}:{}:{}", b.id, req.action.as_str(), generation)
            }
        };

        let attempt = PaymentAttempt {
            id: Ulid::new(),
            action: req.action,
            amount_cents: amount,
            idempotency_key: key.clone(),
            status: AttemptStatus::Pending,
            external_ref: None,
            failure: None,
            opened_at: now_ms(),
            settled_at: None,
        };
        let attempt_id = attempt.id;
        let opened = Event::AttemptOpened {
            booking_id: b.id,
            attempt,
        };
        self.wal_append_one(&opened).await?;
        apply_to_booking(&mut b, &opened);

        let call = match refund_of {
            Some((ref charge_ref, _)) => GatewayCall::Refund(RefundRequest {
                charge_ref: charge_ref.clone(),
                amount_cents: amount,
                idempotency_key: key,
            }),
            None => GatewayCall::Charge(ChargeRequest {
                amount_cents: amount,
                method_ref: b.method_ref.clone().unwrap_or_default(),
                destination: self.settings.read().await.payout_account.clone(),
                platform_fee_cents: pricing::platform_fee_cents(amount, self.platform_fee_bps),
                booking_id: b.id,
                action: req.action,
                idempotency_key: key,
            }),
        };
        drop(b);

        // Phase two: the gateway round trip, with no locks held.
        let started = Instant::now();
        let deadline = Duration::from_millis(GATEWAY_TIMEOUT_MS);
        let result = match call {
            GatewayCall::Charge(c) => {
                flatten_gateway(
                    tokio::time::timeout(deadline, self.gateway.create_charge(c)).await,
                    req.booking_id,
                )
            }
            GatewayCall::Refund(r) => {
                flatten_gateway(
                    tokio::time::timeout(deadline, self.gateway.create_refund(r)).await,
                    req.booking_id,
                )
            }
        };
        metrics::histogram!(observability::GATEWAY_CALL_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        // Phase three: settle under a fresh lock.
        let mut b = arc.write().await;
        let now = now_ms();
        match result {
            Ok(charge) => {
                let mut events = vec![Event::AttemptSettled {
                    booking_id: b.id,
                    attempt_id,
                    status: AttemptStatus::Succeeded,
                    external_ref: Some(charge.external_ref.clone()),
                    failure: None,
                    at: now,
                }];
                // A full refund puts the gift credit back on the card,
                // when the claim-time policy says so.
                if let Some((_, charged)) = refund_of
                    && amount == charged
                    && b.policy.refund_restores_credit
                    && b.gift_applied_cents > 0
                    && let Some(code) = b.gift_code.clone()
                {
                    events.push(Event::CardRestored {
                        id: Ulid::new(),
                        code,
                        booking_id: b.id,
                        amount_cents: b.gift_applied_cents,
                        at: now,
                    });
                }
                self.wal_append(&events).await?;
                let freed = apply_to_booking(&mut b, &events[0]);
                if let Some(restore @ Event::CardRestored { code, .. }) = events.get(1)
                    && let Some(card) = self.get_card(code)
                {
                    let mut cg = card.write().await;
                    apply_to_card(&mut cg, restore);
                }
                if freed {
                    self.remove_busy_for(b.staff_id, b.id).await;
                }
                metrics::counter!(
                    observability::MONEY_ACTIONS_TOTAL,
                    "action" => req.action.as_str(),
                    "outcome" => "succeeded"
                )
                .increment(1);
                self.notify_booking(action_event(req.action), &b);
                Ok(ActionOutcome {
                    booking_id: b.id,
                    action: req.action,
                    status: b.status,
                    payment_status: b.payment_status,
                    amount_cents: amount,
                    attempt_status: Some(AttemptStatus::Succeeded),
                    external_ref: Some(charge.external_ref),
                })
            }
            Err((failure, err)) => {
                let settled = Event::AttemptSettled {
                    booking_id: b.id,
                    attempt_id,
                    status: AttemptStatus::Failed,
                    external_ref: None,
                    failure: Some(failure),
                    at: now,
                };
                // Settle in memory even if the append fails: the
                // restart repair pass reconstructs the same failed
                // state from the pending row.
                if let Err(wal_err) = self.wal_append_one(&settled).await {
                    tracing::error!(
                        booking_id = %b.id,
                        error = %wal_err,
                        "failed to persist attempt settlement"
                    );
                }
                apply_to_booking(&mut b, &settled);
                metrics::counter!(
                    observability::MONEY_ACTIONS_TOTAL,
                    "action" => req.action.as_str(),
                    "outcome" => "failed"
                )
                .increment(1);
                Err(err)
            }
        }
    }

    /// Zero-amount transition: status moves, no attempt is opened and
    /// the gateway is never called.
    async fn settle_free(
        &self,
        b: &mut BookingState,
        action: MoneyAction,
    ) -> Result<ActionOutcome, EngineError> {
        let event = Event::ActionApplied {
            booking_id: b.id,
            action,
            at: now_ms(),
        };
        self.wal_append_one(&event).await?;
        let freed = apply_to_booking(b, &event);
        if freed {
            self.remove_busy_for(b.staff_id, b.id).await;
        }
        metrics::counter!(
            observability::MONEY_ACTIONS_TOTAL,
            "action" => action.as_str(),
            "outcome" => "free"
        )
        .increment(1);
        self.notify_booking(action_event(action), b);
        Ok(ActionOutcome {
            booking_id: b.id,
            action,
            status: b.status,
            payment_status: b.payment_status,
            amount_cents: 0,
            attempt_status: None,
            external_ref: None,
        })
    }

    /// Release a vacated interval on the diary. Takes the staff lock
    /// after the booking lock; nothing ever locks in the other order.
    async fn remove_busy_for(&self, staff_id: Ulid, booking_id: Ulid) {
        if let Some(st) = self.get_staff(&staff_id) {
            let mut guard = st.write().await;
            guard.remove_busy(booking_id);
        }
    }

    /// Attach a saved payment method. Moves a pending booking to
    /// card_saved; re-attaching lets the customer switch cards any time
    /// before the booking settles.
    pub async fn confirm_card(
        &self,
        booking_id: Ulid,
        method_ref: String,
    ) -> Result<BookingInfo, EngineError> {
        if method_ref.is_empty() {
            return Err(EngineError::Validation(
                "payment method ref must not be empty",
            ));
        }
        if method_ref.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("payment method ref too long"));
        }
        let arc = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = arc.write().await;
        if !matches!(b.status, BookingStatus::Pending | BookingStatus::CardSaved) {
            return Err(EngineError::Validation("booking is already settled"));
        }
        if b.method_ref.as_deref() == Some(method_ref.as_str()) {
            return Ok(BookingInfo::from_state(&b));
        }
        let event = Event::CardConfirmed {
            booking_id,
            method_ref,
            at: now_ms(),
        };
        self.wal_append_one(&event).await?;
        apply_to_booking(&mut b, &event);
        self.notify_booking("card_saved", &b);
        Ok(BookingInfo::from_state(&b))
    }
}
