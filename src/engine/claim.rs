//! The claim path: turning an advertised slot into a booking, and the
//! checkout holds that can shield a slot while the customer types.
//!
//! A claim is the only multi-entity mutation in the system. Lock order
//! is staff diary, then gift card; the WAL batch commits while both are
//! held, so a concurrent claim on the same interval sees either nothing
//! or the finished booking.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::gateway::GatewaySetup;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::schedule;

use super::{apply_to_card, apply_to_staff, Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() < MIN_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too narrow"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Conflict scan against one diary. Expired holds never block; `skip`
/// exempts the hold a claim is converting into a booking.
pub(crate) fn check_no_conflict(
    st: &StaffState,
    span: &Span,
    now: Ms,
    skip: Option<Ulid>,
) -> Result<(), EngineError> {
    for busy in st.overlapping(span) {
        if skip == Some(busy.id) {
            continue;
        }
        match &busy.kind {
            BusyKind::Hold { expires_at, .. } if *expires_at <= now => continue,
            BusyKind::Hold { .. } | BusyKind::Booking => {
                return Err(EngineError::Conflict(busy.id));
            }
        }
    }
    Ok(())
}

/// One claim attempt on a concrete slot. The caller picks `id`, so a
/// retried request lands on the booking it already made instead of
/// double-booking.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer: String,
    pub start: Ms,
    pub gift_code: Option<String>,
    /// Hold to convert, when the caller placed one during checkout.
    pub hold_id: Option<Ulid>,
}

/// What a successful claim hands back. The client secret exists only in
/// this response; it is never persisted or broadcast.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub booking: BookingInfo,
    pub client_secret: Option<String>,
}

impl Engine {
    /// Claim a slot. Exactly one of several concurrent claims on the
    /// same interval wins; the rest get `Conflict`. Re-claiming an id
    /// that already exists returns the existing booking unchanged.
    pub async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome, EngineError> {
        if let Some(existing) = self.get_booking(&req.id) {
            let b = existing.read().await;
            return Ok(ClaimOutcome {
                booking: BookingInfo::from_state(&b),
                client_secret: None,
            });
        }
        if req.customer.is_empty() {
            return Err(EngineError::Validation("customer must not be empty"));
        }
        if req.customer.len() > MAX_CUSTOMER_LEN {
            return Err(EngineError::LimitExceeded("customer name too long"));
        }
        if let Some(ref code) = req.gift_code
            && code.len() > MAX_GIFT_CODE_LEN {
                return Err(EngineError::LimitExceeded("gift code too long"));
            }

        let service = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let settings = self.settings.read().await.clone();
        let policy = self.policy.read().await.clone();
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|_| EngineError::Validation("tenant timezone is invalid"))?;

        let duration_min =
            schedule::rounded_duration_min(service.duration_min, settings.slot_grid_minutes);
        let span = Span::new(
            req.start,
            req.start + duration_min as Ms * schedule::MINUTE_MS,
        );
        validate_span(&span)?;
        let now = now_ms();
        self.check_window(&settings, &tz, &req.staff_id, &span, now)
            .await?;

        let st_arc = self
            .get_staff(&req.staff_id)
            .ok_or(EngineError::NotFound(req.staff_id))?;
        let mut st = st_arc.write().await;
        // Staff deletion may have won the lock first.
        if !self.staff.contains_key(&req.staff_id) {
            return Err(EngineError::NotFound(req.staff_id));
        }
        if st.busy.len() >= MAX_BUSY_PER_STAFF {
            return Err(EngineError::LimitExceeded("staff diary is full"));
        }
        if !schedule::on_schedule(
            &st.rules,
            &tz,
            &req.service_id,
            req.start,
            duration_min,
            settings.slot_grid_minutes,
        ) {
            return Err(EngineError::Validation("slot is not on the staff schedule"));
        }

        // A hold being converted must belong to this diary and cover
        // exactly this interval. Expired is fine: nothing else claimed
        // the slot, so the original customer still gets it.
        if let Some(hold_id) = req.hold_id {
            let held = st.busy.iter().find(|b| b.id == hold_id);
            match held {
                None => return Err(EngineError::NotFound(hold_id)),
                Some(b) if !matches!(b.kind, BusyKind::Hold { .. }) => {
                    return Err(EngineError::Validation("referenced id is not a hold"));
                }
                Some(b) if b.span != span => {
                    return Err(EngineError::Validation("hold does not cover this slot"));
                }
                Some(_) => {}
            }
        }

        if let Err(e) = check_no_conflict(&st, &span, now, req.hold_id) {
            metrics::counter!(observability::CLAIM_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        // Gift card second, after the diary lock. Clamp happens here,
        // before anything is written, so the ledger never overdraws.
        let mut card_guard = None;
        let mut applied = 0i64;
        if let Some(ref code) = req.gift_code {
            let card = self
                .get_card(code)
                .ok_or_else(|| EngineError::UnknownCode(code.clone()))?;
            let guard = card.write_owned().await;
            if let Some(exp) = guard.expires_at
                && exp <= now {
                    return Err(EngineError::ExpiredCard(code.clone()));
                }
            let balance = guard.balance();
            if balance <= 0 {
                return Err(EngineError::ZeroBalance(code.clone()));
            }
            if guard.entries.len() >= MAX_ENTRIES_PER_CARD {
                return Err(EngineError::LimitExceeded("gift card ledger is full"));
            }
            applied = balance.min(service.price_cents);
            card_guard = Some(guard);
        }

        let booking = BookingState {
            id: req.id,
            code: BookingState::code_for(&req.id),
            staff_id: req.staff_id,
            service_id: req.service_id,
            customer: req.customer.clone(),
            span,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::None,
            service_name: service.name.clone(),
            service_price_cents: service.price_cents,
            final_price_cents: (service.price_cents - applied).max(0),
            gift_code: req.gift_code.clone(),
            gift_applied_cents: applied,
            policy,
            setup_ref: None,
            method_ref: None,
            last_money_action: None,
            attempts: Vec::new(),
            created_at: now,
        };

        // Booking before redemption: a torn tail leaves the customer
        // their booking and their credit, never the reverse.
        let mut events = Vec::with_capacity(3);
        if let Some(hold_id) = req.hold_id {
            events.push(Event::HoldReleased {
                id: hold_id,
                staff_id: req.staff_id,
            });
        }
        events.push(Event::BookingClaimed {
            booking: Box::new(booking.clone()),
        });
        if applied > 0
            && let Some(ref code) = req.gift_code {
                events.push(Event::CardRedeemed {
                    id: Ulid::new(),
                    code: code.clone(),
                    booking_id: req.id,
                    amount_cents: applied,
                    at: now,
                });
            }

        self.wal_append(&events).await?;
        for event in &events {
            match event {
                Event::CardRedeemed { .. } => {
                    if let Some(guard) = card_guard.as_mut() {
                        apply_to_card(guard, event);
                    }
                }
                _ => apply_to_staff(&mut st, event, &self.entity_to_staff),
            }
        }
        self.bookings
            .insert(req.id, Arc::new(RwLock::new(booking.clone())));
        drop(card_guard);
        drop(st);

        metrics::counter!(observability::CLAIMS_TOTAL).increment(1);
        self.notify_booking("booking_claimed", &booking);

        // Card save is only worth a gateway round trip if money could
        // ever move on this booking.
        let mut info = BookingInfo::from_state(&booking);
        let mut client_secret = None;
        if booking.final_price_cents > 0
            || booking.policy.no_show_fee.is_some()
            || booking.policy.cancel_fee.is_some()
        {
            if let Some(setup) = self.issue_setup(req.id).await {
                info.setup_ref = Some(setup.setup_ref);
                client_secret = Some(setup.client_secret);
            }
        }

        Ok(ClaimOutcome {
            booking: info,
            client_secret,
        })
    }

    /// Ask the gateway for a card-save session. Runs with no engine
    /// locks held. Failure is non-fatal: the booking stands and a card
    /// can still be attached later.
    async fn issue_setup(&self, booking_id: Ulid) -> Option<GatewaySetup> {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(GATEWAY_TIMEOUT_MS),
            self.gateway.create_setup(booking_id),
        )
        .await;
        metrics::histogram!(observability::GATEWAY_CALL_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let setup = match result {
            Ok(Ok(setup)) => setup,
            Ok(Err(e)) => {
                tracing::warn!(booking_id = %booking_id, error = %e, "card setup failed");
                return None;
            }
            Err(_) => {
                metrics::counter!(observability::GATEWAY_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(booking_id = %booking_id, "card setup timed out");
                return None;
            }
        };
        let event = Event::SetupIssued {
            booking_id,
            setup_ref: setup.setup_ref.clone(),
        };
        if let Err(e) = self.wal_append_one(&event).await {
            tracing::warn!(booking_id = %booking_id, error = %e, "setup ref not persisted");
            return None;
        }
        if let Some(b) = self.get_booking(&booking_id) {
            let mut guard = b.write().await;
            super::apply_to_booking(&mut guard, &event);
        }
        Some(setup)
    }

    /// Shield a slot for one checkout session. Same validations as a
    /// claim; expiry is server-side so an abandoned tab cannot pin the
    /// diary.
    pub async fn place_hold(
        &self,
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        start: Ms,
    ) -> Result<HoldInfo, EngineError> {
        if self.entity_to_staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let service = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let settings = self.settings.read().await.clone();
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|_| EngineError::Validation("tenant timezone is invalid"))?;

        let duration_min =
            schedule::rounded_duration_min(service.duration_min, settings.slot_grid_minutes);
        let span = Span::new(start, start + duration_min as Ms * schedule::MINUTE_MS);
        validate_span(&span)?;
        let now = now_ms();
        self.check_window(&settings, &tz, &staff_id, &span, now)
            .await?;

        let st_arc = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut st = st_arc.write().await;
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        if st.busy.len() >= MAX_BUSY_PER_STAFF {
            return Err(EngineError::LimitExceeded("staff diary is full"));
        }
        if !schedule::on_schedule(
            &st.rules,
            &tz,
            &service_id,
            start,
            duration_min,
            settings.slot_grid_minutes,
        ) {
            return Err(EngineError::Validation("slot is not on the staff schedule"));
        }
        if let Err(e) = check_no_conflict(&st, &span, now, None) {
            metrics::counter!(observability::CLAIM_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let expires_at = now + HOLD_TTL_MS;
        let event = Event::HoldPlaced {
            id,
            staff_id,
            service_id,
            span,
            expires_at,
        };
        self.wal_append_one(&event).await?;
        apply_to_staff(&mut st, &event, &self.entity_to_staff);
        drop(st);

        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        self.notify_hold("hold_placed", &staff_id, &id, &span);
        Ok(HoldInfo {
            id,
            staff_id,
            service_id,
            start: span.start,
            end: span.end,
            expires_at,
        })
    }

    pub async fn release_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (staff_id, mut guard) = self.resolve_entity_write(&id).await?;
        let span = match guard.busy.iter().find(|b| b.id == id) {
            Some(b) if matches!(b.kind, BusyKind::Hold { .. }) => b.span,
            _ => return Err(EngineError::NotFound(id)),
        };
        let event = Event::HoldReleased { id, staff_id };
        self.wal_append_one(&event).await?;
        apply_to_staff(&mut guard, &event, &self.entity_to_staff);
        drop(guard);
        self.notify_hold("hold_released", &staff_id, &id, &span);
        Ok(staff_id)
    }

    /// (hold id, staff id) pairs past their expiry. Skips any diary
    /// that is write-locked right now; the next sweep catches it.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.staff.iter() {
            let st = entry.value().clone();
            if let Ok(guard) = st.try_read() {
                for busy in &guard.busy {
                    if let BusyKind::Hold { expires_at, .. } = &busy.kind
                        && *expires_at <= now {
                            expired.push((busy.id, guard.id));
                        }
                }
            }
        }
        expired
    }

    /// Lead-time and horizon bounds plus blackout cover, keyed on the
    /// slot's local calendar date.
    async fn check_window(
        &self,
        settings: &Settings,
        tz: &Tz,
        staff_id: &Ulid,
        span: &Span,
        now: Ms,
    ) -> Result<(), EngineError> {
        if span.start < now + settings.lead_time_minutes as Ms * schedule::MINUTE_MS {
            return Err(EngineError::Validation("slot is inside the lead time"));
        }
        if span.start > now + settings.max_advance_days as Ms * schedule::DAY_MS {
            return Err(EngineError::Validation("slot is past the booking horizon"));
        }
        let Some(day) = schedule::local_date(tz, span.start) else {
            return Err(EngineError::Validation("slot start is out of calendar range"));
        };
        let blackouts = self.blackouts.read().await;
        if blackouts.iter().any(|b| b.covers(staff_id, day)) {
            return Err(EngineError::Validation("date is blacked out"));
        }
        Ok(())
    }
}
