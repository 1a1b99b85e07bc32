mod claim;
mod error;
mod ledger;
mod mutations;
mod payments;
mod pricing;
mod queries;
#[cfg(test)]
mod tests;

pub use claim::{ClaimOutcome, ClaimRequest};
pub use error::EngineError;
pub use payments::ActionRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedStaffState = Arc<RwLock<StaffState>>;
pub type SharedBookingState = Arc<RwLock<BookingState>>;
pub type SharedCardState = Arc<RwLock<CardState>>;

/// Channel every booking lifecycle event is published on.
pub const CHANNEL_BOOKINGS: &str = "bookings";

/// Per-staff channel: booking and hold events for one diary.
pub fn staff_channel(id: &Ulid) -> String {
    format!("staff_{id}")
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One logical mutation; multi-event mutations (claim with a gift
    /// redemption, refund with a credit restore) commit as a unit.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let events_total: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(events_total as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's booking state: staff diaries, bookings, gift cards,
/// services, and business-level config, all rebuilt from the WAL at
/// startup.
pub struct Engine {
    pub staff: DashMap<Ulid, SharedStaffState>,
    pub bookings: DashMap<Ulid, SharedBookingState>,
    /// Keyed by gift card code.
    pub cards: DashMap<String, SharedCardState>,
    pub services: DashMap<Ulid, Service>,
    pub blackouts: RwLock<Vec<Blackout>>,
    pub settings: RwLock<Settings>,
    pub policy: RwLock<Policy>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Platform cut of card charges, in basis points.
    pub platform_fee_bps: u32,
    /// Reverse lookup: entity (rule/hold) id → staff id
    pub(super) entity_to_staff: DashMap<Ulid, Ulid>,
}

/// Apply a staff-scoped event directly to a diary (no locking — caller
/// holds the lock).
fn apply_to_staff(st: &mut StaffState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RuleAdded {
            id,
            staff_id,
            weekday,
            start_min,
            end_min,
            services,
        } => {
            st.add_rule(WeeklyRule {
                id: *id,
                weekday: *weekday,
                start_min: *start_min,
                end_min: *end_min,
                services: services.clone(),
            });
            entity_map.insert(*id, *staff_id);
        }
        Event::RuleRemoved { id, .. } => {
            st.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::HoldPlaced {
            id,
            staff_id,
            service_id,
            span,
            expires_at,
        } => {
            st.insert_busy(Busy {
                id: *id,
                span: *span,
                kind: BusyKind::Hold {
                    service_id: *service_id,
                    expires_at: *expires_at,
                },
            });
            entity_map.insert(*id, *staff_id);
        }
        Event::HoldReleased { id, .. } => {
            st.remove_busy(*id);
            entity_map.remove(id);
        }
        Event::BookingClaimed { booking } if booking.status.is_blocking() => {
            st.insert_busy(Busy {
                id: booking.id,
                span: booking.span,
                kind: BusyKind::Booking,
            });
        }
        _ => {}
    }
}

/// Apply a booking-scoped event (no locking — caller holds the lock).
/// Returns true when the transition vacated the staff interval; the
/// caller removes the busy entry under the staff lock.
fn apply_to_booking(b: &mut BookingState, event: &Event) -> bool {
    match event {
        Event::SetupIssued { setup_ref, .. } => {
            b.setup_ref = Some(setup_ref.clone());
            false
        }
        Event::CardConfirmed { method_ref, .. } => {
            b.method_ref = Some(method_ref.clone());
            if b.status == BookingStatus::Pending {
                b.status = BookingStatus::CardSaved;
            }
            if matches!(b.payment_status, PaymentStatus::None | PaymentStatus::Failed) {
                b.payment_status = PaymentStatus::CardSaved;
            }
            false
        }
        Event::AttemptOpened { attempt, .. } => {
            b.attempts.push(attempt.clone());
            false
        }
        Event::AttemptSettled {
            attempt_id,
            status,
            external_ref,
            failure,
            at,
            ..
        } => {
            let Some(ix) = b.attempts.iter().position(|a| a.id == *attempt_id) else {
                return false;
            };
            b.attempts[ix].status = *status;
            b.attempts[ix].external_ref = external_ref.clone();
            b.attempts[ix].failure = failure.clone();
            b.attempts[ix].settled_at = Some(*at);
            let action = b.attempts[ix].action;
            match status {
                AttemptStatus::Succeeded => {
                    b.last_money_action = Some(action);
                    let was_blocking = b.status.is_blocking();
                    b.status = action.resulting_status();
                    b.payment_status = match action {
                        MoneyAction::Refund => PaymentStatus::Refunded,
                        _ => PaymentStatus::Charged,
                    };
                    was_blocking && !b.status.is_blocking()
                }
                AttemptStatus::Failed => {
                    // A failed refund keeps the charged payment status so
                    // the original charge stays visible.
                    if action != MoneyAction::Refund {
                        b.payment_status = PaymentStatus::Failed;
                    }
                    false
                }
                AttemptStatus::Pending => false,
            }
        }
        Event::ActionApplied { action, .. } => {
            b.last_money_action = Some(*action);
            let was_blocking = b.status.is_blocking();
            b.status = action.resulting_status();
            was_blocking && !b.status.is_blocking()
        }
        _ => false,
    }
}

/// Apply a ledger event to a card (no locking — caller holds the lock).
/// Redemptions are stored negated; balance stays a plain sum.
fn apply_to_card(card: &mut CardState, event: &Event) {
    match event {
        Event::CardIssued {
            id,
            amount_cents,
            expires_at,
            at,
            ..
        } => {
            card.expires_at = *expires_at;
            card.entries.push(LedgerEntry {
                id: *id,
                booking_id: None,
                amount_cents: *amount_cents,
                kind: LedgerKind::Issue,
                at: *at,
            });
        }
        Event::CardRedeemed {
            id,
            booking_id,
            amount_cents,
            at,
            ..
        } => {
            card.entries.push(LedgerEntry {
                id: *id,
                booking_id: Some(*booking_id),
                amount_cents: -*amount_cents,
                kind: LedgerKind::Redeem,
                at: *at,
            });
        }
        Event::CardRestored {
            id,
            booking_id,
            amount_cents,
            at,
            ..
        } => {
            card.entries.push(LedgerEntry {
                id: *id,
                booking_id: Some(*booking_id),
                amount_cents: *amount_cents,
                kind: LedgerKind::Restore,
                at: *at,
            });
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn PaymentGateway>,
        platform_fee_bps: u32,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);

        let engine = Self {
            staff: DashMap::new(),
            bookings: DashMap::new(),
            cards: DashMap::new(),
            services: DashMap::new(),
            blackouts: RwLock::new(Vec::new()),
            settings: RwLock::new(Settings::default()),
            policy: RwLock::new(Policy::default()),
            wal_tx,
            notify,
            gateway,
            platform_fee_bps,
            entity_to_staff: DashMap::new(),
        };

        for event in &events {
            engine.replay_apply(event);
        }

        // Attempts that were in flight when the process died get settled
        // as failed before the engine goes live. The gateway may or may
        // not have moved the money; re-driving the action reuses the
        // same idempotency key, so a retry cannot double-charge.
        let repairs = engine.interrupted_attempts();
        for event in &repairs {
            wal.append(event)?;
            engine.replay_apply(event);
        }

        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(engine)
    }

    /// Replay-time event application. Only safe at startup: lock
    /// acquisition assumes this thread is the sole owner of every Arc.
    /// Runtime mutation paths apply events themselves under the locks
    /// they already hold.
    fn replay_apply(&self, event: &Event) {
        match event {
            Event::StaffCreated { id, name } => {
                let st = StaffState::new(*id, name.clone());
                self.staff.insert(*id, Arc::new(RwLock::new(st)));
            }
            Event::StaffDeleted { id } => {
                if let Some((_, st)) = self.staff.remove(id) {
                    let guard = st.try_read().expect("replay: uncontended read");
                    self.drop_staff_index(&guard);
                }
            }
            Event::ServiceCreated {
                id,
                name,
                duration_min,
                price_cents,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        name: name.clone(),
                        duration_min: *duration_min,
                        price_cents: *price_cents,
                    },
                );
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
            }
            Event::RuleAdded { staff_id, .. }
            | Event::RuleRemoved { staff_id, .. }
            | Event::HoldPlaced { staff_id, .. }
            | Event::HoldReleased { staff_id, .. } => {
                if let Some(entry) = self.staff.get(staff_id) {
                    let st = entry.value().clone();
                    drop(entry);
                    let mut guard = st.try_write().expect("replay: uncontended write");
                    apply_to_staff(&mut guard, event, &self.entity_to_staff);
                }
            }
            Event::BlackoutAdded {
                id,
                staff_id,
                start_day,
                end_day,
            } => {
                let mut guard = self
                    .blackouts
                    .try_write()
                    .expect("replay: uncontended write");
                guard.push(Blackout {
                    id: *id,
                    staff_id: *staff_id,
                    start_day: *start_day,
                    end_day: *end_day,
                });
            }
            Event::BlackoutRemoved { id } => {
                let mut guard = self
                    .blackouts
                    .try_write()
                    .expect("replay: uncontended write");
                guard.retain(|b| b.id != *id);
            }
            Event::SettingsUpdated { settings } => {
                *self.settings.try_write().expect("replay: uncontended write") = settings.clone();
            }
            Event::PolicyUpdated { policy } => {
                *self.policy.try_write().expect("replay: uncontended write") = policy.clone();
            }
            Event::CardIssued { code, .. }
            | Event::CardRedeemed { code, .. }
            | Event::CardRestored { code, .. } => {
                let card = self
                    .cards
                    .entry(code.clone())
                    .or_insert_with(|| {
                        Arc::new(RwLock::new(CardState {
                            code: code.clone(),
                            expires_at: None,
                            entries: Vec::new(),
                        }))
                    })
                    .value()
                    .clone();
                let mut guard = card.try_write().expect("replay: uncontended write");
                apply_to_card(&mut guard, event);
            }
            Event::BookingClaimed { booking } => {
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new((**booking).clone())));
                if let Some(entry) = self.staff.get(&booking.staff_id) {
                    let st = entry.value().clone();
                    drop(entry);
                    let mut guard = st.try_write().expect("replay: uncontended write");
                    apply_to_staff(&mut guard, event, &self.entity_to_staff);
                }
            }
            Event::SetupIssued { booking_id, .. }
            | Event::CardConfirmed { booking_id, .. }
            | Event::AttemptOpened { booking_id, .. }
            | Event::AttemptSettled { booking_id, .. }
            | Event::ActionApplied { booking_id, .. } => {
                let Some(entry) = self.bookings.get(booking_id) else {
                    return;
                };
                let b_arc = entry.value().clone();
                drop(entry);
                let mut b = b_arc.try_write().expect("replay: uncontended write");
                let freed = apply_to_booking(&mut b, event);
                if freed && let Some(entry) = self.staff.get(&b.staff_id) {
                    let st = entry.value().clone();
                    drop(entry);
                    let mut guard = st.try_write().expect("replay: uncontended write");
                    guard.remove_busy(b.id);
                }
            }
        }
    }

    /// Settlement events for attempts the last run left pending.
    fn interrupted_attempts(&self) -> Vec<Event> {
        let now = claim::now_ms();
        let mut repairs = Vec::new();
        for entry in self.bookings.iter() {
            let b = entry.value().try_read().expect("replay: uncontended read");
            for a in &b.attempts {
                if a.status == AttemptStatus::Pending {
                    repairs.push(Event::AttemptSettled {
                        booking_id: b.id,
                        attempt_id: a.id,
                        status: AttemptStatus::Failed,
                        external_ref: None,
                        failure: Some("interrupted by restart".into()),
                        at: now,
                    });
                }
            }
        }
        repairs
    }

    /// Drop rule/hold reverse-index entries for a removed staff member.
    fn drop_staff_index(&self, st: &StaffState) {
        for r in &st.rules {
            self.entity_to_staff.remove(&r.id);
        }
        for b in &st.busy {
            if matches!(b.kind, BusyKind::Hold { .. }) {
                self.entity_to_staff.remove(&b.id);
            }
        }
    }

    /// Write events to WAL via the background group-commit writer. The
    /// slice commits as one mutation with respect to other appends.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_append_one(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(std::slice::from_ref(event)).await
    }

    pub fn get_staff(&self, id: &Ulid) -> Option<SharedStaffState> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<SharedBookingState> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn get_card(&self, code: &str) -> Option<SharedCardState> {
        self.cards.get(code).map(|e| e.value().clone())
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn get_staff_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_staff.get(entity_id).map(|e| *e.value())
    }

    /// Lookup entity → staff, get staff, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<StaffState>), EngineError> {
        let staff_id = self
            .get_staff_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let st = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = st.write_owned().await;
        Ok((staff_id, guard))
    }

    /// Publish a booking lifecycle event on the global and per-staff
    /// channels.
    pub(super) fn notify_booking(&self, kind: &str, b: &BookingState) {
        let payload = serde_json::json!({
            "event": kind,
            "booking_id": b.id.to_string(),
            "code": b.code,
            "staff_id": b.staff_id.to_string(),
            "status": b.status.as_str(),
            "payment_status": b.payment_status.as_str(),
            "start": b.span.start,
            "end": b.span.end,
        })
        .to_string();
        self.notify.send(CHANNEL_BOOKINGS, payload.clone());
        self.notify.send(&staff_channel(&b.staff_id), payload);
    }

    pub(super) fn notify_hold(&self, kind: &str, staff_id: &Ulid, hold_id: &Ulid, span: &Span) {
        let payload = serde_json::json!({
            "event": kind,
            "hold_id": hold_id.to_string(),
            "staff_id": staff_id.to_string(),
            "start": span.start,
            "end": span.end,
        })
        .to_string();
        self.notify.send(&staff_channel(staff_id), payload);
    }
}
