//! Tenant configuration: staff, services, schedule rules, blackouts,
//! settings, and the cancellation policy. Also WAL compaction, which
//! snapshots all of it.

use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::claim::now_ms;
use super::{apply_to_staff, Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_staff(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if self.staff.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        if name.is_empty() {
            return Err(EngineError::Validation("staff name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StaffCreated {
            id,
            name: name.clone(),
        };
        self.wal_append_one(&event).await?;
        self.staff
            .insert(id, Arc::new(RwLock::new(StaffState::new(id, name))));
        Ok(())
    }

    /// Delete a staff member. Refused while the diary still has an
    /// upcoming booking; past bookings keep their staff id as a
    /// dangling reference, which the read side tolerates.
    pub async fn delete_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let st = self.get_staff(&id).ok_or(EngineError::NotFound(id))?;
        let guard = st.write().await;
        let now = now_ms();
        for busy in &guard.busy {
            if busy.kind == BusyKind::Booking && busy.span.end > now {
                return Err(EngineError::Conflict(busy.id));
            }
        }

        let event = Event::StaffDeleted { id };
        self.wal_append_one(&event).await?;
        self.drop_staff_index(&guard);
        drop(guard);
        self.staff.remove(&id);
        Ok(())
    }

    pub async fn create_service(
        &self,
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
    ) -> Result<(), EngineError> {
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if name.is_empty() {
            return Err(EngineError::Validation("service name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if duration_min == 0 {
            return Err(EngineError::Validation("service duration must be positive"));
        }
        if duration_min as i64 * 60_000 > MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if price_cents < 0 {
            return Err(EngineError::Validation("service price must not be negative"));
        }
        if price_cents > MAX_PRICE_CENTS {
            return Err(EngineError::LimitExceeded("service price too large"));
        }
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated {
            id,
            name: name.clone(),
            duration_min,
            price_cents,
        };
        self.wal_append_one(&event).await?;
        self.services.insert(
            id,
            Service {
                id,
                name,
                duration_min,
                price_cents,
            },
        );
        Ok(())
    }

    /// Delete a service. Existing bookings are untouched; they carry
    /// their own name and price snapshot from claim time.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ServiceDeleted { id };
        self.wal_append_one(&event).await?;
        self.services.remove(&id);
        Ok(())
    }

    /// Add a weekly availability window. Windows on the same weekday
    /// must not overlap, so every slot traces to exactly one rule.
    pub async fn add_rule(
        &self,
        id: Ulid,
        staff_id: Ulid,
        weekday: u8,
        start_min: u32,
        end_min: u32,
        services: Option<Vec<Ulid>>,
    ) -> Result<(), EngineError> {
        if weekday > 6 {
            return Err(EngineError::Validation("weekday must be 0..=6"));
        }
        if start_min >= end_min {
            return Err(EngineError::Validation("rule window must not be empty"));
        }
        if end_min > 1440 {
            return Err(EngineError::Validation("rule window exceeds the day"));
        }
        if let Some(ref list) = services {
            if list.is_empty() {
                return Err(EngineError::Validation("service list must not be empty"));
            }
            for sid in list {
                if !self.services.contains_key(sid) {
                    return Err(EngineError::NotFound(*sid));
                }
            }
        }
        if self.entity_to_staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let st = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut guard = st.write().await;
        if guard.rules.len() >= MAX_RULES_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many rules for staff"));
        }
        for r in &guard.rules {
            if r.weekday == weekday && r.start_min < end_min && start_min < r.end_min {
                return Err(EngineError::Conflict(r.id));
            }
        }

        let event = Event::RuleAdded {
            id,
            staff_id,
            weekday,
            start_min,
            end_min,
            services,
        };
        self.wal_append_one(&event).await?;
        apply_to_staff(&mut guard, &event, &self.entity_to_staff);
        Ok(())
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (staff_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, staff_id };
        self.wal_append_one(&event).await?;
        apply_to_staff(&mut guard, &event, &self.entity_to_staff);
        Ok(staff_id)
    }

    /// Add a blackout. `staff_id` None blacks out the whole business.
    /// Days are inclusive local calendar dates.
    pub async fn add_blackout(
        &self,
        id: Ulid,
        staff_id: Option<Ulid>,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<(), EngineError> {
        if start_day > end_day {
            return Err(EngineError::Validation("blackout days are reversed"));
        }
        if let Some(sid) = staff_id
            && !self.staff.contains_key(&sid) {
                return Err(EngineError::NotFound(sid));
            }
        let mut guard = self.blackouts.write().await;
        if guard.len() >= MAX_BLACKOUTS {
            return Err(EngineError::LimitExceeded("too many blackouts"));
        }
        if guard.iter().any(|b| b.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BlackoutAdded {
            id,
            staff_id,
            start_day,
            end_day,
        };
        self.wal_append_one(&event).await?;
        guard.push(Blackout {
            id,
            staff_id,
            start_day,
            end_day,
        });
        Ok(())
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.blackouts.write().await;
        if !guard.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlackoutRemoved { id };
        self.wal_append_one(&event).await?;
        guard.retain(|b| b.id != id);
        Ok(())
    }

    /// Partial settings update. `payout_account` uses the outer Option
    /// for "not mentioned" and the inner one for clearing.
    pub async fn update_settings(
        &self,
        timezone: Option<String>,
        slot_grid_minutes: Option<u32>,
        lead_time_minutes: Option<u32>,
        max_advance_days: Option<u32>,
        payout_account: Option<Option<String>>,
    ) -> Result<Settings, EngineError> {
        let mut guard = self.settings.write().await;
        let mut next = guard.clone();
        if let Some(tz) = timezone {
            if tz.parse::<Tz>().is_err() {
                return Err(EngineError::Validation("unknown timezone"));
            }
            next.timezone = tz;
        }
        if let Some(grid) = slot_grid_minutes {
            if !(MIN_SLOT_GRID_MINUTES..=MAX_SLOT_GRID_MINUTES).contains(&grid) {
                return Err(EngineError::Validation("slot grid out of range"));
            }
            next.slot_grid_minutes = grid;
        }
        if let Some(lead) = lead_time_minutes {
            next.lead_time_minutes = lead;
        }
        if let Some(days) = max_advance_days {
            if !(1..=365).contains(&days) {
                return Err(EngineError::Validation("advance window out of range"));
            }
            next.max_advance_days = days;
        }
        if let Some(account) = payout_account {
            if let Some(ref acct) = account
                && acct.len() > MAX_NAME_LEN {
                    return Err(EngineError::LimitExceeded("payout account too long"));
                }
            next.payout_account = account;
        }

        let event = Event::SettingsUpdated {
            settings: next.clone(),
        };
        self.wal_append_one(&event).await?;
        *guard = next.clone();
        Ok(next)
    }

    /// Partial policy update with the same two-level Option scheme.
    /// Only affects future claims; existing bookings keep the policy
    /// they were claimed under.
    pub async fn update_policy(
        &self,
        no_show_fee: Option<Option<FeePolicy>>,
        cancel_fee: Option<Option<FeePolicy>>,
        refund_restores_credit: Option<bool>,
    ) -> Result<Policy, EngineError> {
        fn check(fee: &Option<FeePolicy>) -> Result<(), EngineError> {
            match fee {
                Some(FeePolicy::Percent(pct)) if *pct > 100 => {
                    Err(EngineError::Validation("percent fee above 100"))
                }
                Some(FeePolicy::Flat(cents)) if *cents < 0 => {
                    Err(EngineError::Validation("flat fee must not be negative"))
                }
                Some(FeePolicy::Flat(cents)) if *cents > MAX_PRICE_CENTS => {
                    Err(EngineError::LimitExceeded("flat fee too large"))
                }
                _ => Ok(()),
            }
        }

        let mut guard = self.policy.write().await;
        let mut next = guard.clone();
        if let Some(fee) = no_show_fee {
            check(&fee)?;
            next.no_show_fee = fee;
        }
        if let Some(fee) = cancel_fee {
            check(&fee)?;
            next.cancel_fee = fee;
        }
        if let Some(flag) = refund_restores_credit {
            next.refund_restores_credit = flag;
        }

        let event = Event::PolicyUpdated {
            policy: next.clone(),
        };
        self.wal_append_one(&event).await?;
        *guard = next.clone();
        Ok(next)
    }

    /// Snapshot of current state as a minimal event sequence. Gift card
    /// ledgers keep their full entry history; everything else collapses
    /// to its latest value.
    fn snapshot_events(&self) -> Vec<Event> {
        let now = now_ms();
        let mut events = Vec::new();

        events.push(Event::SettingsUpdated {
            settings: self
                .settings
                .try_read()
                .expect("compact: uncontended read")
                .clone(),
        });
        events.push(Event::PolicyUpdated {
            policy: self
                .policy
                .try_read()
                .expect("compact: uncontended read")
                .clone(),
        });

        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceCreated {
                id: s.id,
                name: s.name.clone(),
                duration_min: s.duration_min,
                price_cents: s.price_cents,
            });
        }

        for entry in self.staff.iter() {
            let st = entry.value().clone();
            let guard = st.try_read().expect("compact: uncontended read");
            events.push(Event::StaffCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for r in &guard.rules {
                events.push(Event::RuleAdded {
                    id: r.id,
                    staff_id: guard.id,
                    weekday: r.weekday,
                    start_min: r.start_min,
                    end_min: r.end_min,
                    services: r.services.clone(),
                });
            }
            // Live holds survive compaction. Booking intervals need no
            // events of their own; replaying the booking restores them.
            for busy in &guard.busy {
                if let BusyKind::Hold {
                    service_id,
                    expires_at,
                } = &busy.kind
                    && *expires_at > now
                {
                    events.push(Event::HoldPlaced {
                        id: busy.id,
                        staff_id: guard.id,
                        service_id: *service_id,
                        span: busy.span,
                        expires_at: *expires_at,
                    });
                }
            }
        }

        for b in self
            .blackouts
            .try_read()
            .expect("compact: uncontended read")
            .iter()
        {
            events.push(Event::BlackoutAdded {
                id: b.id,
                staff_id: b.staff_id,
                start_day: b.start_day,
                end_day: b.end_day,
            });
        }

        for entry in self.cards.iter() {
            let card = entry.value().clone();
            let guard = card.try_read().expect("compact: uncontended read");
            for e in &guard.entries {
                events.push(match e.kind {
                    LedgerKind::Issue => Event::CardIssued {
                        id: e.id,
                        code: guard.code.clone(),
                        amount_cents: e.amount_cents,
                        expires_at: guard.expires_at,
                        at: e.at,
                    },
                    // Stored negated; the event format carries the
                    // positive amount.
                    LedgerKind::Redeem => Event::CardRedeemed {
                        id: e.id,
                        code: guard.code.clone(),
                        booking_id: e.booking_id.unwrap_or_default(),
                        amount_cents: -e.amount_cents,
                        at: e.at,
                    },
                    LedgerKind::Restore => Event::CardRestored {
                        id: e.id,
                        code: guard.code.clone(),
                        booking_id: e.booking_id.unwrap_or_default(),
                        amount_cents: e.amount_cents,
                        at: e.at,
                    },
                });
            }
        }

        for entry in self.bookings.iter() {
            let b = entry.value().clone();
            let guard = b.try_read().expect("compact: uncontended read");
            events.push(Event::BookingClaimed {
                booking: Box::new(guard.clone()),
            });
        }

        events
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
