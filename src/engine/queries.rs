//! Read side: slot listing over live diaries, plus the row surfaces
//! every table SELECT is served from.

use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::schedule::{self, Slot, SlotQuery};

use super::claim::now_ms;
use super::ledger::card_info;
use super::{Engine, EngineError};

impl Engine {
    /// Expand bookable slots for one service. `staff_id` None means
    /// every diary; `from`/`to` default to now through the tenant's
    /// advance window.
    pub async fn list_slots(
        &self,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<Slot>, EngineError> {
        let service = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let settings = self.settings.read().await.clone();
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|_| EngineError::Validation("tenant timezone is invalid"))?;
        let now = now_ms();

        let horizon_ms =
            settings.max_advance_days.min(MAX_HORIZON_DAYS) as Ms * schedule::DAY_MS;
        let from = from.unwrap_or(now).max(now);
        let to = to.unwrap_or(now + horizon_ms);
        if to <= from {
            return Ok(Vec::new());
        }
        if to - from > MAX_HORIZON_DAYS as Ms * schedule::DAY_MS {
            return Err(EngineError::LimitExceeded("slot window too wide"));
        }

        let blackouts = self.blackouts.read().await.clone();
        let targets = match staff_id {
            Some(id) => vec![self.get_staff(&id).ok_or(EngineError::NotFound(id))?],
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };

        let mut slots = Vec::new();
        for st_arc in targets {
            let st = st_arc.read().await;
            let busy: Vec<Span> = st
                .busy
                .iter()
                .filter(|b| match &b.kind {
                    BusyKind::Hold { expires_at, .. } => *expires_at > now,
                    BusyKind::Booking => true,
                })
                .map(|b| b.span)
                .collect();
            let q = SlotQuery {
                staff_id: st.id,
                service_id,
                rules: st.rules.clone(),
                blackouts: blackouts.clone(),
                busy,
                tz,
                service_duration_min: service.duration_min,
                grid_min: settings.slot_grid_minutes,
                now,
                lead_min: settings.lead_time_minutes,
                advance_days: settings.max_advance_days,
                from,
                to,
            };
            slots.extend(schedule::expand(&q));
        }
        slots.sort_by_key(|s| (s.span.start, s.staff_id));
        Ok(slots)
    }

    pub async fn get_booking_info(&self, id: &Ulid) -> Option<BookingInfo> {
        let arc = self.get_booking(id)?;
        let b = arc.read().await;
        Some(BookingInfo::from_state(&b))
    }

    pub async fn list_staff(&self) -> Vec<StaffInfo> {
        let mut out = Vec::with_capacity(self.staff.len());
        for entry in self.staff.iter() {
            let st = entry.value().clone();
            let guard = st.read().await;
            out.push(StaffInfo {
                id: guard.id,
                name: guard.name.clone(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut out: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn list_rules(&self, staff_id: Option<Ulid>) -> Result<Vec<RuleInfo>, EngineError> {
        let targets = match staff_id {
            Some(id) => vec![self.get_staff(&id).ok_or(EngineError::NotFound(id))?],
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for st_arc in targets {
            let guard = st_arc.read().await;
            for r in &guard.rules {
                out.push(RuleInfo {
                    id: r.id,
                    staff_id: guard.id,
                    weekday: r.weekday,
                    start_min: r.start_min,
                    end_min: r.end_min,
                    services: r.services.clone(),
                });
            }
        }
        Ok(out)
    }

    pub async fn list_blackouts(&self) -> Vec<BlackoutInfo> {
        self.blackouts
            .read()
            .await
            .iter()
            .map(|b| BlackoutInfo {
                id: b.id,
                staff_id: b.staff_id,
                start_day: b.start_day,
                end_day: b.end_day,
            })
            .collect()
    }

    pub async fn list_holds(&self, staff_id: Option<Ulid>) -> Result<Vec<HoldInfo>, EngineError> {
        let targets = match staff_id {
            Some(id) => vec![self.get_staff(&id).ok_or(EngineError::NotFound(id))?],
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for st_arc in targets {
            let guard = st_arc.read().await;
            for busy in &guard.busy {
                if let BusyKind::Hold {
                    service_id,
                    expires_at,
                } = &busy.kind
                {
                    out.push(HoldInfo {
                        id: busy.id,
                        staff_id: guard.id,
                        service_id: *service_id,
                        start: busy.span.start,
                        end: busy.span.end,
                        expires_at: *expires_at,
                    });
                }
            }
        }
        out.sort_by_key(|h| h.start);
        Ok(out)
    }

    pub async fn list_bookings(&self, staff_id: Option<Ulid>) -> Vec<BookingInfo> {
        let mut out = Vec::new();
        for entry in self.bookings.iter() {
            let b = entry.value().clone();
            let guard = b.read().await;
            if staff_id.is_none_or(|id| guard.staff_id == id) {
                out.push(BookingInfo::from_state(&guard));
            }
        }
        out.sort_by_key(|b| (b.start, b.id));
        out
    }

    pub async fn booking_attempts(
        &self,
        booking_id: &Ulid,
    ) -> Result<Vec<AttemptInfo>, EngineError> {
        let arc = self
            .get_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let b = arc.read().await;
        Ok(b.attempts
            .iter()
            .map(|a| AttemptInfo {
                id: a.id,
                booking_id: b.id,
                action: a.action,
                amount_cents: a.amount_cents,
                idempotency_key: a.idempotency_key.clone(),
                status: a.status,
                external_ref: a.external_ref.clone(),
                failure: a.failure.clone(),
                opened_at: a.opened_at,
                settled_at: a.settled_at,
            })
            .collect())
    }

    pub async fn card_info_for(&self, code: &str) -> Result<CardInfo, EngineError> {
        let card = self
            .get_card(code)
            .ok_or_else(|| EngineError::UnknownCode(code.to_string()))?;
        let guard = card.read().await;
        Ok(card_info(&guard, now_ms()))
    }

    pub async fn ledger_entries(&self, code: &str) -> Result<Vec<LedgerEntryInfo>, EngineError> {
        let card = self
            .get_card(code)
            .ok_or_else(|| EngineError::UnknownCode(code.to_string()))?;
        let guard = card.read().await;
        Ok(guard
            .entries
            .iter()
            .map(|e| LedgerEntryInfo {
                id: e.id,
                code: guard.code.clone(),
                booking_id: e.booking_id,
                amount_cents: e.amount_cents,
                kind: e.kind,
                at: e.at,
            })
            .collect())
    }
}
