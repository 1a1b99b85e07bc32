//! Weekly-rule slot expansion.
//!
//! Rules are wall-clock windows in the business timezone; bookable slots
//! are absolute UTC instants. All arithmetic happens on local dates and
//! minutes-of-day, and only the final resolved wall time is converted to
//! an instant, so a DST transition shifts the absolute times of a week's
//! slots without moving their advertised local labels.
//!
//! `expand` is pure: the same query always yields the same slots, lazily.
//! Busy-interval filtering here is advisory; the claim path re-checks
//! under the staff lock.

use chrono::{Datelike, LocalResult, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::{Blackout, Ms, Span, WeeklyRule};

pub(crate) const MINUTE_MS: Ms = 60_000;
pub(crate) const DAY_MS: Ms = 86_400_000;

/// A concrete bookable interval for one staff member and one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    /// Wall-clock start in the business timezone, `YYYY-MM-DDTHH:MM`.
    pub local_label: String,
}

/// Everything slot expansion needs, captured up front. Built by the
/// engine from tenant state; constructing one does no work.
#[derive(Debug, Clone)]
pub struct SlotQuery {
    pub staff_id: Ulid,
    pub service_id: Ulid,
    /// Sorted by (weekday, start_min).
    pub rules: Vec<WeeklyRule>,
    pub blackouts: Vec<Blackout>,
    /// Active busy spans for the staff, sorted by start.
    pub busy: Vec<Span>,
    pub tz: Tz,
    pub service_duration_min: u32,
    pub grid_min: u32,
    pub now: Ms,
    pub lead_min: u32,
    pub advance_days: u32,
    /// Requested horizon `[from, to)` in UTC ms.
    pub from: Ms,
    pub to: Ms,
}

/// Round a service duration up to the slot grid.
pub fn rounded_duration_min(duration_min: u32, grid_min: u32) -> u32 {
    duration_min.div_ceil(grid_min) * grid_min
}

/// Expand a query into its slot sequence. Lazy and restartable: a fresh
/// call walks the same slots again.
pub fn expand(q: &SlotQuery) -> Expansion<'_> {
    let duration_min = rounded_duration_min(q.service_duration_min, q.grid_min.max(1));
    let (day, end_day) = match (local_date(&q.tz, q.from), local_date(&q.tz, q.to - 1)) {
        (Some(first), Some(last)) if q.from < q.to => (first, last),
        // Degenerate horizon: position past the end so the iterator is empty.
        _ => (NaiveDate::MAX, NaiveDate::MIN),
    };
    Expansion {
        q,
        duration_min,
        duration_ms: duration_min as Ms * MINUTE_MS,
        lead_ms: q.lead_min as Ms * MINUTE_MS,
        advance_ms: q.advance_days as Ms * DAY_MS,
        day,
        end_day,
        rule_ix: 0,
        cursor_min: None,
    }
}

/// Iterator state for one expansion pass: a cursor over (day, rule,
/// minute-of-day).
pub struct Expansion<'a> {
    q: &'a SlotQuery,
    duration_min: u32,
    duration_ms: Ms,
    lead_ms: Ms,
    advance_ms: Ms,
    day: NaiveDate,
    end_day: NaiveDate,
    rule_ix: usize,
    cursor_min: Option<u32>,
}

impl Iterator for Expansion<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        loop {
            if self.day > self.end_day {
                return None;
            }
            // Blackouts knock out whole local dates, ahead of any windowing.
            if self
                .q
                .blackouts
                .iter()
                .any(|b| b.covers(&self.q.staff_id, self.day))
            {
                self.advance_day();
                continue;
            }
            let weekday = self.day.weekday().num_days_from_monday() as u8;

            while self.rule_ix < self.q.rules.len() {
                let rule = &self.q.rules[self.rule_ix];
                if rule.weekday != weekday || !rule.accepts(&self.q.service_id) {
                    self.next_rule();
                    continue;
                }
                let cursor = *self.cursor_min.get_or_insert(rule.start_min);
                // A window shorter than the rounded duration yields nothing.
                if cursor + self.duration_min > rule.end_min {
                    self.next_rule();
                    continue;
                }
                self.cursor_min = Some(cursor + self.q.grid_min.max(1));

                if let Some(slot) = self.materialize(cursor) {
                    return Some(slot);
                }
            }
            self.advance_day();
        }
    }
}

impl Expansion<'_> {
    fn advance_day(&mut self) {
        self.day = self.day.succ_opt().unwrap_or(NaiveDate::MAX);
        self.rule_ix = 0;
        self.cursor_min = None;
    }

    fn next_rule(&mut self) {
        self.rule_ix += 1;
        self.cursor_min = None;
    }

    /// Resolve one wall-clock candidate to an instant and run the
    /// filters. None means the candidate is skipped, not the end.
    fn materialize(&self, start_min: u32) -> Option<Slot> {
        let naive = self
            .day
            .and_hms_opt(start_min / 60, start_min % 60, 0)?;
        let local = match self.q.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            // Fall-back repeats the hour; the earlier offset wins.
            LocalResult::Ambiguous(earliest, _) => earliest,
            // Spring-forward gap: this wall time does not exist today.
            LocalResult::None => return None,
        };
        let start = local.timestamp_millis();
        let span = Span::new(start, start + self.duration_ms);

        if start < self.q.from || start >= self.q.to {
            return None;
        }
        if start - self.q.now < self.lead_ms {
            return None;
        }
        if start - self.q.now > self.advance_ms {
            return None;
        }
        if overlaps_any(&self.q.busy, &span) {
            return None;
        }
        Some(Slot {
            staff_id: self.q.staff_id,
            service_id: self.q.service_id,
            span,
            local_label: local.format("%Y-%m-%dT%H:%M").to_string(),
        })
    }
}

/// True if `candidate` overlaps any span in the sorted busy list.
fn overlaps_any(busy: &[Span], candidate: &Span) -> bool {
    let right_bound = busy.partition_point(|b| b.start < candidate.end);
    busy[..right_bound].iter().any(|b| b.end > candidate.start)
}

/// Whether a concrete start instant sits on the expanded grid of some
/// eligible rule. The claim path re-checks this under the staff lock so
/// a stale slot list cannot book outside working hours.
pub fn on_schedule(
    rules: &[WeeklyRule],
    tz: &Tz,
    service_id: &Ulid,
    start: Ms,
    duration_min: u32,
    grid_min: u32,
) -> bool {
    if start % MINUTE_MS != 0 {
        return false;
    }
    // An instant always maps to exactly one wall time, so no gap or
    // overlap handling is needed on this side.
    let Some(local) = tz.timestamp_millis_opt(start).single() else {
        return false;
    };
    let weekday = local.date_naive().weekday().num_days_from_monday() as u8;
    let minute = local.hour() * 60 + local.minute();
    let grid = grid_min.max(1);
    rules.iter().any(|r| {
        r.weekday == weekday
            && r.accepts(service_id)
            && r.start_min <= minute
            && minute + duration_min <= r.end_min
            && (minute - r.start_min) % grid == 0
    })
}

pub(crate) fn local_date(tz: &Tz, t: Ms) -> Option<NaiveDate> {
    tz.timestamp_millis_opt(t).single().map(|dt| dt.date_naive())
}
