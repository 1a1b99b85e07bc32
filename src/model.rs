use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// What a busy interval on a staff diary represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusyKind {
    /// Temporary pre-claim reservation with expiration.
    Hold { service_id: Ulid, expires_at: Ms },
    /// A claimed booking. Details live in the booking map under the same id.
    Booking,
}

/// One occupied interval on a staff diary. Holds and bookings are both
/// just busy time as far as conflict checks are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Busy {
    pub id: Ulid,
    pub span: Span,
    pub kind: BusyKind,
}

/// Recurring weekly availability window, wall-clock values in the
/// business timezone. Weekday 0 = Monday … 6 = Sunday; minutes are
/// minute-of-day with `end_min` exclusive (≤ 1440).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub id: Ulid,
    pub weekday: u8,
    pub start_min: u32,
    pub end_min: u32,
    /// Services this window accepts. None = any service.
    pub services: Option<Vec<Ulid>>,
}

impl WeeklyRule {
    pub fn accepts(&self, service_id: &Ulid) -> bool {
        match &self.services {
            None => true,
            Some(list) => list.contains(service_id),
        }
    }
}

/// A staff member's diary: weekly rules plus occupied intervals.
#[derive(Debug, Clone)]
pub struct StaffState {
    pub id: Ulid,
    pub name: String,
    /// Sorted by (weekday, start_min).
    pub rules: Vec<WeeklyRule>,
    /// All busy intervals (holds + bookings), sorted by `span.start`.
    pub busy: Vec<Busy>,
}

impl StaffState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            rules: Vec::new(),
            busy: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule: WeeklyRule) {
        let pos = self
            .rules
            .binary_search_by_key(&(rule.weekday, rule.start_min), |r| (r.weekday, r.start_min))
            .unwrap_or_else(|e| e);
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<WeeklyRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert busy interval maintaining sort order by span.start.
    pub fn insert_busy(&mut self, busy: Busy) {
        let pos = self
            .busy
            .binary_search_by_key(&busy.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.busy.insert(pos, busy);
    }

    /// Remove busy interval by id.
    pub fn remove_busy(&mut self, id: Ulid) -> Option<Busy> {
        if let Some(pos) = self.busy.iter().position(|b| b.id == id) {
            Some(self.busy.remove(pos))
        } else {
            None
        }
    }

    /// Return only busy intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Busy> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.busy.partition_point(|b| b.span.start < query.end);
        self.busy[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// Date-range exclusion, inclusive local dates. `staff_id` None means
/// business-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start_day: NaiveDate,
    pub end_day: NaiveDate,
}

impl Blackout {
    pub fn covers(&self, staff_id: &Ulid, day: NaiveDate) -> bool {
        let staff_ok = match self.staff_id {
            None => true,
            Some(s) => s == *staff_id,
        };
        staff_ok && self.start_day <= day && day <= self.end_day
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub price_cents: i64,
}

/// Per-tenant scheduling configuration. The timezone is an IANA name,
/// validated when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub timezone: String,
    pub slot_grid_minutes: u32,
    pub lead_time_minutes: u32,
    pub max_advance_days: u32,
    pub payout_account: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timezone: "UTC".into(),
            slot_grid_minutes: 30,
            lead_time_minutes: 0,
            max_advance_days: 30,
            payout_account: None,
        }
    }
}

/// How a fee for one money action is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeePolicy {
    /// Percentage of the basis price, 0..=100.
    Percent(u32),
    /// Flat amount in cents, capped at the basis price when applied.
    Flat(i64),
}

/// Fee configuration for a business. A booking snapshots the policy in
/// effect at claim time; later edits never change fees for existing
/// bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub no_show_fee: Option<FeePolicy>,
    pub cancel_fee: Option<FeePolicy>,
    pub refund_restores_credit: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            no_show_fee: None,
            cancel_fee: None,
            refund_restores_credit: true,
        }
    }
}

impl Policy {
    pub fn fee_for(&self, action: MoneyAction) -> Option<FeePolicy> {
        match action {
            MoneyAction::NoShow => self.no_show_fee,
            MoneyAction::Cancel => self.cancel_fee,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    CardSaved,
    Completed,
    NoShow,
    Cancelled,
    Refunded,
}

impl BookingStatus {
    /// Whether a booking in this status occupies its staff interval.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::CardSaved => "card_saved",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    None,
    CardSaved,
    Charged,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::None => "none",
            PaymentStatus::CardSaved => "card_saved",
            PaymentStatus::Charged => "charged",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// Administrative operation that may move money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoneyAction {
    Complete,
    NoShow,
    Cancel,
    Refund,
}

impl MoneyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoneyAction::Complete => "complete",
            MoneyAction::NoShow => "no_show",
            MoneyAction::Cancel => "cancel",
            MoneyAction::Refund => "refund",
        }
    }

    /// Booking status this action lands in when it succeeds.
    pub fn resulting_status(&self) -> BookingStatus {
        match self {
            MoneyAction::Complete => BookingStatus::Completed,
            MoneyAction::NoShow => BookingStatus::NoShow,
            MoneyAction::Cancel => BookingStatus::Cancelled,
            MoneyAction::Refund => BookingStatus::Refunded,
        }
    }

    pub fn parse(s: &str) -> Option<MoneyAction> {
        match s {
            "complete" => Some(MoneyAction::Complete),
            "no_show" => Some(MoneyAction::NoShow),
            "cancel" => Some(MoneyAction::Cancel),
            "refund" => Some(MoneyAction::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }
}

/// One try at moving money for a booking. Append-only; a retry opens a
/// new attempt rather than rewriting a settled one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Ulid,
    pub action: MoneyAction,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub status: AttemptStatus,
    pub external_ref: Option<String>,
    pub failure: Option<String>,
    pub opened_at: Ms,
    pub settled_at: Option<Ms>,
}

/// Full booking record. Never deleted; lifecycle is soft via `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingState {
    pub id: Ulid,
    pub code: String,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer: String,
    pub span: Span,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    /// Service name and price as they were at claim time.
    pub service_name: String,
    pub service_price_cents: i64,
    /// Price after gift credit, never negative. Fee basis for later actions.
    pub final_price_cents: i64,
    pub gift_code: Option<String>,
    pub gift_applied_cents: i64,
    /// Policy in effect at claim time.
    pub policy: Policy,
    pub setup_ref: Option<String>,
    pub method_ref: Option<String>,
    pub last_money_action: Option<MoneyAction>,
    pub attempts: Vec<PaymentAttempt>,
    pub created_at: Ms,
}

impl BookingState {
    /// Human booking code: the tail of the ULID, stable across replay.
    pub fn code_for(id: &Ulid) -> String {
        let s = id.to_string();
        s[s.len() - 8..].to_string()
    }

    /// The succeeded charge a refund would reverse, if any.
    pub fn succeeded_charge(&self) -> Option<&PaymentAttempt> {
        self.attempts.iter().rev().find(|a| {
            a.status == AttemptStatus::Succeeded
                && a.action != MoneyAction::Refund
                && a.amount_cents > 0
        })
    }

    pub fn attempt_by_key(&self, key: &str) -> Option<&PaymentAttempt> {
        self.attempts.iter().rev().find(|a| a.idempotency_key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    Issue,
    Redeem,
    Restore,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Issue => "issue",
            LedgerKind::Redeem => "redeem",
            LedgerKind::Restore => "restore",
        }
    }
}

/// Immutable signed record of a gift-card balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub booking_id: Option<Ulid>,
    pub amount_cents: i64,
    pub kind: LedgerKind,
    pub at: Ms,
}

/// A gift card is its entry history. Balance is always the fold, never
/// a stored counter.
#[derive(Debug, Clone)]
pub struct CardState {
    pub code: String,
    pub expires_at: Option<Ms>,
    pub entries: Vec<LedgerEntry>,
}

impl CardState {
    pub fn balance(&self) -> i64 {
        self.entries.iter().map(|e| e.amount_cents).sum()
    }

    pub fn issued(&self) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.kind == LedgerKind::Issue)
            .map(|e| e.amount_cents)
            .sum()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffCreated {
        id: Ulid,
        name: String,
    },
    StaffDeleted {
        id: Ulid,
    },
    ServiceCreated {
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
    },
    ServiceDeleted {
        id: Ulid,
    },
    RuleAdded {
        id: Ulid,
        staff_id: Ulid,
        weekday: u8,
        start_min: u32,
        end_min: u32,
        services: Option<Vec<Ulid>>,
    },
    RuleRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    BlackoutAdded {
        id: Ulid,
        staff_id: Option<Ulid>,
        start_day: NaiveDate,
        end_day: NaiveDate,
    },
    BlackoutRemoved {
        id: Ulid,
    },
    SettingsUpdated {
        settings: Settings,
    },
    PolicyUpdated {
        policy: Policy,
    },
    CardIssued {
        id: Ulid,
        code: String,
        amount_cents: i64,
        expires_at: Option<Ms>,
        at: Ms,
    },
    CardRedeemed {
        id: Ulid,
        code: String,
        booking_id: Ulid,
        amount_cents: i64,
        at: Ms,
    },
    CardRestored {
        id: Ulid,
        code: String,
        booking_id: Ulid,
        amount_cents: i64,
        at: Ms,
    },
    HoldPlaced {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        span: Span,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        staff_id: Ulid,
    },
    BookingClaimed {
        booking: Box<BookingState>,
    },
    SetupIssued {
        booking_id: Ulid,
        setup_ref: String,
    },
    CardConfirmed {
        booking_id: Ulid,
        method_ref: String,
        at: Ms,
    },
    AttemptOpened {
        booking_id: Ulid,
        attempt: PaymentAttempt,
    },
    AttemptSettled {
        booking_id: Ulid,
        attempt_id: Ulid,
        status: AttemptStatus,
        external_ref: Option<String>,
        failure: Option<String>,
        at: Ms,
    },
    /// Zero-fee status-only transition: no attempt, no gateway leg.
    ActionApplied {
        booking_id: Ulid,
        action: MoneyAction,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub weekday: u8,
    pub start_min: u32,
    pub end_min: u32,
    pub services: Option<Vec<Ulid>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlackoutInfo {
    pub id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start_day: NaiveDate,
    pub end_day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub code: String,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub final_price_cents: i64,
    pub gift_applied_cents: i64,
    pub setup_ref: Option<String>,
    pub created_at: Ms,
}

impl BookingInfo {
    pub fn from_state(b: &BookingState) -> Self {
        Self {
            id: b.id,
            code: b.code.clone(),
            staff_id: b.staff_id,
            service_id: b.service_id,
            customer: b.customer.clone(),
            start: b.span.start,
            end: b.span.end,
            status: b.status,
            payment_status: b.payment_status,
            final_price_cents: b.final_price_cents,
            gift_applied_cents: b.gift_applied_cents,
            setup_ref: b.setup_ref.clone(),
            created_at: b.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptInfo {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub action: MoneyAction,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub status: AttemptStatus,
    pub external_ref: Option<String>,
    pub failure: Option<String>,
    pub opened_at: Ms,
    pub settled_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub code: String,
    pub issued_cents: i64,
    pub balance_cents: i64,
    pub expires_at: Option<Ms>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntryInfo {
    pub id: Ulid,
    pub code: String,
    pub booking_id: Option<Ulid>,
    pub amount_cents: i64,
    pub kind: LedgerKind,
    pub at: Ms,
}

/// Outcome of a money action, the row the actions surface returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub booking_id: Ulid,
    pub action: MoneyAction,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub amount_cents: i64,
    pub attempt_status: Option<AttemptStatus>,
    pub external_ref: Option<String>,
}
