//! Hard bounds on inputs and state growth. Everything that crosses the
//! wire is checked against these before it can touch the WAL.

use crate::model::Ms;

// Timestamps must land in [1970, 2100).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Bookings and holds are between one minute and one day long.
pub const MIN_SPAN_DURATION_MS: Ms = 60_000;
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_STAFF: usize = 4096;
pub const MAX_SERVICES: usize = 4096;
pub const MAX_RULES_PER_STAFF: usize = 256;
pub const MAX_BLACKOUTS: usize = 4096;
pub const MAX_BUSY_PER_STAFF: usize = 65_536;
pub const MAX_ATTEMPTS_PER_BOOKING: usize = 64;
pub const MAX_ENTRIES_PER_CARD: usize = 4096;
pub const MAX_CARDS: usize = 65_536;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CUSTOMER_LEN: usize = 512;
pub const MAX_GIFT_CODE_LEN: usize = 64;

/// $100k in cents. Applies to service prices, gift issuance, and fees.
pub const MAX_PRICE_CENTS: i64 = 10_000_000;

/// Slot expansion never looks further out than this.
pub const MAX_HORIZON_DAYS: u32 = 60;

pub const MIN_SLOT_GRID_MINUTES: u32 = 5;
pub const MAX_SLOT_GRID_MINUTES: u32 = 240;

/// How long a checkout hold blocks the diary before the reaper frees it.
pub const HOLD_TTL_MS: Ms = 900_000;

/// Ceiling on a single gateway round trip.
pub const GATEWAY_TIMEOUT_MS: u64 = 10_000;
