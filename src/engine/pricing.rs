//! Money math. Integer cents only; division rounds half-up.

use crate::model::FeePolicy;

/// Price after gift credit, never negative. This is also the basis any
/// later fee is computed against.
pub fn final_price_cents(price_cents: i64, credit_cents: i64) -> i64 {
    (price_cents - credit_cents).max(0)
}

/// Fee owed for a no-show or cancellation. A percent fee rounds half-up
/// against the basis; a flat fee never exceeds the basis. No policy
/// configured means no fee.
pub fn fee_amount(fee: Option<&FeePolicy>, basis_cents: i64) -> i64 {
    match fee {
        None => 0,
        Some(FeePolicy::Percent(pct)) => (basis_cents * *pct as i64 + 50) / 100,
        Some(FeePolicy::Flat(cents)) => (*cents).min(basis_cents),
    }
}

/// The platform's cut of a charge, in basis points.
pub fn platform_fee_cents(amount_cents: i64, bps: u32) -> i64 {
    (amount_cents * bps as i64 + 5_000) / 10_000
}
