use ulid::Ulid;

use crate::model::{BookingStatus, MoneyAction};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Slot unavailable; carries the blocking interval's id.
    Conflict(Ulid),
    Validation(&'static str),
    UnknownCode(String),
    DuplicateCode(String),
    ExpiredCard(String),
    ZeroBalance(String),
    /// Illegal state-machine transition for the booking's current status.
    IllegalTransition {
        from: BookingStatus,
        action: MoneyAction,
    },
    /// An attempt with this idempotency key is still pending.
    InFlight(Ulid),
    /// The action needs a saved payment method or customer authentication.
    RequiresAction(Ulid),
    Declined(String),
    GatewayTimeout,
    GatewayUnavailable(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "slot conflict with: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::UnknownCode(code) => write!(f, "unknown gift card: {code}"),
            EngineError::DuplicateCode(code) => {
                write!(f, "gift card code already issued: {code}")
            }
            EngineError::ExpiredCard(code) => write!(f, "gift card expired: {code}"),
            EngineError::ZeroBalance(code) => write!(f, "gift card has zero balance: {code}"),
            EngineError::IllegalTransition { from, action } => {
                write!(
                    f,
                    "cannot {} a booking in status {}",
                    action.as_str(),
                    from.as_str()
                )
            }
            EngineError::InFlight(id) => {
                write!(f, "a payment attempt is already in flight for booking {id}")
            }
            EngineError::RequiresAction(id) => {
                write!(f, "booking {id} has no usable payment method saved")
            }
            EngineError::Declined(reason) => write!(f, "payment declined: {reason}"),
            EngineError::GatewayTimeout => write!(f, "payment gateway timed out"),
            EngineError::GatewayUnavailable(reason) => {
                write!(f, "payment gateway unavailable: {reason}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
