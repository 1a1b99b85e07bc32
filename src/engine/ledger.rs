//! Gift card issuance and the ledger read side. A card is nothing but
//! its entry history; the claim and refund paths append redemptions and
//! restores, this module only ever appends `Issue`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{apply_to_card, claim::now_ms, Engine, EngineError};

/// Snapshot for the cards read surface. `active` means spendable now.
pub(super) fn card_info(card: &CardState, now: Ms) -> CardInfo {
    let balance = card.balance();
    let expired = card.expires_at.is_some_and(|exp| exp <= now);
    CardInfo {
        code: card.code.clone(),
        issued_cents: card.issued(),
        balance_cents: balance,
        expires_at: card.expires_at,
        active: balance > 0 && !expired,
    }
}

impl Engine {
    /// Issue a new card. Codes are caller-chosen (they get printed on
    /// physical cards) and are never reusable, even once drained.
    pub async fn issue_card(
        &self,
        code: String,
        amount_cents: i64,
        expires_at: Option<Ms>,
    ) -> Result<CardInfo, EngineError> {
        if code.is_empty() {
            return Err(EngineError::Validation("gift card code must not be empty"));
        }
        if code.len() > MAX_GIFT_CODE_LEN {
            return Err(EngineError::LimitExceeded("gift code too long"));
        }
        if amount_cents <= 0 {
            return Err(EngineError::Validation("gift amount must be positive"));
        }
        if amount_cents > MAX_PRICE_CENTS {
            return Err(EngineError::LimitExceeded("gift amount too large"));
        }
        if let Some(exp) = expires_at
            && !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&exp) {
                return Err(EngineError::LimitExceeded("timestamp out of range"));
            }
        if self.cards.len() >= MAX_CARDS {
            return Err(EngineError::LimitExceeded("too many gift cards"));
        }

        // Reserve the code first so two issuers can't share it, then
        // hold the card lock across the append so no claim can redeem
        // against a half-issued card.
        let card = match self.cards.entry(code.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateCode(code)),
            Entry::Vacant(v) => v
                .insert(Arc::new(RwLock::new(CardState {
                    code: code.clone(),
                    expires_at: None,
                    entries: Vec::new(),
                })))
                .clone(),
        };
        let mut guard = card.write().await;

        let event = Event::CardIssued {
            id: Ulid::new(),
            code: code.clone(),
            amount_cents,
            expires_at,
            at: now_ms(),
        };
        if let Err(e) = self.wal_append_one(&event).await {
            drop(guard);
            self.cards.remove(&code);
            return Err(e);
        }
        apply_to_card(&mut guard, &event);

        metrics::counter!(observability::CARDS_ISSUED_TOTAL).increment(1);
        Ok(card_info(&guard, now_ms()))
    }
}
