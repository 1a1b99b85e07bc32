use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::auth::RotaAuthSource;
use crate::engine::{ActionRequest, ClaimRequest, Engine, CHANNEL_BOOKINGS};
use crate::model::*;
use crate::notify::NotifyMsg;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct RotaHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RotaQueryParser>,
    /// LISTEN subscriptions for this connection, keyed by channel name.
    /// Receivers are drained at command boundaries, so a subscriber that
    /// wants timely delivery issues any cheap query to pump the stream.
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<NotifyMsg>>>,
}

impl RotaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RotaQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    fn subs(&self) -> MutexGuard<'_, HashMap<String, broadcast::Receiver<NotifyMsg>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push everything queued on this connection's subscriptions out as
    /// NotificationResponse frames. Called before and after each command.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let queued = {
            let mut subs = self.subs();
            let mut out = Vec::new();
            for rx in subs.values_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(msg) => out.push(msg),
                        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
            out
        };
        if queued.is_empty() {
            return Ok(());
        }
        for msg in queued {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, msg.channel, msg.payload),
                ))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertStaff { id, name } => {
                engine.create_staff(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteStaff { id } => {
                engine.delete_staff(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertService {
                id,
                name,
                duration_min,
                price_cents,
            } => {
                engine
                    .create_service(id, name, duration_min, price_cents)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRule {
                id,
                staff_id,
                weekday,
                start_min,
                end_min,
                services,
            } => {
                engine
                    .add_rule(id, staff_id, weekday, start_min, end_min, services)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteRule { id } => {
                engine.remove_rule(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBlackout {
                id,
                staff_id,
                start_day,
                end_day,
            } => {
                engine
                    .add_blackout(id, staff_id, start_day, end_day)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBlackout { id } => {
                engine.remove_blackout(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpdateSettings {
                timezone,
                slot_grid_minutes,
                lead_time_minutes,
                max_advance_days,
                payout_account,
            } => {
                engine
                    .update_settings(
                        timezone,
                        slot_grid_minutes,
                        lead_time_minutes,
                        max_advance_days,
                        payout_account,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdatePolicy {
                no_show_fee,
                cancel_fee,
                refund_restores_credit,
            } => {
                engine
                    .update_policy(no_show_fee, cancel_fee, refund_restores_credit)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertCard {
                code,
                amount_cents,
                expires_at,
            } => {
                engine
                    .issue_card(code, amount_cents, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertHold {
                id,
                staff_id,
                service_id,
                start,
            } => {
                engine
                    .place_hold(id, staff_id, service_id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteHold { id } => {
                engine.release_hold(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                staff_id,
                service_id,
                customer,
                start,
                gift_code,
                hold_id,
            } => {
                let outcome = engine
                    .claim(ClaimRequest {
                        id,
                        staff_id,
                        service_id,
                        customer,
                        start,
                        gift_code,
                        hold_id,
                    })
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(claim_schema());
                let b = outcome.booking;
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&b.id.to_string())?;
                encoder.encode_field(&b.code)?;
                encoder.encode_field(&b.status.as_str())?;
                encoder.encode_field(&b.final_price_cents)?;
                encoder.encode_field(&b.gift_applied_cents)?;
                encoder.encode_field(&outcome.client_secret)?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::ConfirmCard {
                booking_id,
                method_ref,
            } => {
                engine
                    .confirm_card(booking_id, method_ref)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertAction {
                booking_id,
                action,
                amount_cents,
                idempotency_key,
            } => {
                let outcome = engine
                    .run_action(ActionRequest {
                        booking_id,
                        action,
                        amount_cents,
                        idempotency_key,
                    })
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(action_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.booking_id.to_string())?;
                encoder.encode_field(&outcome.action.as_str())?;
                encoder.encode_field(&outcome.status.as_str())?;
                encoder.encode_field(&outcome.payment_status.as_str())?;
                encoder.encode_field(&outcome.amount_cents)?;
                encoder.encode_field(&outcome.attempt_status.map(|s| s.as_str()))?;
                encoder.encode_field(&outcome.external_ref)?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStaff => {
                let staff = engine.list_staff().await;
                let schema = Arc::new(staff_schema());
                let rows: Vec<PgWireResult<_>> = staff
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectServices => {
                let services = engine.list_services();
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_min as i32))?;
                        encoder.encode_field(&s.price_cents)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRules { staff_id } => {
                let rules = engine.list_rules(staff_id).await.map_err(engine_err)?;
                let schema = Arc::new(rules_schema());
                let rows: Vec<PgWireResult<_>> = rules
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.staff_id.to_string())?;
                        encoder.encode_field(&(r.weekday as i16))?;
                        encoder.encode_field(&(r.start_min as i32))?;
                        encoder.encode_field(&(r.end_min as i32))?;
                        encoder.encode_field(&services_text(&r.services))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBlackouts => {
                let blackouts = engine.list_blackouts().await;
                let schema = Arc::new(blackouts_schema());
                let rows: Vec<PgWireResult<_>> = blackouts
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.staff_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&b.start_day.format("%Y-%m-%d").to_string())?;
                        encoder.encode_field(&b.end_day.format("%Y-%m-%d").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSettings => {
                let settings = engine.settings.read().await.clone();
                let schema = Arc::new(settings_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&settings.timezone)?;
                encoder.encode_field(&(settings.slot_grid_minutes as i32))?;
                encoder.encode_field(&(settings.lead_time_minutes as i32))?;
                encoder.encode_field(&(settings.max_advance_days as i32))?;
                encoder.encode_field(&settings.payout_account)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectPolicy => {
                let policy = engine.policy.read().await.clone();
                let schema = Arc::new(policy_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&fee_text(policy.no_show_fee))?;
                encoder.encode_field(&fee_text(policy.cancel_fee))?;
                encoder.encode_field(&policy.refund_restores_credit)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectCard { code } => {
                let card = engine.card_info_for(&code).await.map_err(engine_err)?;
                let schema = Arc::new(cards_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&card.code)?;
                encoder.encode_field(&card.issued_cents)?;
                encoder.encode_field(&card.balance_cents)?;
                encoder.encode_field(&card.expires_at)?;
                encoder.encode_field(&card.active)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectLedger { code } => {
                let entries = engine.ledger_entries(&code).await.map_err(engine_err)?;
                let schema = Arc::new(ledger_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.code)?;
                        encoder.encode_field(&e.booking_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&e.amount_cents)?;
                        encoder.encode_field(&e.kind.as_str())?;
                        encoder.encode_field(&e.at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectHolds { staff_id } => {
                let holds = engine.list_holds(staff_id).await.map_err(engine_err)?;
                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<_>> = holds
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.id.to_string())?;
                        encoder.encode_field(&h.staff_id.to_string())?;
                        encoder.encode_field(&h.service_id.to_string())?;
                        encoder.encode_field(&h.start)?;
                        encoder.encode_field(&h.end)?;
                        encoder.encode_field(&h.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { id, staff_id } => {
                let bookings = match id {
                    Some(bid) => engine.get_booking_info(&bid).await.into_iter().collect(),
                    None => engine.list_bookings(staff_id).await,
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.code)?;
                        encoder.encode_field(&b.staff_id.to_string())?;
                        encoder.encode_field(&b.service_id.to_string())?;
                        encoder.encode_field(&b.customer)?;
                        encoder.encode_field(&b.start)?;
                        encoder.encode_field(&b.end)?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.payment_status.as_str())?;
                        encoder.encode_field(&b.final_price_cents)?;
                        encoder.encode_field(&b.gift_applied_cents)?;
                        encoder.encode_field(&b.setup_ref)?;
                        encoder.encode_field(&b.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAttempts { booking_id } => {
                let attempts = engine
                    .booking_attempts(&booking_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(attempts_schema());
                let rows: Vec<PgWireResult<_>> = attempts
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.booking_id.to_string())?;
                        encoder.encode_field(&a.action.as_str())?;
                        encoder.encode_field(&a.amount_cents)?;
                        encoder.encode_field(&a.idempotency_key)?;
                        encoder.encode_field(&a.status.as_str())?;
                        encoder.encode_field(&a.external_ref)?;
                        encoder.encode_field(&a.failure)?;
                        encoder.encode_field(&a.opened_at)?;
                        encoder.encode_field(&a.settled_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots {
                service_id,
                staff_id,
                from,
                to,
            } => {
                let slots = engine
                    .list_slots(service_id, staff_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let sid_str = service_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.staff_id.to_string())?;
                        encoder.encode_field(&sid_str)?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        encoder.encode_field(&slot.local_label)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                validate_channel(&channel)?;
                let rx = engine.notify.subscribe(&channel);
                // Re-LISTEN on the same channel replaces the receiver,
                // so duplicates never double-deliver.
                self.subs().insert(channel, rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.subs().remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subs().clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn validate_channel(channel: &str) -> PgWireResult<()> {
    if channel == CHANNEL_BOOKINGS {
        return Ok(());
    }
    let staff_id = channel.strip_prefix("staff_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected bookings or staff_{{id}})"),
        )))
    })?;
    Ulid::from_string(staff_id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })?;
    Ok(())
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn claim_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("code", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("final_price_cents", Type::INT8),
        text_field("gift_applied_cents", Type::INT8),
        text_field("client_secret", Type::VARCHAR),
    ]
}

fn action_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id", Type::VARCHAR),
        text_field("action", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("payment_status", Type::VARCHAR),
        text_field("amount_cents", Type::INT8),
        text_field("attempt_status", Type::VARCHAR),
        text_field("external_ref", Type::VARCHAR),
    ]
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("duration_min", Type::INT4),
        text_field("price_cents", Type::INT8),
    ]
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("staff_id", Type::VARCHAR),
        text_field("weekday", Type::INT2),
        text_field("start_min", Type::INT4),
        text_field("end_min", Type::INT4),
        text_field("services", Type::VARCHAR),
    ]
}

fn blackouts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("staff_id", Type::VARCHAR),
        text_field("start_day", Type::VARCHAR),
        text_field("end_day", Type::VARCHAR),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("timezone", Type::VARCHAR),
        text_field("slot_grid_minutes", Type::INT4),
        text_field("lead_time_minutes", Type::INT4),
        text_field("max_advance_days", Type::INT4),
        text_field("payout_account", Type::VARCHAR),
    ]
}

fn policy_schema() -> Vec<FieldInfo> {
    vec![
        text_field("no_show_fee", Type::VARCHAR),
        text_field("cancel_fee", Type::VARCHAR),
        text_field("refund_restores_credit", Type::BOOL),
    ]
}

fn cards_schema() -> Vec<FieldInfo> {
    vec![
        text_field("code", Type::VARCHAR),
        text_field("issued_cents", Type::INT8),
        text_field("balance_cents", Type::INT8),
        text_field("expires_at", Type::INT8),
        text_field("active", Type::BOOL),
    ]
}

fn ledger_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("code", Type::VARCHAR),
        text_field("booking_id", Type::VARCHAR),
        text_field("amount_cents", Type::INT8),
        text_field("kind", Type::VARCHAR),
        text_field("at", Type::INT8),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("staff_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("expires_at", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("code", Type::VARCHAR),
        text_field("staff_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("customer", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("payment_status", Type::VARCHAR),
        text_field("final_price_cents", Type::INT8),
        text_field("gift_applied_cents", Type::INT8),
        text_field("setup_ref", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn attempts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("booking_id", Type::VARCHAR),
        text_field("action", Type::VARCHAR),
        text_field("amount_cents", Type::INT8),
        text_field("idempotency_key", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("external_ref", Type::VARCHAR),
        text_field("failure", Type::VARCHAR),
        text_field("opened_at", Type::INT8),
        text_field("settled_at", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("staff_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("local_label", Type::VARCHAR),
    ]
}

fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("INSERT") {
        if upper.contains("INTO BOOKINGS") {
            return claim_schema();
        }
        if upper.contains("INTO ACTIONS") {
            return action_schema();
        }
        return vec![];
    }
    if !upper.contains("SELECT") {
        return vec![];
    }
    let tables: [(&str, fn() -> Vec<FieldInfo>); 12] = [
        ("FROM SLOTS", slots_schema),
        ("FROM BOOKINGS", bookings_schema),
        ("FROM ATTEMPTS", attempts_schema),
        ("FROM STAFF", staff_schema),
        ("FROM SERVICES", services_schema),
        ("FROM RULES", rules_schema),
        ("FROM BLACKOUTS", blackouts_schema),
        ("FROM SETTINGS", settings_schema),
        ("FROM POLICY", policy_schema),
        ("FROM CARDS", cards_schema),
        ("FROM LEDGER", ledger_schema),
        ("FROM HOLDS", holds_schema),
    ];
    for (needle, schema) in tables {
        if upper.contains(needle) {
            return schema();
        }
    }
    vec![]
}

fn fee_text(fee: Option<FeePolicy>) -> Option<String> {
    fee.map(|f| match f {
        FeePolicy::Percent(p) => format!("percent:{p}"),
        FeePolicy::Flat(c) => format!("flat:{c}"),
    })
}

fn services_text(services: &Option<Vec<Ulid>>) -> Option<String> {
    services.as_ref().map(|ids| {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    })
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for RotaHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        self.flush_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RotaQueryParser;

#[async_trait]
impl QueryParser for RotaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RotaHandler {
    type Statement = String;
    type QueryParser = RotaQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        self.flush_notifications(client).await?;
        let mut responses = result?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema_for(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RotaFactory {
    handler: Arc<RotaHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RotaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RotaFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RotaAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RotaHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RotaFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection to completion. Builds a fresh handler so
/// LISTEN subscriptions live and die with the session.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = RotaFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
