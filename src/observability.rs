use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rota_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rota_query_duration_seconds";

/// Counter: bookings claimed.
pub const CLAIMS_TOTAL: &str = "rota_claims_total";

/// Counter: claims and holds refused because the interval was taken.
pub const CLAIM_CONFLICTS_TOTAL: &str = "rota_claim_conflicts_total";

/// Counter: checkout holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "rota_holds_placed_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "rota_holds_reaped_total";

/// Counter: money actions settled. Labels: action, outcome.
pub const MONEY_ACTIONS_TOTAL: &str = "rota_money_actions_total";

/// Counter: gift cards issued.
pub const CARDS_ISSUED_TOTAL: &str = "rota_cards_issued_total";

/// Histogram: payment gateway round-trip latency in seconds.
pub const GATEWAY_CALL_DURATION_SECONDS: &str = "rota_gateway_call_duration_seconds";

/// Counter: gateway calls cut off at the deadline.
pub const GATEWAY_TIMEOUTS_TOTAL: &str = "rota_gateway_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rota_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rota_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rota_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "rota_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "rota_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rota_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rota_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertRule { .. } => "insert_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::UpdateSettings { .. } => "update_settings",
        Command::UpdatePolicy { .. } => "update_policy",
        Command::InsertCard { .. } => "insert_card",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ConfirmCard { .. } => "confirm_card",
        Command::InsertAction { .. } => "insert_action",
        Command::SelectStaff => "select_staff",
        Command::SelectServices => "select_services",
        Command::SelectRules { .. } => "select_rules",
        Command::SelectBlackouts => "select_blackouts",
        Command::SelectSettings => "select_settings",
        Command::SelectPolicy => "select_policy",
        Command::SelectCard { .. } => "select_card",
        Command::SelectLedger { .. } => "select_ledger",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAttempts { .. } => "select_attempts",
        Command::SelectSlots { .. } => "select_slots",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
