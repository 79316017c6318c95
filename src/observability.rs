use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "daybook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "daybook_query_duration_seconds";

/// Counter: booking attempts. Labels: result (`ok` or an error code).
pub const BOOKINGS_TOTAL: &str = "daybook_bookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "daybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "daybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "daybook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "daybook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "daybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "daybook_wal_flush_batch_size";

// ── Batch jobs ──────────────────────────────────────────────────

/// Counter: job runs. Labels: job.
pub const JOB_RUNS_TOTAL: &str = "daybook_job_runs_total";

/// Counter: entities handled by jobs. Labels: job, result (`processed`/`failed`).
pub const JOB_ITEMS_TOTAL: &str = "daybook_job_items_total";

/// Histogram: job run duration in seconds. Labels: job.
pub const JOB_DURATION_SECONDS: &str = "daybook_job_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertClient { .. } => "insert_client",
        Command::InsertPackage { .. } => "insert_package",
        Command::InsertPurchase { .. } => "insert_purchase",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::MoveAppointment { .. } => "move_appointment",
        Command::SetStatus { .. } => "set_status",
        Command::MarkMessage { .. } => "mark_message",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectLanes { .. } => "select_lanes",
        Command::SelectOutbound => "select_outbound",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
