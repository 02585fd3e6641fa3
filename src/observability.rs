use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total protocol requests. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "pewledger_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "pewledger_request_duration_seconds";

// ── Ledger outcomes ─────────────────────────────────────────────

/// Counter: allocations granted.
pub const ALLOCATIONS_GRANTED_TOTAL: &str = "pewledger_allocations_granted_total";

/// Counter: units granted across all allocations.
pub const UNITS_GRANTED_TOTAL: &str = "pewledger_units_granted_total";

/// Counter: reservations refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "pewledger_reservations_rejected_total";

/// Counter: reserve calls answered from the idempotency memo.
pub const RESERVATIONS_REPLAYED_TOTAL: &str = "pewledger_reservations_replayed_total";

/// Counter: allocations released.
pub const ALLOCATIONS_RELEASED_TOTAL: &str = "pewledger_allocations_released_total";

/// Counter: lock waits that ran past the configured budget.
pub const LOCK_TIMEOUTS_TOTAL: &str = "pewledger_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "pewledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "pewledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "pewledger_connections_rejected_total";

/// Gauge: number of loaded tenant ledgers.
pub const TENANTS_ACTIVE: &str = "pewledger_tenants_active";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "pewledger_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pewledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pewledger_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
