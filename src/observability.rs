use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: lifecycle operations committed. Labels: op, outcome.
pub const OPS_TOTAL: &str = "slicedb_ops_total";

/// Histogram: lifecycle operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "slicedb_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of live entities.
pub const ENTITIES_ACTIVE: &str = "slicedb_entities_active";

/// Counter: reservations repointed by reference migration.
pub const RESERVATIONS_MIGRATED_TOTAL: &str = "slicedb_reservations_migrated_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slicedb_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slicedb_wal_flush_batch_size";

/// Install a Prometheus metrics exporter on the given port. No-op if `port`
/// is None.
pub fn init_metrics(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install a plain fmt tracing subscriber. Convenience for binaries and
/// tests embedding the engine; no-op if a subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}
