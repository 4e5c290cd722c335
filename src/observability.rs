use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "caplevel_requests_total";

/// Histogram: request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "caplevel_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "caplevel_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "caplevel_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "caplevel_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "caplevel_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "caplevel_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: allocations committed.
pub const ALLOCATIONS_ACCEPTED_TOTAL: &str = "caplevel_allocations_accepted_total";

/// Counter: allocation writes refused. Labels: reason (`validation` | `capacity`).
pub const ALLOCATIONS_REJECTED_TOTAL: &str = "caplevel_allocations_rejected_total";

/// Counter: fragmentation warnings handed back to callers.
pub const FRAGMENTATION_WARNINGS_TOTAL: &str = "caplevel_fragmentation_warnings_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
///
/// A failed install is logged; the service runs on without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Collapse a request path to a low-cardinality route label.
pub fn route_label(method: &str, path: &str) -> &'static str {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("GET", ["availability"]) => "availability",
        ("GET", ["booking"]) => "booking",
        ("GET", ["resources"]) => "list_resources",
        ("GET", ["resources", _, "allocations"]) => "list_allocations",
        ("GET", ["projects", _, "summary"]) => "project_summary",
        ("GET", ["allocations", _]) => "get_allocation",
        ("POST", ["resources"]) => "create_resource",
        ("PUT", ["resources", _]) => "update_resource",
        ("DELETE", ["resources", _]) => "delete_resource",
        ("POST", ["projects"]) => "create_project",
        ("DELETE", ["projects", _]) => "delete_project",
        ("POST", ["allocations"]) => "create_allocation",
        ("PUT", ["allocations", _]) => "update_allocation",
        ("DELETE", ["allocations", _]) => "delete_allocation",
        ("POST", ["allocations", _, "retire"]) => "retire_allocation",
        ("POST", ["allocations", _, "reinstate"]) => "reinstate_allocation",
        _ => "unknown",
    }
}
