//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; [`install`] wires the
//! Prometheus recorder whose handle renders `GET /metrics`. Without an
//! installed recorder every helper is a no-op, which is what tests see.

use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const TOTAL_CONNECTIONS: &str = "receptor_controller_websocket_total_connection_count";
pub const ACTIVE_CONNECTIONS: &str = "receptor_controller_websocket_active_connection_count";
pub const MESSAGES_SENT: &str = "receptor_controller_messages_sent_count";
pub const MESSAGES_RECEIVED: &str = "receptor_controller_messages_received_count";
pub const DUPLICATE_CONNECTIONS: &str = "receptor_controller_duplicate_connection_count";
pub const PING_SECONDS: &str = "receptor_controller_ping_seconds";
pub const KAFKA_WRITER_FAILURES: &str = "receptor_controller_kafka_response_writer_failure_count";
pub const RESPONSE_WITHOUT_HANDLER: &str =
    "receptor_controller_response_message_without_handler_count";
pub const RESPONSE_HANDLED: &str = "receptor_controller_response_message_handled_count";
pub const STALE_UNREGISTERED: &str =
    "receptor_controller_unregister_stale_connection_from_redis_count";
pub const RE_REGISTERED: &str = "receptor_controller_re_register_connection_with_redis_count";
pub const CLOSED_DUE_TO_DUPLICATE: &str =
    "receptor_controller_connection_closed_due_to_duplicate_count";
pub const POD_LOOKUP_FAILURES: &str = "receptor_controller_pod_running_status_lookup_failure_count";
pub const REDIS_LOOKUP_FAILURES: &str = "receptor_controller_redis_lookup_failure_count";
pub const PROXY_DURATION: &str = "receptor_controller_http_proxy_duration_seconds";
pub const PROXY_STATUS: &str = "receptor_controller_http_proxy_status_code_count";

/// Install the global Prometheus recorder.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn connection_opened(account: &str) {
    ::metrics::counter!(TOTAL_CONNECTIONS, "account" => account.to_string()).increment(1);
    ::metrics::gauge!(ACTIVE_CONNECTIONS, "account" => account.to_string()).increment(1.0);
}

pub fn connection_closed(account: &str) {
    ::metrics::gauge!(ACTIVE_CONNECTIONS, "account" => account.to_string()).decrement(1.0);
}

pub fn message_sent(kind: &'static str) {
    ::metrics::counter!(MESSAGES_SENT, "type" => kind).increment(1);
}

pub fn message_received(kind: &'static str) {
    ::metrics::counter!(MESSAGES_RECEIVED, "type" => kind).increment(1);
}

pub fn duplicate_connection() {
    ::metrics::counter!(DUPLICATE_CONNECTIONS).increment(1);
}

pub fn ping_elapsed(account: &str, recipient: &str, elapsed: Duration) {
    ::metrics::histogram!(
        PING_SECONDS,
        "account" => account.to_string(),
        "recipient" => recipient.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn kafka_write_failed(records: usize) {
    ::metrics::counter!(KAFKA_WRITER_FAILURES).increment(records as u64);
}

pub fn response_without_handler() {
    ::metrics::counter!(RESPONSE_WITHOUT_HANDLER).increment(1);
}

pub fn response_handled() {
    ::metrics::counter!(RESPONSE_HANDLED).increment(1);
}

pub fn stale_connection_unregistered() {
    ::metrics::counter!(STALE_UNREGISTERED).increment(1);
}

pub fn connection_re_registered() {
    ::metrics::counter!(RE_REGISTERED).increment(1);
}

pub fn closed_due_to_duplicate() {
    ::metrics::counter!(CLOSED_DUE_TO_DUPLICATE).increment(1);
}

pub fn pod_lookup_failed() {
    ::metrics::counter!(POD_LOOKUP_FAILURES).increment(1);
}

pub fn redis_lookup_failed() {
    ::metrics::counter!(REDIS_LOOKUP_FAILURES).increment(1);
}

pub fn proxy_request(method: &'static str, status: Option<u16>, elapsed: Duration) {
    ::metrics::histogram!(PROXY_DURATION, "method" => method).record(elapsed.as_secs_f64());
    let code = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    ::metrics::counter!(PROXY_STATUS, "method" => method, "code" => code).increment(1);
}
