//! Prometheus metrics registry.

use ::metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the recorder and describe every metric the gateway emits.
pub fn install() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");

    describe_counter!(
        "ubergang_http_requests_total",
        "The total number of HTTP requests"
    );
    describe_counter!(
        "ubergang_http_request_size_bytes",
        "The total size of incoming requests"
    );
    describe_counter!(
        "ubergang_http_response_size_bytes",
        "The total size of HTTP responses"
    );
    describe_histogram!(
        "ubergang_http_request_duration_seconds",
        "HTTP request latency"
    );
    describe_counter!(
        "ubergang_backend_connection_errors_total",
        "The total number of failed upstream connections"
    );
    describe_counter!(
        "ubergang_cert_updates_total",
        "The total number of certificate updates"
    );
    describe_gauge!(
        "ubergang_cert_last_updated",
        "The timestamp when the certificate was last updated"
    );

    describe_counter!(
        "ubermqtt_connection_errors_total",
        "The total number of connection errors"
    );
    describe_counter!(
        "ubermqtt_connection_success_total",
        "The total number of connection successes"
    );
    describe_counter!("ubermqtt_publish_total", "The total number of publishes");
    describe_counter!(
        "ubermqtt_subscribe_topics_total",
        "The total number of subscription topics"
    );
    describe_counter!(
        "ubermqtt_subscribe_messages_total",
        "The total number of received messages from subscriptions"
    );
    describe_counter!(
        "ubermqtt_packets_client_total",
        "The total number of MQTT packets from clients"
    );
    describe_counter!(
        "ubermqtt_packets_broker_total",
        "The total number of MQTT packets from the broker"
    );
    describe_gauge!("ubermqtt_client_connected", "Connected clients, by account");
    describe_counter!(
        "ubermqtt_publisher_success_total",
        "Total number of successful publishes"
    );
    describe_counter!(
        "ubermqtt_publisher_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "ubermqtt_publisher_reconnects_total",
        "Total number of reconnection attempts"
    );
    describe_gauge!(
        "ubermqtt_publisher_connected",
        "Whether the publisher is connected (1) or not (0)"
    );

    handle
}
