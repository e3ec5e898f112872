//! Server metrics.
//!
//! Instruments come from the global OpenTelemetry meter provider. Without an
//! installed provider every recording is a no-op, so the library never needs
//! an exporter of its own.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("xmpp-light"))
}

// ============================================================================
// Counters
// ============================================================================

pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.routed")
        .with_description("Stanzas handled by the router, by outcome")
        .with_unit("stanza")
        .build()
}

pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.auth.attempts")
        .with_description("SASL authentication attempts")
        .with_unit("attempt")
        .build()
}

pub fn backpressure_drops() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.delivery.backpressure_drops")
        .with_description("Stanzas dropped because an output queue stayed full")
        .with_unit("stanza")
        .build()
}

pub fn offline_messages() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.offline.messages")
        .with_description("Messages for recipients without an available resource")
        .with_unit("message")
        .build()
}

pub fn muc_presence_events() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.muc.presence")
        .with_description("MUC joins and leaves")
        .with_unit("event")
        .build()
}

pub fn muc_messages() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.muc.messages")
        .with_description("Groupchat messages broadcast")
        .with_unit("message")
        .build()
}

// ============================================================================
// Gauges
// ============================================================================

pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.sessions.active")
        .with_description("Sessions with a bound resource")
        .with_unit("session")
        .build()
}

pub fn muc_rooms_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.muc.rooms.active")
        .with_description("Existing MUC rooms")
        .with_unit("room")
        .build()
}

// ============================================================================
// Histograms
// ============================================================================

pub fn routing_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.routing.latency")
        .with_description("Time from router admission to delivery")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Recording helpers
// ============================================================================

pub fn record_routed(kind: &str, outcome: &'static str) {
    stanzas_routed().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

pub fn record_backpressure_drop() {
    backpressure_drops().add(1, &[]);
}

/// `action` is one of persist, drop or bounce.
pub fn record_offline(action: &'static str) {
    offline_messages().add(1, &[KeyValue::new("action", action)]);
}

pub fn record_session_count(count: i64) {
    sessions_active().record(count, &[]);
}

pub fn record_muc_presence(event: &'static str) {
    muc_presence_events().add(1, &[KeyValue::new("event", event)]);
}

pub fn record_muc_message() {
    muc_messages().add(1, &[]);
}

pub fn record_room_count(count: i64) {
    muc_rooms_active().record(count, &[]);
}

pub fn record_routing_latency(latency_ms: f64, kind: &str) {
    routing_latency().record(latency_ms, &[KeyValue::new("kind", kind.to_string())]);
}
