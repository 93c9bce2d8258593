//! Metric names recorded through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding binary installs a recorder.

/// Physical connections opened (counter).
pub const CONNECTIONS_OPENED_TOTAL: &str = "tether_connections_opened_total";
/// Open connections that ended (counter, labels: initiator).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "tether_connections_closed_total";
/// Connections currently open (gauge).
pub const CONNECTIONS_OPEN: &str = "tether_connections_open";
/// Reconnect attempts scheduled (counter).
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "tether_reconnect_attempts_total";
/// Records that gave up reconnecting (counter).
pub const RECONNECT_EXHAUSTED_TOTAL: &str = "tether_reconnect_exhausted_total";
/// Inbound frames dropped as unparseable (counter).
pub const PARSE_FAILURES_TOTAL: &str = "tether_parse_failures_total";
/// Subscribes parked at the connection ceiling (counter).
pub const LIMIT_REJECTIONS_TOTAL: &str = "tether_limit_rejections_total";
/// Sends dropped because the outbound buffer was full (counter).
pub const SEND_DROPS_TOTAL: &str = "tether_send_drops_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_OPENED_TOTAL,
            CONNECTIONS_CLOSED_TOTAL,
            CONNECTIONS_OPEN,
            RECONNECT_ATTEMPTS_TOTAL,
            RECONNECT_EXHAUSTED_TOTAL,
            PARSE_FAILURES_TOTAL,
            LIMIT_REJECTIONS_TOTAL,
            SEND_DROPS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tether_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
