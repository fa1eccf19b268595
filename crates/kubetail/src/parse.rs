use chrono::{DateTime, Utc};

/// Split a line returned with `timestamps=true` into its timestamp and text. The
/// trailing newline is dropped. When no RFC3339 timestamp leads the line, the current
/// time is returned with the line untouched.
pub fn parse_kubernetes_log(input: &str) -> (DateTime<Utc>, String) {
    let input = input.strip_suffix('\n').unwrap_or(input);
    let input = input.strip_suffix('\r').unwrap_or(input);
    let Some((ts, rest)) = input.split_once(' ') else {
        return (Utc::now(), input.to_string());
    };
    match DateTime::parse_from_rfc3339(ts) {
        Ok(t) => (t.with_timezone(&Utc), rest.to_string()),
        Err(_) => (Utc::now(), input.to_string()),
    }
}
