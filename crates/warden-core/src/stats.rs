//! Traffic counter queries against the proxy's stats API.
//!
//! Counters are reset on read: every successful query returns the bytes
//! accumulated since the previous query and zeroes them at the source.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::MetricsError;

/// Metrics future type.
pub type MetricsFuture<'a> = Pin<Box<dyn Future<Output = Result<i64, MetricsError>> + Send + 'a>>;

/// Direction of a per-account traffic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    Uplink,
    Downlink,
}

impl TrafficDirection {
    pub const ALL: [Self; 2] = [Self::Uplink, Self::Downlink];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uplink => "uplink",
            Self::Downlink => "downlink",
        }
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter name for an account tag: `user>>>{tag}>>>traffic>>>{direction}`.
#[must_use]
pub fn counter_name(tag: &str, direction: TrafficDirection) -> String {
    format!("user>>>{tag}>>>traffic>>>{direction}")
}

/// Source of reset-on-read traffic counters.
pub trait MetricsGateway: Send + Sync {
    /// Read counter `name`, zeroing it at the source when `reset` is set.
    fn get_counter<'a>(&'a self, name: &'a str, reset: bool) -> MetricsFuture<'a>;
}

/// Queries counters by running the proxy's stats client.
///
/// Invocation: `<binary> api stats --server=<addr> -name <counter> [-reset]`.
#[derive(Debug, Clone)]
pub struct CliStatsGateway {
    binary: String,
    server: String,
    timeout: Option<Duration>,
}

impl CliStatsGateway {
    #[must_use]
    pub fn new(binary: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            server: server.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments passed to the stats client for one query.
    #[must_use]
    pub fn query_args(&self, name: &str, reset: bool) -> Vec<String> {
        let mut args = vec![
            "api".to_string(),
            "stats".to_string(),
            format!("--server={}", self.server),
            "-name".to_string(),
            name.to_string(),
        ];
        if reset {
            args.push("-reset".to_string());
        }
        args
    }

    async fn query(&self, name: &str, reset: bool) -> Result<i64, MetricsError> {
        let output = Command::new(&self.binary)
            .args(self.query_args(name, reset))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MetricsError::Spawn(format!("{}: {e}", self.binary)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(counter = name, status = ?output.status, "Stats client finished");

        if !output.status.success() {
            if is_not_found_reply(&stderr) || is_not_found_reply(&stdout) {
                debug!(counter = name, "Counter not registered yet, reading as zero");
                return Ok(0);
            }
            return Err(MetricsError::CommandFailed {
                name: name.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        parse_stats_reply(name, &stdout)
    }
}

impl MetricsGateway for CliStatsGateway {
    fn get_counter<'a>(&'a self, name: &'a str, reset: bool) -> MetricsFuture<'a> {
        Box::pin(async move {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.query(name, reset))
                    .await
                    .map_err(|_| MetricsError::Timeout {
                        name: name.to_string(),
                        seconds: limit.as_secs(),
                    })?,
                None => self.query(name, reset).await,
            }
        })
    }
}

fn is_not_found_reply(text: &str) -> bool {
    text.to_ascii_lowercase().contains("not found")
}

/// Parse a stats client reply into a counter value.
///
/// Accepts the JSON reply (`{"stat": {"name": .., "value": ..}}`, or a `stat`
/// array as printed for multi-counter queries) and the protobuf text form
/// (`stat: < name: ".." value: 123 >`). The value may be a number or a
/// decimal string; an absent value or an empty reply reads as zero.
pub fn parse_stats_reply(name: &str, reply: &str) -> Result<i64, MetricsError> {
    let parse_error = |reason: String| MetricsError::ParseError {
        name: name.to_string(),
        reason,
    };

    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(0);
    }

    if reply.starts_with('{') {
        let doc: Value = serde_json::from_str(reply).map_err(|e| parse_error(e.to_string()))?;
        let stat = match doc.get("stat") {
            None | Some(Value::Null) => return Ok(0),
            Some(Value::Array(stats)) => match stats
                .iter()
                .find(|s| s.get("name").and_then(Value::as_str) == Some(name))
            {
                Some(stat) => stat,
                None => return Ok(0),
            },
            Some(stat) => stat,
        };
        return match stat.get("value") {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| parse_error(format!("value {n} is not an integer"))),
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|e| parse_error(format!("value {s:?}: {e}"))),
            Some(other) => Err(parse_error(format!("unexpected value {other}"))),
        };
    }

    for line in reply.lines() {
        if let Some(value) = line.trim().strip_prefix("value:") {
            let value = value.trim();
            return value
                .parse::<i64>()
                .map_err(|e| parse_error(format!("value {value:?}: {e}")));
        }
    }
    if reply.contains("stat") {
        return Ok(0);
    }
    Err(parse_error(format!("unrecognized reply: {reply}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_match_proxy_layout() {
        assert_eq!(
            counter_name("user_abc", TrafficDirection::Uplink),
            "user>>>user_abc>>>traffic>>>uplink"
        );
        assert_eq!(
            counter_name("user_abc", TrafficDirection::Downlink),
            "user>>>user_abc>>>traffic>>>downlink"
        );
    }

    #[test]
    fn query_args_include_reset_flag_only_when_requested() {
        let gateway = CliStatsGateway::new("v2ray", "127.0.0.1:10085");
        assert_eq!(
            gateway.query_args("c", true),
            vec!["api", "stats", "--server=127.0.0.1:10085", "-name", "c", "-reset"]
        );
        assert!(!gateway.query_args("c", false).contains(&"-reset".to_string()));
    }

    #[test]
    fn parses_json_object_reply() {
        let reply = r#"{"stat": {"name": "c", "value": 4096}}"#;
        assert_eq!(parse_stats_reply("c", reply).unwrap(), 4096);
    }

    #[test]
    fn parses_string_values_and_absent_values() {
        assert_eq!(
            parse_stats_reply("c", r#"{"stat": {"name": "c", "value": "77"}}"#).unwrap(),
            77
        );
        assert_eq!(parse_stats_reply("c", r#"{"stat": {"name": "c"}}"#).unwrap(), 0);
        assert_eq!(parse_stats_reply("c", "{}").unwrap(), 0);
        assert_eq!(parse_stats_reply("c", "   ").unwrap(), 0);
    }

    #[test]
    fn parses_array_reply_by_name() {
        let reply = r#"{"stat": [{"name": "other", "value": 1}, {"name": "c", "value": 9}]}"#;
        assert_eq!(parse_stats_reply("c", reply).unwrap(), 9);
        assert_eq!(parse_stats_reply("missing", reply).unwrap(), 0);
    }

    #[test]
    fn parses_protobuf_text_reply() {
        let reply = "stat: <\n  name: \"c\"\n  value: 123\n>\n";
        assert_eq!(parse_stats_reply("c", reply).unwrap(), 123);
        assert_eq!(parse_stats_reply("c", "stat: <\n  name: \"c\"\n>").unwrap(), 0);
    }

    #[test]
    fn negative_values_are_passed_through() {
        assert_eq!(
            parse_stats_reply("c", r#"{"stat": {"name": "c", "value": -5}}"#).unwrap(),
            -5
        );
    }

    #[test]
    fn garbage_is_parse_error() {
        assert!(matches!(
            parse_stats_reply("c", "{not json"),
            Err(MetricsError::ParseError { .. })
        ));
        assert!(matches!(
            parse_stats_reply("c", r#"{"stat": {"value": "many"}}"#),
            Err(MetricsError::ParseError { .. })
        ));
        assert!(parse_stats_reply("c", "segmentation fault").is_err());
    }

    #[test]
    fn not_found_detection_is_case_insensitive() {
        assert!(is_not_found_reply("rpc error: code = Unknown desc = user>>>x Not Found"));
        assert!(!is_not_found_reply("connection refused"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let gateway = CliStatsGateway::new("/nonexistent/warden-stats-client", "127.0.0.1:1");
        let err = gateway.get_counter("c", true).await.unwrap_err();
        assert!(matches!(err, MetricsError::Spawn(_)));
    }
}
