use clap::Parser;
use common::hub::parse_interval;
use std::time::Duration;

fn parse_period(value: &str) -> Result<Duration, String> {
    parse_interval(value)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| format!("invalid period {value:?}, expected something like 500ms, 1s or 5m"))
        .or_else(|e| {
            value
                .strip_suffix("ms")
                .and_then(|ms| ms.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .ok_or(e)
        })
}

/// Operator settings, every flag can come from the environment
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address of the metrics and health endpoints
    #[arg(short, long, env = "BIND_ADDRESS", value_name = "BIND_ADDRESS", default_value = "0.0.0.0:9000")]
    pub bind: String,

    /// Concurrent LynqHub reconciliations
    #[arg(long, env = "HUB_CONCURRENCY", value_name = "HUB_CONCURRENCY", default_value_t = 3)]
    pub hub_concurrency: u16,

    /// Concurrent LynqForm reconciliations
    #[arg(long, env = "FORM_CONCURRENCY", value_name = "FORM_CONCURRENCY", default_value_t = 3)]
    pub form_concurrency: u16,

    /// Concurrent LynqNode reconciliations
    #[arg(long, env = "NODE_CONCURRENCY", value_name = "NODE_CONCURRENCY", default_value_t = 10)]
    pub node_concurrency: u16,

    /// Attempts of a status write before giving up on conflicts
    #[arg(long, env = "STATUS_RETRIES", value_name = "STATUS_RETRIES", default_value_t = 5)]
    pub status_retries: u32,

    /// Period of the background flush of pending LynqNode statuses
    #[arg(long, env = "STATUS_FLUSH_INTERVAL", value_name = "STATUS_FLUSH_INTERVAL", default_value = "1s", value_parser = parse_period)]
    pub status_flush_interval: Duration,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["operator"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.hub_concurrency, 3);
        assert_eq!(config.form_concurrency, 3);
        assert_eq!(config.node_concurrency, 10);
        assert_eq!(config.status_retries, 5);
        assert_eq!(config.status_flush_interval, Duration::from_secs(1));
        assert!(!config.log_json);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from(["operator", "--node-concurrency", "4", "--status-flush-interval", "250ms", "--log-json"]);
        assert_eq!(config.node_concurrency, 4);
        assert_eq!(config.status_flush_interval, Duration::from_millis(250));
        assert!(config.log_json);
    }

    #[test]
    fn test_period_parser() {
        assert_eq!(parse_period("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_period("0s").is_err());
        assert!(parse_period("soon").is_err());
    }
}
