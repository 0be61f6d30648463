use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "CLICKHOUSE_URL", default = "http://127.0.0.1:8123")]
    pub clickhouse_url: String,

    #[envconfig(from = "TOPIC")]
    pub topic: String,

    #[envconfig(from = "START_FROM", default = "oldest")]
    pub start_from: StartFrom,

    #[envconfig(from = "EXIT_AFTER_CAUGHT_UP", default = "false")]
    pub exit_after_caught_up: bool,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "500")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "FETCH_BATCH_SIZE", default = "1000")]
    pub fetch_batch_size: u64,
}

/// Where a run starts when no offsets are supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Oldest,
    Latest,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("expected `oldest` or `latest`, got `{0}`")]
pub struct ParseStartFromError(String);

impl FromStr for StartFrom {
    type Err = ParseStartFromError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" | "beginning" | "earliest" => Ok(StartFrom::Oldest),
            "latest" | "newest" => Ok(StartFrom::Latest),
            _ => Err(ParseStartFromError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("expected a number of milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
