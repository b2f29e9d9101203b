//! Process configuration.
//!
//! Everything comes from the environment (flags exist mostly for tests and
//! operators poking at things). The fixed variables are declared on the
//! clap struct; sampling rules are free-form `MOBYSTASH_SAMPLE_KEY_<key>`
//! variables and are scanned by hand. Unknown variables are ignored;
//! invalid values abort startup.

use std::path::PathBuf;

use clap::Parser;
use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::sampler::Sampler;

const SAMPLE_KEY_PREFIX: &str = "MOBYSTASH_SAMPLE_KEY_";

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid regex in {variable}: {source}"))]
    InvalidSampleRule {
        variable: String,
        source: regex::Error,
    },
}

#[derive(Debug, Parser)]
#[command(name = "mobystash", about = "Ship container logs to logstash")]
pub struct Config {
    /// Address of the container engine.
    #[arg(
        long,
        env = "DOCKER_HOST",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_host: String,

    /// host:port of the logstash json_lines listener.
    #[arg(long, env = "LOGSTASH_SERVER")]
    pub logstash_server: String,

    /// Where per-container read cursors are persisted.
    #[arg(
        long,
        env = "MOBYSTASH_STATE_FILE",
        default_value = "./mobystash_state.dump"
    )]
    pub state_file: PathBuf,

    /// Seconds between cursor checkpoints.
    #[arg(
        long,
        env = "MOBYSTASH_STATE_CHECKPOINT_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub state_checkpoint_interval: u64,

    /// Serve prometheus metrics on port 9367.
    #[arg(
        long,
        env = "MOBYSTASH_ENABLE_METRICS",
        default_value = "no",
        value_parser = parse_bool
    )]
    pub enable_metrics: bool,

    /// Keep one in this many messages matching a sampling rule.
    #[arg(
        long,
        env = "MOBYSTASH_SAMPLE_RATIO",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sample_ratio: u64,
}

fn parse_bool(value: &str) -> Result<bool, String> {
    if crate::worker::truthy(value) {
        Ok(true)
    } else if value.is_empty() || crate::worker::falsy(value) {
        Ok(false)
    } else {
        Err(format!("{value:?} is not a boolean"))
    }
}

impl Config {
    /// Build the sampler from the ratio plus every `MOBYSTASH_SAMPLE_KEY_*`
    /// variable in the environment. Rules are ordered by key name so that
    /// which rule wins on an ambiguous message does not depend on
    /// environment iteration order.
    pub fn sampler(&self) -> Result<Sampler, ConfigError> {
        let mut rules: Vec<(String, String)> = std::env::vars()
            .filter_map(|(name, pattern)| {
                name.strip_prefix(SAMPLE_KEY_PREFIX)
                    .map(|key| (key.to_lowercase(), pattern))
            })
            .collect();
        rules.sort();

        let compiled = rules
            .into_iter()
            .map(|(key, pattern)| {
                let regex = Regex::new(&pattern).context(InvalidSampleRuleSnafu {
                    variable: format!("{SAMPLE_KEY_PREFIX}{}", key.to_uppercase()),
                })?;
                Ok((key, regex))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Sampler::new(self.sample_ratio, compiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_the_truthy_family() {
        for value in ["yes", "Y", "1", "on", "TRUE", "t"] {
            assert_eq!(parse_bool(value), Ok(true), "{value}");
        }
        for value in ["no", "N", "0", "off", "FALSE", "f", ""] {
            assert_eq!(parse_bool(value), Ok(false), "{value}");
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn minimal_configuration_parses() {
        let config = Config::try_parse_from([
            "mobystash",
            "--logstash-server",
            "logstash.internal:5151",
        ])
        .unwrap();
        assert_eq!(config.logstash_server, "logstash.internal:5151");
        assert_eq!(config.state_checkpoint_interval, 60);
        assert!(!config.enable_metrics);
        assert_eq!(config.sample_ratio, 1);
    }

    #[test]
    fn checkpoint_interval_rejects_zero() {
        let result = Config::try_parse_from([
            "mobystash",
            "--logstash-server",
            "l:5151",
            "--state-checkpoint-interval",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn metrics_flag_rejects_nonsense() {
        let result = Config::try_parse_from([
            "mobystash",
            "--logstash-server",
            "l:5151",
            "--enable-metrics",
            "sideways",
        ]);
        assert!(result.is_err());
    }
}
