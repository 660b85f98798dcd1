//! Runtime configuration.
//!
//! Every knob has a default and can be overridden programmatically through
//! the `with_*` builders or from the environment:
//!
//! | Field | Variable | Values |
//! |-------|----------|--------|
//! | `alignment` | `SHAN_ALIGNMENT` | power of two ≥ 16 (default 64) |
//! | `segment_backend` | `SHAN_SEGMENT_BACKEND` | `posix`, `native`, `heap` |
//! | `negotiation` | `SHAN_NEGOTIATION` | `p2p`, `allgather` |
//! | `validate_roster` | `SHAN_VALIDATE_ROSTER` | `0`/`1`, `true`/`false` |
//! | `variable_message_len` | `SHAN_VARIABLE_MESSAGE_LEN` | `0`/`1`, `true`/`false` |
//! | `backoff` | `SHAN_BACKOFF` | `pause`, `yield`, `spin:N` |
//! | `queue` | `SHAN_QUEUE` | fabric queue number |
//!
//! All ranks of a neighborhood must use the same alignment.

use std::env;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::segment::SegmentBackend;
use crate::wait::BackoffPolicy;

/// How partners learn each other's communication index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Pairwise exchange with every partner, lower rank sends first.
    PointToPoint,
    /// Gather every rank's roster and search it locally.
    AllGather,
}

/// Settings of a neighborhood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShanConfig {
    /// Slot alignment in the remote segment.
    pub alignment: usize,
    /// Facility backing shared segments.
    pub segment_backend: SegmentBackend,
    /// Reciprocal index negotiation variant.
    pub negotiation: Negotiation,
    /// Reject asymmetric rosters before negotiating.
    pub validate_roster: bool,
    /// Adopt the sender's element count and size on receive.
    pub variable_message_len: bool,
    /// Idle policy of spin-waits.
    pub backoff: BackoffPolicy,
    /// Fabric queue used for writes.
    pub queue: u32,
}

impl Default for ShanConfig {
    fn default() -> Self {
        Self {
            alignment: 64,
            segment_backend: SegmentBackend::Posix,
            negotiation: Negotiation::PointToPoint,
            validate_roster: true,
            variable_message_len: false,
            backoff: BackoffPolicy::Pause,
            queue: 0,
        }
    }
}

impl ShanConfig {
    /// Defaults overridden by `SHAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("SHAN_ALIGNMENT") {
            let alignment: usize = parse("SHAN_ALIGNMENT", &v)?;
            if !alignment.is_power_of_two() || alignment < 16 {
                return Err(Error::Config(format!(
                    "SHAN_ALIGNMENT={v}: must be a power of two >= 16"
                )));
            }
            config.alignment = alignment;
        }
        if let Some(v) = lookup("SHAN_SEGMENT_BACKEND") {
            config.segment_backend = match v.to_ascii_lowercase().as_str() {
                "posix" => SegmentBackend::Posix,
                "native" | "window" => SegmentBackend::NativeWindow,
                "heap" => SegmentBackend::ProcessHeap,
                _ => return Err(invalid("SHAN_SEGMENT_BACKEND", &v)),
            };
        }
        if let Some(v) = lookup("SHAN_NEGOTIATION") {
            config.negotiation = match v.to_ascii_lowercase().as_str() {
                "p2p" | "pointtopoint" => Negotiation::PointToPoint,
                "allgather" => Negotiation::AllGather,
                _ => return Err(invalid("SHAN_NEGOTIATION", &v)),
            };
        }
        if let Some(v) = lookup("SHAN_VALIDATE_ROSTER") {
            config.validate_roster = parse_flag("SHAN_VALIDATE_ROSTER", &v)?;
        }
        if let Some(v) = lookup("SHAN_VARIABLE_MESSAGE_LEN") {
            config.variable_message_len = parse_flag("SHAN_VARIABLE_MESSAGE_LEN", &v)?;
        }
        if let Some(v) = lookup("SHAN_BACKOFF") {
            config.backoff = match v.to_ascii_lowercase().as_str() {
                "pause" => BackoffPolicy::Pause,
                "yield" => BackoffPolicy::Yield,
                other => match other.strip_prefix("spin:") {
                    Some(n) => BackoffPolicy::SpinThenYield {
                        spins: parse("SHAN_BACKOFF", n)?,
                    },
                    None => return Err(invalid("SHAN_BACKOFF", &v)),
                },
            };
        }
        if let Some(v) = lookup("SHAN_QUEUE") {
            config.queue = parse("SHAN_QUEUE", &v)?;
        }
        Ok(config)
    }

    /// Set the slot alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the shared segment backend.
    pub fn with_segment_backend(mut self, backend: SegmentBackend) -> Self {
        self.segment_backend = backend;
        self
    }

    /// Set the negotiation variant.
    pub fn with_negotiation(mut self, negotiation: Negotiation) -> Self {
        self.negotiation = negotiation;
        self
    }

    /// Enable or disable roster validation.
    pub fn with_validate_roster(mut self, validate: bool) -> Self {
        self.validate_roster = validate;
        self
    }

    /// Enable or disable variable-length receives.
    pub fn with_variable_message_len(mut self, variable: bool) -> Self {
        self.variable_message_len = variable;
        self
    }

    /// Set the spin-wait idle policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the fabric queue.
    pub fn with_queue(mut self, queue: u32) -> Self {
        self.queue = queue;
        self
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::Config(format!("{key}={value}"))
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ShanConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ShanConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), ShanConfig::default());
    }

    #[test]
    fn every_variable_is_parsed() {
        let config = from_pairs(&[
            ("SHAN_ALIGNMENT", "128"),
            ("SHAN_SEGMENT_BACKEND", "heap"),
            ("SHAN_NEGOTIATION", "allgather"),
            ("SHAN_VALIDATE_ROSTER", "off"),
            ("SHAN_VARIABLE_MESSAGE_LEN", "1"),
            ("SHAN_BACKOFF", "spin:500"),
            ("SHAN_QUEUE", "3"),
        ])
        .unwrap();
        assert_eq!(
            config,
            ShanConfig::default()
                .with_alignment(128)
                .with_segment_backend(SegmentBackend::ProcessHeap)
                .with_negotiation(Negotiation::AllGather)
                .with_validate_roster(false)
                .with_variable_message_len(true)
                .with_backoff(BackoffPolicy::SpinThenYield { spins: 500 })
                .with_queue(3)
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        for (key, value) in [
            ("SHAN_ALIGNMENT", "48"),
            ("SHAN_ALIGNMENT", "eight"),
            ("SHAN_SEGMENT_BACKEND", "sysv"),
            ("SHAN_NEGOTIATION", "gossip"),
            ("SHAN_VARIABLE_MESSAGE_LEN", "maybe"),
            ("SHAN_BACKOFF", "spin:-1"),
            ("SHAN_BACKOFF", "sleep"),
        ] {
            assert!(
                matches!(from_pairs(&[(key, value)]), Err(Error::Config(_))),
                "{key}={value} accepted"
            );
        }
    }
}
