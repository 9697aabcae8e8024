// src/telemetry.rs
//! Tracing setup.
//!
//! - filter from `RUST_LOG`, default `humdata_core=info,warn`
//! - `HUMDATA_LOG_FORMAT=json` switches to JSON lines, otherwise compact
//! - `try_init`: a subscriber installed by the host runtime wins

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_FORMAT: &str = "HUMDATA_LOG_FORMAT";
pub const DEFAULT_FILTER: &str = "humdata_core=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(ENV_LOG_FORMAT).unwrap_or_default())
    }

    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

/// Returns `false` when a global subscriber was already set.
pub fn init() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let res = match LogFormat::from_env() {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };
    res.is_ok()
}
