// tests/common/mod.rs
//
// Shared fixtures: a scripted in-process transport and small config
// builders, so cross-component tests never open sockets.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use humdata_core::config::CoreConfig;
use humdata_core::error::NetworkFailure;
use humdata_core::store::MemoryStore;
use humdata_core::transport::{RawResponse, Transport};
use humdata_core::DashboardCore;

#[derive(Debug, Clone)]
pub enum Reply {
    /// 200 with this body.
    Body(String),
    Status(u16),
    Fail(NetworkFailure),
}

impl Reply {
    pub fn rows(rows: &[(&str, f64)]) -> Self {
        Reply::Body(rows_json(rows))
    }

    pub fn connect_refused() -> Self {
        Reply::Fail(NetworkFailure::Connect("connection refused".into()))
    }

    pub fn timeout() -> Self {
        Reply::Fail(NetworkFailure::Timeout(Duration::from_secs(12)))
    }
}

/// `[{"date": .., "count": ..}, ..]`
pub fn rows_json(rows: &[(&str, f64)]) -> String {
    let items: Vec<String> = rows
        .iter()
        .map(|(d, v)| format!(r#"{{"date":"{d}","count":{v}}}"#))
        .collect();
    format!("[{}]", items.join(","))
}

#[derive(Default)]
struct Route {
    script: VecDeque<Reply>,
    last: Option<Reply>,
    delay: Duration,
}

/// Replies per URL are consumed in order; the last one repeats.
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_string()).or_default();
        route.script = replies.into();
        route.last = None;
    }

    /// Every call to `url` takes this long before answering.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.routes.lock().entry(url.to_string()).or_default().delay = delay;
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<RawResponse, NetworkFailure> {
        self.calls.lock().push((url.to_string(), Instant::now()));
        let (reply, delay) = {
            let mut routes = self.routes.lock();
            match routes.get_mut(url) {
                Some(route) => {
                    let reply = route.script.pop_front().or_else(|| route.last.clone());
                    if let Some(r) = &reply {
                        route.last = Some(r.clone());
                    }
                    (reply, route.delay)
                }
                None => (None, Duration::ZERO),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Some(Reply::Body(body)) => Ok(RawResponse {
                status: 200,
                body: body.into_bytes(),
            }),
            Some(Reply::Status(status)) => Ok(RawResponse {
                status,
                body: Vec::new(),
            }),
            Some(Reply::Fail(failure)) => Err(failure),
            None => Ok(RawResponse {
                status: 404,
                body: Vec::new(),
            }),
        }
    }
}

pub const ALPHA_URL: &str = "http://alpha.test/counts.json";
pub const BETA_URL: &str = "http://beta.test/counts.json";

const HEADER: &str = r#"
[scheduler]
interval_secs = 0
focus_min_interval_secs = 300

[fetch]
jitter_ratio = 0.0
max_wait_ms = 30000
"#;

fn source_toml(id: &str, priority: u8, area: &str) -> String {
    format!(
        r#"
[[sources]]
id = "{id}"
base_url = "http://{id}.test"
priority = {priority}
ttl_secs = 300
max_attempts = 3
rate_limit = {{ max_per_minute = 60, max_per_hour = 1000, max_concurrent = 2, backoff_base_ms = 1000, backoff_multiplier = 2.0, backoff_ceiling_ms = 60000 }}

[[sources.endpoints]]
path = "counts.json"
area = "{area}"
decoder = {{ kind = "json_rows", date_field = "date", fields = ["count"] }}
"#
    )
}

/// Sources `alpha` and `beta`, each feeding the area of the same name.
/// No jitter, 3 attempts, 1 s base backoff doubling, TTL 300 s.
pub fn two_area_toml() -> String {
    format!(
        r#"{HEADER}
[[areas]]
key = "alpha"
expected_metrics = ["count"]

[[areas]]
key = "beta"
expected_metrics = ["count"]
{}{}"#,
        source_toml("alpha", 1, "alpha"),
        source_toml("beta", 2, "beta"),
    )
}

/// Sources `alpha` and `beta` both feeding one `combined` area.
pub fn shared_area_toml(merge: &str) -> String {
    format!(
        r#"{HEADER}
[[areas]]
key = "combined"
merge = "{merge}"
expected_metrics = ["count"]
{}{}"#,
        source_toml("alpha", 1, "combined"),
        source_toml("beta", 2, "combined"),
    )
}

pub fn config(toml: &str) -> CoreConfig {
    CoreConfig::from_toml_str(toml).expect("test config parses")
}

pub fn core_with(
    cfg: CoreConfig,
    transport: Arc<ScriptedTransport>,
) -> (Arc<DashboardCore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (core_on(cfg, transport, store.clone()), store)
}

/// A core over an existing store, as after a restart.
pub fn core_on(
    cfg: CoreConfig,
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryStore>,
) -> Arc<DashboardCore> {
    Arc::new(DashboardCore::new(cfg, transport, store).expect("core builds"))
}
