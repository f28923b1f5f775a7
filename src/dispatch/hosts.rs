//! Execution hosts: the configured pool, automatic host choice and suspect
//! marking, plus one-way requests to a host.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::nanny::JobSignaller;
use crate::net::{ConnectionRegistry, Target};
use crate::types::attribute::Attribute;
use crate::types::protocol::{BatchRequest, RequestBody, StatusEntry};

#[derive(Debug)]
struct Host {
    /// `host:port`
    name: String,
    suspect_until: Option<Instant>,
}

impl Host {
    fn healthy(&self, now: Instant) -> bool {
        self.suspect_until.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug)]
struct Pool {
    hosts: Vec<Host>,
    cursor: usize,
}

#[derive(Debug)]
pub struct HostPool {
    pool: Mutex<Pool>,
    default_port: u16,
    suspect_for: Duration,
}

impl HostPool {
    pub fn new(
        moms: &[String],
        default_port: u16,
        suspect_for: Duration,
    ) -> Self {
        let hosts = moms
            .iter()
            .map(|m| Host {
                name: normalize(m, default_port),
                suspect_until: None,
            })
            .unique_by(|h| h.name.clone())
            .collect();
        Self {
            pool: Mutex::new(Pool { hosts, cursor: 0 }),
            default_port,
            suspect_for,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// `host` with the default port added if it has none.
    pub fn normalize(&self, host: &str) -> String {
        normalize(host, self.default_port)
    }

    /// The next healthy host in round-robin order.
    pub fn pick(&self) -> Option<String> {
        let now = Instant::now();
        let mut pool = self.lock();
        let n = pool.hosts.len();
        for step in 0..n {
            let i = (pool.cursor + step) % n;
            if pool.hosts[i].healthy(now) {
                pool.cursor = (i + 1) % n;
                return Some(pool.hosts[i].name.clone());
            }
        }
        None
    }

    /// Skips `host` for automatic choices for a while.
    pub fn mark_suspect(&self, host: &str) {
        let host = self.normalize(host);
        let until = Instant::now() + self.suspect_for;
        let mut pool = self.lock();
        if let Some(h) = pool.hosts.iter_mut().find(|h| h.name == host) {
            h.suspect_until = Some(until);
            info!(
                %host,
                secs = self.suspect_for.as_secs(),
                "execution host marked suspect"
            );
        }
    }

    pub fn is_suspect(&self, host: &str) -> bool {
        let host = self.normalize(host);
        let now = Instant::now();
        self.lock()
            .hosts
            .iter()
            .any(|h| h.name == host && !h.healthy(now))
    }

    /// Status entries, one per host, optionally just `name`.
    pub fn status(&self, name: &str) -> Vec<StatusEntry> {
        let now = Instant::now();
        self.lock()
            .hosts
            .iter()
            .filter(|h| {
                name.is_empty()
                    || h.name == name
                    || h.name.starts_with(&format!("{name}:"))
            })
            .map(|h| StatusEntry {
                name: h.name.clone(),
                attrs: vec![Attribute::new(
                    "state",
                    if h.healthy(now) { "free" } else { "down" },
                )],
            })
            .collect()
    }
}

fn normalize(host: &str, default_port: u16) -> String {
    if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:{default_port}")
    }
}

/// Sends one request to an execution host in the background, logging but
/// otherwise ignoring the outcome.
pub fn send_oneway(
    registry: &Arc<ConnectionRegistry>,
    host: &str,
    default_port: u16,
    wait: Duration,
    body: RequestBody,
) {
    let (host, port) = match registry.resolve(host, default_port) {
        Ok(Target::Remote { host, port }) => (host, port),
        Ok(Target::Local) => {
            warn!(
                %host,
                request = body.name(),
                "execution host resolves to this server"
            );
            return;
        },
        Err(error) => {
            warn!(%host, %error, "bad execution host");
            return;
        },
    };

    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let name = body.name();
        let req = BatchRequest::new("root", body);
        let mut conn = match registry.connect(&host, port).await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(
                    %host,
                    request = name,
                    %error,
                    "failed to reach execution host"
                );
                return;
            },
        };
        match conn.request(&req, wait).await {
            Ok(_) => debug!(%host, request = name, "delivered"),
            Err(error) => {
                warn!(%host, request = name, %error, "request failed")
            },
        }
        registry.disconnect(conn).await;
    });
}

/// Signals jobs through their execution host's batch port.
pub struct MomSignaller {
    registry: Arc<ConnectionRegistry>,
    default_port: u16,
    wait: Duration,
}

impl MomSignaller {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        default_port: u16,
        wait: Duration,
    ) -> Self {
        Self {
            registry,
            default_port,
            wait,
        }
    }
}

impl JobSignaller for MomSignaller {
    fn signal(&self, job_id: &str, exec_host: &str, signal: &str) {
        debug!(job_id, exec_host, signal, "signalling job");
        send_oneway(
            &self.registry,
            exec_host,
            self.default_port,
            self.wait,
            RequestBody::SignalJob {
                job_id: job_id.to_owned(),
                signal: signal.to_owned(),
            },
        );
    }
}
