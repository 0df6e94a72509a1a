use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/* ============================= DEFAULTS ============================= */

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_ELECTION_PATH: &str = "/sdn/controller_election";
pub const DEFAULT_ZK_HOSTS: &str = "zookeeper:2181";
pub const DEFAULT_SWITCH_LISTEN_PORT: u16 = 6653;

/// Upper bound on a single policy repository fetch.
pub const REPOSITORY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/* ============================= CONFIG ============================= */

/// Process configuration, read once from the environment at startup.
///
/// Recognized variables:
/// - `DATABASE_URL` — policy repository endpoint (required)
/// - `ZK_HOSTS` — coordination service endpoints, comma-separated
/// - `POLICY_POLL_INTERVAL_SECONDS` — policy refresh period (default 5)
/// - `LEADER_ELECTION_PATH` — election path (default `/sdn/controller_election`)
/// - `SWITCH_LISTEN_PORT` — southbound listen port (default 6653)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub zk_hosts: Vec<String>,
    pub poll_interval: Duration,
    pub election_path: String,
    pub switch_listen_port: u16,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// A missing `DATABASE_URL` is the only fatal misconfiguration: the
    /// controller has no policy source of truth without it.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL is not set; the controller cannot start without a policy repository")?;

        let zk_hosts = parse_hosts(
            &env::var("ZK_HOSTS").unwrap_or_else(|_| DEFAULT_ZK_HOSTS.to_string()),
        );

        let poll_interval = match env::var("POLICY_POLL_INTERVAL_SECONDS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().with_context(|| {
                    format!("POLICY_POLL_INTERVAL_SECONDS must be an integer, got '{raw}'")
                })?;
                Duration::from_secs(secs.max(1))
            }
            Err(_) => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
        };

        let election_path =
            env::var("LEADER_ELECTION_PATH").unwrap_or_else(|_| DEFAULT_ELECTION_PATH.to_string());

        let switch_listen_port = match env::var("SWITCH_LISTEN_PORT") {
            Ok(raw) => raw.parse().with_context(|| {
                format!("SWITCH_LISTEN_PORT must be a port number, got '{raw}'")
            })?,
            Err(_) => DEFAULT_SWITCH_LISTEN_PORT,
        };

        Ok(Self {
            database_url,
            zk_hosts,
            poll_interval,
            election_path,
            switch_listen_port,
        })
    }

    /// Coordination lease name derived from the election path.
    pub fn lease_name(&self) -> String {
        lease_name_from_path(&self.election_path)
    }
}

/* ============================= HELPERS ============================= */

fn parse_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Flatten an election path into a name usable as a lease object name.
///
/// `/sdn/controller_election` becomes `sdn-controller-election`.
pub fn lease_name_from_path(path: &str) -> String {
    path.trim_matches('/')
        .replace(['/', '_'], "-")
        .to_lowercase()
}

/* ============================= TESTS ============================= */
