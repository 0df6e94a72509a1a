//! Read-only client for the policy repository.
//!
//! The repository is the durable source of truth, written by the external
//! policy intake API; the controller only ever reads. Each fetch opens a
//! short-lived connection and is bounded by a timeout so a slow repository
//! can never wedge the poller.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::timeout;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::REPOSITORY_FETCH_TIMEOUT;
use crate::policy::Policy;

/* ============================= TRAIT ============================= */

/// The policy repository seam. The production implementation reads
/// Postgres; tests substitute in-memory fixtures.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Fetch all `status=ENABLED` policies.
    async fn fetch_enabled(&self) -> Result<Vec<Policy>>;
}

/* ============================= POSTGRES ============================= */

pub struct PostgresRepository {
    database_url: String,
    fetch_timeout: Duration,
}

const ENABLED_POLICIES_QUERY: &str =
    "SELECT id, name, priority, source, destination, service, action, status \
     FROM policies WHERE status = 'ENABLED'";

impl PostgresRepository {
    pub fn new(database_url: String) -> Self {
        Self {
            database_url,
            fetch_timeout: REPOSITORY_FETCH_TIMEOUT,
        }
    }

    async fn fetch_inner(&self) -> Result<Vec<Policy>> {
        let (client, connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .context("failed to connect to policy repository")?;

        // The connection object drives the socket; it resolves once the
        // client is dropped.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "repository_connection_closed");
            }
        });

        let rows = client
            .query(ENABLED_POLICIES_QUERY, &[])
            .await
            .context("failed to query policies")?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in &rows {
            match policy_from_row(row) {
                Ok(policy) => policies.push(policy),
                // One malformed record must not block the rest of the
                // snapshot.
                Err(e) => warn!(error = %e, "policy_row_skipped"),
            }
        }

        drop(client);
        let _ = driver.await;
        Ok(policies)
    }
}

#[async_trait]
impl PolicyRepository for PostgresRepository {
    async fn fetch_enabled(&self) -> Result<Vec<Policy>> {
        timeout(self.fetch_timeout, self.fetch_inner())
            .await
            .context("policy repository fetch timed out")?
    }
}

/* ============================= ROW DECODING ============================= */

fn policy_from_row(row: &tokio_postgres::Row) -> Result<Policy> {
    let id: String = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let priority: i32 = row.try_get("priority")?;
    let source: serde_json::Value = row.try_get("source")?;
    let destination: serde_json::Value = row.try_get("destination")?;
    let service: Option<serde_json::Value> = row.try_get("service")?;
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;

    assemble_policy(id, name, priority, source, destination, service, &action, &status)
}

/// Build a [`Policy`] from loosely-typed repository columns. Split from the
/// row accessor so decoding is testable without a database.
#[allow(clippy::too_many_arguments)]
fn assemble_policy(
    id: String,
    name: String,
    priority: i32,
    source: serde_json::Value,
    destination: serde_json::Value,
    service: Option<serde_json::Value>,
    action: &str,
    status: &str,
) -> Result<Policy> {
    let priority = u16::try_from(priority)
        .with_context(|| format!("policy '{id}' priority {priority} out of range"))?;

    Ok(Policy {
        priority,
        source: serde_json::from_value(source)
            .with_context(|| format!("policy '{id}' has an invalid source selector"))?,
        destination: serde_json::from_value(destination)
            .with_context(|| format!("policy '{id}' has an invalid destination selector"))?,
        service: match service {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value(value)
                    .with_context(|| format!("policy '{id}' has an invalid service list"))?,
            ),
        },
        action: serde_json::from_value(serde_json::Value::String(action.to_string()))
            .with_context(|| format!("policy '{id}' has an unknown action '{action}'"))?,
        status: serde_json::from_value(serde_json::Value::String(status.to_string()))
            .with_context(|| format!("policy '{id}' has an unknown status '{status}'"))?,
        id,
        name,
    })
}

/* ============================= TESTS ============================= */
