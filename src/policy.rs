use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/* ============================= CIDR ============================= */

/// An IPv4 network in CIDR form (`a.b.c.d/n`).
///
/// `/32` is a single-host match; `/0` matches any address. Ordering is by
/// address then prefix length, which gives rule emission a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix_len: u8,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Ipv4NetError {
    #[error("invalid IPv4 network '{0}'")]
    InvalidFormat(String),
    #[error("prefix length {0} out of range (0-32)")]
    InvalidPrefix(u8),
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, Ipv4NetError> {
        if prefix_len > 32 {
            return Err(Ipv4NetError::InvalidPrefix(prefix_len));
        }
        Ok(Self { addr, prefix_len })
    }

    /// A `/32` network matching exactly one host.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, prefix_len: 32 }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Network mask as a big-endian u32.
    pub fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }

    /// True for `/0`, which matches every address.
    pub fn is_any(&self) -> bool {
        self.prefix_len == 0
    }

    /// True for `/32` host matches.
    pub fn is_host(&self) -> bool {
        self.prefix_len == 32
    }
}

impl FromStr for Ipv4Net {
    type Err = Ipv4NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Ipv4NetError::InvalidFormat(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
                let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix_len)
            }
            // A bare address is treated as a host match.
            None => {
                let addr: Ipv4Addr = s.parse().map_err(|_| invalid())?;
                Ok(Self::host(addr))
            }
        }
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl TryFrom<String> for Ipv4Net {
    type Error = Ipv4NetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Net> for String {
    fn from(net: Ipv4Net) -> Self {
        net.to_string()
    }
}

/* ============================= SELECTOR ============================= */

/// Matches a set of workloads by label predicate, literal IP block, or both.
///
/// The label predicate requires every key/value pair to match. An empty
/// predicate matches no pods; resolution is the union of label matches and
/// the literal block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<Ipv4Net>,
}

/* ============================= SERVICE ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// An L4 service tuple. Accepted and stored with each policy; not yet
/// rendered into rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub protocol: Protocol,
    /// Port in [1, 65535] when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/* ============================= POLICY ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyStatus {
    Enabled,
    Disabled,
}

/// Default evaluation priority; mitigation policies use the 65000 band.
pub const DEFAULT_PRIORITY: u16 = 1000;

fn default_priority() -> u16 {
    DEFAULT_PRIORITY
}

/// A declarative security policy as stored in the policy repository.
///
/// Higher `priority` evaluates before lower at the switch. Only
/// `status=ENABLED` policies are materialized into rules; `id` is globally
/// unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u16,
    pub source: Selector,
    pub destination: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<Service>>,
    pub action: Action,
    pub status: PolicyStatus,
}

impl Policy {
    pub fn is_enabled(&self) -> bool {
        self.status == PolicyStatus::Enabled
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── Ipv4Net ──

    #[test]
    fn test_parse_cidr() {
        let net: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        assert_eq!(net.addr(), Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.mask(), 0xFFFF_FF00);
    }

    #[test]
    fn test_parse_bare_address_is_host() {
        let net: Ipv4Net = "10.0.1.1".parse().unwrap();
        assert!(net.is_host());
        assert_eq!(net.to_string(), "10.0.1.1/32");
    }

    #[test]
    fn test_parse_any() {
        let net: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert!(net.is_any());
        assert_eq!(net.mask(), 0);
    }

    #[test]
    fn test_parse_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Net>().is_err());
        assert!("not-an-ip/8".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn test_host_mask_is_full() {
        assert_eq!(Ipv4Net::host(Ipv4Addr::new(1, 2, 3, 4)).mask(), u32::MAX);
    }

    #[test]
    fn test_ordering_by_address_then_prefix() {
        let a: Ipv4Net = "10.0.1.1/32".parse().unwrap();
        let b: Ipv4Net = "10.0.2.1/32".parse().unwrap();
        let c: Ipv4Net = "10.0.1.1/24".parse().unwrap();
        assert!(a < b);
        assert!(c < a);
    }

    // ── Policy JSON shape ──

    #[test]
    fn test_policy_roundtrip() {
        let raw = serde_json::json!({
            "id": "p1",
            "name": "deny-frontend-to-db",
            "priority": 5000,
            "source": { "label_selector": { "app": "frontend" } },
            "destination": { "label_selector": { "app": "db", "env": "prod" } },
            "service": [ { "protocol": "TCP", "port": 5432 } ],
            "action": "DENY",
            "status": "ENABLED"
        });

        let policy: Policy = serde_json::from_value(raw).unwrap();
        assert_eq!(policy.priority, 5000);
        assert_eq!(policy.action, Action::Deny);
        assert!(policy.is_enabled());
        let service = policy.service.as_ref().unwrap();
        assert_eq!(service[0].protocol, Protocol::Tcp);
        assert_eq!(service[0].port, Some(5432));

        let back = serde_json::to_value(&policy).unwrap();
        assert_eq!(back["source"]["label_selector"]["app"], "frontend");
        assert_eq!(back["status"], "ENABLED");
    }

    #[test]
    fn test_policy_priority_defaults() {
        let raw = serde_json::json!({
            "id": "p2",
            "name": "mitigation",
            "source": { "ip_block": "1.2.3.4/32" },
            "destination": { "ip_block": "0.0.0.0/0" },
            "action": "DENY",
            "status": "DISABLED"
        });

        let policy: Policy = serde_json::from_value(raw).unwrap();
        assert_eq!(policy.priority, DEFAULT_PRIORITY);
        assert!(!policy.is_enabled());
        assert!(policy.source.ip_block.unwrap().is_host());
        assert!(policy.destination.ip_block.unwrap().is_any());
    }

    #[test]
    fn test_selector_rejects_bad_ip_block() {
        let raw = serde_json::json!({ "ip_block": "999.0.0.1/24" });
        assert!(serde_json::from_value::<Selector>(raw).is_err());
    }
}
