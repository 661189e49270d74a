//! Service records attached to a hostname.
//!
//! A record maps `(service, protocol)` to a target, either a peer address or
//! another hostname, with SRV-style priority and weight. Service
//! [`DEFAULT_SERVICE`] is the hostname's plain address mapping; every
//! registration carries at least one such record for the registrant itself.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::topology::PeerAddress;

/// Service number of the plain hostname -> address mapping.
pub const DEFAULT_SERVICE: u16 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Resolves a service given by name or number.
pub fn parse_service(s: &str) -> Option<u16> {
    if let Ok(n) = s.parse::<u16>() {
        return Some(n);
    }
    let port = match s.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "smtp" => 25,
        "domain" | "dns" => 53,
        "http" | "www" => 80,
        "pop3" => 110,
        "imap" => 143,
        "irc" => 194,
        "https" => 443,
        _ => return None,
    };
    Some(port)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordTarget {
    Address(PeerAddress),
    Hostname(HostnameHash),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service: u16,
    pub protocol: Protocol,
    /// Lower is preferred.
    pub priority: u8,
    /// Higher is preferred among equal priorities.
    pub weight: u8,
    pub target: RecordTarget,
}

impl ServiceRecord {
    /// The default-service record pointing at `addr`.
    pub fn primary(addr: PeerAddress) -> Self {
        Self {
            service: DEFAULT_SERVICE,
            protocol: Protocol::Tcp,
            priority: 0,
            weight: 1,
            target: RecordTarget::Address(addr),
        }
    }

    pub fn is_default_service(&self) -> bool {
        self.service == DEFAULT_SERVICE
    }

    /// Identity of a record for deletion: everything except priority/weight.
    fn same_slot(&self, other: &ServiceRecord) -> bool {
        self.service == other.service
            && self.protocol == other.protocol
            && self.target == other.target
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceSelector {
    pub service: u16,
    pub protocol: Protocol,
}

impl ServiceSelector {
    pub const fn new(service: u16, protocol: Protocol) -> Self {
        Self { service, protocol }
    }

    fn matches(&self, record: &ServiceRecord) -> bool {
        if self.service == DEFAULT_SERVICE {
            return record.is_default_service();
        }
        record.service == self.service && record.protocol == self.protocol
    }
}

impl Default for ServiceSelector {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE, Protocol::Tcp)
    }
}

/// Records answering `selector`, best first. Falls back to the default
/// service when the requested one is absent.
pub fn select(records: &[ServiceRecord], selector: ServiceSelector) -> Vec<ServiceRecord> {
    let mut chosen: Vec<ServiceRecord> = records
        .iter()
        .filter(|r| selector.matches(r))
        .cloned()
        .collect();
    if chosen.is_empty() && selector.service != DEFAULT_SERVICE {
        chosen = records
            .iter()
            .filter(|r| r.is_default_service())
            .cloned()
            .collect();
    }
    chosen.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    chosen
}

pub fn validate(records: &[ServiceRecord], max_records: usize) -> Result<(), AndnaError> {
    if records.len() > max_records {
        return Err(AndnaError::MalformedRequest);
    }
    Ok(())
}

/// Removes every record of `records` matching one in `to_delete`.
pub fn remove_matching(records: &mut Vec<ServiceRecord>, to_delete: &[ServiceRecord]) {
    records.retain(|r| !to_delete.iter().any(|d| d.same_slot(r)));
}
