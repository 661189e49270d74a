//! # Configuration
//!
//! [`AndnaConfig`] carries every tunable bound and interval, with defaults
//! suitable for a long-running mesh node. Tests shrink the durations.
//!
//! The hostnames file lists what the local node wants registered, one entry
//! per line (`#` starts a comment):
//!
//! ```text
//! alpha                               # plain hostname -> own address
//! alpha http tcp 1 5 10.0.0.7         # service record: service proto prio weight target
//! alpha ssh tcp 0 1 beta              # target may be another hostname
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::crypto::HostnameHash;
use crate::records::{RecordTarget, ServiceRecord, parse_service};
use crate::topology::PeerAddress;

/// How long a registration stays valid without being refreshed (3 days).
pub const DEFAULT_EXPIRATION_WINDOW: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Minimum time between two updates of the same hostname (1 hour).
pub const DEFAULT_MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Competing claimants kept per hostname, the active one included.
pub const DEFAULT_MAX_QUEUE: usize = 5;

/// Hostnames a single public key may hold network-wide, and the number of
/// hostnames a node keeps in its own local cache.
pub const DEFAULT_MAX_HOSTNAMES: usize = 256;

/// Service records attached to one hostname.
pub const DEFAULT_MAX_RECORDS: usize = 16;

/// Entries kept in the resolved-name cache.
pub const DEFAULT_RESOLVED_CACHE_SIZE: usize = 512;

/// Identifiers remembered per flood category.
pub const DEFAULT_FLOOD_RING_SIZE: usize = 16;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before an own hostname whose registration must be retried is tried
/// again.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Period of the background eviction and re-registration sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Registrations a peer processes at once before refusing new ones.
pub const DEFAULT_MAX_INBOUND_REGISTRATIONS: usize = 64;

/// Previous-owner peers a single cache fetch may traverse.
pub const DEFAULT_MAX_SPREAD_HOPS: usize = 8;

/// Maximum hostname length in bytes.
pub const MAX_HOSTNAME_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct AndnaConfig {
    pub expiration_window: Duration,
    pub min_update_interval: Duration,
    pub max_queue: usize,
    pub max_hostnames: usize,
    pub max_records: usize,
    pub resolved_cache_size: usize,
    pub flood_ring_size: usize,
    pub rpc_timeout: Duration,
    pub retry_backoff: Duration,
    pub sweep_interval: Duration,
    pub max_inbound_registrations: usize,
    pub max_spread_hops: usize,
}

impl Default for AndnaConfig {
    fn default() -> Self {
        Self {
            expiration_window: DEFAULT_EXPIRATION_WINDOW,
            min_update_interval: DEFAULT_MIN_UPDATE_INTERVAL,
            max_queue: DEFAULT_MAX_QUEUE,
            max_hostnames: DEFAULT_MAX_HOSTNAMES,
            max_records: DEFAULT_MAX_RECORDS,
            resolved_cache_size: DEFAULT_RESOLVED_CACHE_SIZE,
            flood_ring_size: DEFAULT_FLOOD_RING_SIZE,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_inbound_registrations: DEFAULT_MAX_INBOUND_REGISTRATIONS,
            max_spread_hops: DEFAULT_MAX_SPREAD_HOPS,
        }
    }
}

impl AndnaConfig {
    pub fn expiration_ms(&self) -> u64 {
        self.expiration_window.as_millis() as u64
    }

    pub fn min_update_ms(&self) -> u64 {
        self.min_update_interval.as_millis() as u64
    }

    /// Own hostnames are refreshed once less than a quarter of the
    /// expiration window remains.
    pub fn reregister_margin_ms(&self) -> u64 {
        self.expiration_ms() / 4
    }
}

/// One hostname the local node wants registered and the extra records to
/// attach. The record for the node's own address is added at registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostnameSpec {
    pub hostname: String,
    pub records: Vec<ServiceRecord>,
}

pub fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

pub fn load_hostnames(path: &Path, max_records: usize) -> Result<Vec<HostnameSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read hostnames file {}", path.display()))?;
    parse_hostnames(&text, max_records)
        .with_context(|| format!("invalid hostnames file {}", path.display()))
}

pub fn parse_hostnames(text: &str, max_records: usize) -> Result<Vec<HostnameSpec>> {
    let mut specs: Vec<HostnameSpec> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let hostname = fields[0].to_ascii_lowercase();
        if !is_valid_hostname(&hostname) {
            bail!("line {}: invalid hostname '{}'", lineno + 1, fields[0]);
        }

        let idx = match specs.iter().position(|s| s.hostname == hostname) {
            Some(i) => i,
            None => {
                specs.push(HostnameSpec {
                    hostname: hostname.clone(),
                    records: Vec::new(),
                });
                specs.len() - 1
            }
        };

        match fields.len() {
            1 => {}
            6 => {
                let record = parse_record(&fields[1..])
                    .with_context(|| format!("line {}", lineno + 1))?;
                let spec = &mut specs[idx];
                // One slot is reserved for the primary address record.
                if spec.records.len() + 1 >= max_records {
                    bail!("line {}: too many records for '{}'", lineno + 1, hostname);
                }
                spec.records.push(record);
            }
            n => bail!(
                "line {}: expected 1 or 6 fields, found {}",
                lineno + 1,
                n
            ),
        }
    }

    Ok(specs)
}

fn parse_record(fields: &[&str]) -> Result<ServiceRecord> {
    let service = parse_service(fields[0])
        .with_context(|| format!("unknown service '{}'", fields[0]))?;
    let protocol = fields[1]
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let priority: u8 = fields[2].parse().context("invalid priority")?;
    let weight: u8 = fields[3].parse().context("invalid weight")?;
    let target = match fields[4].parse::<PeerAddress>() {
        Ok(addr) => RecordTarget::Address(addr),
        Err(_) if is_valid_hostname(fields[4]) => {
            RecordTarget::Hostname(HostnameHash::of_hostname(fields[4]))
        }
        Err(_) => bail!("invalid target '{}'", fields[4]),
    };
    Ok(ServiceRecord {
        service,
        protocol,
        priority,
        weight,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Protocol;

    #[test]
    fn parses_plain_and_service_lines() {
        let text = "\
# own names
Alpha
alpha http tcp 1 5 10.0.0.7
beta   # trailing comment
alpha ssh tcp 0 1 gamma
";
        let specs = parse_hostnames(text, DEFAULT_MAX_RECORDS).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].hostname, "alpha");
        assert_eq!(specs[0].records.len(), 2);
        assert_eq!(specs[0].records[0].service, 80);
        assert_eq!(specs[0].records[0].protocol, Protocol::Tcp);
        assert_eq!(
            specs[0].records[0].target,
            RecordTarget::Address("10.0.0.7".parse().unwrap())
        );
        assert_eq!(
            specs[0].records[1].target,
            RecordTarget::Hostname(HostnameHash::of_hostname("gamma"))
        );
        assert_eq!(specs[1].hostname, "beta");
        assert!(specs[1].records.is_empty());
    }

    #[test]
    fn rejects_bad_field_count() {
        let err = parse_hostnames("alpha http tcp\n", DEFAULT_MAX_RECORDS).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn rejects_invalid_hostname() {
        assert!(parse_hostnames("bad/name\n", DEFAULT_MAX_RECORDS).is_err());
    }

    #[test]
    fn enforces_record_bound() {
        let text = "a 80 tcp 0 1 10.0.0.1\na 81 tcp 0 1 10.0.0.1\na 82 tcp 0 1 10.0.0.1\n";
        assert!(parse_hostnames(text, 3).is_err());
        assert!(parse_hostnames(text, 4).is_ok());
    }

    #[test]
    fn reregister_margin_is_quarter_window() {
        let config = AndnaConfig {
            expiration_window: Duration::from_millis(400),
            ..AndnaConfig::default()
        };
        assert_eq!(config.reregister_margin_ms(), 100);
    }
}
