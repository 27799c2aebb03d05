//! Domain resolution via the system lookup tool
//!
//! Wraps `nslookup` and extracts IPv4 answers from its textual output. The
//! extraction pairs each `Name:` line with the `Address:` line that follows
//! it, which skips the resolver's own address printed in the header (that one
//! follows a `Server:` line instead).

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to run lookup tool '{tool}': {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("Failed to resolve domain {domain}: {detail}")]
    LookupFailed { domain: String, detail: String },
}

pub struct Resolver {
    lookup_bin: String,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new("nslookup")
    }
}

impl Resolver {
    pub fn new(lookup_bin: impl Into<String>) -> Self {
        Self {
            lookup_bin: lookup_bin.into(),
        }
    }

    /// Resolve a domain to its IPv4 addresses, in answer order, deduplicated.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<String>, ResolveError> {
        debug!("Resolving {} via {}", domain, self.lookup_bin);
        let output = Command::new(&self.lookup_bin)
            .arg(domain)
            .output()
            .await
            .map_err(|source| ResolveError::Spawn {
                tool: self.lookup_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ResolveError::LookupFailed {
                domain: domain.to_string(),
                detail,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let addresses = extract_ipv4_addresses(stdout.lines());
        info!("Resolved {} -> {:?}", domain, addresses);
        Ok(addresses)
    }
}

/// Extract IPv4 addresses from lookup output lines.
///
/// Only an `Address:` line directly following a `Name:` line counts as an
/// answer. Values that do not parse as IPv4 (notably IPv6 answers) are
/// dropped, and duplicates are kept once in first-seen order.
pub fn extract_ipv4_addresses<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut addresses: Vec<String> = Vec::new();
    let mut after_name = false;
    for line in lines {
        let trimmed = line.trim_start();
        if after_name {
            if let Some(value) = trimmed.strip_prefix("Address:") {
                let candidate = value.trim();
                if candidate.parse::<Ipv4Addr>().is_ok()
                    && !addresses.iter().any(|a| a == candidate)
                {
                    addresses.push(candidate.to_string());
                }
            }
        }
        after_name = trimmed.starts_with("Name:");
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_names_with_following_address_lines() {
        let lines = [
            "Server:\t\t127.0.0.53",
            "Address:\t127.0.0.53#53",
            "",
            "Non-authoritative answer:",
            "Name:\texample.com",
            "Address: 93.184.216.34",
        ];
        assert_eq!(extract_ipv4_addresses(lines), vec!["93.184.216.34"]);
    }

    #[test]
    fn excludes_ipv6_and_deduplicates() {
        let lines = [
            "Name: example.com",
            "Address: 93.184.216.34",
            "Name: example.com",
            "Address: 2606:2800::1",
            "Name: example.com",
            "Address: 93.184.216.34",
        ];
        assert_eq!(extract_ipv4_addresses(lines), vec!["93.184.216.34"]);
    }

    #[test]
    fn address_without_preceding_name_is_ignored() {
        let lines = ["Address: 192.0.2.1", "Name: example.com"];
        assert!(extract_ipv4_addresses(lines).is_empty());
    }

    #[test]
    fn multiple_answers_keep_order() {
        let lines = [
            "Name: cluster.example.com",
            "Address: 192.0.2.10",
            "Name: cluster.example.com",
            "Address: 192.0.2.11",
        ];
        assert_eq!(
            extract_ipv4_addresses(lines),
            vec!["192.0.2.10", "192.0.2.11"]
        );
    }

    #[test]
    fn garbage_values_are_dropped() {
        let lines = ["Name: x", "Address: not-an-ip", "Name: y", "Address: 10.0.0.300"];
        assert!(extract_ipv4_addresses(lines).is_empty());
    }
}
