//! CIDR-based admission of incoming client connections.
//!
//! The list is parsed once at startup; a malformed entry is a fatal
//! configuration error. Matching happens per incoming RPC connection.

use sqlrelay_impl::{RelayError, RelayResult};
use std::net::IpAddr;

#[derive(Clone, Copy, Debug)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn matches(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let bits = 32 - u32::from(self.prefix_len);
                let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
                u32::from(network) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let bits = 128 - u32::from(self.prefix_len);
                let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
                u128::from(network) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

/// The evaluator for the `allowed.ips` list.
#[derive(Clone, Debug)]
pub struct IpFilter {
    allow_all: bool,
    entries: Vec<Cidr>,
}

impl IpFilter {
    /// Parses a comma-separated list of addresses and CIDR ranges.
    /// `*` and `0.0.0.0/0` allow everything; the empty list denies
    /// everything.
    pub fn parse(list: &str) -> RelayResult<Self> {
        let mut allow_all = false;
        let mut entries = Vec::new();
        for item in list.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            if item == "*" || item == "0.0.0.0/0" {
                allow_all = true;
                continue;
            }
            let (addr_part, prefix_len) = match item.split_once('/') {
                Some((addr_part, prefix)) => {
                    let prefix_len: u8 = prefix.parse().map_err(|_| {
                        RelayError::ConfigInvalid(format!("Invalid CIDR prefix in \"{item}\""))
                    })?;
                    (addr_part, Some(prefix_len))
                }
                None => (item, None),
            };
            let network: IpAddr = addr_part.parse().map_err(|_| {
                RelayError::ConfigInvalid(format!("Invalid IP address in \"{item}\""))
            })?;
            let max_prefix = match network {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            let prefix_len = prefix_len.unwrap_or(max_prefix);
            if prefix_len > max_prefix {
                return Err(RelayError::ConfigInvalid(format!(
                    "CIDR prefix out of range in \"{item}\""
                )));
            }
            entries.push(Cidr {
                network,
                prefix_len,
            });
        }
        Ok(Self { allow_all, entries })
    }

    /// True if the source address may talk to the server; governed solely by
    /// the configured list.
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        if self.allow_all {
            return true;
        }
        self.entries.iter().any(|cidr| cidr.matches(addr))
    }

    /// Admission check with the standard denial error and warning log.
    pub fn check(&self, addr: IpAddr) -> RelayResult<()> {
        if self.is_allowed(addr) {
            Ok(())
        } else {
            warn!("Rejected connection from non-whitelisted address {addr}");
            Err(RelayError::SecurityDenied(format!(
                "Address {addr} is not allowed"
            )))
        }
    }
}
