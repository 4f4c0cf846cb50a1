// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Client IP resolution behind trusted proxies, privacy-safe presentation,
//! and throttle key derivation.

use crate::config::{IpMode, PrivacyConfig};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Bytes of an IPv6 address kept when masking (48 bits).
const IPV6_MASK_KEEP_BYTES: usize = 6;

/// An IP network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `10.0.0.0/8`, `::1/128` or a bare address.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (raw, None),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return None;
        }
        Some(Self { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(&IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Resolves the client address from the peer address and, when the peer
/// is a trusted proxy, the configured client IP header.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    header: Option<String>,
    trusted: Vec<Cidr>,
}

impl ClientIpResolver {
    pub fn new(config: &PrivacyConfig) -> Self {
        let trusted = config
            .trusted_proxies
            .iter()
            .filter_map(|raw| {
                let cidr = Cidr::parse(raw);
                if cidr.is_none() {
                    tracing::warn!(cidr = %raw, "Ignoring invalid trusted proxy entry");
                }
                cidr
            })
            .collect();
        Self {
            header: config
                .client_ip_header
                .as_ref()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
            trusted,
        }
    }

    pub fn resolve(&self, remote: IpAddr, headers: &HeaderMap) -> IpAddr {
        let header = match &self.header {
            Some(header) => header,
            None => return remote,
        };
        if !self.trusted.iter().any(|cidr| cidr.contains(&remote)) {
            return remote;
        }
        headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|value| parse_header_ips(value).into_iter().find(is_public_ip))
            .unwrap_or(remote)
    }
}

/// Addresses from a comma-separated header such as `X-Forwarded-For`.
fn parse_header_ips(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim().trim_matches('"');
            part.parse::<IpAddr>()
                .ok()
                .or_else(|| part.parse::<SocketAddr>().ok().map(|s| s.ip()))
                .or_else(|| {
                    part.strip_prefix('[')
                        .and_then(|p| p.split_once(']'))
                        .and_then(|(ip, _)| ip.parse().ok())
                })
        })
        .collect()
}

/// Globally routable unicast address.
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public_ip(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
                || first == 0x2001 && v6.segments()[1] == 0x0db8)
        }
    }
}

/// Zero the host part: last IPv4 octet, or all but the first 48 bits.
pub fn mask(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let mut octets = [0u8; 16];
            octets[..IPV6_MASK_KEEP_BYTES].copy_from_slice(&v6.octets()[..IPV6_MASK_KEEP_BYTES]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn salted_hash(value: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Present an address under the privacy mode. `None` in `none` mode.
pub fn present(ip: IpAddr, config: &PrivacyConfig) -> Option<String> {
    match config.ip_mode {
        IpMode::None => None,
        IpMode::Masked => Some(mask(ip).to_string()),
        IpMode::Hash => Some(salted_hash(&ip.to_string(), &config.ip_hash_salt)),
        IpMode::Full => Some(ip.to_string()),
    }
}

/// The address as log lines may carry it; empty in `none` mode.
pub fn present_for_log(ip: IpAddr, config: &PrivacyConfig) -> String {
    present(ip, config).unwrap_or_default()
}

/// Throttle key for a client: a salted SHA-256 of the address, masked
/// first in `masked` mode. `None` disables throttling for the request.
pub fn throttle_key(ip: IpAddr, config: &PrivacyConfig) -> Option<String> {
    let basis = match config.ip_mode {
        IpMode::None => return None,
        IpMode::Masked => mask(ip),
        IpMode::Hash | IpMode::Full => ip,
    };
    Some(salted_hash(&basis.to_string(), &config.ip_hash_salt))
}
