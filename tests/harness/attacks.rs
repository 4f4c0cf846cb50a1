// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: Apache-2.0

//! Attack simulation patterns for security testing.

/// Where each simulated submission gets its token from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// A freshly minted hidden token per request
    Fresh,
    /// One minted token replayed by every request
    Shared,
    /// Well-formed tokens that were never minted
    Forged,
    /// No token and no cookie
    Missing,
}

/// Attack pattern configuration.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Total number of submissions to send
    pub total_requests: usize,
    /// Number of unique client addresses to simulate
    pub unique_ips: usize,
    /// Token supply for each submission
    pub tokens: TokenSource,
    /// Fill the honeypot field
    pub honeypot: bool,
    /// Submissions in flight at once
    pub concurrency: usize,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            total_requests: 100,
            unique_ips: 1,
            tokens: TokenSource::Fresh,
            honeypot: false,
            concurrency: 1,
        }
    }
}

/// Predefined attack patterns.
impl AttackConfig {
    /// Single client flood - many valid submissions from one address.
    pub fn single_ip_flood() -> Self {
        Self {
            total_requests: 60,
            unique_ips: 1,
            ..Default::default()
        }
    }

    /// Distributed submissions - many clients, low rate each.
    pub fn distributed_attack() -> Self {
        Self {
            total_requests: 200,
            unique_ips: 100,
            concurrency: 8,
            ..Default::default()
        }
    }

    /// Replay storm - one captured token submitted concurrently.
    pub fn replay_storm() -> Self {
        Self {
            total_requests: 48,
            unique_ips: 12,
            tokens: TokenSource::Shared,
            concurrency: 16,
            ..Default::default()
        }
    }

    /// Forged tokens - guessed UUIDs with no record.
    pub fn forged_tokens() -> Self {
        Self {
            total_requests: 40,
            unique_ips: 10,
            tokens: TokenSource::Forged,
            ..Default::default()
        }
    }

    /// Bots that fill every field, the honeypot included.
    pub fn honeypot_bots() -> Self {
        Self {
            total_requests: 30,
            unique_ips: 10,
            honeypot: true,
            ..Default::default()
        }
    }

    /// Submissions that skip the token entirely.
    pub fn tokenless() -> Self {
        Self {
            total_requests: 30,
            unique_ips: 5,
            tokens: TokenSource::Missing,
            ..Default::default()
        }
    }

    /// Requests each client sends.
    pub fn per_ip(&self) -> usize {
        self.total_requests.div_ceil(self.unique_ips.max(1))
    }

    /// Get expected outcomes for this attack pattern under a throttle of
    /// `max_per_minute`.
    pub fn expectations(&self, max_per_minute: usize) -> AttackExpectations {
        if self.honeypot {
            AttackExpectations {
                min_accepted: 0,
                max_accepted: 0,
                description: "Honeypot submissions must never be accepted",
            }
        } else {
            match self.tokens {
                TokenSource::Shared => AttackExpectations {
                    min_accepted: 1,
                    max_accepted: 1,
                    description: "A replayed token is accepted exactly once",
                },
                TokenSource::Forged => AttackExpectations {
                    min_accepted: 0,
                    max_accepted: 0,
                    description: "Forged tokens have no record and are rejected",
                },
                TokenSource::Missing => AttackExpectations {
                    min_accepted: 0,
                    max_accepted: self.total_requests,
                    description: "Tokenless submissions follow the cookie-missing policy",
                },
                TokenSource::Fresh if self.per_ip() <= max_per_minute => AttackExpectations {
                    min_accepted: self.total_requests,
                    max_accepted: self.total_requests,
                    description: "Each client stays under its per-minute budget",
                },
                TokenSource::Fresh => AttackExpectations {
                    min_accepted: 0,
                    max_accepted: max_per_minute * self.unique_ips,
                    description: "Each client is capped at its per-minute budget",
                },
            }
        }
    }
}

/// Expected outcomes for an attack.
pub struct AttackExpectations {
    /// Fewest submissions that should be accepted
    pub min_accepted: usize,
    /// Most submissions that may be accepted
    pub max_accepted: usize,
    /// Description of expected behavior
    pub description: &'static str,
}

impl AttackExpectations {
    pub fn holds(&self, accepted: usize) -> bool {
        (self.min_accepted..=self.max_accepted).contains(&accepted)
    }
}
