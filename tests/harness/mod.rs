// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: Apache-2.0

//! Test harness for eforms-guard attack simulation.
//!
//! Builds a full service over a temporary storage root and provides
//! request builders plus attack patterns for exercising the throttle,
//! the replay ledger and the request checks.

#![allow(dead_code)]

pub mod attacks;
pub mod fixtures;
pub mod generators;
pub mod metrics;
