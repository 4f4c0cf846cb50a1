// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: Apache-2.0

//! Test data generators for attack simulation.

use std::net::{IpAddr, Ipv4Addr};

/// Generate a pool of client addresses for testing.
///
/// Each address sits in its own /24 so masked throttle keys stay distinct.
pub fn generate_ips(count: usize) -> Vec<IpAddr> {
    (0..count)
        .map(|i| {
            let a = ((i >> 8) & 0xFF) as u8;
            let b = (i & 0xFF) as u8;
            IpAddr::V4(Ipv4Addr::new(10, a, b, 7))
        })
        .collect()
}

/// Generate forged tokens: well-formed v4 UUIDs with no record behind them.
pub fn generate_forged_tokens(count: usize) -> Vec<String> {
    (0..count)
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect()
}

/// Generate various Content-Type values for bypass testing.
pub fn generate_content_types() -> Vec<Option<&'static str>> {
    vec![
        // Valid
        Some("application/x-www-form-urlencoded"),
        Some("application/x-www-form-urlencoded; charset=utf-8"),
        // Invalid - should be rejected
        Some("application/json"),
        Some("text/plain"),
        Some("multipart/form-data"),
        Some("text/html"),
        Some("application/xml"),
        Some("APPLICATION/X-WWW-FORM-URLENCODED"), // Case variation
        Some("application/x-www-form-urlencoded; boundary=---"),
        None,        // Missing
        Some(""),    // Empty
        Some("   "), // Whitespace
    ]
}

/// Classify a Content-Type as valid or invalid.
pub fn is_valid_content_type(ct: Option<&str>) -> bool {
    match ct {
        Some(s) => {
            let normalized = s.split(';').next().unwrap_or("").trim().to_lowercase();
            normalized == "application/x-www-form-urlencoded"
        }
        None => false,
    }
}

/// Form ids paired with whether they are acceptable.
pub fn generate_form_ids() -> Vec<(String, bool)> {
    vec![
        ("contact".to_string(), true),
        ("news_letter-2".to_string(), true),
        ("a".repeat(64), true),
        ("a".repeat(65), false),
        (String::new(), false),
        ("two words".to_string(), false),
        ("../escape".to_string(), false),
        ("form!".to_string(), false),
        ("f\u{00fc}r".to_string(), false),
    ]
}

/// Origin header values that must not be treated as same-origin for
/// `http://forms.example.org`.
pub fn generate_foreign_origins() -> Vec<Option<&'static str>> {
    vec![
        None,
        Some("null"),
        Some("https://forms.example.org"),
        Some("http://forms.example.org:8080"),
        Some("http://evil.example"),
        Some("http://forms.example.org.evil.example"),
        Some("not an origin"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ips() {
        let ips = generate_ips(256);
        assert_eq!(ips.len(), 256);
        // All should be unique
        let unique: std::collections::HashSet<_> = ips.iter().collect();
        assert_eq!(unique.len(), 256);
    }

    #[test]
    fn test_forged_tokens_are_unique() {
        let tokens = generate_forged_tokens(50);
        let unique: std::collections::HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), 50);
    }

    #[test]
    fn test_content_type_validation() {
        assert!(is_valid_content_type(Some("application/x-www-form-urlencoded")));
        assert!(is_valid_content_type(Some(
            "application/x-www-form-urlencoded; charset=utf-8"
        )));
        assert!(!is_valid_content_type(Some("application/json")));
        assert!(!is_valid_content_type(None));
    }
}
