// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use libfuzzer_sys::fuzz_target;

use drive_organizer::recognition::{normalize_labels, parse_labels};
use drive_organizer::storage::google_drive::escape_query_value;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let labels = normalize_labels(parse_labels(text), 20);
        assert!(labels.len() <= 20);
        assert!(labels.iter().all(|l| !l.is_empty()));

        let escaped = escape_query_value(text);
        assert!(!escaped.replace("\\\\", "").replace("\\'", "").contains('\''));
    }
});
