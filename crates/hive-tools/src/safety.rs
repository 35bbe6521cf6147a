// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static denylist for shell command execution.
//!
//! Substring matching only; this is a last-resort guard against obviously
//! destructive commands, not a sandbox.

const DENIED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
    "chmod -R 777 /",
    "sudo rm",
    "sudo dd",
];

/// Return the first denied pattern found in `command`, if any.
pub fn blocked_pattern(command: &str) -> Option<&'static str> {
    DENIED_PATTERNS
        .iter()
        .find(|pat| command.contains(*pat))
        .copied()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
