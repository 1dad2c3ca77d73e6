// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-ordered identifiers.
//!
//! Internal event IDs and run IDs are UUIDv7: 128-bit, lexicographically
//! sortable by creation time, with the unix-millisecond timestamp embedded in
//! the first 48 bits. The external `event.id` field is caller-provided and
//! never authoritative; ordering always uses the internal ID.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a new time-ordered ID for "now".
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate a time-ordered ID at a specific unix-millisecond timestamp.
pub fn new_id_at(unix_ms: u64) -> Uuid {
    let ts = uuid::Timestamp::from_unix(
        uuid::NoContext,
        unix_ms / 1000,
        ((unix_ms % 1000) * 1_000_000) as u32,
    );
    Uuid::new_v7(ts)
}

/// Deterministically derive an ID from an idempotency seed: the millisecond
/// timestamp plus caller-provided entropy. Ingesting the same seed twice
/// yields the same internal ID, which dedupes the event.
pub fn seeded_id(unix_ms: u64, entropy: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = (unix_ms >> 40) as u8;
    bytes[1] = (unix_ms >> 32) as u8;
    bytes[2] = (unix_ms >> 24) as u8;
    bytes[3] = (unix_ms >> 16) as u8;
    bytes[4] = (unix_ms >> 8) as u8;
    bytes[5] = unix_ms as u8;
    // Remaining 10 bytes come from the caller's entropy, zero-padded. Wider
    // entropy is folded through a hash so every byte contributes.
    if entropy.len() <= 10 {
        bytes[6..6 + entropy.len()].copy_from_slice(entropy);
    } else {
        let digest = Sha256::digest(entropy);
        bytes[6..16].copy_from_slice(&digest[..10]);
    }
    // Stamp version 7 and the RFC4122 variant so the ID sorts with the rest.
    bytes[6] = (bytes[6] & 0x0f) | 0x70;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Extract the unix-millisecond timestamp embedded in a v7 ID.
pub fn id_millis(id: &Uuid) -> u64 {
    let b = id.as_bytes();
    ((b[0] as u64) << 40)
        | ((b[1] as u64) << 32)
        | ((b[2] as u64) << 24)
        | ((b[3] as u64) << 16)
        | ((b[4] as u64) << 8)
        | (b[5] as u64)
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
