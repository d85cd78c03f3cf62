// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Generates a random 16-byte object identifier and returns:
/// - `[u8; 16]` for direct use on the wire
/// - `String` containing its hexadecimal representation (no prefix)
///
/// The version/variant bits follow the random-UUID layout so identifiers
/// minted by independent processes stay disjoint from handcrafted ones.
pub fn generate_identifier() -> ([u8; 16], String) {
    let mut id = [0u8; 16];
    rand::rng().fill(&mut id);

    id[6] = (id[6] & 0x0F) | 0x40;
    id[8] = (id[8] & 0x3F) | 0x80;

    let mut hex = String::with_capacity(32);
    for byte in &id {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (id, hex)
}
