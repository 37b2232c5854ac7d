//! Alias and UUID canonicalisation.
//!
//! Human names are never sent as names: they become aliases by gaining the
//! [`ALIAS_SENTINEL`] prefix, unless they already look like an id or an alias.

use std::sync::LazyLock;

use regex::Regex;

pub const ALIAS_SENTINEL: char = '\'';

static UUID_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{22}$").expect("uuid pattern compiles"));

pub fn is_alias(value: &str) -> bool {
    value.starts_with(ALIAS_SENTINEL)
}

/// True for 22-character tokens over `[A-Za-z0-9_-]`.
pub fn is_uuid(value: &str) -> bool {
    UUID_SHAPE.is_match(value)
}

/// Unconditionally prefix the sentinel. Use [`resolve`] unless a double prefix is intended.
pub fn make_alias(value: &str) -> String {
    format!("{ALIAS_SENTINEL}{value}")
}

/// Canonical identifier for `value`: aliases and UUIDs pass through, anything
/// else is turned into an alias. Idempotent.
pub fn resolve(value: &str) -> String {
    if is_alias(value) || is_uuid(value) {
        value.to_string()
    } else {
        make_alias(value)
    }
}

/// The id used to read a directory: UUIDs as-is, everything else aliased.
///
/// Unlike [`resolve`] this always prefixes non-UUIDs, which is how directories
/// created by older clients (whose aliases began with the sentinel) are found.
pub fn directory_key(value: &str) -> String {
    if is_uuid(value) {
        value.to_string()
    } else {
        make_alias(value)
    }
}
