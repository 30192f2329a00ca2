//! Naming convention for chains owned by meshwall
//!
//! Every port meshwall enforces gets one chain in the `filter` table:
//!
//! - `managed_<port>` - the live chain, linked into the hook
//! - `managed_<port>_staging` - transient chain built during rotation
//!
//! These names are the only state meshwall persists between runs, so the
//! format must stay stable. [`port_from_name`] is deliberately strict: any
//! chain that does not match the live format exactly is treated as foreign and
//! never touched by diff or purge logic.

const PREFIX: &str = "managed_";
const STAGING_SUFFIX: &str = "_staging";

/// A decoded managed chain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedName {
    pub port: u16,
    pub staging: bool,
}

/// Name of the live chain for `port`.
pub fn live_name(port: u16) -> String {
    format!("{PREFIX}{port}")
}

/// Name of the staging chain for `port`.
pub fn staging_name(port: u16) -> String {
    format!("{PREFIX}{port}{STAGING_SUFFIX}")
}

/// Decodes the port of a live managed chain.
///
/// Returns `None` for staging chains and for anything outside the convention.
pub fn port_from_name(name: &str) -> Option<u16> {
    match parse(name) {
        Some(ManagedName {
            port,
            staging: false,
        }) => Some(port),
        _ => None,
    }
}

/// Decodes either a live or a staging managed chain name.
pub fn parse(name: &str) -> Option<ManagedName> {
    let rest = name.strip_prefix(PREFIX)?;
    let (digits, staging) = match rest.strip_suffix(STAGING_SUFFIX) {
        Some(digits) => (digits, true),
        None => (rest, false),
    };

    parse_canonical_port(digits).map(|port| ManagedName { port, staging })
}

/// Only the exact text `live_name` would produce is accepted: no sign,
/// no leading zeros, no port 0.
fn parse_canonical_port(digits: &str) -> Option<u16> {
    if digits.is_empty() || digits.starts_with('0') {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
