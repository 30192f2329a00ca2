//! Input validation for values that end up on an iptables command line
//!
//! Arguments are passed to iptables without a shell, but a value starting
//! with `-` would still be read as an option. Everything configurable is
//! checked here before the first command runs.

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN - 1`).
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a table or chain name for use as an iptables argument.
///
/// # Errors
///
/// Returns `Err` if the name:
/// - is empty or longer than [`MAX_CHAIN_NAME_LEN`]
/// - starts with `-` or `!` (would be parsed as an option or negation)
/// - contains whitespace or non-ASCII characters
pub fn validate_chain_name(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!("Name too long (max {MAX_CHAIN_NAME_LEN} chars): {name}"));
    }

    if name.starts_with('-') || name.starts_with('!') {
        return Err(format!("Name cannot start with '-' or '!': {name}"));
    }

    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(format!("Name contains invalid characters: {name}"));
    }

    Ok(name)
}

/// Validates a directory tag pattern.
///
/// # Errors
///
/// Returns `Err` if the pattern is empty or is not a valid regular expression.
pub fn validate_pattern(pattern: &str) -> Result<&str, String> {
    if pattern.trim().is_empty() {
        return Err("Pattern cannot be empty".to_string());
    }
    if crate::core::rules::is_wildcard(pattern) {
        return Ok(pattern);
    }
    crate::directory::compile_pattern(pattern)
        .map(|_| pattern)
        .map_err(|e| e.to_string())
}
