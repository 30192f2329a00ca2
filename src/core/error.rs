use thiserror::Error;

/// Core error types for meshwall
#[derive(Debug, Error)]
pub enum Error {
    /// Service directory could not resolve a pattern or be loaded
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// Packet filter state query failed
    #[error("iptables read failed ({command}): {message}")]
    Read {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// Packet filter mutation failed
    #[error("iptables write failed ({command}): {message}")]
    Write {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// Expected entity is absent (host not in directory, chain missing)
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),
}

impl Error {
    /// Raw stderr text worth running through [`IptablesErrorPattern`], if any.
    pub fn filter_message(&self) -> Option<&str> {
        match self {
            Error::Read { message, .. } | Error::Write { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an iptables stderr message against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify iptables")
                .with_suggestion("Run meshwall as root or from a root cron/systemd unit")
                .with_suggestion("Or set MESHWALL_ELEVATION_METHOD=sudo with a NOPASSWD rule")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or point MESHWALL_IPTABLES_COMMAND at the binary");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the iptables lock")
                .with_suggestion("Another firewall manager may be modifying iptables")
                .with_suggestion("Wait a moment and re-run meshwall")
                .with_suggestion("Check for conflicting managers: systemctl status firewalld ufw");
        }

        // Chain already exists (usually a staging chain left by an interrupted run)
        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Firewall chain already exists")
                .with_suggestion("A previous run may have been interrupted mid-rotation")
                .with_suggestion("Re-running meshwall repairs leftover staging chains")
                .with_suggestion("Inspect with: iptables -S | grep managed_");
        }

        // Deleting a chain that is still referenced
        if lower.contains("too many links") || lower.contains("directory not empty") {
            return ErrorTranslation::new("Chain is still referenced and cannot be deleted")
                .with_suggestion("Another rule still jumps to this chain")
                .with_suggestion("List references with: iptables -S INPUT");
        }

        // Unknown chain/target
        if lower.contains("no chain/target/match by that name")
            || lower.contains("couldn't load target")
        {
            return ErrorTranslation::new("Firewall chain or target not found")
                .with_suggestion("The chain may have been removed out-of-band")
                .with_suggestion("Re-running meshwall rebuilds missing chains");
        }

        // Argument errors
        if lower.contains("bad argument") || lower.contains("invalid") {
            return ErrorTranslation::new("iptables rejected the rule arguments")
                .with_suggestion("Verify directory addresses are valid IPv4 addresses")
                .with_suggestion("Verify the configured hook chain and protocol");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
