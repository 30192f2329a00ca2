//! Access rules as supplied by configuration
//!
//! A [`Rule`] reads as "hosts tagged like `source` may reach this host on
//! `port`, provided this host is tagged like `destination`". Both patterns
//! are either the wildcard `ALL` or a regular expression over service tags.

use serde::{Deserialize, Deserializer, Serialize};

/// Pattern matching every directory entry, compared case-insensitively.
pub const WILDCARD: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub destination: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
}

impl Rule {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, port: u16) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            port,
        }
    }
}

/// Whether `pattern` is the match-everything wildcard.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.eq_ignore_ascii_case(WILDCARD)
}

/// Rules enforced when no configuration file is present.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("ALL", "logs.*", 5141),
        Rule::new("metrics.*", "ALL", 9100),
        Rule::new("metrics.*", "app.*", 9104),
        Rule::new("backups.*", "app.*", 3306),
    ]
}

/// Accepts `9100` as well as `"9100"`; configuration written for older
/// tooling carried ports as strings.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => Ok(port),
        RawPort::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{text}'"))),
    }
}
