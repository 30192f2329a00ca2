//! iptables-backed packet filter
//!
//! Implements [`ChainStateReader`] and [`RulesetWriter`] by running the
//! `iptables` binary, one invocation per primitive. Reads classify failures
//! as [`Error::Read`], mutations as [`Error::Write`].
//!
//! Chain contents are read from the per-rule statistics listing
//! (`iptables -t filter -L <chain> -n -v -x`):
//!
//! ```text
//! Chain managed_9100 (1 references)
//!     pkts      bytes target     prot opt in     out     source               destination
//!       12      720 ACCEPT     all  --  *      *       10.0.0.5             0.0.0.0/0
//!        0        0 DROP       all  --  *      *       0.0.0.0/0            0.0.0.0/0
//! ```
//!
//! The permit set is the source column of every `ACCEPT` row with a concrete
//! address. The terminal deny row matches any source (`0.0.0.0/0`); rows
//! with a zero-length prefix are never treated as permits.

use crate::core::error::{Error, Result};
use crate::core::filter::{AddressSet, ChainStateReader, RulesetWriter};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::process::Stdio;
use tracing::{debug, error};

/// Rule targets meshwall writes into its own chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Target {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// Transport protocol matched by hook jumps.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// One row of `iptables -L -n -v -x` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStat {
    pub packets: u64,
    pub bytes: u64,
    pub target: String,
    pub protocol: String,
    pub input: String,
    pub output: String,
    pub source: IpNetwork,
    pub destination: IpNetwork,
    pub options: String,
}

impl RuleStat {
    /// The source address of a permit rule, or `None` for the deny sentinel
    /// and any rule meshwall did not write as a permit.
    pub fn permitted_source(&self) -> Option<IpAddr> {
        if self.target.parse::<Target>() != Ok(Target::Accept) || self.source.prefix() == 0 {
            return None;
        }
        Some(self.source.ip())
    }
}

/// Parses the statistics listing for a single chain.
///
/// Header lines are skipped. Newer iptables builds omit the `opt` column, so
/// both layouts are accepted.
pub fn parse_stats(output: &str) -> std::result::Result<Vec<RuleStat>, String> {
    let mut stats = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Chain ") || line.starts_with("pkts") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();

        // pkts bytes target prot [opt] in out source destination [options...]
        let has_opt = fields.len() >= 9 && is_opt_column(fields[4]);
        let base = if has_opt { 9 } else { 8 };
        if fields.len() < base {
            return Err(format!("unexpected rule line: {line}"));
        }
        let at = |i: usize| if has_opt || i < 4 { fields[i] } else { fields[i - 1] };

        let parse_count = |s: &str| {
            s.parse::<u64>()
                .map_err(|e| format!("bad counter '{s}' in line: {line}: {e}"))
        };
        let parse_net = |s: &str| {
            s.parse::<IpNetwork>()
                .map_err(|e| format!("bad address '{s}' in line: {line}: {e}"))
        };

        stats.push(RuleStat {
            packets: parse_count(fields[0])?,
            bytes: parse_count(fields[1])?,
            target: fields[2].to_string(),
            protocol: fields[3].to_string(),
            input: at(5).to_string(),
            output: at(6).to_string(),
            source: parse_net(at(7))?,
            destination: parse_net(at(8))?,
            options: fields[base..].join(" "),
        });
    }

    Ok(stats)
}

fn is_opt_column(field: &str) -> bool {
    matches!(field, "--" | "-f" | "!f")
}

/// Parses `iptables -S` output into chain names (built-in and user-defined).
pub fn parse_chain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P" | "-N") => parts.next().map(String::from),
                _ => None,
            }
        })
        .collect()
}

/// Packet filter handle driving the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    table: String,
    hook_chain: String,
    protocol: Protocol,
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self::new("filter", "INPUT", Protocol::Tcp)
    }
}

enum Kind {
    Read,
    Write,
}

struct Outcome {
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

impl IptablesFilter {
    pub fn new(table: impl Into<String>, hook_chain: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            table: table.into(),
            hook_chain: hook_chain.into(),
            protocol,
        }
    }

    /// Arguments of the hook rule jumping `port` traffic into `chain`.
    fn hook_rule(&self, chain: &str, port: u16) -> Vec<String> {
        vec![
            self.hook_chain.clone(),
            "-p".to_string(),
            self.protocol.to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            chain.to_string(),
        ]
    }

    async fn execute(&self, args: &[&str]) -> Result<Outcome> {
        let mut full = vec!["-w", "-t", self.table.as_str()];
        full.extend_from_slice(args);
        debug!("iptables {}", full.join(" "));

        let output = crate::elevation::create_elevated_iptables_command(&full)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to spawn iptables: {e}");
                return Ok(Outcome {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("Failed to spawn iptables: {e}"),
                    exit_code: None,
                });
            }
        };

        Ok(Outcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Runs a command that must succeed, returning stdout.
    async fn run(&self, kind: Kind, args: &[&str]) -> Result<String> {
        let outcome = self.execute(args).await?;
        if outcome.success {
            return Ok(outcome.stdout);
        }

        let command = format!("iptables -t {} {}", self.table, args.join(" "));
        error!("{command} failed: {}", outcome.stderr);
        Err(match kind {
            Kind::Read => Error::Read {
                command,
                message: outcome.stderr,
                exit_code: outcome.exit_code,
            },
            Kind::Write => Error::Write {
                command,
                message: outcome.stderr,
                exit_code: outcome.exit_code,
            },
        })
    }

    /// Runs `iptables -C ...`; exit status 1 means "rule not present".
    async fn rule_present(&self, rule: &[&str]) -> Result<bool> {
        let mut args = vec!["-C"];
        args.extend_from_slice(rule);
        let outcome = self.execute(&args).await?;

        match (outcome.success, outcome.exit_code) {
            (true, _) => Ok(true),
            (false, Some(1)) => Ok(false),
            (false, exit_code) => Err(Error::Write {
                command: format!("iptables -t {} {}", self.table, args.join(" ")),
                message: outcome.stderr,
                exit_code,
            }),
        }
    }
}

impl ChainStateReader for IptablesFilter {
    async fn exists(&self, chain: &str) -> Result<bool> {
        Ok(self.list_chains().await?.iter().any(|name| name == chain))
    }

    async fn list_chains(&self) -> Result<Vec<String>> {
        let stdout = self.run(Kind::Read, &["-S"]).await?;
        Ok(parse_chain_list(&stdout))
    }

    async fn current_addresses(&self, chain: &str) -> Result<AddressSet> {
        let args = ["-L", chain, "-n", "-v", "-x"];
        let stdout = self.run(Kind::Read, &args).await?;

        let stats = parse_stats(&stdout).map_err(|message| Error::Read {
            command: format!("iptables -t {} {}", self.table, args.join(" ")),
            message,
            exit_code: None,
        })?;

        Ok(stats.iter().filter_map(RuleStat::permitted_source).collect())
    }
}

impl RulesetWriter for IptablesFilter {
    async fn create_chain(&self, chain: &str) -> Result<()> {
        self.run(Kind::Write, &["-N", chain]).await.map(drop)
    }

    async fn append_permit(&self, chain: &str, addr: IpAddr) -> Result<()> {
        let source = addr.to_string();
        let target = Target::Accept.to_string();
        self.run(Kind::Write, &["-A", chain, "-s", &source, "-j", &target])
        .await
        .map(drop)
    }

    async fn append_deny_if_absent(&self, chain: &str) -> Result<()> {
        let target = Target::Drop.to_string();
        let rule = [chain, "-j", target.as_str()];
        if self.rule_present(&rule).await? {
            return Ok(());
        }
        let mut args = vec!["-A"];
        args.extend_from_slice(&rule);
        self.run(Kind::Write, &args).await.map(drop)
    }

    async fn link_to_hook(&self, chain: &str, port: u16) -> Result<()> {
        let rule = self.hook_rule(chain, port);
        let rule: Vec<&str> = rule.iter().map(String::as_str).collect();
        if self.rule_present(&rule).await? {
            return Ok(());
        }
        let mut args = vec!["-A"];
        args.extend_from_slice(&rule);
        self.run(Kind::Write, &args).await.map(drop)
    }

    async fn unlink_from_hook(&self, chain: &str, port: u16) -> Result<()> {
        let rule = self.hook_rule(chain, port);
        let rule: Vec<&str> = rule.iter().map(String::as_str).collect();
        if !self.rule_present(&rule).await? {
            return Ok(());
        }
        let mut args = vec!["-D"];
        args.extend_from_slice(&rule);
        self.run(Kind::Write, &args).await.map(drop)
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.run(Kind::Write, &["-E", old, new]).await.map(drop)
    }

    async fn clear_and_delete(&self, chain: &str) -> Result<()> {
        self.run(Kind::Write, &["-F", chain]).await?;
        self.run(Kind::Write, &["-X", chain]).await.map(drop)
    }
}
