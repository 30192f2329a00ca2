//! meshwall - directory-driven port allow-lists for iptables
//!
//! Keeps one managed iptables chain per protected port in line with a set of
//! access rules whose sources and destinations are service-tag patterns
//! resolved against a Consul-style catalog.
//!
//! # Architecture
//!
//! - [`core`] - Chain naming, packet filter traits, reconciliation engine
//! - [`directory`] - Catalog fetching and tag-pattern resolution
//! - [`agent`] - One pass of the control loop
//! - [`audit`] - JSON-lines record of every chain change
//! - [`config`] - Agent configuration loading and validation
//! - [`elevation`] - Running iptables through sudo/run0/pkexec when not root
//! - [`validators`] - Input validation for values that reach iptables
//! - [`utils`] - XDG directories and hostname discovery
//!
//! # Safety Features
//!
//! - Staging chain rotation: a port is never left without a deny-terminated chain
//! - Installed state is re-read every run, so out-of-band edits are repaired
//! - Every address is resolved before the packet filter is touched
//! - Obsolete-chain cleanup is best-effort and never aborts a run

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod audit;
pub mod config;
pub mod core;
pub mod directory;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use agent::{Agent, Mode, RunReport};
pub use core::error::{Error, Result};
pub use core::reconciler::{PurgeReport, RulesetReconciler};
pub use core::rules::Rule;
