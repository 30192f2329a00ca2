//! Audit trail of packet filter changes
//!
//! Every chain meshwall creates, rotates or purges is appended as one JSON
//! line to `<state dir>/audit.log`, tagged with the run that made the change.
//! Audit failures are logged and never abort a run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ChainCreated,
    ChainRotated,
    ChainPurged,
    PurgeFailed,
    RunCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: Uuid,
    pub event_type: EventType,
    /// Port whose chain changed; absent for run-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub success: bool,
    #[serde(default)]
    pub details: serde_json::Value,
    pub error: Option<String>,
}

impl AuditEvent {
    /// A change to the managed chain of `port`.
    pub fn chain(
        run_id: Uuid,
        event_type: EventType,
        port: u16,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            event_type,
            port: Some(port),
            success: error.is_none(),
            details,
            error,
        }
    }

    /// Summary written once at the end of an enforcing run.
    pub fn run_completed(
        run_id: Uuid,
        clean: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            event_type: EventType::RunCompleted,
            port: None,
            success: clean,
            details,
            error,
        }
    }
}

/// Append-only JSON-lines audit file
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Audit log in the XDG state directory, created with mode 0700 if missing
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined or created
    pub fn new() -> std::io::Result<Self> {
        let dir = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no state directory for this user")
        })?;
        crate::utils::ensure_state_dir()?;

        Ok(Self::at(dir.join("audit.log")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event` and syncs it to disk before returning
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await
    }

    /// Up to `count` most recent events, newest first
    ///
    /// A log that does not exist yet reads as empty. Lines that fail to parse
    /// are skipped.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }
}

/// Appends `event` if auditing is enabled, warning instead of failing.
pub async fn record(audit: Option<&AuditLog>, event: AuditEvent) {
    let Some(audit) = audit else {
        return;
    };

    if let Err(e) = audit.append(&event).await {
        tracing::warn!("Failed to write audit log {}: {e}", audit.path().display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_event_json_shape() {
        let event = AuditEvent::chain(
            Uuid::nil(),
            EventType::PurgeFailed,
            22,
            serde_json::Value::Null,
            Some("Too many links.".to_string()),
        );

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "purge_failed");
        assert_eq!(json["port"], 22);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Too many links.");
    }

    #[test]
    fn test_run_event_omits_port() {
        let event = AuditEvent::run_completed(Uuid::nil(), true, serde_json::json!({}), None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"port\""));

        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::RunCompleted);
        assert_eq!(parsed.port, None);
        assert!(parsed.success);
    }

    #[tokio::test]
    async fn test_append_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));
        let run_id = Uuid::new_v4();

        for port in [80, 443, 9100] {
            let event = AuditEvent::chain(
                run_id,
                EventType::ChainCreated,
                port,
                serde_json::Value::Null,
                None,
            );
            audit.append(&event).await.unwrap();
        }
        tokio::fs::write(
            audit.path(),
            format!("{}not json\n", tokio::fs::read_to_string(audit.path()).await.unwrap()),
        )
        .await
        .unwrap();

        let events = audit.read_recent(2).await.unwrap();
        let ports: Vec<_> = events.iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![Some(9100), Some(443)]);
        assert!(events.iter().all(|e| e.run_id == run_id && e.success));
    }

    #[tokio::test]
    async fn test_read_recent_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("never-written.log"));
        assert!(audit.read_recent(10).await.unwrap().is_empty());
    }
}
