// =============================================================================
// Operation log, audit trail, and external operations — append-only
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;

use crate::positions::{ExternalOpKind, ExternalOpStatus, ExternalOperation};

use super::Store;

/// Severity of a log/audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One row of the operation log or the audit trail (both tables share this
/// shape).
#[derive(Debug, Clone, Serialize)]
pub struct OperationLogEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub level: String,
    pub created_at: i64,
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationLogEntry> {
    let old: Option<String> = row.get(4)?;
    let new: Option<String> = row.get(5)?;
    Ok(OperationLogEntry {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        action: row.get(3)?,
        old_value: old.and_then(|s| serde_json::from_str(&s).ok()),
        new_value: new.and_then(|s| serde_json::from_str(&s).ok()),
        level: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Store {
    /// Append one operation-log entry. Rows are never updated or deleted.
    pub fn append_operation_log(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
        level: LogLevel,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operation_log \
                 (entity_type, entity_id, action, old_value, new_value, level, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity_type,
                    entity_id,
                    action,
                    old_value.map(|v| v.to_string()),
                    new_value.map(|v| v.to_string()),
                    level.as_str(),
                    now,
                ],
            )
            .context("append operation log")?;
            Ok(())
        })
    }

    /// Append one audit-trail entry (same shape, separate table).
    pub fn append_audit(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
        level: LogLevel,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_trail \
                 (entity_type, entity_id, action, old_value, new_value, level, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity_type,
                    entity_id,
                    action,
                    old_value.map(|v| v.to_string()),
                    new_value.map(|v| v.to_string()),
                    level.as_str(),
                    now,
                ],
            )
            .context("append audit trail")?;
            Ok(())
        })
    }

    /// Most recent operation-log entries, newest first.
    pub fn recent_operation_logs(&self, limit: usize) -> Result<Vec<OperationLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, entity_id, action, old_value, new_value, level, created_at \
                 FROM operation_log ORDER BY id DESC LIMIT ?1",
            )?;
            let entries = stmt
                .query_map(params![limit], entry_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Most recent audit-trail entries, newest first.
    pub fn recent_audit_entries(&self, limit: usize) -> Result<Vec<OperationLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, entity_id, action, old_value, new_value, level, created_at \
                 FROM audit_trail ORDER BY id DESC LIMIT ?1",
            )?;
            let entries = stmt
                .query_map(params![limit], entry_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Total operation-log rows. Reconciler idempotence tests lean on this.
    pub fn operation_log_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM operation_log", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Total audit-trail rows.
    pub fn audit_trail_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM audit_trail", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    // -------------------------------------------------------------------------
    // External operations
    // -------------------------------------------------------------------------

    pub fn insert_external_operation(&self, op: &ExternalOperation) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO external_operations \
                 (id, user_id, symbol, operation_type, old_amount, new_amount, confidence, \
                  detected_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    op.id,
                    op.user_id,
                    op.symbol,
                    op.operation_type.as_str(),
                    op.old_amount,
                    op.new_amount,
                    op.confidence,
                    op.detected_at,
                    op.status.as_str(),
                ],
            )
            .with_context(|| format!("insert external operation {}", op.id))?;
            Ok(())
        })
    }

    pub fn mark_external_operation_processed(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE external_operations SET status = 'processed' WHERE id = ?1",
                params![id],
            )?;
            if changed == 0 {
                anyhow::bail!("external operation {id} not found");
            }
            Ok(())
        })
    }

    pub fn recent_external_operations(&self, limit: usize) -> Result<Vec<ExternalOperation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, symbol, operation_type, old_amount, new_amount, \
                        confidence, detected_at, status \
                 FROM external_operations ORDER BY detected_at DESC LIMIT ?1",
            )?;
            let ops = stmt
                .query_map(params![limit], |row| {
                    let kind: String = row.get(3)?;
                    let status: String = row.get(8)?;
                    Ok(ExternalOperation {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        symbol: row.get(2)?,
                        operation_type: ExternalOpKind::from_str(&kind)
                            .unwrap_or(ExternalOpKind::ExternalModifyIncrease),
                        old_amount: row.get(4)?,
                        new_amount: row.get(5)?,
                        confidence: row.get(6)?,
                        detected_at: row.get(7)?,
                        status: ExternalOpStatus::from_str(&status)
                            .unwrap_or(ExternalOpStatus::Detected),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ops)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn operation_log_appends_and_reads_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_operation_log(
                "scheduled_order",
                "o1",
                "status_change",
                Some(&json!({"status": "sent"})),
                Some(&json!({"status": "filled"})),
                LogLevel::Info,
            )
            .unwrap();

        assert_eq!(store.operation_log_count().unwrap(), 1);
        let entries = store.recent_operation_logs(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "status_change");
        assert_eq!(entries[0].new_value, Some(json!({"status": "filled"})));
    }

    #[test]
    fn audit_trail_appends_and_reads_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_audit(
                "bracket_link",
                "b1",
                "orphaned",
                Some(&json!({"status": "active"})),
                Some(&json!({"status": "orphaned"})),
                LogLevel::Warning,
            )
            .unwrap();
        store
            .append_audit("health", "store", "probe_failed", None, None, LogLevel::Critical)
            .unwrap();

        assert_eq!(store.audit_trail_count().unwrap(), 2);
        // Audit rows never land in the operation log.
        assert_eq!(store.operation_log_count().unwrap(), 0);

        let entries = store.recent_audit_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].action, "probe_failed");
        assert_eq!(entries[0].level, "critical");
        assert_eq!(entries[1].entity_id, "b1");
        assert_eq!(entries[1].new_value, Some(json!({"status": "orphaned"})));
    }

    #[test]
    fn external_operation_life_cycle() {
        let store = Store::open_in_memory().unwrap();
        let op = ExternalOperation {
            id: Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            symbol: "ETHUSDT".to_string(),
            operation_type: ExternalOpKind::ExternalFullClose,
            old_amount: 1.0,
            new_amount: 0.0,
            confidence: 0.95,
            detected_at: 123,
            status: ExternalOpStatus::Detected,
        };
        store.insert_external_operation(&op).unwrap();

        store.mark_external_operation_processed(&op.id).unwrap();
        let ops = store.recent_external_operations(10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, ExternalOpStatus::Processed);
        assert_eq!(ops[0].operation_type, ExternalOpKind::ExternalFullClose);
    }
}
