use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Branch, BranchKind, Message};
use crate::store::log::BranchEvent;
use crate::store::StoreError;

/// Derived read model over the event log, stored in SQLite.
///
/// The cache is a regenerable projection — the JSONL logs remain the
/// source of truth, and the database file is safe to delete. Writes are
/// funneled through `apply` so per-branch rows are serialized behind the
/// connection lock.
pub struct QueryCache {
    conn: Mutex<Connection>,
}

impl QueryCache {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS branches (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                parent_message_id TEXT NOT NULL,
                kind_type TEXT NOT NULL,
                kind_json TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_branches_conversation
                ON branches(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_branches_parent_message
                ON branches(parent_message_id);

            CREATE TABLE IF NOT EXISTS branch_messages (
                id TEXT PRIMARY KEY,
                branch_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                message_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_branch
                ON branch_messages(branch_id, seq);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Apply one event to the projection.
    pub fn apply(&self, event: &BranchEvent) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        match event {
            BranchEvent::BranchCreated { branch } => {
                conn.execute(
                    "INSERT OR REPLACE INTO branches
                     (id, conversation_id, parent_message_id, kind_type, kind_json, created, updated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        branch.id,
                        branch.conversation_id,
                        branch.parent_message_id,
                        branch.kind.type_str(),
                        serde_json::to_string(&branch.kind)?,
                        branch.created.to_rfc3339(),
                        branch.updated.to_rfc3339(),
                    ],
                )?;
            }
            BranchEvent::BranchUpdated {
                branch_id,
                kind,
                updated,
            } => {
                let changed = conn.execute(
                    "UPDATE branches SET kind_type = ?2, kind_json = ?3, updated = ?4
                     WHERE id = ?1",
                    params![
                        branch_id,
                        kind.type_str(),
                        serde_json::to_string(kind)?,
                        updated.to_rfc3339(),
                    ],
                )?;
                if changed == 0 {
                    return Err(StoreError::BranchNotFound(branch_id.clone()));
                }
            }
            BranchEvent::MessageAdded { branch_id, message }
            | BranchEvent::MessageUpdated { branch_id, message } => {
                conn.execute(
                    "INSERT OR REPLACE INTO branch_messages (id, branch_id, seq, message_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message.id,
                        branch_id,
                        message.sequence as i64,
                        serde_json::to_string(message)?,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Load one branch with its messages, or `None` if unknown.
    pub fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>, StoreError> {
        let branch = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT id, conversation_id, parent_message_id, kind_json, created, updated
                 FROM branches WHERE id = ?1",
                params![branch_id],
                row_to_branch,
            )
            .optional()?
        };

        match branch {
            Some(mut branch) => {
                branch.messages = self.branch_messages(branch_id)?;
                Ok(Some(branch))
            }
            None => Ok(None),
        }
    }

    /// Messages of a branch ordered by sequence number.
    pub fn branch_messages(&self, branch_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_json FROM branch_messages WHERE branch_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![branch_id], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    /// Highest sequence number used in a branch (0 when empty).
    pub fn max_sequence(&self, branch_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock_conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM branch_messages WHERE branch_id = ?1",
            params![branch_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// All branches of a conversation (without messages), oldest first.
    pub fn branches_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Branch>, StoreError> {
        self.branch_query(
            "SELECT id, conversation_id, parent_message_id, kind_json, created, updated
             FROM branches WHERE conversation_id = ?1 ORDER BY created ASC",
            conversation_id,
        )
    }

    /// Branches forked from a specific parent message.
    pub fn branches_by_message(&self, parent_message_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.branch_query(
            "SELECT id, conversation_id, parent_message_id, kind_json, created, updated
             FROM branches WHERE parent_message_id = ?1 ORDER BY created ASC",
            parent_message_id,
        )
    }

    /// Subagent branches of a conversation.
    pub fn subagent_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.branch_query(
            "SELECT id, conversation_id, parent_message_id, kind_json, created, updated
             FROM branches WHERE conversation_id = ?1 AND kind_type = 'subagent'
             ORDER BY created ASC",
            conversation_id,
        )
    }

    fn branch_query(&self, sql: &str, param: &str) -> Result<Vec<Branch>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![param], row_to_branch)?;

        let mut branches = Vec::new();
        for row in rows {
            branches.push(row?);
        }
        Ok(branches)
    }

    /// Drop all rows belonging to a conversation's branches.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM branch_messages WHERE branch_id IN
             (SELECT id FROM branches WHERE conversation_id = ?1)",
            params![conversation_id],
        )?;
        conn.execute(
            "DELETE FROM branches WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    /// Empty the projection (used before a full replay).
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute_batch("DELETE FROM branch_messages; DELETE FROM branches;")?;
        Ok(())
    }
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    let kind_json: String = row.get(3)?;
    let kind: BranchKind = serde_json::from_str(&kind_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;

    Ok(Branch {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        parent_message_id: row.get(2)?,
        kind,
        messages: Vec::new(),
        created: parse_timestamp(&created),
        updated: parse_timestamp(&updated),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
