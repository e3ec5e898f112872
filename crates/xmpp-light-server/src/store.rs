//! libsql-backed message store.
//!
//! Installed when `xmpp.message.save` is on. Each saved message keeps the
//! addressing and body as columns plus the full stanza for later replay.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use xmpp_light::{MessageStore, PersistedMessage, XmppError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stanza_id TEXT,
        from_jid TEXT NOT NULL,
        to_jid TEXT NOT NULL,
        message_type TEXT NOT NULL,
        body TEXT,
        stanza_xml TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_to ON messages (to_jid, id)",
];

/// Message store on a local libsql database.
pub struct LibSqlMessageStore {
    _db: libsql::Database,
    conn: Mutex<libsql::Connection>,
}

impl LibSqlMessageStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        for statement in SCHEMA {
            conn.execute(statement, ()).await?;
        }
        info!(db_path = %path.display(), "Message store initialized");
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query("SELECT COUNT(*) FROM messages", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    /// Saved messages addressed to `to`, oldest first.
    #[instrument(skip(self))]
    pub async fn messages_for(&self, to: &str) -> Result<Vec<PersistedMessage>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT stanza_id, from_jid, to_jid, message_type, body, stanza_xml, created_at
                FROM messages
                WHERE to_jid = ?
                ORDER BY id ASC
                "#,
                libsql::params![to],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at: String = row.get(6)?;
            let timestamp = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::Corrupt(format!("created_at '{}': {}", created_at, e)))?
                .with_timezone(&Utc);
            messages.push(PersistedMessage {
                id: row.get(0)?,
                from: row.get(1)?,
                to: row.get(2)?,
                message_type: row.get(3)?,
                body: row.get(4)?,
                stanza_xml: row.get(5)?,
                timestamp,
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    async fn save(&self, message: &PersistedMessage) -> Result<(), XmppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO messages (
                stanza_id, from_jid, to_jid, message_type, body, stanza_xml, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                message.id.clone(),
                message.from.clone(),
                message.to.clone(),
                message.message_type.clone(),
                message.body.clone(),
                message.stanza_xml.clone(),
                message.timestamp.to_rfc3339()
            ],
        )
        .await
        .map_err(|e| XmppError::persistence(format!("Failed to insert message: {}", e)))?;

        debug!(from = %message.from, to = %message.to, "Saved message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, to: &str, body: &str) -> PersistedMessage {
        PersistedMessage {
            from: from.into(),
            to: to.into(),
            id: Some("m1".into()),
            message_type: "chat".into(),
            body: Some(body.into()),
            stanza_xml: format!("<message xmlns='jabber:client' type='chat'><body>{}</body></message>", body),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = LibSqlMessageStore::open(&dir.path().join("messages.db")).await.unwrap();

        store.save(&message("alice@example.com/r1", "bob@example.com", "hi")).await.unwrap();
        store.save(&message("carol@example.com/r1", "bob@example.com", "yo")).await.unwrap();
        store.save(&message("bob@example.com/r1", "alice@example.com", "hey")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 3);

        let for_bob = store.messages_for("bob@example.com").await.unwrap();
        assert_eq!(for_bob.len(), 2);
        assert_eq!(for_bob[0].from, "alice@example.com/r1");
        assert_eq!(for_bob[0].body.as_deref(), Some("hi"));
        assert_eq!(for_bob[1].body.as_deref(), Some("yo"));
        assert_eq!(for_bob[0].id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_reopen_keeps_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("messages.db");
        {
            let store = LibSqlMessageStore::open(&path).await.unwrap();
            store.save(&message("a@example.com/x", "b@example.com", "persisted")).await.unwrap();
        }
        let store = LibSqlMessageStore::open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
