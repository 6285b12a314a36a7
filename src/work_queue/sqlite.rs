//! SQLite queue backend, shareable between worker processes on one host.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::warn;
use uuid::Uuid;

use super::memory::DEFAULT_MAX_RECEIVE_COUNT;
use super::{QueueBackend, ReceivedMessage, WorkQueueError};
use crate::sqlite::connect;

pub struct SqliteQueueBackend {
    db_path: PathBuf,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

struct Row {
    id: i64,
    body: String,
    group_id: String,
    receipt: Option<String>,
    visible_at: i64,
    receive_count: u32,
}

impl SqliteQueueBackend {
    pub fn new(db_path: &Path, visibility_timeout: Duration) -> Result<Self, WorkQueueError> {
        let backend = Self {
            db_path: db_path.to_path_buf(),
            visibility_timeout,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        };
        backend.init_schema()?;
        Ok(backend)
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    fn connect(&self) -> Result<Connection, WorkQueueError> {
        Ok(connect(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<(), WorkQueueError> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                group_id TEXT NOT NULL,
                receipt TEXT,
                visible_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                dead_letter INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_messages_receipt ON queue_messages(receipt);
        "#,
        )?;
        Ok(())
    }

    /// Bodies moved aside after too many receives.
    pub fn dead_letters(&self) -> Result<Vec<String>, WorkQueueError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT body FROM queue_messages WHERE dead_letter = 1 ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(bodies)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn send(&self, body: &str, group_id: &str) -> Result<(), WorkQueueError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO queue_messages (body, group_id, visible_at, created_at) VALUES (?, ?, ?, ?)",
            params![body, group_id, now_millis(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, WorkQueueError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        let rows = {
            let mut stmt = tx.prepare(
                "SELECT id, body, group_id, receipt, visible_at, receive_count
                 FROM queue_messages WHERE dead_letter = 0 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Row {
                        id: row.get(0)?,
                        body: row.get(1)?,
                        group_id: row.get(2)?,
                        receipt: row.get(3)?,
                        visible_at: row.get(4)?,
                        receive_count: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let visible_at = now + self.visibility_timeout.as_millis() as i64;
        let mut blocked_groups = HashSet::new();
        let mut received = Vec::new();
        for row in rows {
            if received.len() >= max_messages {
                break;
            }
            if blocked_groups.contains(&row.group_id) {
                continue;
            }
            if row.receipt.is_some() && row.visible_at > now {
                blocked_groups.insert(row.group_id);
                continue;
            }
            if row.receive_count >= self.max_receive_count {
                warn!(
                    "Moving message to dead letters after {} receives: '{}'",
                    row.receive_count, row.body
                );
                tx.execute(
                    "UPDATE queue_messages SET dead_letter = 1, receipt = NULL WHERE id = ?",
                    params![row.id],
                )?;
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages
                 SET receipt = ?, visible_at = ?, receive_count = receive_count + 1
                 WHERE id = ?",
                params![receipt, visible_at, row.id],
            )?;
            blocked_groups.insert(row.group_id);
            received.push(ReceivedMessage {
                body: row.body,
                receipt,
            });
        }

        tx.commit()?;
        Ok(received)
    }

    async fn release(&self, receipt: &str) -> Result<(), WorkQueueError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE queue_messages SET receipt = NULL, visible_at = ? WHERE receipt = ?",
            params![now_millis(), receipt],
        )?;
        if changed == 0 {
            return Err(WorkQueueError::UnknownReceipt(receipt.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, receipt: &str) -> Result<(), WorkQueueError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM queue_messages WHERE receipt = ? AND dead_letter = 0",
            params![receipt],
        )?;
        if changed == 0 {
            return Err(WorkQueueError::UnknownReceipt(receipt.to_string()));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize, WorkQueueError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE dead_letter = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, visibility_timeout: Duration) -> SqliteQueueBackend {
        SqliteQueueBackend::new(&dir.path().join("queue.db"), visibility_timeout).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_per_group() {
        let dir = TempDir::new().unwrap();
        let queue = backend(&dir, Duration::from_secs(60));
        queue.send("a1", "a").await.unwrap();
        queue.send("a2", "a").await.unwrap();
        queue.send("b1", "b").await.unwrap();

        let all = queue.receive(10).await.unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["a1", "b1"]);

        queue.delete(&all[0].receipt).await.unwrap();
        assert_eq!(queue.receive(10).await.unwrap()[0].body, "a2");
    }

    #[tokio::test]
    async fn test_shared_between_handles() {
        let dir = TempDir::new().unwrap();
        let producer = backend(&dir, Duration::from_secs(60));
        let consumer = backend(&dir, Duration::from_secs(60));

        producer.send("job", "g").await.unwrap();
        let message = consumer.receive(1).await.unwrap().remove(0);
        assert!(producer.receive(1).await.unwrap().is_empty());

        consumer.release(&message.receipt).await.unwrap();
        let again = producer.receive(1).await.unwrap().remove(0);
        assert!(matches!(
            consumer.delete(&message.receipt).await,
            Err(WorkQueueError::UnknownReceipt(_))
        ));
        producer.delete(&again.receipt).await.unwrap();
        assert_eq!(consumer.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letters() {
        let dir = TempDir::new().unwrap();
        let queue = backend(&dir, Duration::ZERO).with_max_receive_count(2);
        queue.send("poison", "p").await.unwrap();
        for _ in 0..2 {
            let message = queue.receive(1).await.unwrap().remove(0);
            queue.release(&message.receipt).await.unwrap();
        }
        assert!(queue.receive(1).await.unwrap().is_empty());
        assert_eq!(queue.dead_letters().unwrap(), vec!["poison".to_string()]);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
