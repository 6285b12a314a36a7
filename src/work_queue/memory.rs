//! In-process queue backend.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use super::{QueueBackend, ReceivedMessage, WorkQueueError};

pub(crate) const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

#[derive(Debug)]
struct StoredMessage {
    body: String,
    group_id: String,
    receipt: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.receipt.is_some() && self.visible_at > now
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<String>,
}

/// FIFO queue with per-group ordering, visibility timeouts and a receive limit.
#[derive(Debug)]
pub struct InMemoryQueueBackend {
    visibility_timeout: Duration,
    max_receive_count: u32,
    state: Mutex<QueueState>,
}

impl InMemoryQueueBackend {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    /// Bodies moved aside after too many receives.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn send(&self, body: &str, group_id: &str) -> Result<(), WorkQueueError> {
        self.state.lock().await.messages.push(StoredMessage {
            body: body.to_string(),
            group_id: group_id.to_string(),
            receipt: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, WorkQueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut blocked_groups = HashSet::new();
        let mut received = Vec::new();
        let mut index = 0;

        while index < state.messages.len() && received.len() < max_messages {
            let message = &state.messages[index];
            if blocked_groups.contains(&message.group_id) {
                index += 1;
                continue;
            }
            if message.in_flight(now) {
                blocked_groups.insert(message.group_id.clone());
                index += 1;
                continue;
            }
            if message.receive_count >= self.max_receive_count {
                let message = state.messages.remove(index);
                warn!(
                    "Moving message to dead letters after {} receives: '{}'",
                    message.receive_count, message.body
                );
                state.dead_letters.push(message.body);
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            let message = &mut state.messages[index];
            message.receipt = Some(receipt.clone());
            message.visible_at = now + self.visibility_timeout;
            message.receive_count += 1;
            blocked_groups.insert(message.group_id.clone());
            received.push(ReceivedMessage {
                body: message.body.clone(),
                receipt,
            });
            index += 1;
        }
        Ok(received)
    }

    async fn release(&self, receipt: &str) -> Result<(), WorkQueueError> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.receipt.as_deref() == Some(receipt))
            .ok_or_else(|| WorkQueueError::UnknownReceipt(receipt.to_string()))?;
        message.receipt = None;
        message.visible_at = Instant::now();
        Ok(())
    }

    async fn delete(&self, receipt: &str) -> Result<(), WorkQueueError> {
        let mut state = self.state.lock().await;
        let index = state
            .messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt))
            .ok_or_else(|| WorkQueueError::UnknownReceipt(receipt.to_string()))?;
        state.messages.remove(index);
        Ok(())
    }

    async fn depth(&self) -> Result<usize, WorkQueueError> {
        Ok(self.state.lock().await.messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_head_in_flight_blocks_group() {
        let queue = InMemoryQueueBackend::new(Duration::from_secs(60));
        queue.send("a1", "a").await.unwrap();
        queue.send("a2", "a").await.unwrap();
        queue.send("b1", "b").await.unwrap();

        let first = queue.receive(1).await.unwrap();
        assert_eq!(first[0].body, "a1");
        // a2 waits behind a1.
        let second = queue.receive(1).await.unwrap();
        assert_eq!(second[0].body, "b1");
        assert!(queue.receive(1).await.unwrap().is_empty());

        queue.delete(&first[0].receipt).await.unwrap();
        assert_eq!(queue.receive(1).await.unwrap()[0].body, "a2");
    }

    #[tokio::test]
    async fn test_release_makes_visible_again() {
        let queue = InMemoryQueueBackend::new(Duration::from_secs(60));
        queue.send("a1", "a").await.unwrap();
        let received = queue.receive(10).await.unwrap();
        assert_eq!(received.len(), 1);
        queue.release(&received[0].receipt).await.unwrap();

        let again = queue.receive(10).await.unwrap();
        assert_eq!(again[0].body, "a1");
        assert_ne!(again[0].receipt, received[0].receipt);
    }

    #[tokio::test]
    async fn test_expired_lease_rotates_receipt() {
        let queue = InMemoryQueueBackend::new(Duration::ZERO);
        queue.send("a1", "a").await.unwrap();
        let stale = queue.receive(1).await.unwrap().remove(0);
        let fresh = queue.receive(1).await.unwrap().remove(0);

        assert!(matches!(
            queue.delete(&stale.receipt).await,
            Err(WorkQueueError::UnknownReceipt(_))
        ));
        queue.delete(&fresh.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_limit_moves_to_dead_letters() {
        let queue = InMemoryQueueBackend::new(Duration::ZERO).with_max_receive_count(1);
        queue.send("poison", "p").await.unwrap();
        assert_eq!(queue.receive(1).await.unwrap().len(), 1);
        assert!(queue.receive(1).await.unwrap().is_empty());
        assert_eq!(queue.dead_letters().await, vec!["poison".to_string()]);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
