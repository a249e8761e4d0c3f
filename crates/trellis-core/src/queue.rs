use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::model::{QueuedKind, QueuedMessage};

/// Handler invoked once per delivered message. Exactly one is active at
/// a time.
pub type Processor =
    Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Best-effort observability signals for external consumers (e.g. UI
/// refresh). Not part of the processing contract.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Queued { len: usize },
    Processing { id: String },
    Empty,
}

/// In-process priority queue that defers non-urgent messages (subagent
/// results, system notices) while the primary conversation is
/// generating, and lets user input jump ahead of pending results.
///
/// Queued messages live in memory only: delivery is at-most-once, and a
/// crash while the queue is paused loses whatever is pending.
pub struct MessageQueue {
    pending: Mutex<VecDeque<QueuedMessage>>,
    generating: AtomicBool,
    processor: Mutex<Option<Processor>>,
    notify_tx: broadcast::Sender<QueueEvent>,
}

impl MessageQueue {
    pub fn new(notify_buffer: usize) -> Self {
        let (notify_tx, _) = broadcast::channel(notify_buffer.max(1));
        Self {
            pending: Mutex::new(VecDeque::new()),
            generating: AtomicBool::new(false),
            processor: Mutex::new(None),
            notify_tx,
        }
    }

    /// Lock the deque, recovering from a poisoned lock (the queue holds
    /// plain data, so the contents stay usable after a panic).
    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the active processor.
    pub fn set_processor(&self, processor: Processor) {
        *self
            .processor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(processor);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.notify_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Deliver a message now if generation is idle, otherwise queue it.
    ///
    /// User messages are inserted after the last queued user message, so
    /// consecutive user input keeps submission order while jumping ahead
    /// of pending subagent results. Everything else goes to the back.
    pub async fn enqueue(&self, message: QueuedMessage) {
        if !self.is_generating() {
            self.process(message).await;
            return;
        }

        let len = {
            let mut pending = self.pending();
            if message.kind == QueuedKind::User {
                let pos = pending
                    .iter()
                    .rposition(|m| m.kind == QueuedKind::User)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                pending.insert(pos, message);
            } else {
                pending.push_back(message);
            }
            pending.len()
        };
        debug!("Queued message during generation (queue length {len})");
        let _ = self.notify_tx.send(QueueEvent::Queued { len });
    }

    pub fn on_generation_start(&self) {
        self.generating.store(true, Ordering::SeqCst);
    }

    /// Mark generation idle and drain whatever is queued.
    pub async fn on_generation_complete(&self) {
        self.generating.store(false, Ordering::SeqCst);
        self.drain().await;
    }

    /// Deliver queued messages strictly FIFO until the queue is empty or
    /// a new generation starts mid-drain (in which case draining pauses
    /// and resumes on the next completion).
    async fn drain(&self) {
        loop {
            if self.is_generating() {
                debug!("Queue drain paused: generation restarted");
                return;
            }

            let next = self.pending().pop_front();
            match next {
                Some(message) => self.process(message).await,
                None => {
                    let _ = self.notify_tx.send(QueueEvent::Empty);
                    return;
                }
            }
        }
    }

    async fn process(&self, message: QueuedMessage) {
        let _ = self.notify_tx.send(QueueEvent::Processing {
            id: message.id.clone(),
        });

        let processor = self
            .processor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match processor {
            Some(processor) => {
                // A failing processor is a reported error, never a
                // queue-halting one.
                if let Err(e) = processor(message).await {
                    warn!("Queued message processing failed: {e}");
                }
            }
            None => warn!("No queue processor registered; dropping message {}", message.id),
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let pending = self.pending();
        if !pending.is_empty() {
            warn!(
                "Message queue dropped with {} undelivered message(s); queued results \
                 are in-memory only",
                pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueuedMeta;

    fn message(kind: QueuedKind, content: &str) -> QueuedMessage {
        QueuedMessage::new(kind, content, QueuedMeta::default())
    }

    /// Queue plus a log of processed contents, shared with the processor.
    fn recording_queue() -> (Arc<MessageQueue>, Arc<Mutex<Vec<String>>>) {
        let queue = Arc::new(MessageQueue::new(16));
        let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = processed.clone();
        queue.set_processor(Arc::new(move |msg: QueuedMessage| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(msg.content);
                Ok(())
            })
        }));
        (queue, processed)
    }

    #[tokio::test]
    async fn test_pass_through_when_idle() {
        let (queue, processed) = recording_queue();

        queue.enqueue(message(QueuedKind::SubagentResult, "S1")).await;

        assert_eq!(queue.len(), 0);
        assert_eq!(*processed.lock().unwrap(), vec!["S1"]);
    }

    #[tokio::test]
    async fn test_user_messages_jump_ahead_of_results() {
        let (queue, processed) = recording_queue();

        queue.on_generation_start();
        queue.enqueue(message(QueuedKind::User, "U1")).await;
        queue.enqueue(message(QueuedKind::SubagentResult, "S1")).await;
        queue.enqueue(message(QueuedKind::User, "U2")).await;
        assert_eq!(queue.len(), 3);

        queue.on_generation_complete().await;

        assert_eq!(*processed.lock().unwrap(), vec!["U1", "U2", "S1"]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_result_after_user_keeps_relative_order() {
        let (queue, processed) = recording_queue();

        queue.on_generation_start();
        queue.enqueue(message(QueuedKind::SubagentResult, "S1")).await;
        queue.enqueue(message(QueuedKind::User, "U1")).await;
        queue.enqueue(message(QueuedKind::System, "N1")).await;
        queue.on_generation_complete().await;

        // U1 jumped ahead of S1; N1 stayed behind both.
        assert_eq!(*processed.lock().unwrap(), vec!["U1", "S1", "N1"]);
    }

    #[tokio::test]
    async fn test_processor_error_does_not_halt_drain() {
        let queue = Arc::new(MessageQueue::new(16));
        let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = processed.clone();
        queue.set_processor(Arc::new(move |msg: QueuedMessage| {
            let log = log.clone();
            Box::pin(async move {
                if msg.content == "boom" {
                    anyhow::bail!("processing failed");
                }
                log.lock().unwrap().push(msg.content);
                Ok(())
            })
        }));

        queue.on_generation_start();
        queue.enqueue(message(QueuedKind::System, "boom")).await;
        queue.enqueue(message(QueuedKind::System, "after")).await;
        queue.on_generation_complete().await;

        assert_eq!(*processed.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_drain_pauses_when_generation_restarts() {
        let queue = Arc::new(MessageQueue::new(16));
        let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = processed.clone();
        let queue_for_processor = queue.clone();
        queue.set_processor(Arc::new(move |msg: QueuedMessage| {
            let log = log.clone();
            let queue = queue_for_processor.clone();
            Box::pin(async move {
                log.lock().unwrap().push(msg.content.clone());
                // Delivering the first message kicks off a new turn.
                if msg.content == "first" {
                    queue.on_generation_start();
                }
                Ok(())
            })
        }));

        queue.on_generation_start();
        queue.enqueue(message(QueuedKind::System, "first")).await;
        queue.enqueue(message(QueuedKind::System, "second")).await;

        queue.on_generation_complete().await;
        assert_eq!(*processed.lock().unwrap(), vec!["first"]);
        assert_eq!(queue.len(), 1);

        // Draining resumes once the restarted generation finishes.
        queue.on_generation_complete().await;
        assert_eq!(*processed.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_queue_notifications() {
        let (queue, _processed) = recording_queue();
        let mut events = queue.subscribe();

        queue.on_generation_start();
        queue.enqueue(message(QueuedKind::User, "U1")).await;
        queue.on_generation_complete().await;

        assert!(matches!(
            events.try_recv().unwrap(),
            QueueEvent::Queued { len: 1 }
        ));
        assert!(matches!(events.try_recv().unwrap(), QueueEvent::Processing { .. }));
        assert!(matches!(events.try_recv().unwrap(), QueueEvent::Empty));
    }
}
