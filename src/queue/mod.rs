use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    cache::MessageCache,
    common::{
        errors::QueueError,
        types::{ChannelId, MessageId},
    },
    configs::QueueConfig,
    rest::{MessageApi, OutgoingMessage, ServerMessage},
};

/// Tracks the pending-action count across all three kind-queues and emits
/// one warning per threshold crossing: the first at `start`, doubling after
/// each, re-armed once the backlog drops back under half of `start`.
pub(crate) struct Backlog {
    start: usize,
    count: AtomicUsize,
    next_warning: AtomicUsize,
}

impl Backlog {
    fn new(start: usize) -> Self {
        let start = start.max(1);
        Self {
            start,
            count: AtomicUsize::new(0),
            next_warning: AtomicUsize::new(start),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let next = self.next_warning.load(Ordering::SeqCst);
        if count >= next
            && self
                .next_warning
                .compare_exchange(next, next * 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!("action queue is backed up, currently at {} actions", count);
        }
    }

    fn decrement(&self) {
        let count = self.count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if count * 2 < self.start {
            self.next_warning.store(self.start, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    fn armed(&self) -> usize {
        self.next_warning.load(Ordering::SeqCst)
    }
}

struct PendingSend {
    channel: ChannelId,
    nonce: u64,
    done: oneshot::Sender<Result<Arc<ServerMessage>, QueueError>>,
}

struct PendingEdit {
    channel: ChannelId,
    message: MessageId,
    content: String,
    done: oneshot::Sender<Result<(), QueueError>>,
}

struct PendingDelete {
    channel: ChannelId,
    message: MessageId,
    done: oneshot::Sender<Result<(), QueueError>>,
}

/// Completion handle for a queued send. Resolves exactly once with the
/// server-confirmed entity or the failure; never hangs past queue shutdown.
pub struct SendHandle {
    nonce: u64,
    rx: oneshot::Receiver<Result<Arc<ServerMessage>, QueueError>>,
}

impl SendHandle {
    /// Nonce identifying this send while it is still queued; usable with
    /// [`ActionQueue::rewrite_queued`] and [`ActionQueue::abort_queued`].
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub async fn resolve(self) -> Result<Arc<ServerMessage>, QueueError> {
        self.rx.await.unwrap_or(Err(QueueError::Stopped))
    }
}

/// Completion handle for a queued edit or delete.
pub struct ActionHandle {
    rx: oneshot::Receiver<Result<(), QueueError>>,
}

impl ActionHandle {
    pub async fn resolve(self) -> Result<(), QueueError> {
        self.rx.await.unwrap_or(Err(QueueError::Stopped))
    }
}

/// The outgoing action queue: three independent FIFOs (send, edit, delete),
/// each drained by its own loop at a fixed interval with one network call
/// per dequeued item, so a slow item never blocks actions of another kind.
/// Producers enqueue from any task; each FIFO has a single consumer.
pub struct ActionQueue {
    rest: Arc<dyn MessageApi>,
    cache: Arc<MessageCache>,
    sends: (flume::Sender<PendingSend>, flume::Receiver<PendingSend>),
    edits: (flume::Sender<PendingEdit>, flume::Receiver<PendingEdit>),
    deletes: (flume::Sender<PendingDelete>, flume::Receiver<PendingDelete>),
    /// nonce -> latest content for sends that have not reached the wire yet.
    pending_sends: DashMap<u64, String>,
    backlog: Backlog,
    drain_interval: Duration,
    /// Guards enqueue against the stop-drain: producers hold the read side
    /// while pushing, `halt` drains under the write side.
    running: RwLock<bool>,
}

impl ActionQueue {
    pub fn new(rest: Arc<dyn MessageApi>, cache: Arc<MessageCache>, config: &QueueConfig) -> Self {
        Self {
            rest,
            cache,
            sends: flume::unbounded(),
            edits: flume::unbounded(),
            deletes: flume::unbounded(),
            pending_sends: DashMap::new(),
            backlog: Backlog::new(config.warning_start),
            drain_interval: Duration::from_millis(config.drain_interval_ms.max(1)),
            running: RwLock::new(false),
        }
    }

    /// Current number of pending actions across all three queues.
    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register_nonce(&self, content: String) -> u64 {
        loop {
            let nonce = rand::thread_rng().gen_range(1..u64::MAX);
            if !self.pending_sends.contains_key(&nonce) {
                self.pending_sends.insert(nonce, content);
                return nonce;
            }
        }
    }

    pub fn enqueue_send(&self, channel: ChannelId, content: impl Into<String>) -> SendHandle {
        let (done, rx) = oneshot::channel();
        let nonce = self.register_nonce(content.into());
        let handle = SendHandle { nonce, rx };

        let running = self.running.read();
        if !*running {
            self.pending_sends.remove(&nonce);
            let _ = done.send(Err(QueueError::Stopped));
            return handle;
        }
        self.backlog.increment();
        let _ = self.sends.0.send(PendingSend {
            channel,
            nonce,
            done,
        });
        handle
    }

    pub fn enqueue_edit(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: impl Into<String>,
    ) -> ActionHandle {
        let (done, rx) = oneshot::channel();
        let handle = ActionHandle { rx };

        let running = self.running.read();
        if !*running {
            let _ = done.send(Err(QueueError::Stopped));
            return handle;
        }
        self.backlog.increment();
        let _ = self.edits.0.send(PendingEdit {
            channel,
            message,
            content: content.into(),
            done,
        });
        handle
    }

    pub fn enqueue_delete(&self, channel: ChannelId, message: MessageId) -> ActionHandle {
        let (done, rx) = oneshot::channel();
        let handle = ActionHandle { rx };

        let running = self.running.read();
        if !*running {
            let _ = done.send(Err(QueueError::Stopped));
            return handle;
        }
        self.backlog.increment();
        let _ = self.deletes.0.send(PendingDelete {
            channel,
            message,
            done,
        });
        handle
    }

    /// Rewrites the payload of a send that has not reached the wire yet,
    /// sparing a separate edit round trip. Returns false once the send left
    /// the queue.
    pub fn rewrite_queued(&self, nonce: u64, content: impl Into<String>) -> bool {
        match self.pending_sends.get_mut(&nonce) {
            Some(mut entry) => {
                *entry = content.into();
                true
            }
            None => false,
        }
    }

    /// Aborts a send that has not reached the wire yet; its handle resolves
    /// as aborted when the drain loop reaches it. Returns false once the
    /// send left the queue.
    pub fn abort_queued(&self, nonce: u64) -> bool {
        self.pending_sends.remove(&nonce).is_some()
    }

    /// Drops every queued action, resolving their handles as aborted.
    pub fn clear(&self) {
        self.fail_remaining(&QueueError::Aborted);
    }

    /// Spawns the three drain loops for the life of `cancel`.
    pub(crate) fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        *self.running.write() = true;

        let send_queue = self.clone();
        let send_cancel = cancel.clone();
        let edit_queue = self.clone();
        let edit_cancel = cancel.clone();
        let delete_queue = self.clone();
        let delete_cancel = cancel;

        vec![
            tokio::spawn(async move { send_queue.run_send_queue(send_cancel).await }),
            tokio::spawn(async move { edit_queue.run_edit_queue(edit_cancel).await }),
            tokio::spawn(async move { delete_queue.run_delete_queue(delete_cancel).await }),
        ]
    }

    /// Called by connection cleanup after the drain loops exited: rejects
    /// new producers and resolves everything still queued, so no completion
    /// handle is ever left pending after the queue is stopped.
    pub(crate) fn halt(&self) {
        let mut running = self.running.write();
        *running = false;
        self.fail_remaining(&QueueError::Stopped);
    }

    fn fail_remaining(&self, err: &QueueError) {
        while let Ok(item) = self.sends.1.try_recv() {
            self.pending_sends.remove(&item.nonce);
            self.backlog.decrement();
            let _ = item.done.send(Err(err.clone()));
        }
        while let Ok(item) = self.edits.1.try_recv() {
            self.backlog.decrement();
            let _ = item.done.send(Err(err.clone()));
        }
        while let Ok(item) = self.deletes.1.try_recv() {
            self.backlog.decrement();
            let _ = item.done.send(Err(err.clone()));
        }
    }

    async fn run_send_queue(&self, cancel: CancellationToken) {
        loop {
            while let Ok(item) = self.sends.1.try_recv() {
                self.process_send(item).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
        }
        debug!("send queue drain loop stopped");
    }

    async fn run_edit_queue(&self, cancel: CancellationToken) {
        loop {
            while let Ok(item) = self.edits.1.try_recv() {
                self.process_edit(item).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
        }
        debug!("edit queue drain loop stopped");
    }

    async fn run_delete_queue(&self, cancel: CancellationToken) {
        loop {
            while let Ok(item) = self.deletes.1.try_recv() {
                self.process_delete(item).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
        }
        debug!("delete queue drain loop stopped");
    }

    async fn process_send(&self, item: PendingSend) {
        let PendingSend {
            channel,
            nonce,
            done,
        } = item;
        let outcome = match self.pending_sends.remove(&nonce) {
            // Aborted while queued; never hits the wire.
            None => Err(QueueError::Aborted),
            Some((_, content)) => {
                let body = OutgoingMessage {
                    content,
                    nonce: Some(nonce.to_string()),
                };
                match self.rest.send_message(channel, &body).await {
                    Ok(confirmed) => Ok(self.cache.get_or_add(confirmed)),
                    Err(e) => {
                        error!("failed to send message to {}: {}", channel, e);
                        Err(QueueError::Rest(e))
                    }
                }
            }
        };
        self.backlog.decrement();
        let _ = done.send(outcome);
    }

    async fn process_edit(&self, item: PendingEdit) {
        let outcome = match self
            .rest
            .edit_message(item.channel, item.message, &item.content)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("failed to edit message {}: {}", item.message, e);
                Err(QueueError::Rest(e))
            }
        };
        self.backlog.decrement();
        let _ = item.done.send(outcome);
    }

    async fn process_delete(&self, item: PendingDelete) {
        let outcome = match self.rest.delete_message(item.channel, item.message).await {
            Ok(()) => Ok(()),
            // The target was already gone; deleting it is a successful no-op.
            Err(crate::common::errors::RestError::NotFound) => {
                debug!("message {} already deleted", item.message);
                Ok(())
            }
            Err(e) => {
                error!("failed to delete message {}: {}", item.message, e);
                Err(QueueError::Rest(e))
            }
        };
        self.backlog.decrement();
        let _ = item.done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::common::errors::RestError;

    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        /// Message ids whose edit call sleeps before completing.
        slow_edits: Vec<MessageId>,
        /// Message ids whose delete call reports NotFound.
        missing: Vec<MessageId>,
        fail_sends: bool,
    }

    impl RecordingApi {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                slow_edits: Vec::new(),
                missing: Vec::new(),
                fail_sends: false,
            }
        }

        async fn recorded(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageApi for RecordingApi {
        async fn send_message(
            &self,
            channel: ChannelId,
            message: &OutgoingMessage,
        ) -> Result<ServerMessage, RestError> {
            self.calls
                .lock()
                .await
                .push(format!("send:{}", message.content));
            if self.fail_sends {
                return Err(RestError::Status(500));
            }
            Ok(ServerMessage {
                id: MessageId(message.content.len() as u64 + 1000),
                channel_id: channel,
                content: message.content.clone(),
                author_id: None,
                nonce: message.nonce.clone(),
                timestamp: None,
            })
        }

        async fn edit_message(
            &self,
            _channel: ChannelId,
            message: MessageId,
            _content: &str,
        ) -> Result<(), RestError> {
            if self.slow_edits.contains(&message) {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            self.calls.lock().await.push(format!("edit:{}", message));
            Ok(())
        }

        async fn delete_message(
            &self,
            _channel: ChannelId,
            message: MessageId,
        ) -> Result<(), RestError> {
            self.calls.lock().await.push(format!("delete:{}", message));
            if self.missing.contains(&message) {
                return Err(RestError::NotFound);
            }
            Ok(())
        }
    }

    fn queue_with(api: RecordingApi) -> (Arc<ActionQueue>, Arc<RecordingApi>) {
        let api = Arc::new(api);
        let queue = Arc::new(ActionQueue::new(
            api.clone(),
            Arc::new(MessageCache::new()),
            &QueueConfig {
                enabled: true,
                drain_interval_ms: 10,
                warning_start: 30,
            },
        ));
        (queue, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_drain_in_fifo_order_despite_slow_item() {
        let mut api = RecordingApi::new();
        api.slow_edits.push(MessageId(2));
        let (queue, api) = queue_with(api);

        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());

        let channel = ChannelId(10);
        let first = queue.enqueue_edit(channel, MessageId(1), "a");
        let second = queue.enqueue_edit(channel, MessageId(2), "b");
        let third = queue.enqueue_edit(channel, MessageId(3), "c");

        first.resolve().await.unwrap();
        second.resolve().await.unwrap();
        third.resolve().await.unwrap();

        assert_eq!(api.recorded().await, vec!["edit:1", "edit:2", "edit:3"]);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_resolves_with_confirmed_entity() {
        let (queue, _api) = queue_with(RecordingApi::new());
        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());

        let confirmed = queue
            .enqueue_send(ChannelId(10), "hello")
            .resolve()
            .await
            .unwrap();
        assert_eq!(confirmed.content, "hello");
        assert!(confirmed.nonce.is_some());

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_resolves_that_future_only() {
        let mut api = RecordingApi::new();
        api.fail_sends = true;
        let (queue, api) = queue_with(api);
        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());

        let failed = queue.enqueue_send(ChannelId(10), "boom").resolve().await;
        assert!(matches!(
            failed,
            Err(QueueError::Rest(RestError::Status(500)))
        ));

        // The queue keeps draining after a per-action failure.
        queue
            .enqueue_delete(ChannelId(10), MessageId(5))
            .resolve()
            .await
            .unwrap();
        assert!(api.recorded().await.contains(&"delete:5".to_string()));

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_not_found_resolves_as_success() {
        let mut api = RecordingApi::new();
        api.missing.push(MessageId(42));
        let (queue, _api) = queue_with(api);
        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());

        queue
            .enqueue_delete(ChannelId(10), MessageId(42))
            .resolve()
            .await
            .unwrap();

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_queued_send_never_reaches_the_wire() {
        let (queue, api) = queue_with(RecordingApi::new());

        // Not started yet, so the item cannot be drained out from under us.
        let cancel = CancellationToken::new();
        *queue.running.write() = true;
        let handle = queue.enqueue_send(ChannelId(10), "doomed");
        assert!(queue.abort_queued(handle.nonce()));

        let handles = queue.start(cancel.clone());
        assert!(matches!(handle.resolve().await, Err(QueueError::Aborted)));
        assert!(api.recorded().await.is_empty());

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_queued_send_uses_latest_content() {
        let (queue, api) = queue_with(RecordingApi::new());

        let cancel = CancellationToken::new();
        *queue.running.write() = true;
        let handle = queue.enqueue_send(ChannelId(10), "draft");
        assert!(queue.rewrite_queued(handle.nonce(), "final"));

        let handles = queue.start(cancel.clone());
        let confirmed = handle.resolve().await.unwrap();
        assert_eq!(confirmed.content, "final");
        assert_eq!(api.recorded().await, vec!["send:final"]);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_enqueue_before_start_resolves_stopped() {
        let (queue, _api) = queue_with(RecordingApi::new());
        let result = queue.enqueue_send(ChannelId(1), "x").resolve().await;
        assert!(matches!(result, Err(QueueError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_resolves_everything_still_queued() {
        let (queue, _api) = queue_with(RecordingApi::new());

        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }

        // Producers that raced the shutdown window still get resolved.
        let send = queue.enqueue_send(ChannelId(1), "late");
        let edit = queue.enqueue_edit(ChannelId(1), MessageId(2), "late");
        queue.halt();

        assert!(matches!(send.resolve().await, Err(QueueError::Stopped)));
        assert!(matches!(edit.resolve().await, Err(QueueError::Stopped)));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_backlog_warning_doubles_and_rearms() {
        let backlog = Backlog::new(4);
        assert_eq!(backlog.armed(), 4);

        for _ in 0..4 {
            backlog.increment();
        }
        assert_eq!(backlog.armed(), 8);

        for _ in 0..4 {
            backlog.increment();
        }
        assert_eq!(backlog.armed(), 16);

        // Draining below half the start threshold re-arms the first warning.
        for _ in 0..7 {
            backlog.decrement();
        }
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.armed(), 4);
    }
}
