//! Delivery of updates and notices to attached clients.
//!
//! Push transports (websocket, event stream) register a bounded channel and
//! get every update and notice as it happens. Pull transports read updates
//! straight from the cache; notices for them are parked in a per-client
//! queue until their next poll.
//!
//! A push transport that misses an update is held back from region updates
//! until the next fullscreen image reaches it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sharing::ClientId;
use crate::transport::wire::Notice;
use crate::update_cache::{Update, UpdateCache};

/// Upper bound on notices parked for one pull client.
const MAX_QUEUED_NOTICES: usize = 1024;

pub type TransportId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushKind {
    WebSocket,
    EventStream,
}

#[derive(Clone, Debug)]
pub enum Outbound {
    Update(Arc<Update>),
    Notice(Notice),
}

impl Outbound {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Outbound::Notice(Notice::Disconnected { .. }))
    }
}

/// A registered push transport's receiving end.
pub struct PushSubscription {
    pub id: TransportId,
    pub receiver: mpsc::Receiver<Outbound>,
}

struct PushEntry {
    client: ClientId,
    kind: PushKind,
    tx: mpsc::Sender<Outbound>,
    /// Missed an update; waiting for a fullscreen image.
    resync: bool,
}

/// Result of handing an item to every push transport.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Transports too far behind to take the item.
    pub dropped: usize,
    /// Region updates withheld from transports waiting to resync.
    pub held: usize,
}

#[derive(Default)]
pub struct FanOut {
    push: HashMap<TransportId, PushEntry>,
    queues: HashMap<ClientId, NoticeQueue>,
    next_id: TransportId,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a push transport. The client's pull queue, if any, is
    /// dropped: notices go to the socket from now on.
    pub fn register_push(
        &mut self,
        client: ClientId,
        kind: PushKind,
        capacity: usize,
    ) -> PushSubscription {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        self.queues.remove(&client);
        debug!(transport = id, client = %client, ?kind, "push transport registered");
        self.push.insert(
            id,
            PushEntry {
                client,
                kind,
                tx,
                resync: false,
            },
        );
        PushSubscription { id, receiver }
    }

    pub fn deregister(&mut self, id: TransportId) -> bool {
        self.push.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn push_count(&self) -> usize {
        self.push.len()
    }

    /// Start parking notices for a pull client.
    pub fn enable_queue(&mut self, client: &ClientId) {
        self.queues.entry(client.clone()).or_default();
    }

    pub fn publish_update(&mut self, update: Arc<Update>) -> Delivery {
        let region = update.is_region();
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();
        for (id, entry) in self.push.iter_mut() {
            if entry.resync && region {
                delivery.held += 1;
                continue;
            }
            match entry.tx.try_send(Outbound::Update(update.clone())) {
                Ok(()) => {
                    delivery.delivered += 1;
                    if update.fullscreen {
                        entry.resync = false;
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(transport = id, client = %entry.client, kind = ?entry.kind, idx = update.idx, "push transport lagging, holding until fullscreen");
                    entry.resync = true;
                    delivery.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        self.prune(closed);
        delivery
    }

    /// Send a notice to every push transport and park it for pull clients.
    pub fn publish_notice(&mut self, notice: Notice) -> Delivery {
        for queue in self.queues.values_mut() {
            queue.push(notice.clone());
        }
        self.broadcast(|| Outbound::Notice(notice.clone()))
    }

    /// Notice for a single client, wherever it is attached.
    pub fn notify_client(&mut self, client: &ClientId, notice: Notice) {
        if let Some(queue) = self.queues.get_mut(client) {
            queue.push(notice.clone());
        }
        let mut closed = Vec::new();
        for (id, entry) in self.push.iter().filter(|(_, e)| &e.client == client) {
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                entry.tx.try_send(Outbound::Notice(notice.clone()))
            {
                closed.push(*id);
            }
        }
        for id in closed {
            self.push.remove(&id);
        }
    }

    /// Tell one transport the session is already over.
    pub fn notify_transport(&mut self, id: TransportId, notice: Notice) {
        if let Some(entry) = self.push.get(&id) {
            let _ = entry.tx.try_send(Outbound::Notice(notice));
        }
    }

    /// Drop every transport a client has open.
    pub fn detach_client(&mut self, client: &ClientId) {
        self.push.retain(|_, entry| &entry.client != client);
        self.queues.remove(client);
    }

    pub fn next_notice(&mut self, client: &ClientId) -> Option<Notice> {
        self.queues.get_mut(client)?.pop()
    }

    /// Send the final notice to every push transport and forget them.
    pub fn disconnect_all(&mut self, exit_code: Option<i32>) {
        let notice = Notice::Disconnected { exit_code };
        for queue in self.queues.values_mut() {
            queue.push(notice.clone());
        }
        for (id, entry) in self.push.drain() {
            // A full channel still gets the notice once the client catches up.
            let tx = entry.tx;
            let notice = Outbound::Notice(notice.clone());
            tokio::spawn(async move {
                if tx.send(notice).await.is_err() {
                    debug!(transport = id, "transport gone before disconnect notice");
                }
            });
        }
    }

    fn broadcast(&mut self, item: impl Fn() -> Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();
        for (id, entry) in &self.push {
            match entry.tx.try_send(item()) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(transport = id, client = %entry.client, kind = ?entry.kind, "push transport lagging, item dropped");
                    delivery.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        self.prune(closed);
        delivery
    }

    fn prune(&mut self, closed: Vec<TransportId>) {
        for id in closed {
            debug!(transport = id, "pruning closed push transport");
            self.push.remove(&id);
        }
    }
}

/// FIFO of notices for one pull client.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    items: VecDeque<Notice>,
}

impl NoticeQueue {
    pub fn push(&mut self, notice: Notice) {
        if self.items.len() >= MAX_QUEUED_NOTICES {
            self.items.pop_front();
        }
        self.items.push_back(notice);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Next notice. Consecutive terminal chunks come out as one.
    pub fn pop(&mut self) -> Option<Notice> {
        match self.items.pop_front()? {
            Notice::Terminal(mut text) => {
                while let Some(Notice::Terminal(_)) = self.items.front() {
                    if let Some(Notice::Terminal(more)) = self.items.pop_front() {
                        text.push_str(&more);
                    }
                }
                Some(Notice::Terminal(text))
            }
            other => Some(other),
        }
    }
}

/// Coalesces items arriving on a push channel into small batches.
///
/// A batch closes when it holds `max_items`, when `max_delay` has passed
/// since its first item, or right after a disconnect notice. Updates that
/// expired from the cache while waiting are left out.
pub struct PushBatcher {
    max_items: usize,
    max_delay: Duration,
    cache: Arc<UpdateCache>,
    skipped: u64,
}

impl PushBatcher {
    pub fn new(max_items: usize, max_delay: Duration, cache: Arc<UpdateCache>) -> Self {
        Self {
            max_items: max_items.max(1),
            max_delay,
            cache,
            skipped: 0,
        }
    }

    /// Updates left out so far because they expired before sending.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next batch, or `None` once the channel is closed and drained.
    pub async fn next_batch(&mut self, rx: &mut mpsc::Receiver<Outbound>) -> Option<Vec<Outbound>> {
        loop {
            let first = rx.recv().await?;
            let mut batch = vec![first];

            if !self.max_delay.is_zero() && !batch[0].is_disconnect() {
                let deadline = Instant::now() + self.max_delay;
                while batch.len() < self.max_items {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(item)) => {
                            let last = item.is_disconnect();
                            batch.push(item);
                            if last {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }

                let mut fresh = Vec::with_capacity(batch.len());
                for item in batch {
                    if let Outbound::Update(update) = &item {
                        if !self.cache.contains(update.idx).await {
                            self.skipped += 1;
                            continue;
                        }
                    }
                    fresh.push(item);
                }
                batch = fresh;
            }

            if !batch.is_empty() {
                return Some(batch);
            }
        }
    }
}
