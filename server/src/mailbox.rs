//! Per-device request queues and the request/response correlation table.
//!
//! Every outstanding request has exactly one entry in the correlation table,
//! keyed by `request_id`, from enqueue until it is claimed by a waiter, expires,
//! or is drained. Queued envelopes additionally sit in their device's
//! [`DeviceQueue`] until a poll takes them.
//!
//! Lock order is always `table` → `queues` → `DeviceQueue::pending`. Dequeue
//! plus the "dispatched" transition, resolve, and TTL expiry all happen under
//! the table lock, so a request can never be handed to two polls and a resolve
//! can never race its own expiry.
//!
//! Long-polls wait on the queue's [`Notify`] with the waiter enabled *before*
//! the queue is inspected, so an enqueue landing between the check and the
//! wait is never missed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::RelayError;

/// Pending requests for one device plus the wakeup for its long-polls.
struct DeviceQueue {
    pending: Mutex<VecDeque<RequestEnvelope>>,
    notify: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Dispatched,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
        }
    }
}

/// Where the response goes once it arrives.
enum Slot {
    /// Nobody is waiting yet.
    Empty,
    /// A caller is blocked in [`Mailbox::wait`].
    Waiting(oneshot::Sender<ResponseEnvelope>),
    /// Resolved before anyone waited; parked until claimed or expired.
    Delivered(ResponseEnvelope),
}

struct Outstanding {
    device_id: String,
    phase: Phase,
    slot: Slot,
    /// Time of the last transition (enqueue, dispatch, delivery).
    since: Instant,
}

/// Outcome of [`Mailbox::resolve`]. None of these are errors for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to a blocked waiter.
    Delivered,
    /// Stored until a waiter claims it.
    Parked,
    /// Already resolved, a repeat is ignored.
    Duplicate,
    /// Not dispatched yet, so the response can't be genuine. Ignored.
    NotDispatched,
    /// Never enqueued, already claimed, timed out or expired. Dropped.
    Unknown,
}

impl Resolution {
    pub fn delivered(self) -> bool {
        matches!(self, Self::Delivered | Self::Parked)
    }
}

/// What [`Mailbox::wait_with`] does with the entry when its wait runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTimeout {
    /// Forget the request; a late response is dropped.
    Discard,
    /// Leave the request outstanding so the caller can wait again.
    Keep,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
    dropped_responses: AtomicU64,
}

/// Point-in-time mailbox counters, reported by `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MailboxStats {
    pub queued: usize,
    pub dispatched: usize,
    pub awaiting_pickup: usize,
    pub outstanding: usize,
    pub enqueued_total: u64,
    pub dispatched_total: u64,
    pub resolved_total: u64,
    pub expired_total: u64,
    pub dropped_responses_total: u64,
    /// Per-device queues currently allocated.
    pub device_queues: usize,
}

/// Shared, cloneable handle to all device queues and the correlation table.
#[derive(Clone)]
pub struct Mailbox {
    table: Arc<Mutex<HashMap<String, Outstanding>>>,
    queues: Arc<RwLock<HashMap<String, Arc<DeviceQueue>>>>,
    max_queued_per_device: usize,
    counters: Arc<Counters>,
}

impl Mailbox {
    pub fn new(max_queued_per_device: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            max_queued_per_device,
            counters: Arc::new(Counters::default()),
        }
    }

    async fn queue(&self, device_id: &str) -> Arc<DeviceQueue> {
        if let Some(q) = self.queues.read().await.get(device_id) {
            return q.clone();
        }
        self.queues
            .write()
            .await
            .entry(device_id.to_string())
            .or_insert_with(|| {
                Arc::new(DeviceQueue {
                    pending: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Append a request to its device's queue and wake any long-polls.
    pub async fn enqueue(&self, envelope: RequestEnvelope) -> Result<String, RelayError> {
        let queue = self.queue(&envelope.device_id).await;
        let request_id = envelope.request_id.clone();
        {
            let mut table = self.table.lock().await;
            if table.contains_key(&request_id) {
                return Err(RelayError::MalformedEnvelope(format!(
                    "duplicate request_id '{request_id}'"
                )));
            }
            let mut pending = queue.pending.lock().await;
            if pending.len() >= self.max_queued_per_device {
                warn!(device_id = %envelope.device_id, "Queue full, rejecting request");
                return Err(RelayError::QueueFull(envelope.device_id.clone()));
            }
            table.insert(
                request_id.clone(),
                Outstanding {
                    device_id: envelope.device_id.clone(),
                    phase: Phase::Queued,
                    slot: Slot::Empty,
                    since: Instant::now(),
                },
            );
            debug!(
                device_id = %envelope.device_id,
                request_id = %request_id,
                method = %envelope.method,
                path = %envelope.path,
                "Request queued"
            );
            pending.push_back(envelope);
        }
        queue.notify.notify_waiters();
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(request_id)
    }

    /// Long-poll: return every queued request for the device, waiting up to
    /// `max_wait` for one to show up. Returned requests become "dispatched".
    pub async fn poll(&self, device_id: &str, max_wait: Duration) -> Vec<RequestEnvelope> {
        let queue = self.queue(device_id).await;
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(&queue).await;
            if !batch.is_empty() {
                debug!(device_id, count = batch.len(), "Dispatched requests");
                return batch;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    async fn take_batch(&self, queue: &DeviceQueue) -> Vec<RequestEnvelope> {
        let mut table = self.table.lock().await;
        let mut pending = queue.pending.lock().await;
        if pending.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut batch = Vec::with_capacity(pending.len());
        for envelope in pending.drain(..) {
            // Entries missing from the table were abandoned or expired.
            if let Some(entry) = table.get_mut(&envelope.request_id) {
                entry.phase = Phase::Dispatched;
                entry.since = now;
                batch.push(envelope);
            }
        }
        self.counters
            .dispatched
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Route a device's response to whoever is waiting for it.
    ///
    /// Unknown, late, duplicate and premature responses are dropped and
    /// reported through [`Resolution`]; only a responder naming a different
    /// device than the request's target is an error.
    pub async fn resolve(&self, response: ResponseEnvelope) -> Result<Resolution, RelayError> {
        let mut table = self.table.lock().await;
        let request_id = response.request_id.clone();
        let Some(entry) = table.get_mut(&request_id) else {
            self.counters.dropped_responses.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %request_id,
                "Response arrived for timed-out or unknown request (dropped)"
            );
            return Ok(Resolution::Unknown);
        };

        if let Some(responder) = response.device_id.as_deref() {
            if responder != entry.device_id {
                warn!(
                    request_id = %request_id,
                    responder,
                    target = %entry.device_id,
                    "Rejected response from a device the request was not sent to"
                );
                return Err(RelayError::DeviceMismatch {
                    request_id,
                    responder: responder.to_string(),
                });
            }
        }

        if entry.phase == Phase::Queued {
            warn!(request_id = %request_id, "Response for a request that was never dispatched (ignored)");
            return Ok(Resolution::NotDispatched);
        }

        match std::mem::replace(&mut entry.slot, Slot::Empty) {
            Slot::Waiting(tx) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                match tx.send(response) {
                    Ok(()) => {
                        table.remove(&request_id);
                        Ok(Resolution::Delivered)
                    }
                    Err(response) => {
                        // The waiter went away; park it for the next one.
                        debug!(request_id = %request_id, "Waiter went away, parking response");
                        entry.slot = Slot::Delivered(response);
                        entry.since = Instant::now();
                        Ok(Resolution::Parked)
                    }
                }
            }
            Slot::Empty => {
                entry.slot = Slot::Delivered(response);
                entry.since = Instant::now();
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(Resolution::Parked)
            }
            Slot::Delivered(first) => {
                entry.slot = Slot::Delivered(first);
                debug!(request_id = %request_id, "Duplicate response ignored");
                Ok(Resolution::Duplicate)
            }
        }
    }

    /// Block until the response for `request_id` arrives or `timeout` elapses.
    ///
    /// On timeout the entry is discarded, so a late response is dropped rather
    /// than delivered to a stale waiter. Timing out does not stop the device
    /// from executing the request.
    pub async fn wait(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RelayError> {
        self.wait_with(request_id, timeout, OnTimeout::Discard).await
    }

    /// [`Mailbox::wait`] with a choice of what a timeout does to the entry.
    pub async fn wait_with(
        &self,
        request_id: &str,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<ResponseEnvelope, RelayError> {
        let mut rx = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(request_id) else {
                return Err(RelayError::UnknownRequest(request_id.to_string()));
            };
            match std::mem::replace(&mut entry.slot, Slot::Empty) {
                Slot::Delivered(response) => {
                    table.remove(request_id);
                    return Ok(response);
                }
                Slot::Waiting(tx) if !tx.is_closed() => {
                    entry.slot = Slot::Waiting(tx);
                    return Err(RelayError::AlreadyAwaited(request_id.to_string()));
                }
                Slot::Waiting(_) | Slot::Empty => {
                    let (tx, rx) = oneshot::channel();
                    entry.slot = Slot::Waiting(tx);
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the entry expired underneath us.
            Ok(Err(_)) => Err(RelayError::DispatchTimeout(request_id.to_string())),
            Err(_) => {
                let mut table = self.table.lock().await;
                // A resolve may have landed between the timer and the lock.
                if let Ok(response) = rx.try_recv() {
                    return Ok(response);
                }
                match on_timeout {
                    OnTimeout::Discard => {
                        if let Some(entry) = table.remove(request_id) {
                            if entry.phase == Phase::Queued {
                                self.unqueue(&entry.device_id, request_id).await;
                            }
                        }
                    }
                    OnTimeout::Keep => {
                        if let Some(entry) = table.get_mut(request_id) {
                            entry.slot = Slot::Empty;
                            entry.since = Instant::now();
                        }
                    }
                }
                debug!(request_id, ?on_timeout, "Wait timed out");
                Err(RelayError::DispatchTimeout(request_id.to_string()))
            }
        }
    }

    /// Enqueue and wait in one step.
    pub async fn send_and_wait(
        &self,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RelayError> {
        let request_id = self.enqueue(envelope).await?;
        self.wait(&request_id, timeout).await
    }

    /// Forget a request. A still-queued request is pulled from its queue; a
    /// dispatched one may still run on the device but its answer is dropped.
    pub async fn abandon(&self, request_id: &str) -> bool {
        let mut table = self.table.lock().await;
        let Some(entry) = table.remove(request_id) else {
            return false;
        };
        if entry.phase == Phase::Queued {
            self.unqueue(&entry.device_id, request_id).await;
        }
        true
    }

    async fn unqueue(&self, device_id: &str, request_id: &str) {
        let queue = self.queues.read().await.get(device_id).cloned();
        if let Some(queue) = queue {
            queue
                .pending
                .lock()
                .await
                .retain(|e| e.request_id != request_id);
        }
    }

    /// Drop entries idle for longer than `ttl`. Entries with a live waiter are
    /// left to that waiter's own timeout. Returns the number removed.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.since) >= ttl)
            .filter(|(_, o)| !matches!(&o.slot, Slot::Waiting(tx) if !tx.is_closed()))
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in &expired {
            if let Some(entry) = table.remove(request_id) {
                if entry.phase == Phase::Queued {
                    self.unqueue(&entry.device_id, request_id).await;
                }
                warn!(
                    request_id = %request_id,
                    device_id = %entry.device_id,
                    phase = entry.phase.as_str(),
                    "Request expired"
                );
            }
        }
        self.counters
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.prune_queues(&table).await;
        expired.len()
    }

    /// Free queues no request references and no poll is holding. Every other
    /// lock on `pending` is taken under the table lock, so `try_lock` only
    /// fails for a queue that is in use.
    async fn prune_queues(&self, table: &HashMap<String, Outstanding>) {
        let referenced: HashSet<&str> = table.values().map(|o| o.device_id.as_str()).collect();
        let mut queues = self.queues.write().await;
        let before = queues.len();
        queues.retain(|device_id, queue| {
            referenced.contains(device_id.as_str())
                || Arc::strong_count(queue) > 1
                || queue.pending.try_lock().map_or(true, |p| !p.is_empty())
        });
        let freed = before - queues.len();
        if freed > 0 {
            debug!(freed, "Released idle device queues");
        }
    }

    /// Fail every outstanding request for a device with a synthetic 502, so
    /// waiters get a definite answer instead of a timeout.
    pub async fn drain_device(&self, device_id: &str, reason: &str) -> usize {
        let count = self.drain_where(|d| d == device_id, reason).await;
        if count > 0 {
            info!(device_id, count, "Drained {count} pending requests: {reason}");
        }
        count
    }

    /// Drain every device (relay shutdown).
    pub async fn drain_all(&self, reason: &str) -> usize {
        let count = self.drain_where(|_| true, reason).await;
        if count > 0 {
            info!(count, "Drained {count} pending requests: {reason}");
        }
        count
    }

    async fn drain_where(&self, pred: impl Fn(&str) -> bool, reason: &str) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let ids: Vec<String> = table
            .iter()
            .filter(|(_, o)| pred(&o.device_id) && !matches!(o.slot, Slot::Delivered(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let mut touched_devices = Vec::new();
        for request_id in &ids {
            let failure = ResponseEnvelope::error(request_id.as_str(), 502, "DEVICE_DISCONNECTED", reason);
            let waiting = matches!(table.get(request_id).map(|o| &o.slot), Some(Slot::Waiting(_)));
            if waiting {
                if let Some(entry) = table.remove(request_id) {
                    if let Slot::Waiting(tx) = entry.slot {
                        let _ = tx.send(failure);
                    }
                    touched_devices.push(entry.device_id);
                }
            } else if let Some(entry) = table.get_mut(request_id) {
                // Park the failure for a caller that has not started waiting yet.
                entry.phase = Phase::Dispatched;
                entry.slot = Slot::Delivered(failure);
                entry.since = now;
                touched_devices.push(entry.device_id.clone());
            }
        }

        touched_devices.sort();
        touched_devices.dedup();
        let queues = self.queues.read().await;
        for device_id in &touched_devices {
            if let Some(queue) = queues.get(device_id) {
                queue.pending.lock().await.clear();
            }
        }
        ids.len()
    }

    /// Outstanding entries (queued, dispatched or awaiting pickup) for a device.
    pub async fn pending_count(&self, device_id: &str) -> usize {
        self.table
            .lock()
            .await
            .values()
            .filter(|o| o.device_id == device_id)
            .count()
    }

    pub async fn stats(&self) -> MailboxStats {
        let table = self.table.lock().await;
        let mut stats = MailboxStats {
            outstanding: table.len(),
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            dispatched_total: self.counters.dispatched.load(Ordering::Relaxed),
            resolved_total: self.counters.resolved.load(Ordering::Relaxed),
            expired_total: self.counters.expired.load(Ordering::Relaxed),
            dropped_responses_total: self.counters.dropped_responses.load(Ordering::Relaxed),
            device_queues: self.queues.read().await.len(),
            ..MailboxStats::default()
        };
        for entry in table.values() {
            match (&entry.slot, entry.phase) {
                (Slot::Delivered(_), _) => stats.awaiting_pickup += 1,
                (_, Phase::Queued) => stats.queued += 1,
                (_, Phase::Dispatched) => stats.dispatched += 1,
            }
        }
        stats
    }
}
