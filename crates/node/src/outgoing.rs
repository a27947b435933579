//! Outbound message queue.
//!
//! Decouples the pacemaker's single-threaded state machine from network I/O.
//! Parcels carry a TTL; the queue head-drops on overflow and a fixed pool of
//! workers posts each parcel to its destination's pacemaker endpoint. There
//! are no transport retries: redundant delivery is the committee's job.

use crate::metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Parcels older than this are dropped without a send attempt.
pub const OUT_QUEUE_TTL: Duration = Duration::from_secs(5);
/// Per-request HTTP timeout.
pub const REQ_TIMEOUT: Duration = Duration::from_secs(4);
/// Fixed worker pool size.
pub const WORKER_CONCURRENCY: usize = 8;
/// Bounded queue capacity.
pub const OUT_QUEUE_CAPACITY: usize = 2048;
/// Peer pacemaker endpoint port.
pub const PACEMAKER_PORT: u16 = 8670;

/// One outbound message addressed to a peer.
#[derive(Clone, Debug)]
pub struct OutgoingParcel {
    /// Destination peer IP.
    pub to: String,
    pub msg_type: &'static str,
    pub body: Vec<u8>,
    pub relay: bool,
    pub enqueued_at: Instant,
    pub expire_at: Instant,
}

impl OutgoingParcel {
    pub fn new(to: String, msg_type: &'static str, body: Vec<u8>, relay: bool) -> Self {
        let now = Instant::now();
        Self {
            to,
            msg_type,
            body,
            relay,
            enqueued_at: now,
            expire_at: now + OUT_QUEUE_TTL,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.expire_at
    }
}

struct QueueInner {
    queue: Mutex<VecDeque<OutgoingParcel>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    port: u16,
}

/// Bounded, TTL-policed outbound queue with a fixed worker pool.
pub struct OutgoingQueue {
    inner: Arc<QueueInner>,
    workers: Vec<JoinHandle<()>>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::with_capacity(OUT_QUEUE_CAPACITY, PACEMAKER_PORT)
    }

    pub fn with_capacity(capacity: usize, port: u16) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                capacity,
                port,
            }),
            workers: Vec::new(),
        }
    }

    /// Spawn the worker pool. Must run inside a tokio runtime.
    pub fn start(&mut self) {
        info!(workers = WORKER_CONCURRENCY, "outgoing queue started");
        for id in 1..=WORKER_CONCURRENCY {
            let inner = self.inner.clone();
            self.workers.push(tokio::spawn(worker_run(id, inner)));
        }
    }

    /// Enqueue a parcel. When the queue is full the oldest parcel is dropped
    /// to make room.
    pub fn add(&self, parcel: OutgoingParcel) {
        let depth = {
            let mut queue = self.inner.queue.lock().expect("queue lock");
            while queue.len() >= self.inner.capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        msg_type = dropped.msg_type,
                        to = %dropped.to,
                        "outgoing msg dropped due to cap"
                    );
                }
            }
            debug!(msg_type = parcel.msg_type, to = %parcel.to, "add msg to out queue");
            queue.push_back(parcel);
            queue.len()
        };
        metrics::metrics().out_queue_depth.set(depth as f64);
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and wait for the workers to drain what remains.
    pub async fn shutdown(self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("outgoing queue drained and stopped");
    }
}

impl Default for OutgoingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop the next parcel, waiting for work. Returns `None` once the queue is
/// closed and empty.
async fn next_parcel(inner: &QueueInner) -> Option<OutgoingParcel> {
    loop {
        if let Some(parcel) = inner.queue.lock().expect("queue lock").pop_front() {
            return Some(parcel);
        }
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let notified = inner.notify.notified();
        // Re-check after registering interest so a concurrent add is not
        // missed.
        if let Some(parcel) = inner.queue.lock().expect("queue lock").pop_front() {
            return Some(parcel);
        }
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }
        notified.await;
    }
}

fn make_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQ_TIMEOUT)
        .build()
        .expect("reqwest client")
}

async fn worker_run(id: usize, inner: Arc<QueueInner>) {
    // One HTTP client per destination IP; rebuilt cheaply on transport error.
    let mut clients: HashMap<String, reqwest::Client> = HashMap::new();

    while let Some(parcel) = next_parcel(&inner).await {
        metrics::metrics()
            .out_queue_depth
            .set(inner.queue.lock().expect("queue lock").len() as f64);

        if parcel.expired() {
            info!(
                worker = id,
                msg_type = parcel.msg_type,
                "outgoing msg expired, dropped"
            );
            metrics::metrics()
                .msgs_dropped
                .with_label_values(&["expired"])
                .inc();
            continue;
        }

        let client = clients
            .entry(parcel.to.clone())
            .or_insert_with(make_client)
            .clone();
        let url = format!("http://{}:{}/pacemaker", parcel.to, inner.port);

        if parcel.relay {
            debug!(worker = id, msg_type = parcel.msg_type, to = %parcel.to, "relay msg");
        } else {
            info!(worker = id, msg_type = parcel.msg_type, to = %parcel.to, "send msg");
        }

        match client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(parcel.body)
            .send()
            .await
        {
            Ok(response) => {
                // Drain the body so the connection can be reused.
                let _ = response.bytes().await;
                metrics::metrics().msgs_sent.inc();
            }
            Err(err) => {
                error!(worker = id, %err, msg_type = parcel.msg_type, to = %parcel.to, "send msg failed");
                // Rebuild the per-IP client and move on; the parcel is not
                // retried.
                clients.insert(parcel.to.clone(), make_client());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parcel(tag: &'static str) -> OutgoingParcel {
        OutgoingParcel::new("192.0.2.1".to_string(), tag, vec![1, 2, 3], false)
    }

    #[tokio::test]
    async fn overflow_drops_exactly_the_oldest() {
        let queue = OutgoingQueue::with_capacity(3, PACEMAKER_PORT);
        queue.add(parcel("a"));
        queue.add(parcel("b"));
        queue.add(parcel("c"));
        assert_eq!(queue.len(), 3);

        // One more enqueue drops exactly one parcel, the head.
        queue.add(parcel("d"));
        assert_eq!(queue.len(), 3);
        let head = queue
            .inner
            .queue
            .lock()
            .unwrap()
            .front()
            .map(|p| p.msg_type)
            .unwrap();
        assert_eq!(head, "b");
    }

    #[test]
    fn parcel_expiry_is_ttl_based() {
        let mut p = parcel("x");
        assert!(!p.expired());
        p.expire_at = Instant::now() - Duration::from_millis(1);
        assert!(p.expired());
    }

    #[tokio::test]
    async fn shutdown_waits_for_workers() {
        let mut queue = OutgoingQueue::with_capacity(8, PACEMAKER_PORT);
        queue.start();
        // No parcels in flight; workers should exit promptly on close.
        tokio::time::timeout(Duration::from_secs(2), queue.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
