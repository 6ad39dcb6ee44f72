//! In-memory backend and push transport for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};

use hirewire_client::{
    ChannelFrame, Credentials, NotificationBackend, PushLink, PushTransport, JOIN_EVENT,
};
use hirewire_core::{
    MalformedPayload, NotificationEntry, NotificationId, NotifyConfig, Result, StoreSnapshot,
    TransientError,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> NotifyConfig {
    let mut config = NotifyConfig::default();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config.refresh.interval_secs = 3_600;
    config
}

pub fn payload(id: &str, secs: i64, is_read: bool) -> Value {
    NotificationEntry::new(id, format!("msg {id}"), Utc.timestamp_opt(secs, 0).unwrap())
        .read(is_read)
        .to_payload()
}

pub fn id(s: &str) -> NotificationId {
    NotificationId::new(s)
}

pub fn ids(snapshot: &StoreSnapshot) -> Vec<String> {
    snapshot.entries.iter().map(|e| e.id.to_string()).collect()
}

/// Wait until a snapshot satisfies `pred`
pub async fn wait_for<F>(rx: &mut watch::Receiver<StoreSnapshot>, pred: F) -> StoreSnapshot
where
    F: FnMut(&StoreSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("runtime stopped")
        .clone()
}

// ==================== Gate ====================

/// Holds calls until released, one permit per call
#[derive(Default)]
struct Gate {
    semaphore: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    fn hold(&self) {
        *self.semaphore.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    fn release(&self, n: usize) {
        if let Some(sem) = self.semaphore.lock().unwrap().as_ref() {
            sem.add_permits(n);
        }
    }

    fn open(&self) {
        if let Some(sem) = self.semaphore.lock().unwrap().take() {
            sem.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn pass(&self) {
        let sem = self.semaphore.lock().unwrap().clone();
        if let Some(sem) = sem {
            sem.acquire().await.expect("gate closed").forget();
        }
    }
}

// ==================== Backend ====================

pub struct FakeBackend {
    lists: Mutex<HashMap<String, Vec<Value>>>,
    failing_acks: Mutex<HashSet<String>>,
    acked: Mutex<Vec<NotificationId>>,
    panic_acks: AtomicBool,
    fail_pulls: AtomicUsize,
    pull_gate: Gate,
    ack_gate: Gate,
    pulls: watch::Sender<usize>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::default(),
            failing_acks: Mutex::default(),
            acked: Mutex::default(),
            panic_acks: AtomicBool::new(false),
            fail_pulls: AtomicUsize::new(0),
            pull_gate: Gate::default(),
            ack_gate: Gate::default(),
            pulls: watch::channel(0).0,
        })
    }

    /// Server-side list for a user
    pub fn set_list(&self, user: &str, items: Vec<Value>) {
        self.lists.lock().unwrap().insert(user.to_string(), items);
    }

    pub fn fail_ack(&self, id: &str) {
        self.failing_acks.lock().unwrap().insert(id.to_string());
    }

    /// Make every acknowledgement call panic
    pub fn panic_on_ack(&self) {
        self.panic_acks.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_pulls(&self, n: usize) {
        self.fail_pulls.store(n, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<NotificationId> {
        self.acked.lock().unwrap().clone()
    }

    pub fn hold_pulls(&self) {
        self.pull_gate.hold();
    }

    pub fn release_pulls(&self, n: usize) {
        self.pull_gate.release(n);
    }

    pub fn open_pulls(&self) {
        self.pull_gate.open();
    }

    pub fn hold_acks(&self) {
        self.ack_gate.hold();
    }

    pub fn open_acks(&self) {
        self.ack_gate.open();
    }

    /// Number of pulls started so far
    pub fn pull_count(&self) -> usize {
        *self.pulls.borrow()
    }

    /// Wait until at least `n` pulls have started
    pub async fn wait_pulls(&self, n: usize) {
        let mut rx = self.pulls.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|count| *count >= n))
            .await
            .expect("timed out waiting for pulls")
            .expect("counter dropped");
    }
}

impl NotificationBackend for FakeBackend {
    async fn fetch_all(&self, credentials: &Credentials) -> Result<Vec<Value>> {
        self.pulls.send_modify(|count| *count += 1);
        self.pull_gate.pass().await;

        if self
            .fail_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransientError::Http {
                status: 503,
                message: "unavailable".into(),
            }
            .into());
        }

        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(&credentials.user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn acknowledge(&self, credentials: &Credentials, ids: &[NotificationId]) -> Result<()> {
        self.ack_gate.pass().await;
        if self.panic_acks.load(Ordering::SeqCst) {
            panic!("acknowledge blew up for {} ids", ids.len());
        }

        let failing = self.failing_acks.lock().unwrap();
        if ids.iter().any(|i| failing.contains(i.as_str())) {
            return Err(TransientError::Http {
                status: 500,
                message: "ack failed".into(),
            }
            .into());
        }
        drop(failing);

        let mut lists = self.lists.lock().unwrap();
        if let Some(list) = lists.get_mut(&credentials.user_id) {
            for item in list.iter_mut() {
                if ids.iter().any(|i| item["id"] == json!(i.as_str())) {
                    item["isRead"] = json!(true);
                }
            }
        }
        self.acked.lock().unwrap().extend_from_slice(ids);
        Ok(())
    }
}

// ==================== Transport ====================

type Inbound = std::result::Result<ChannelFrame, String>;

pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<ServerConn>,
    fail_next: AtomicUsize,
    opens: AtomicUsize,
    close_delay_ms: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, MemoryServer) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            accepted,
            fail_next: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            close_delay_ms: AtomicU64::new(0),
        });
        (transport, MemoryServer { accepted: rx })
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Links opened from now on take this long to close
    pub fn slow_close(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl PushTransport for MemoryTransport {
    type Link = MemoryLink;

    async fn open(&self, credentials: &Credentials) -> Result<MemoryLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransientError::Connect("connection refused".into()).into());
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerConn {
            token: credentials.token.clone(),
            to_client,
            from_client,
        });
        Ok(MemoryLink {
            incoming,
            outgoing,
            close_delay: Duration::from_millis(self.close_delay_ms.load(Ordering::SeqCst)),
        })
    }
}

pub struct MemoryLink {
    incoming: mpsc::UnboundedReceiver<Inbound>,
    outgoing: mpsc::UnboundedSender<ChannelFrame>,
    close_delay: Duration,
}

impl PushLink for MemoryLink {
    async fn send(&mut self, frame: &ChannelFrame) -> Result<()> {
        self.outgoing
            .send(frame.clone())
            .map_err(|_| TransientError::Connect("peer gone".into()).into())
    }

    async fn recv(&mut self) -> Option<Result<ChannelFrame>> {
        match self.incoming.recv().await? {
            Ok(frame) => Some(Ok(frame)),
            Err(raw) => Some(Err(MalformedPayload::Frame(raw).into())),
        }
    }

    async fn close(&mut self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.incoming.close();
    }
}

pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    /// True if no connection attempt is waiting
    pub fn is_idle(&mut self) -> bool {
        self.accepted.try_recv().is_err()
    }
}

/// Server side of one link
pub struct ServerConn {
    pub token: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<ChannelFrame>,
}

impl ServerConn {
    pub async fn next_frame(&mut self) -> ChannelFrame {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the link")
    }

    /// Read the join frame and return the room
    pub async fn expect_join(&mut self) -> String {
        let frame = self.next_frame().await;
        assert_eq!(frame.event, JOIN_EVENT);
        frame.data.as_str().expect("room is a string").to_string()
    }

    pub fn push(&self, event: &str, data: Value) {
        let _ = self.to_client.send(Ok(ChannelFrame::new(event, data)));
    }

    pub fn notify(&self, data: Value) {
        self.push("new_notification", data);
    }

    pub fn push_garbage(&self, raw: &str) {
        let _ = self.to_client.send(Err(raw.to_string()));
    }

    /// Wait until the client side has gone away
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.from_client.recv().await.is_some() {}
        })
        .await
        .expect("client did not close the link");
    }

    /// Drop the link from the server side
    pub fn hang_up(self) {}
}
