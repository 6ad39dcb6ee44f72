//! Session runtime
//!
//! A single task owns the [`NotificationStore`] and drains a queue of
//! [`Reaction`]s one at a time. Network I/O runs in spawned tasks whose
//! results come back through the same queue tagged with the session they
//! were issued under, so a reaction always runs to completion against a
//! consistent store and late results from an old session are dropped.
//!
//! ```text
//!  handle ──┐
//!  ticker ──┤                      ┌──▶ pull task ──┐
//!  channel ─┼──▶ reaction queue ──▶ runtime (store)  ├──▶ reaction queue
//!  forwarder┘                      └──▶ ack task ───┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use hirewire_core::{
    parse_batch, AckReport, BatchId, ConnectionState, Listener, NotificationEntry,
    NotificationId, NotificationStore, NotifyConfig, NotifyError, ReadBatch, ReadSyncOutcome,
    Result, StoreChange, StoreSnapshot, SubscriptionId, TransientError,
};

use crate::backend::NotificationBackend;
use crate::channel::{ChannelConnection, PushTransport};
use crate::identity::{Credentials, IdentityProvider, SessionId};

type ReactionSender = mpsc::UnboundedSender<Reaction>;
type WeakReactionSender = mpsc::WeakUnboundedSender<Reaction>;

/// Everything the runtime reacts to
enum Reaction {
    Initialize {
        credentials: Credentials,
        reply: oneshot::Sender<SessionId>,
    },
    Teardown {
        reply: Option<oneshot::Sender<()>>,
    },
    Refresh,
    PullCompleted {
        session: SessionId,
        result: Result<Vec<Value>>,
    },
    PushReceived {
        session: SessionId,
        payload: Value,
    },
    OpenPanel {
        reply: oneshot::Sender<ReadSyncOutcome>,
    },
    AckCompleted {
        session: SessionId,
        batch: BatchId,
        report: AckReport,
    },
    ConnectionChanged {
        session: SessionId,
        state: ConnectionState,
    },
    Subscribe {
        listener: Listener,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Shutdown,
}

struct PendingRead {
    batch: ReadBatch,
    reply: Option<oneshot::Sender<ReadSyncOutcome>>,
}

struct Session<T: PushTransport> {
    id: SessionId,
    credentials: Credentials,
    channel: ChannelConnection<T>,
    forwarder: JoinHandle<()>,
    pull_in_flight: bool,
    pull_again: bool,
    /// Pushes that arrived while a pull was in flight, in arrival order
    parked: Vec<NotificationEntry>,
    reads: HashMap<BatchId, PendingRead>,
    connected_once: bool,
}

/// The actor behind a [`NotificationHandle`]
pub struct NotificationRuntime<B: NotificationBackend, T: PushTransport> {
    config: NotifyConfig,
    backend: Arc<B>,
    transport: Arc<T>,
    store: NotificationStore,
    session: Option<Session<T>>,
    reactions: WeakReactionSender,
}

impl<B: NotificationBackend, T: PushTransport> NotificationRuntime<B, T> {
    /// Start the runtime on the current tokio runtime.
    ///
    /// It stops on [`NotificationHandle::shutdown`] or once every handle is
    /// dropped.
    pub fn spawn(config: NotifyConfig, backend: Arc<B>, transport: Arc<T>) -> NotificationHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = NotificationStore::new();

        let (snapshots, snapshot_rx) = watch::channel(store.snapshot());
        store.subscribe(move |_change: &StoreChange, snapshot: &StoreSnapshot| {
            snapshots.send_replace(snapshot.clone());
        });

        let runtime = Self {
            config,
            backend,
            transport,
            store,
            session: None,
            reactions: tx.downgrade(),
        };
        tokio::spawn(runtime.run(rx));

        NotificationHandle {
            reactions: tx,
            snapshots: snapshot_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Reaction>) {
        let period = Duration::from_secs(self.config.refresh.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Notification runtime started");
        loop {
            let reaction = tokio::select! {
                reaction = rx.recv() => match reaction {
                    Some(reaction) => reaction,
                    None => break,
                },
                _ = ticker.tick() => Reaction::Refresh,
            };
            if !self.react(reaction) {
                break;
            }
        }

        self.end_session();
        tracing::info!("Notification runtime stopped");
    }

    /// Apply one reaction; false stops the runtime
    fn react(&mut self, reaction: Reaction) -> bool {
        match reaction {
            Reaction::Initialize { credentials, reply } => {
                let id = self.begin_session(credentials);
                let _ = reply.send(id);
            }
            Reaction::Teardown { reply } => {
                self.end_session();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Reaction::Refresh => self.start_pull(),
            Reaction::PullCompleted { session, result } => self.pull_completed(session, result),
            Reaction::PushReceived { session, payload } => self.push_received(session, payload),
            Reaction::OpenPanel { reply } => self.open_panel(reply),
            Reaction::AckCompleted {
                session,
                batch,
                report,
            } => self.ack_completed(session, batch, report),
            Reaction::ConnectionChanged { session, state } => {
                self.connection_changed(session, state)
            }
            Reaction::Subscribe { listener, reply } => {
                let id = self.store.attach(listener);
                let _ = reply.send(id);
            }
            Reaction::Unsubscribe { id } => {
                self.store.unsubscribe(id);
            }
            Reaction::Shutdown => return false,
        }
        true
    }

    // ==================== Session lifecycle ====================

    fn begin_session(&mut self, credentials: Credentials) -> SessionId {
        self.end_session();

        let id = SessionId::new();
        tracing::info!(
            "Starting notification session {} for user {}",
            id,
            credentials.user_id
        );

        let channel = ChannelConnection::new(
            Arc::clone(&self.transport),
            credentials.clone(),
            self.config.reconnect.clone(),
        );
        let reactions = self.reactions.clone();
        channel.on_event(&self.config.service.notification_event, move |data| {
            send(
                &reactions,
                Reaction::PushReceived {
                    session: id,
                    payload: data.clone(),
                },
            );
        });
        let forwarder = forward_state(channel.state_watch(), self.reactions.clone(), id);

        channel.join_room(&credentials.user_id);
        channel.connect();

        self.session = Some(Session {
            id,
            credentials,
            channel,
            forwarder,
            pull_in_flight: false,
            pull_again: false,
            parked: Vec::new(),
            reads: HashMap::new(),
            connected_once: false,
        });
        self.start_pull();
        id
    }

    fn end_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::info!("Ending notification session {}", session.id);

        session.forwarder.abort();
        session.channel.disconnect();
        for (_, pending) in session.reads {
            if let Some(reply) = pending.reply {
                let _ = reply.send(ReadSyncOutcome::Abandoned);
            }
        }
        self.store.clear();
    }

    fn connection_changed(&mut self, session_id: SessionId, state: ConnectionState) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            tracing::debug!("Ignoring connection state from stale session {}", session_id);
            return;
        };

        let reconnected = state == ConnectionState::Connected && session.connected_once;
        if state == ConnectionState::Connected {
            session.connected_once = true;
        }
        self.store.set_connection_state(state);

        if reconnected
            && self.config.refresh.refresh_on_reconnect
            && self.store.last_full_sync_at().is_some()
        {
            tracing::debug!("Push channel reconnected, pulling to cover the gap");
            self.start_pull();
        }
    }

    // ==================== Pull ====================

    fn start_pull(&mut self) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("No active session, skipping pull");
            return;
        };
        if session.pull_in_flight {
            tracing::debug!("Pull already in flight, will pull again when it lands");
            session.pull_again = true;
            return;
        }
        session.pull_in_flight = true;

        let backend = Arc::clone(&self.backend);
        let credentials = session.credentials.clone();
        let reactions = self.reactions.clone();
        let id = session.id;
        tokio::spawn(async move {
            let result = backend.fetch_all(&credentials).await;
            send(&reactions, Reaction::PullCompleted { session: id, result });
        });
    }

    fn pull_completed(&mut self, session_id: SessionId, result: Result<Vec<Value>>) {
        let current = self.session.as_ref().map(|s| s.id);
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            tracing::debug!("Dropping pull result: {}", stale(session_id, current));
            return;
        };

        session.pull_in_flight = false;
        let again = std::mem::take(&mut session.pull_again);
        let parked = std::mem::take(&mut session.parked);
        // Acks still on the wire may not be reflected server-side yet
        let pending: Vec<NotificationId> = session
            .reads
            .values()
            .flat_map(|read| read.batch.ids().iter().cloned())
            .collect();

        match result {
            Ok(items) => {
                let parsed = parse_batch(&items);
                if !parsed.is_clean() {
                    tracing::warn!(
                        "Pull dropped {} of {} notifications",
                        parsed.rejected.len(),
                        items.len()
                    );
                }
                self.store
                    .replace_all_pending(parsed.entries, &pending, Utc::now());
                tracing::debug!("Pull applied, {} notifications", self.store.len());
            }
            Err(err) => tracing::warn!("Notification pull failed: {}", err),
        }

        for entry in parked {
            self.store.ingest_push(entry);
        }
        if again {
            self.start_pull();
        }
    }

    // ==================== Push ====================

    fn push_received(&mut self, session_id: SessionId, payload: Value) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            tracing::debug!("Ignoring push for stale session {}", session_id);
            return;
        };

        let entry = match NotificationEntry::from_payload(&payload) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Dropping malformed push: {}", err);
                return;
            }
        };

        if session.pull_in_flight {
            tracing::debug!("Parking push {} until the pull lands", entry.id);
            session.parked.push(entry);
            return;
        }
        self.store.ingest_push(entry);
    }

    // ==================== Read state ====================

    fn open_panel(&mut self, reply: oneshot::Sender<ReadSyncOutcome>) {
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(ReadSyncOutcome::NothingToAck);
            return;
        };
        let Some(mut batch) = ReadBatch::begin(&mut self.store) else {
            let _ = reply.send(ReadSyncOutcome::NothingToAck);
            return;
        };

        batch.confirming();
        let chunks = batch.chunks(self.config.ack.batch_size);
        let backend = Arc::clone(&self.backend);
        let credentials = session.credentials.clone();
        let reactions = self.reactions.clone();
        let (id, batch_id) = (session.id, batch.id());
        let all_ids = batch.ids().to_vec();

        tracing::debug!(
            "Acknowledging {} notifications in {} requests",
            batch.ids().len(),
            chunks.len()
        );
        let work = tokio::spawn(async move {
            let results =
                join_all(chunks.iter().map(|chunk| backend.acknowledge(&credentials, chunk))).await;
            let mut report = AckReport::new();
            for (chunk, result) in chunks.iter().zip(results) {
                report.record(chunk, result);
            }
            report
        });
        // The batch must settle even if the acknowledgement task dies
        tokio::spawn(async move {
            let report = match work.await {
                Ok(report) => report,
                Err(err) => {
                    tracing::warn!("Acknowledgement task for batch {} failed: {}", batch_id, err);
                    let mut report = AckReport::new();
                    report.record(
                        &all_ids,
                        Err(TransientError::Request(format!(
                            "acknowledgement task failed: {err}"
                        ))
                        .into()),
                    );
                    report
                }
            };
            send(
                &reactions,
                Reaction::AckCompleted {
                    session: id,
                    batch: batch_id,
                    report,
                },
            );
        });

        session.reads.insert(
            batch_id,
            PendingRead {
                batch,
                reply: Some(reply),
            },
        );
    }

    fn ack_completed(&mut self, session_id: SessionId, batch_id: BatchId, report: AckReport) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            tracing::debug!("Ignoring acknowledgement for stale session {}", session_id);
            return;
        };
        let Some(pending) = session.reads.remove(&batch_id) else {
            tracing::debug!("Unknown read batch {}", batch_id);
            return;
        };

        let outcome = pending.batch.settle(&mut self.store, report);
        let confirmed = matches!(outcome, ReadSyncOutcome::Confirmed { .. });
        if let ReadSyncOutcome::Confirmed { ids } = &outcome {
            tracing::info!("Marked {} notifications read", ids.len());
        }
        if let Some(reply) = pending.reply {
            let _ = reply.send(outcome);
        }

        // Pick up anything that changed server-side while confirming
        if confirmed {
            self.start_pull();
        }
    }
}

fn send(reactions: &WeakReactionSender, reaction: Reaction) {
    if let Some(tx) = reactions.upgrade() {
        let _ = tx.send(reaction);
    }
}

fn stale(got: SessionId, current: Option<SessionId>) -> NotifyError {
    NotifyError::StaleSession {
        expected: current.map(|id| id.to_string()).unwrap_or_default(),
        actual: got.to_string(),
    }
}

/// Relay channel state transitions into the reaction queue
fn forward_state(
    mut states: watch::Receiver<ConnectionState>,
    reactions: WeakReactionSender,
    session: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = *states.borrow_and_update();
            let Some(tx) = reactions.upgrade() else { break };
            if tx.send(Reaction::ConnectionChanged { session, state }).is_err() {
                break;
            }
            drop(tx);
            if states.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Adapter-facing API. Cheap to clone; every surface shares one runtime.
#[derive(Clone)]
pub struct NotificationHandle {
    reactions: ReactionSender,
    snapshots: watch::Receiver<StoreSnapshot>,
}

impl NotificationHandle {
    fn post(&self, reaction: Reaction) -> Result<()> {
        self.reactions.send(reaction).map_err(|_| NotifyError::Closed)
    }

    /// Start a session: pull the full list, connect and join the user's room.
    ///
    /// Any previous session is torn down first.
    pub async fn initialize(&self, credentials: Credentials) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.post(Reaction::Initialize { credentials, reply })?;
        rx.await.map_err(|_| NotifyError::Closed)
    }

    /// Initialize from an identity collaborator; tears down if nobody is logged in
    pub async fn initialize_from(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Result<Option<SessionId>> {
        match identity.credentials() {
            Some(credentials) => self.initialize(credentials).await.map(Some),
            None => {
                self.teardown().await?;
                Ok(None)
            }
        }
    }

    /// End the session: disconnect and clear the store
    pub async fn teardown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Reaction::Teardown { reply: Some(reply) })?;
        rx.await.map_err(|_| NotifyError::Closed)
    }

    /// Request a full pull
    pub fn refresh(&self) -> Result<()> {
        self.post(Reaction::Refresh)
    }

    /// Mark everything unread as read; resolves once the acknowledgements settle
    pub async fn open_panel(&self) -> Result<ReadSyncOutcome> {
        let (reply, rx) = oneshot::channel();
        self.post(Reaction::OpenPanel { reply })?;
        rx.await.map_err(|_| NotifyError::Closed)
    }

    /// Register a listener. It is called once with the current state, then
    /// after every store mutation.
    pub async fn subscribe<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: FnMut(&StoreChange, &StoreSnapshot) + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.post(Reaction::Subscribe {
            listener: Box::new(listener),
            reply,
        })?;
        rx.await.map_err(|_| NotifyError::Closed)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.post(Reaction::Unsubscribe { id });
    }

    /// Latest published state
    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn entries(&self) -> Arc<[NotificationEntry]> {
        Arc::clone(&self.snapshots.borrow().entries)
    }

    pub fn unread_count(&self) -> usize {
        self.snapshots.borrow().unread_count
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshots.borrow().connection_state
    }

    /// Receiver that changes after every store mutation
    pub fn watch(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshots.clone()
    }

    /// Drive initialize/teardown from login and logout transitions
    pub fn follow_identity(
        &self,
        mut identity: watch::Receiver<Option<Credentials>>,
    ) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut current: Option<Credentials> = None;
            loop {
                let next = identity.borrow_and_update().clone();
                if next != current {
                    let result = match &next {
                        Some(credentials) => handle.initialize(credentials.clone()).await.map(drop),
                        None => handle.teardown().await,
                    };
                    if result.is_err() {
                        break;
                    }
                    current = next;
                }
                if identity.changed().await.is_err() {
                    break;
                }
            }
            tracing::debug!("Stopped following identity");
        })
    }

    /// Stop the runtime, ending any session
    pub fn shutdown(&self) {
        let _ = self.post(Reaction::Shutdown);
    }
}
