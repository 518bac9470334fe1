//! The tower's connection registry and forwarding engine.
//!
//! Every participant holds at most one connection. A forward resolves the
//! running task from the leading task id, authorizes the sender against the
//! record and hands the frame, untouched, to the counterparty's connection.
//! The caller then waits for that connection's next frame for the same task,
//! which is taken as the response.
//!
//! Identities are claimed, not proven, at connect time. A forwarded frame must
//! carry the claimed sender's signature, so a squatted socket can receive but
//! never speak for the identity it took.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    envelope::{self, EnvelopeError},
    ledger::{LedgerError, LedgerOracle},
    types::{Address, Hash32, TaskId},
};

pub mod server;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

// late replies remembered per connection
const ABANDONED_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Envelope,
    Commitment,
    Authorization,
    Liveness,
    Ledger,
    // the host could not run the task
    Execution,
}

/// Failure report carried in text frames and HTTP error bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RelayFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        RelayFault {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("malformed frame of `{0}` bytes")]
    MalformedFrame(usize),
    #[error("task `{0}` not found")]
    TaskNotFound(TaskId),
    #[error("task `{task_id}` is relayed by tower `{tower}`")]
    NotThisTower { task_id: TaskId, tower: Address },
    #[error("`{sender}` is not a party of task `{task_id}`")]
    Unauthorized { task_id: TaskId, sender: Address },
    #[error("frame for task `{task_id}` claims `{sender}` but is signed by `{signer}`")]
    SignerMismatch {
        task_id: TaskId,
        sender: Address,
        signer: Address,
    },
    #[error("commitment `{actual}` does not match `{expected}` for task `{task_id}`")]
    CommitmentMismatch {
        task_id: TaskId,
        expected: Hash32,
        actual: Hash32,
    },
    #[error("`{0}` is already connected")]
    AlreadyConnected(Address),
    #[error("`{0}` is not connected")]
    TargetNotConnected(Address),
    #[error("`{0}` disconnected")]
    PeerDisconnected(Address),
    #[error("`{0}` did not respond in time")]
    Timeout(Address),
    #[error("rejected by peer: {}", .0.message)]
    Rejected(RelayFault),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl BrokerError {
    pub fn kind(&self) -> FaultKind {
        match self {
            BrokerError::MalformedFrame(_) => FaultKind::Envelope,
            BrokerError::CommitmentMismatch { .. } => FaultKind::Commitment,
            BrokerError::TaskNotFound(_)
            | BrokerError::NotThisTower { .. }
            | BrokerError::Unauthorized { .. }
            | BrokerError::SignerMismatch { .. } => FaultKind::Authorization,
            BrokerError::AlreadyConnected(_)
            | BrokerError::TargetNotConnected(_)
            | BrokerError::PeerDisconnected(_)
            | BrokerError::Timeout(_) => FaultKind::Liveness,
            // the peer's own classification travels back unchanged
            BrokerError::Rejected(fault) => fault.kind,
            BrokerError::Ledger(_) => FaultKind::Ledger,
        }
    }

    pub fn to_fault(&self) -> RelayFault {
        match self {
            BrokerError::Rejected(fault) => fault.clone(),
            other => RelayFault::new(other.kind(), other.to_string()),
        }
    }
}

/// What the broker pushes down a participant's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Envelope(Vec<u8>),
    Fault(RelayFault),
}

pub type Outbox = mpsc::UnboundedReceiver<Outbound>;

struct Pending {
    request: Uuid,
    task_id: TaskId,
    reply: oneshot::Sender<Result<Vec<u8>, BrokerError>>,
}

#[derive(Default)]
struct Slot {
    closed: bool,
    pending: Option<Pending>,
    // tasks whose forward ended before the target answered
    abandoned: VecDeque<TaskId>,
}

impl Slot {
    fn abandon(&mut self, task_id: TaskId) {
        if self.abandoned.len() == ABANDONED_LIMIT {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(task_id);
    }

    fn take_abandoned(&mut self, task_id: &TaskId) -> bool {
        match self.abandoned.iter().position(|id| id == task_id) {
            Some(i) => {
                self.abandoned.remove(i);
                true
            }
            None => false,
        }
    }
}

struct Connection {
    id: Uuid,
    identity: Address,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
    slot: Mutex<Slot>,
    // one relayed request at a time per target
    turn: tokio::sync::Mutex<()>,
}

impl Connection {
    fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        if let Some(pending) = slot.pending.take() {
            let _ = pending.reply.send(Err(BrokerError::PeerDisconnected(self.identity)));
        }
    }

    fn respond(&self, result: Result<Vec<u8>, BrokerError>) -> bool {
        match self.slot.lock().pending.take() {
            Some(pending) => {
                let _ = pending.reply.send(result);
                true
            }
            None => false,
        }
    }
}

// clears the pending slot if the forward ends without a response, so a late
// answer for that task is recognized and dropped
struct PendingGuard {
    connection: Arc<Connection>,
    request: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut slot = self.connection.slot.lock();
        if slot.pending.as_ref().is_some_and(|p| p.request == self.request) {
            if let Some(pending) = slot.pending.take() {
                slot.abandon(pending.task_id);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub identity: Address,
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
}

pub struct RelayBroker {
    tower: Address,
    ledger: Arc<dyn LedgerOracle>,
    registry: Mutex<HashMap<Address, Arc<Connection>>>,
    forward_timeout: Duration,
}

impl RelayBroker {
    pub fn new(tower: Address, ledger: Arc<dyn LedgerOracle>, forward_timeout: Duration) -> Self {
        RelayBroker {
            tower,
            ledger,
            registry: Mutex::new(HashMap::new()),
            forward_timeout,
        }
    }

    pub fn tower(&self) -> Address {
        self.tower
    }

    /// Registers `identity`. A second connect while the first is open fails.
    pub fn connect(self: &Arc<Self>, identity: Address) -> Result<(ConnectionHandle, Outbox), BrokerError> {
        let mut registry = self.registry.lock();
        if registry.contains_key(&identity) {
            warn!("Connection for `{identity}` refused, already connected");
            return Err(BrokerError::AlreadyConnected(identity));
        }
        let (outbound, outbox) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            identity,
            connected_at: Utc::now(),
            outbound,
            slot: Mutex::new(Slot::default()),
            turn: tokio::sync::Mutex::new(()),
        });
        let handle = ConnectionHandle {
            broker: Arc::clone(self),
            identity,
            id: connection.id,
        };
        registry.insert(identity, connection);
        info!("`{identity}` connected, `{}` open connections", registry.len());
        Ok((handle, outbox))
    }

    /// Drops the registration of `identity`, failing a forward waiting on it.
    pub fn disconnect(&self, identity: &Address) -> bool {
        let removed = self.registry.lock().remove(identity);
        match removed {
            Some(connection) => {
                connection.close();
                info!("`{identity}` disconnected");
                true
            }
            None => false,
        }
    }

    // only the connection instance that registered may remove itself
    fn release(&self, identity: &Address, id: Uuid) {
        let removed = {
            let mut registry = self.registry.lock();
            match registry.get(identity) {
                Some(c) if c.id == id => registry.remove(identity),
                _ => None,
            }
        };
        if let Some(connection) = removed {
            connection.close();
            info!("`{identity}` disconnected");
        }
    }

    pub fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = self.registry.lock().drain().map(|(_, c)| c).collect();
        for connection in drained.iter() {
            connection.close();
        }
        info!("Broker shut down, `{}` connections dropped", drained.len());
    }

    pub fn is_connected(&self, identity: &Address) -> bool {
        self.registry.lock().contains_key(identity)
    }

    pub fn connected(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .registry
            .lock()
            .values()
            .map(|c| ConnectionInfo {
                identity: c.identity,
                id: c.id,
                connected_at: c.connected_at,
            })
            .collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    fn lookup(&self, identity: &Address) -> Option<Arc<Connection>> {
        self.registry.lock().get(identity).cloned()
    }

    fn lookup_instance(&self, identity: &Address, id: Uuid) -> Option<Arc<Connection>> {
        self.lookup(identity).filter(|c| c.id == id)
    }

    /// Relays `frame` from `sender` to the other party of its task and waits
    /// for the reply. `commitment`, when given, must equal the commitment the
    /// ledger holds for what `sender` is sending.
    #[tracing::instrument(skip(self, frame, commitment), fields(tower = %self.tower, len = frame.len()))]
    pub async fn forward(
        &self,
        sender: &Address,
        frame: &[u8],
        commitment: Option<&Hash32>,
    ) -> Result<Vec<u8>, BrokerError> {
        let task_id = envelope::task_id_of(frame).map_err(|_| BrokerError::MalformedFrame(frame.len()))?;
        let running = self
            .ledger
            .get_running_task(&task_id)
            .await?
            .ok_or(BrokerError::TaskNotFound(task_id))?;
        if running.tower != self.tower {
            return Err(BrokerError::NotThisTower {
                task_id,
                tower: running.tower,
            });
        }
        let role = running.role_of(sender).ok_or(BrokerError::Unauthorized {
            task_id,
            sender: *sender,
        })?;
        match envelope::verify_signer(frame, sender) {
            Ok(_) => {}
            Err(EnvelopeError::CounterpartyMismatch { actual, .. }) => {
                return Err(BrokerError::SignerMismatch {
                    task_id,
                    sender: *sender,
                    signer: actual,
                })
            }
            Err(_) => return Err(BrokerError::MalformedFrame(frame.len())),
        }
        if let Some(actual) = commitment {
            let expected = running.commitment_for(role);
            if *actual != expected {
                return Err(BrokerError::CommitmentMismatch {
                    task_id,
                    expected,
                    actual: *actual,
                });
            }
        }

        let target = running.counterparty(role);
        let connection = self.lookup(&target).ok_or(BrokerError::TargetNotConnected(target))?;
        let _turn = connection.turn.lock().await;

        let (reply, response) = oneshot::channel();
        let request = Uuid::new_v4();
        {
            let mut slot = connection.slot.lock();
            if slot.closed {
                return Err(BrokerError::PeerDisconnected(target));
            }
            slot.pending = Some(Pending {
                request,
                task_id,
                reply,
            });
        }
        let _guard = PendingGuard {
            connection: Arc::clone(&connection),
            request,
        };
        if connection.outbound.send(Outbound::Envelope(frame.to_vec())).is_err() {
            return Err(BrokerError::PeerDisconnected(target));
        }
        debug!("Task `{task_id}` frame from `{sender}` handed to `{target}`");

        match tokio::time::timeout(self.forward_timeout, response).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    info!("Task `{task_id}` forwarded to `{target}` and answered");
                }
                result
            }
            Ok(Err(_)) => Err(BrokerError::PeerDisconnected(target)),
            Err(_) => {
                warn!("Task `{task_id}`: `{target}` timed out");
                Err(BrokerError::Timeout(target))
            }
        }
    }
}

/// One open connection, owned by the socket's reader. Dropping it
/// deregisters the connection.
pub struct ConnectionHandle {
    broker: Arc<RelayBroker>,
    identity: Address,
    id: Uuid,
}

impl ConnectionHandle {
    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Routes an inbound binary frame. A frame for the task of the outstanding
    /// request is its response; a late frame for a task whose forward already
    /// ended is dropped; anything else is a new forward request, whose result
    /// is pushed back down this connection.
    pub fn inbound(&self, frame: Vec<u8>) {
        let Some(connection) = self.broker.lookup_instance(&self.identity, self.id) else {
            debug!("Frame from stale connection of `{}` dropped", self.identity);
            return;
        };
        if let Ok(task_id) = envelope::task_id_of(&frame) {
            let mut slot = connection.slot.lock();
            if slot.pending.as_ref().is_some_and(|p| p.task_id == task_id) {
                if let Some(pending) = slot.pending.take() {
                    let _ = pending.reply.send(Ok(frame));
                }
                return;
            }
            if slot.take_abandoned(&task_id) {
                debug!("Late reply from `{}` for task `{task_id}` dropped", self.identity);
                return;
            }
        }
        let broker = Arc::clone(&self.broker);
        let sender = self.identity;
        tokio::spawn(async move {
            let outbound = match broker.forward(&sender, &frame, None).await {
                Ok(response) => Outbound::Envelope(response),
                Err(e) => {
                    warn!("Forward from `{sender}` failed: {e}");
                    Outbound::Fault(e.to_fault())
                }
            };
            // the caller may have gone away in the meantime
            let _ = connection.outbound.send(outbound);
        });
    }

    /// The peer refused the request it was handed.
    pub fn reject(&self, fault: RelayFault) {
        let delivered = self
            .broker
            .lookup_instance(&self.identity, self.id)
            .is_some_and(|c| c.respond(Err(BrokerError::Rejected(fault.clone()))));
        if false == delivered {
            warn!("Unsolicited fault from `{}`: {}", self.identity, fault.message);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.broker.release(&self.identity, self.id);
    }
}
