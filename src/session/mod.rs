//! Both ends of a task's relay lifecycle, and the pieces they share.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_stream::wrappers::IntervalStream;
use tokio_tungstenite::{
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    broker::{
        server::{ForwardRequest, ForwardResponse},
        FaultKind, RelayFault,
    },
    envelope::{CommitmentError, EnvelopeError},
    ledger::{LedgerError, LedgerOracle},
    types::{Address, Hash32, TaskId},
};

pub mod host;
pub mod submitter;

pub use host::{CommandExecutor, EchoExecutor, HostSession, TaskExecutor};
pub use submitter::{Outcome, Submitter};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Commitment(#[from] CommitmentError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("tower reported {:?}: {}", .0.kind, .0.message)]
    Relay(RelayFault),
    #[error("relay transport: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("relay http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay connection closed")]
    Closed,
    #[error("no reply within `{0:?}`")]
    Timeout(Duration),
    #[error("host `{0}` is not registered")]
    UnknownHost(Address),
    #[error("host `{0}` has an unusable encryption key")]
    InvalidHostKey(Address),
    #[error("tower `{0}` is not registered")]
    UnknownTower(Address),
    #[error("task `{0}` is not running")]
    TaskNotRunning(TaskId),
    #[error("task `{task_id}` is assigned to `{host}`")]
    NotAssigned { task_id: TaskId, host: Address },
    #[error("reply is for task `{actual}`, expected `{expected}`")]
    UnexpectedTask { expected: TaskId, actual: TaskId },
    #[error("execution failed: {0}")]
    Execution(String),
}

impl SessionError {
    pub fn kind(&self) -> FaultKind {
        match self {
            SessionError::Envelope(_) | SessionError::UnexpectedTask { .. } => FaultKind::Envelope,
            SessionError::Commitment(_) => FaultKind::Commitment,
            SessionError::TaskNotRunning(_)
            | SessionError::NotAssigned { .. }
            | SessionError::UnknownHost(_)
            | SessionError::InvalidHostKey(_)
            | SessionError::UnknownTower(_) => FaultKind::Authorization,
            SessionError::Relay(fault) => fault.kind,
            SessionError::Transport(_)
            | SessionError::Http(_)
            | SessionError::Closed
            | SessionError::Timeout(_) => FaultKind::Liveness,
            SessionError::Ledger(_) => FaultKind::Ledger,
            SessionError::Execution(_) => FaultKind::Execution,
        }
    }

    pub fn to_fault(&self) -> RelayFault {
        RelayFault::new(self.kind(), self.to_string())
    }
}

/// A frame received from the tower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Envelope(Vec<u8>),
    Fault(RelayFault),
}

pub fn ws_url(tower_url: &str, identity: &Address) -> String {
    let base = tower_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/{identity}")
}

/// A participant's socket to its tower.
pub struct RelayClient {
    identity: Address,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayClient {
    pub async fn connect(tower_url: &str, identity: Address) -> Result<Self, SessionError> {
        let url = ws_url(tower_url, &identity);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!("Connected to relay `{url}`");
        Ok(RelayClient { identity, socket })
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub async fn send_envelope(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.socket.send(Message::Binary(frame)).await?;
        Ok(())
    }

    pub async fn send_fault(&mut self, fault: &RelayFault) -> Result<(), SessionError> {
        let text = serde_json::to_string(fault)
            .map_err(|e| SessionError::Execution(e.to_string()))?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    /// The next envelope or fault; `None` once the tower hangs up.
    pub async fn next_frame(&mut self) -> Result<Option<RelayFrame>, SessionError> {
        while let Some(message) = self.socket.next().await {
            match message? {
                Message::Binary(frame) => return Ok(Some(RelayFrame::Envelope(frame))),
                Message::Text(text) => match serde_json::from_str::<RelayFault>(&text) {
                    Ok(fault) => return Ok(Some(RelayFrame::Fault(fault))),
                    Err(e) => debug!("Ignoring text frame: {e}"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Closes the socket and waits for the tower to hang up, after which the
    /// identity may connect again.
    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
        let drain = async {
            while let Some(Ok(_)) = self.socket.next().await {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            debug!("Tower did not hang up on `{}`", self.identity);
        }
    }
}

/// One-shot forward over the tower's HTTP endpoint, with the optional
/// commitment pre-check.
pub async fn post_forward(
    tower_url: &str,
    sender: &Address,
    frame: &[u8],
    commitment: Option<Hash32>,
) -> Result<Vec<u8>, SessionError> {
    let url = format!("{}/forward/{sender}", tower_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(url)
        .json(&ForwardRequest {
            envelope: hex::encode(frame),
            commitment,
        })
        .send()
        .await?;
    if false == response.status().is_success() {
        let fault: RelayFault = response.json().await?;
        return Err(SessionError::Relay(fault));
    }
    let body: ForwardResponse = response.json().await?;
    hex::decode(body.envelope)
        .map_err(|_| SessionError::Relay(RelayFault::new(FaultKind::Envelope, "reply is not valid hex")))
}

/// Resolves once the ledger no longer reports `task_id` as running.
pub async fn poll_until_cleared(
    ledger: &dyn LedgerOracle,
    task_id: &TaskId,
    interval: Duration,
) -> Result<(), LedgerError> {
    let mut ticks = IntervalStream::new(tokio::time::interval(interval));
    while ticks.next().await.is_some() {
        if ledger.get_running_task(task_id).await?.is_none() {
            debug!("Task `{task_id}` cleared on the ledger");
            return Ok(());
        }
    }
    Ok(())
}
