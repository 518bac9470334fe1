//! HTTP and WebSocket front of the relay broker.
use std::{future::Future, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::{
    BrokerError, ConnectionHandle, ConnectionInfo, FaultKind, Outbound, Outbox, RelayBroker,
    RelayFault,
};
use crate::types::{Address, Hash32};

#[derive(Debug, Serialize)]
pub struct TowerStatus {
    pub tower: Address,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    // hex encoded envelope
    pub envelope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Hash32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub envelope: String,
}

pub struct ApiError(StatusCode, RelayFault);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

pub fn status_of(error: &BrokerError) -> StatusCode {
    match error {
        BrokerError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
        BrokerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::NotThisTower { .. }
        | BrokerError::Unauthorized { .. }
        | BrokerError::SignerMismatch { .. } => StatusCode::FORBIDDEN,
        BrokerError::CommitmentMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::AlreadyConnected(_) => StatusCode::CONFLICT,
        BrokerError::TargetNotConnected(_) | BrokerError::PeerDisconnected(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BrokerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BrokerError::Rejected(_) | BrokerError::Ledger(_) => StatusCode::BAD_GATEWAY,
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        ApiError(status_of(&error), error.to_fault())
    }
}

pub fn router(broker: Arc<RelayBroker>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/ws/:address", get(connect))
        .route("/forward/:address", post(forward))
        .with_state(broker)
}

/// Serves until `shutdown` resolves, then drops every registration.
pub async fn serve<F>(listener: TcpListener, broker: Arc<RelayBroker>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Tower `{}` relaying on `{}`", broker.tower(), listener.local_addr()?);
    axum::serve(listener, router(broker.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;
    broker.shutdown();
    Ok(())
}

async fn status(State(broker): State<Arc<RelayBroker>>) -> Json<TowerStatus> {
    Json(TowerStatus {
        tower: broker.tower(),
        connections: broker.connected(),
    })
}

async fn connect(
    State(broker): State<Arc<RelayBroker>>,
    Path(address): Path<Address>,
    ws: WebSocketUpgrade,
) -> Response {
    // registered before the upgrade so a duplicate gets a plain 409
    match broker.connect(address) {
        Ok((handle, outbox)) => ws
            .on_upgrade(move |socket| pump(socket, handle, outbox))
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn forward(
    State(broker): State<Arc<RelayBroker>>,
    Path(sender): Path<Address>,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<ForwardResponse>, ApiError> {
    let frame = hex::decode(request.envelope.trim_start_matches("0x")).map_err(|_| {
        ApiError(
            StatusCode::BAD_REQUEST,
            RelayFault::new(FaultKind::Envelope, "envelope is not valid hex"),
        )
    })?;
    let response = broker
        .forward(&sender, &frame, request.commitment.as_ref())
        .await?;
    Ok(Json(ForwardResponse {
        envelope: hex::encode(response),
    }))
}

// one reader loop per socket, writes go through a spawned writer
async fn pump(socket: WebSocket, handle: ConnectionHandle, mut outbox: Outbox) {
    let identity = handle.identity();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbox.recv().await {
            let message = match outbound {
                Outbound::Envelope(frame) => Message::Binary(frame),
                Outbound::Fault(fault) => match serde_json::to_string(&fault) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!("Fault for `{identity}` not encodable: {e}");
                        continue;
                    }
                },
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => handle.inbound(frame),
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayFault>(&text) {
                Ok(fault) => handle.reject(fault),
                Err(e) => warn!("Unreadable text frame from `{identity}`: {e}"),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!("`{identity}` closed: {frame:?}");
                break;
            }
            Err(e) => {
                warn!("Socket of `{identity}` failed: {e}");
                break;
            }
        }
    }

    drop(handle);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::{self, Identity},
        ledger::InMemoryLedger,
        types::{FeeBreakdown, RunningTask},
        envelope,
    };
    use std::time::Duration;

    async fn spawn_tower() -> (Arc<RelayBroker>, String, Identity, Identity, Hash32) {
        let tower = Address([7u8; 20]);
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Identity::random();
        let host = Identity::random();
        let task_id = Hash32([0x11; 32]);
        ledger.insert_running_task(
            task_id,
            RunningTask {
                task_hash: Hash32([0xaa; 32]),
                input_hash: keys::commitment(b"input"),
                output_hash: Hash32::ZERO,
                size: 1,
                tower,
                host: host.address(),
                owner: owner.address(),
                start_block: 0,
                block_timeout: 100,
                fee: FeeBreakdown::default(),
            },
        );
        let broker = Arc::new(RelayBroker::new(tower, ledger, Duration::from_secs(5)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, broker.clone(), std::future::pending()));
        (broker, url, owner, host, task_id)
    }

    #[tokio::test]
    async fn test_duplicate_socket_refused() {
        let (broker, url, _, host, _) = spawn_tower().await;
        let ws = format!("{}/ws/{}", url.replacen("http", "ws", 1), host.address());
        let (_first, _) = tokio_tungstenite::connect_async(ws.as_str()).await.unwrap();
        assert!(broker.is_connected(&host.address()));
        match tokio_tungstenite::connect_async(ws.as_str()).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 409);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_http_forward_faults() {
        let (_broker, url, owner, host, task_id) = spawn_tower().await;
        let client = reqwest::Client::new();
        let frame = envelope::encode(&task_id, &host.public_key(), b"input", &owner).unwrap();

        let response = client
            .post(format!("{url}/forward/{}", owner.address()))
            .json(&ForwardRequest {
                envelope: hex::encode(&frame),
                commitment: Some(Hash32([0x55; 32])),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 422);
        let fault: RelayFault = response.json().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Commitment);

        let response = client
            .post(format!("{url}/forward/{}", owner.address()))
            .json(&ForwardRequest {
                envelope: hex::encode(&frame),
                commitment: Some(keys::commitment(b"input")),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);

        let response = client
            .post(format!("{url}/forward/{}", owner.address()))
            .json(&ForwardRequest {
                envelope: "zz".into(),
                commitment: None,
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        // the host cannot forward a frame it signed in the owner's name
        let forged = envelope::encode(&task_id, &host.public_key(), b"input", &host).unwrap();
        let response = client
            .post(format!("{url}/forward/{}", owner.address()))
            .json(&ForwardRequest {
                envelope: hex::encode(&forged),
                commitment: None,
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 403);
        let fault: RelayFault = response.json().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Authorization);
    }

    #[tokio::test]
    async fn test_status_lists_connections() {
        let (broker, url, owner, _, _) = spawn_tower().await;
        let ws = format!("{}/ws/{}", url.replacen("http", "ws", 1), owner.address());
        let (_socket, _) = tokio_tungstenite::connect_async(ws.as_str()).await.unwrap();
        let status: serde_json::Value = reqwest::get(format!("{url}/")).await.unwrap().json().await.unwrap();
        assert_eq!(status["tower"], broker.tower().to_string());
        assert_eq!(
            status["connections"][0]["identity"],
            owner.address().to_string()
        );
    }
}
