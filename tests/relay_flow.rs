use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use meca_relay::{
    broker::{server, FaultKind, RelayBroker},
    envelope,
    keys::{self, Identity},
    ledger::{InMemoryLedger, LedgerOracle},
    matcher,
    session::{
        self, EchoExecutor, HostSession, Outcome, RelayClient, RelayFrame, SessionError,
        Submitter, TaskExecutor,
    },
    types::{FeeType, Hash32, HostRecord, HostTaskBinding, TaskDescriptor, TowerRecord},
};

const TASK: Hash32 = Hash32([0xaa; 32]);

struct Network {
    ledger: Arc<InMemoryLedger>,
    broker: Arc<RelayBroker>,
    tower_url: String,
    owner: Identity,
    host: Identity,
    stop_host: Option<oneshot::Sender<()>>,
    host_session: Option<JoinHandle<Result<(), SessionError>>>,
}

struct Reverse;

#[async_trait::async_trait]
impl TaskExecutor for Reverse {
    async fn execute(&self, _: &Hash32, mut input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        input.reverse();
        Ok(input)
    }
}

async fn network(executor: Arc<dyn TaskExecutor>) -> Network {
    let tower = Identity::random();
    let host = Identity::random();
    let owner = Identity::random();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tower_url = format!("http://{}", listener.local_addr().unwrap());

    let ledger = Arc::new(InMemoryLedger::new());
    ledger.set_block(100);
    ledger.set_scheduler_fee(1);
    ledger.add_task(TaskDescriptor {
        hash: TASK,
        owner: Identity::random().address(),
        fee: 10,
        computing_type: 0,
        size: 64,
    });
    ledger.add_host(HostRecord {
        owner: host.address(),
        encryption_key: host.encryption_key(),
        block_timeout_limit: 30,
        stake: 0,
    });
    ledger.add_tower(TowerRecord {
        owner: tower.address(),
        public_connection: tower_url.clone(),
        size_limit: 1024,
        fee: 3,
        fee_type: FeeType::Flat,
        stake: 0,
    });
    ledger.bind_host(host.address(), TASK, HostTaskBinding { block_timeout: 7, fee: 5 });
    ledger.request_membership(tower.address(), host.address());
    ledger.accept_host(tower.address(), host.address());

    let broker = Arc::new(RelayBroker::new(tower.address(), ledger.clone(), Duration::from_secs(10)));
    tokio::spawn(server::serve(listener, broker.clone(), std::future::pending()));

    let session = HostSession::new(host.clone(), ledger.clone(), executor);
    let (stop_host, stopped) = oneshot::channel::<()>();
    let url = tower_url.clone();
    let host_session = tokio::spawn(async move {
        session
            .run_until(&url, async {
                let _ = stopped.await;
            })
            .await
    });
    for _ in 0..250 {
        if broker.is_connected(&host.address()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(broker.is_connected(&host.address()));

    Network {
        ledger,
        broker,
        tower_url,
        owner,
        host,
        stop_host: Some(stop_host),
        host_session: Some(host_session),
    }
}

impl Network {
    fn submitter(&self) -> Submitter {
        Submitter::new(
            self.owner.clone(),
            self.ledger.clone(),
            Duration::from_millis(50),
            Duration::from_secs(10),
        )
    }

    async fn stop_host(&mut self) -> Result<(), SessionError> {
        if let Some(stop) = self.stop_host.take() {
            let _ = stop.send(());
        }
        match self.host_session.take() {
            Some(handle) => handle.await.unwrap(),
            None => Ok(()),
        }
    }
}

#[tokio::test]
async fn test_task_round_trip() {
    let mut net = network(Arc::new(Reverse)).await;
    let candidates = matcher::candidates_for(net.ledger.as_ref(), &TASK).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].host, net.host.address());
    assert_eq!(candidates[0].end_block, 7);

    let outcome = net.submitter().run(&TASK, &candidates[0], b"relay me").await.unwrap();
    let Outcome::Completed { task_id, output } = outcome else {
        panic!("task was not completed");
    };
    assert_eq!(output, b"em yaler");
    // finalized
    assert!(net.ledger.get_running_task(&task_id).await.unwrap().is_none());
    net.stop_host().await.unwrap();
}

#[tokio::test]
async fn test_two_tasks_in_sequence() {
    let mut net = network(Arc::new(EchoExecutor)).await;
    let candidate = matcher::candidates_for(net.ledger.as_ref(), &TASK).await.unwrap().remove(0);
    for input in [&b"first"[..], &b""[..]] {
        let outcome = net.submitter().run(&TASK, &candidate, input).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed { ref output, .. } if output == input));
    }
    net.stop_host().await.unwrap();
}

#[tokio::test]
async fn test_wrong_input_is_reported_and_rejected() {
    let mut net = network(Arc::new(EchoExecutor)).await;
    let task_id = net
        .ledger
        .submit_task(&net.owner.address(), &TASK, &net.host.address(), &net.broker.tower(), &keys::commitment(b"promised"))
        .await
        .unwrap();

    let mut client = RelayClient::connect(&net.tower_url, net.owner.address()).await.unwrap();
    let frame = envelope::encode(&task_id, &net.host.public_key(), b"delivered", &net.owner).unwrap();
    client.send_envelope(frame).await.unwrap();
    match client.next_frame().await.unwrap() {
        Some(RelayFrame::Fault(fault)) => assert_eq!(fault.kind, FaultKind::Commitment),
        other => panic!("unexpected {other:?}"),
    }
    // the host invalidated the task on the ledger
    assert!(net.ledger.get_running_task(&task_id).await.unwrap().is_none());
    client.close().await;
    net.stop_host().await.unwrap();
}

#[tokio::test]
async fn test_http_forward_with_commitment() {
    let mut net = network(Arc::new(EchoExecutor)).await;
    let input = b"over http";
    let commitment = keys::commitment(input);
    let task_id = net
        .ledger
        .submit_task(&net.owner.address(), &TASK, &net.host.address(), &net.broker.tower(), &commitment)
        .await
        .unwrap();
    let frame = envelope::encode(&task_id, &net.host.public_key(), input, &net.owner).unwrap();

    let err = session::post_forward(&net.tower_url, &net.owner.address(), &frame, Some(Hash32([1u8; 32])))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Relay(ref fault) if fault.kind == FaultKind::Commitment));

    let reply = session::post_forward(&net.tower_url, &net.owner.address(), &frame, Some(commitment))
        .await
        .unwrap();
    let opened = envelope::decode(&reply, &net.host.address(), net.owner.secret()).unwrap();
    assert_eq!(opened.payload, input);
    let running = net.ledger.get_running_task(&task_id).await.unwrap().unwrap();
    envelope::verify_commitment(&opened.payload, &running.output_hash).unwrap();
    net.stop_host().await.unwrap();
}

#[tokio::test]
async fn test_forward_to_absent_host() {
    let mut net = network(Arc::new(EchoExecutor)).await;
    net.stop_host().await.unwrap();
    for _ in 0..250 {
        if false == net.broker.is_connected(&net.host.address()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let candidate = matcher::candidates_for(net.ledger.as_ref(), &TASK).await.unwrap().remove(0);
    let err = net.submitter().run(&TASK, &candidate, b"nobody home").await.unwrap_err();
    match err {
        SessionError::Relay(fault) => assert_eq!(fault.kind, FaultKind::Liveness),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_task_clears_submitter() {
    struct Stall;

    #[async_trait::async_trait]
    impl TaskExecutor for Stall {
        async fn execute(&self, _: &Hash32, _: Vec<u8>) -> anyhow::Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    let net = network(Arc::new(Stall)).await;
    let candidate = matcher::candidates_for(net.ledger.as_ref(), &TASK).await.unwrap().remove(0);
    let ledger = net.ledger.clone();
    let expire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ledger.advance_blocks(100);
    });

    let outcome = net.submitter().run(&TASK, &candidate, b"slow").await.unwrap();
    assert!(matches!(outcome, Outcome::Cleared { .. }));
    expire.await.unwrap();
}
