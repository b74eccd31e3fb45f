//! End-to-end scenarios against an in-memory central system

use std::sync::Arc;
use std::time::Duration;

use cpsim_core::frame_log::{Direction, LogFilter};
use cpsim_core::ocpp::{ErrorCode, Frame, FrameKind};
use cpsim_core::transport::{MemoryAcceptor, MemoryPeer, MemoryTransport, NORMAL_CLOSURE};
use cpsim_core::{
    ChargePoint, ChargePointRegistry, ConnectionState, EngineError, MemoryStore, SessionPhase,
    SimulatorConfig, StateStore,
};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const TRANSACTION_ID: i64 = 777;

/// Central system side that answers the charge point's calls with canned replies
struct Csms {
    peer: MemoryPeer,
}

impl Csms {
    fn canned_reply(action: &str) -> Value {
        match action {
            "Authorize" => json!({"idTagInfo": {"status": "Accepted"}}),
            "StartTransaction" => {
                json!({"transactionId": TRANSACTION_ID, "idTagInfo": {"status": "Accepted"}})
            }
            "BootNotification" => json!({
                "currentTime": "2026-01-01T00:00:00Z",
                "interval": 300,
                "status": "Accepted"
            }),
            _ => json!({}),
        }
    }

    /// Answer calls until a frame satisfies `done`; returns that frame
    async fn serve_until(&mut self, done: impl Fn(&Frame) -> bool) -> Frame {
        loop {
            let frame = timeout(Duration::from_secs(10), self.peer.next_frame())
                .await
                .expect("frame within 10 s")
                .expect("channel open");
            if done(&frame) {
                return frame;
            }
            if let Frame::Call { id, action, .. } = &frame {
                self.peer.reply(id, Self::canned_reply(action)).await;
            }
        }
    }

    /// Answer calls until one for `action` arrives; returns its id and payload unanswered
    async fn expect_call(&mut self, action: &str) -> (String, Value) {
        let wanted = action.to_string();
        match self
            .serve_until(|frame| matches!(frame, Frame::Call { action, .. } if *action == wanted))
            .await
        {
            Frame::Call { id, payload, .. } => (id, payload),
            other => panic!("Expected {} call, got {:?}", action, other),
        }
    }
}

async fn charge_point(cp_id: &str) -> (ChargePoint, MemoryAcceptor) {
    let (transport, acceptor) = MemoryTransport::new();
    let cp = ChargePoint::builder(SimulatorConfig::new(cp_id, "ws://csms.local/ocpp"))
        .transport(Arc::new(transport))
        .build()
        .await
        .unwrap();
    (cp, acceptor)
}

async fn connect(cp: &ChargePoint, acceptor: &mut MemoryAcceptor) -> Csms {
    let cp2 = cp.clone();
    let connecting = tokio::spawn(async move { cp2.connect().await });
    let peer = acceptor.accept().await.unwrap();
    peer.open().await;
    connecting.await.unwrap().unwrap();
    Csms { peer }
}

async fn wait_for_phase(cp: &ChargePoint, phase: SessionPhase) {
    let mut states = cp.watch_transaction();
    timeout(Duration::from_secs(10), async {
        while states.borrow_and_update().phase != phase {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("phase reached");
}

#[tokio::test]
async fn local_session_start_and_stop() {
    let (cp, mut acceptor) = charge_point("CP-LOCAL").await;
    let mut csms = connect(&cp, &mut acceptor).await;

    let cp2 = cp.clone();
    let start = tokio::spawn(async move { cp2.start_session().await });
    let (id, payload) = csms.expect_call("Authorize").await;
    assert_eq!(payload["idTag"], "DEMO1234");
    csms.peer.reply(&id, Csms::canned_reply("Authorize")).await;

    let (id, payload) = csms.expect_call("StartTransaction").await;
    assert_eq!(payload["connectorId"], 1);
    let meter_start = payload["meterStart"].as_u64().unwrap();
    csms.peer.reply(&id, Csms::canned_reply("StartTransaction")).await;
    assert_eq!(assert_ok!(start.await.unwrap()), TRANSACTION_ID);

    let (id, payload) = csms.expect_call("StatusNotification").await;
    assert_eq!(payload["status"], "Charging");
    csms.peer.reply(&id, json!({})).await;

    let state = cp.transaction_state();
    assert_eq!(state.phase, SessionPhase::Charging);
    assert_eq!(state.transaction_id, Some(TRANSACTION_ID));

    let cp2 = cp.clone();
    let stop = tokio::spawn(async move { cp2.stop_session().await });
    let (id, payload) = csms.expect_call("StopTransaction").await;
    assert_eq!(payload["transactionId"], TRANSACTION_ID);
    assert!(payload["meterStop"].as_u64().unwrap() >= meter_start);
    csms.peer.reply(&id, json!({})).await;
    assert_ok!(stop.await.unwrap());

    let (_, payload) = csms.expect_call("StatusNotification").await;
    assert_eq!(payload["status"], "Available");
    assert_eq!(cp.transaction_state().phase, SessionPhase::Idle);
    assert_eq!(cp.transaction_state().transaction_id, None);
}

#[tokio::test]
async fn remote_start_is_accepted_and_starts_charging() {
    let (cp, mut acceptor) = charge_point("CP-REMOTE").await;
    let mut csms = connect(&cp, &mut acceptor).await;

    csms.peer
        .send_text(r#"[2,"x1","RemoteStartTransaction",{"idTag":"ABC"}]"#)
        .await;

    let mut authorized_tag = None;
    let reply = loop {
        let frame = csms.serve_until(|frame| frame.id() == "x1" || frame.action() == "Authorize").await;
        match frame {
            Frame::Call { id, payload, .. } => {
                authorized_tag = payload["idTag"].as_str().map(str::to_string);
                csms.peer.reply(&id, Csms::canned_reply("Authorize")).await;
            }
            reply => break reply,
        }
    };

    assert_eq!(authorized_tag.as_deref(), Some("ABC"));
    assert_eq!(reply, Frame::result("x1", json!({"status": "Accepted"})));
    wait_for_phase(&cp, SessionPhase::Charging).await;
    assert_eq!(cp.transaction_state().id_tag, "ABC");

    // Remote stop for the wrong transaction is rejected, for the right one accepted
    csms.peer
        .send_text(r#"[2,"x2","RemoteStopTransaction",{"transactionId":1}]"#)
        .await;
    let reply = csms.serve_until(|frame| frame.id() == "x2").await;
    assert_eq!(reply, Frame::result("x2", json!({"status": "Rejected"})));

    csms.peer
        .send_text(r#"[2,"x3","RemoteStopTransaction",{"transactionId":777}]"#)
        .await;
    let reply = csms.serve_until(|frame| frame.id() == "x3").await;
    assert_eq!(reply, Frame::result("x3", json!({"status": "Accepted"})));
    wait_for_phase(&cp, SessionPhase::Idle).await;
}

#[tokio::test]
async fn unknown_action_gets_not_implemented() {
    let (cp, mut acceptor) = charge_point("CP-UNKNOWN").await;
    let mut csms = connect(&cp, &mut acceptor).await;

    csms.peer.send_text(r#"[2,"f1","Foo",{}]"#).await;
    let reply = csms.serve_until(|frame| frame.id() == "f1").await;
    match reply {
        Frame::CallError { code, .. } => assert_eq!(code, ErrorCode::NotImplemented),
        other => panic!("Expected CALLERROR, got {:?}", other),
    }

    // Malformed input is logged and does not drop the connection
    csms.peer.send_text("not json").await;
    csms.peer.send_text(r#"[2,"f2","Reset",{"type":"Soft"}]"#).await;
    let reply = csms.serve_until(|frame| frame.id() == "f2").await;
    assert_eq!(reply, Frame::result("f2", json!({"status": "Accepted"})));
    assert_eq!(cp.connection_state(), ConnectionState::Connected);

    let parse_errors = cp
        .filtered_frames(LogFilter {
            kind: Some(FrameKind::ParseErr),
            ..Default::default()
        })
        .await;
    assert_eq!(parse_errors.len(), 1);
    assert_eq!(parse_errors[0].direction, Direction::In);
}

#[tokio::test]
async fn pending_calls_fail_when_the_channel_closes() {
    let (cp, mut acceptor) = charge_point("CP-DRAIN").await;
    let mut csms = connect(&cp, &mut acceptor).await;

    let cp2 = cp.clone();
    let heartbeat = tokio::spawn(async move { cp2.send_heartbeat().await });
    csms.expect_call("Heartbeat").await;

    let cp2 = cp.clone();
    let authorize = tokio::spawn(async move { cp2.authorize(None).await });
    csms.expect_call("Authorize").await;

    csms.peer.close(NORMAL_CLOSURE, "bye").await;

    assert!(matches!(heartbeat.await.unwrap(), Err(EngineError::ConnectionClosed)));
    assert!(matches!(authorize.await.unwrap(), Err(EngineError::ConnectionClosed)));
    assert_eq!(cp.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        assert_err!(cp.send_heartbeat().await),
        EngineError::NotConnected
    ));

    // The charge point can reconnect after a drop
    let _csms = connect(&cp, &mut acceptor).await;
    assert_eq!(cp.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn session_survives_in_store_across_instances() {
    let (transport, mut acceptor) = MemoryTransport::new();
    let store = Arc::new(MemoryStore::new());
    let config = SimulatorConfig::new("CP-STORE", "ws://csms.local/ocpp");

    let cp = ChargePoint::builder(config.clone())
        .transport(Arc::new(transport.clone()))
        .store(store.clone())
        .build()
        .await
        .unwrap();
    cp.update_runtime(|runtime| runtime.id_tag = "STORED".into());

    let mut csms = connect(&cp, &mut acceptor).await;
    let cp2 = cp.clone();
    let boot = tokio::spawn(async move { cp2.boot_notification().await });
    let (id, _) = csms.expect_call("BootNotification").await;
    csms.peer.reply(&id, Csms::canned_reply("BootNotification")).await;
    boot.await.unwrap().unwrap();

    // Wait for the persister to catch up with the boot reply
    let mut saved = None;
    for _ in 0..200 {
        if let Some(state) = store.load_state("CP-STORE").unwrap() {
            if state.frames.len() >= 2 && state.runtime.id_tag == "STORED" {
                saved = Some(state);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saved.is_some());
    cp.disconnect().await;
    drop(cp);

    let restored = ChargePoint::builder(config)
        .transport(Arc::new(transport))
        .store(store)
        .build()
        .await
        .unwrap();
    assert_eq!(restored.runtime().id_tag, "STORED");
    let boots = restored
        .filtered_frames(LogFilter {
            query: "bootnotification".into(),
            ..Default::default()
        })
        .await;
    assert!(!boots.is_empty());
}

#[tokio::test]
async fn registry_runs_independent_charge_points() {
    let (transport, mut acceptor) = MemoryTransport::new();
    let mut registry = ChargePointRegistry::new(Arc::new(transport));

    let a = registry
        .add(Some("Left".into()), SimulatorConfig::new("CP-A", "ws://csms.local/ocpp"))
        .await
        .unwrap();
    let b = registry
        .add(Some("Right".into()), SimulatorConfig::new("CP-B", "ws://csms.local/ocpp"))
        .await
        .unwrap();

    let cp_a = registry.get(&a).unwrap().clone();
    let cp_b = registry.get(&b).unwrap().clone();
    let mut csms_a = connect(&cp_a, &mut acceptor).await;
    assert_eq!(csms_a.peer.url(), "ws://csms.local/ocpp/CP-A");

    // B stays offline while A talks
    let cp2 = cp_a.clone();
    let heartbeat = tokio::spawn(async move { cp2.send_heartbeat().await });
    let (id, _) = csms_a.expect_call("Heartbeat").await;
    csms_a.peer.reply(&id, json!({"currentTime": "2026-01-01T00:00:00Z"})).await;
    heartbeat.await.unwrap().unwrap();

    assert_eq!(cp_b.connection_state(), ConnectionState::Disconnected);
    assert!(cp_b.frame_log().await.is_empty());

    registry.remove(&a).await.unwrap();
    assert_eq!(cp_a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(registry.ids(), vec![b]);
}
