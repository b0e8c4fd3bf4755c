// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end observe scenarios driven with a paused clock.

use lwm2m_coap::ReliabilityHint;
use lwm2m_core::{Attributes, Path, SSID_ANY, Token, Value};
use lwm2m_dm::testing::InMemoryModel;
use lwm2m_observe::testing::TestTransports;
use lwm2m_observe::{
    ConnRef, ObserveAction, ObserveCommand, ObserveConfig, ObserveEngine, ObserveRequest,
    observe_channel,
};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

const SSID_A: u16 = 1;
const SSID_B: u16 = 2;

fn resource() -> Path {
    Path::resource(42, 69, 4)
}

fn token(byte: u8) -> Token {
    Token::new(&[byte]).expect("valid")
}

fn request(byte: u8) -> ObserveRequest {
    ObserveRequest {
        token: token(byte),
        action: ObserveAction::Read,
        paths: vec![resource()],
        accept: None,
    }
}

fn engine_with_one_server() -> (Rc<InMemoryModel>, ObserveEngine<Rc<InMemoryModel>, TestTransports>)
{
    let model = Rc::new(InMemoryModel::new());
    model.add_server(SSID_A);
    let mut transports = TestTransports::new();
    transports.add_connection(ConnRef::primary(SSID_A));
    let engine = ObserveEngine::new(model.clone(), transports, ObserveConfig::default());
    (model, engine)
}

/// Scenario: `pmax = 10` drives periodic notifications, and after a day
/// without a confirmable message the next one is promoted to CON.
#[tokio::test(start_paused = true)]
async fn pmax_notifications_and_daily_confirmable_promotion() {
    let (model, mut engine) = engine_with_one_server();
    model.add_single_resource(resource(), Value::Str("514".into()));
    model.set_resource_attrs(
        resource(),
        SSID_A,
        Attributes {
            pmax: Some(10),
            ..Attributes::default()
        },
    );
    let conn = ConnRef::primary(SSID_A);

    let t0 = Instant::now();
    let response = engine.handle_observe(conn, request(1), t0);
    assert_eq!(response.payload, b"514");
    assert_eq!(
        engine.next_planned_pmax_trigger(Some(SSID_A)),
        Some(t0 + Duration::from_secs(10))
    );

    // After pmax the changed value goes out as NON.
    tokio::time::advance(Duration::from_secs(10)).await;
    let t1 = Instant::now();
    model.set_value(resource(), Value::Str("Hello".into()));
    engine.fire_due(t1);
    {
        let mock = engine.transports_mut().mock(conn);
        assert_eq!(mock.notifications.len(), 1);
        assert_eq!(mock.last_payload_str(), Some("Hello"));
        assert_eq!(
            mock.notifications[0].reliability,
            ReliabilityHint::PreferNonConfirmable
        );
    }
    engine.handle_delivery(conn, Ok(()), t1);
    engine.assert_consistent();

    // Close to a day since the last confirmable message, the next
    // notification is promoted to CON.
    model.set_value(resource(), Value::Str("Hi!".into()));
    tokio::time::advance(Duration::from_secs(86_300)).await;
    let t2 = Instant::now();
    engine.fire_due(t2);
    {
        let mock = engine.transports_mut().mock(conn);
        assert_eq!(mock.notifications.len(), 2);
        assert_eq!(mock.last_payload_str(), Some("Hi!"));
        assert_eq!(
            mock.notifications[1].reliability,
            ReliabilityHint::PreferConfirmable
        );
    }
    engine.handle_delivery(conn, Ok(()), t2);

    // The acknowledged CON advanced last_confirmable: the next one is NON
    // again.
    model.set_value(resource(), Value::Str("again".into()));
    tokio::time::advance(Duration::from_secs(10)).await;
    let t3 = Instant::now();
    engine.fire_due(t3);
    {
        let mock = engine.transports_mut().mock(conn);
        assert_eq!(mock.notifications.len(), 3);
        assert_eq!(
            mock.notifications[2].reliability,
            ReliabilityHint::PreferNonConfirmable
        );
    }
    engine.assert_consistent();
}

/// Scenario: `lt = 69`, `gt = 777`. Only strict threshold crossings notify;
/// landing exactly on a threshold does not.
#[tokio::test(start_paused = true)]
async fn lt_gt_crossings_filter_notifications() {
    let (model, mut engine) = engine_with_one_server();
    model.add_single_resource(resource(), Value::Double(514.0));
    model.set_resource_attrs(
        resource(),
        SSID_A,
        Attributes {
            lt: Some(69.0),
            gt: Some(777.0),
            ..Attributes::default()
        },
    );
    let conn = ConnRef::primary(SSID_A);

    let t0 = Instant::now();
    let response = engine.handle_observe(conn, request(1), t0);
    assert_eq!(response.payload, b"514");

    let sequence = [42.43, 14.7, 695.0, 69.0, 1024.0, 999.0, -69.75];
    for value in sequence {
        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        let sent_before = engine.transports_mut().mock(conn).notifications.len();
        model.set_value(resource(), Value::Double(value));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);
        if engine.transports_mut().mock(conn).notifications.len() > sent_before {
            engine.handle_delivery(conn, Ok(()), now);
        }
        engine.assert_consistent();
    }

    let payloads: Vec<String> = engine
        .transports_mut()
        .mock(conn)
        .notifications
        .iter()
        .map(|record| String::from_utf8_lossy(&record.payload).into_owned())
        .collect();
    assert_eq!(payloads, ["42.43", "695", "1024", "-69.75"]);
}

/// Scenario: two servers, one offline with storing enabled. The offline
/// server accumulates values and flushes them in enqueue order once back
/// online; the online server is notified throughout.
#[tokio::test(start_paused = true)]
async fn storing_across_an_offline_period() {
    let model = Rc::new(InMemoryModel::new());
    model.add_server(SSID_A);
    model.add_server(SSID_B);
    model.add_single_resource(resource(), Value::Str("initial".into()));
    let mut transports = TestTransports::new();
    let conn_a = ConnRef::primary(SSID_A);
    let conn_b = ConnRef::primary(SSID_B);
    transports.add_connection(conn_a);
    transports.add_connection(conn_b);
    transports.state_mut(conn_a).ready = false;
    let mut engine = ObserveEngine::new(model.clone(), transports, ObserveConfig::default());

    let t0 = Instant::now();
    let _ = engine.handle_observe(conn_a, request(1), t0);
    let _ = engine.handle_observe(conn_b, request(2), t0);

    for (step, text) in ["x1", "x2", "x3"].into_iter().enumerate() {
        tokio::time::advance(Duration::from_secs(u64::try_from(step).expect("small") + 1)).await;
        let now = Instant::now();
        model.set_value(resource(), Value::Str(text.into()));
        engine.notify_changed(&resource(), SSID_ANY, true, now);
        engine.fire_due(now);
        // The online server keeps receiving...
        engine.handle_delivery(conn_b, Ok(()), now);
        engine.assert_consistent();
    }
    // ...while the offline one stored everything.
    assert_eq!(engine.transports_mut().mock(conn_b).notifications.len(), 3);
    assert!(engine.transports_mut().mock(conn_a).notifications.is_empty());
    assert!(engine.has_unsent_notifications(Some(SSID_A)));

    // Server A comes back: stored notifications flush in enqueue order.
    engine.transports_mut().state_mut(conn_a).ready = true;
    let now = Instant::now();
    engine.schedule_flush(conn_a, now);
    for _ in 0..3 {
        engine.fire_due(now);
        engine.handle_delivery(conn_a, Ok(()), now);
    }
    let payloads: Vec<String> = engine
        .transports_mut()
        .mock(conn_a)
        .notifications
        .iter()
        .map(|record| String::from_utf8_lossy(&record.payload).into_owned())
        .collect();
    assert_eq!(payloads, ["x1", "x2", "x3"]);
    assert!(!engine.has_unsent_notifications(Some(SSID_A)));
    engine.assert_consistent();
}

/// The async shell routes commands into the engine and answers Observe
/// requests with the initial value.
#[tokio::test(start_paused = true)]
async fn runtime_loop_round_trip() {
    let (model, engine) = engine_with_one_server();
    model.add_single_resource(resource(), Value::Str("514".into()));
    let (handle, rx) = observe_channel(8);

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let _ = tokio::task::spawn_local(engine.run(rx));

            let response = handle
                .observe(ConnRef::primary(SSID_A), request(1))
                .await
                .expect("engine loop alive");
            assert_eq!(response.payload, b"514");

            assert!(handle.send(ObserveCommand::Gc).await);
            assert!(handle.send(ObserveCommand::Shutdown).await);
        })
        .await;
}
