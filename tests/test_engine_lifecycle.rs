//! Connection lifecycle behaviour driven through the public engine API
//!
//! The scripted `MockTransport` only does what each test tells it to, so
//! every stage transition here is explicit.

use cloudsync::config::TimingConfig;
use cloudsync::engine::{
    ConnectionEngine, EngineError, EngineEvent, NetworkingFlags, SessionState, TimeoutKind,
};
use cloudsync::session::{
    BrokerEndpoint, HubSession, ProvisioningSession, SessionError, SessionSignal,
};
use cloudsync::testing::MockTransport;
use cloudsync::transport::{
    LinkEvent, OutboundMessage, QoS, Socket, TransportState, WifiCredentials,
};
use bytes::Bytes;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn new_engine() -> ConnectionEngine<MockTransport> {
    let mut transport = MockTransport::new();
    transport.resolve_to(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    ConnectionEngine::new(
        transport,
        Box::new(HubSession::new(
            BrokerEndpoint::new("hub.example.net", 8883),
            "sensor-1",
            None,
        )),
        WifiCredentials::parse("home,secret").unwrap(),
        &TimingConfig::default(),
    )
}

/// Walk the engine from reset to an accepted session, collecting events
fn connect(engine: &mut ConnectionEngine<MockTransport>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    engine.reset();
    engine.transport_mut().link_up();

    // link events + resolve request, resolved, socket open, socket connect
    for _ in 0..4 {
        events.extend(engine.poll());
    }
    engine.transport_mut().complete_connect();
    events.extend(engine.poll()); // CONNECT
    engine.transport_mut().accept_session();
    events.extend(engine.poll()); // CONNACK
    events
}

#[test]
fn test_connect_sends_exactly_one_subscribe() {
    let mut engine = new_engine();
    let events = connect(&mut engine);

    assert!(engine.is_connected());
    assert!(events.contains(&EngineEvent::Connected));
    assert_eq!(engine.transport().connects().len(), 1);
    assert_eq!(engine.transport().subscriptions().len(), 1);
    assert!(!engine.timers().is_armed(TimeoutKind::Session));
    assert!(!engine.timers().is_armed(TimeoutKind::CloudReset));

    let flags = engine.flags();
    for stage in [
        NetworkingFlags::AP,
        NetworkingFlags::IP,
        NetworkingFlags::HOST_IP,
        NetworkingFlags::SESSION,
    ] {
        assert!(flags.contains(stage));
    }

    // Further ticks service the session without re-subscribing
    for _ in 0..5 {
        engine.poll();
    }
    assert_eq!(engine.transport().subscriptions().len(), 1);
}

#[test]
fn test_connect_request_identifies_device() {
    let mut engine = new_engine();
    connect(&mut engine);

    let request = &engine.transport().connects()[0];
    assert_eq!(request.client_id, "sensor-1");
    assert_eq!(
        request.username,
        "hub.example.net/sensor-1/?api-version=2021-04-12"
    );
    assert!(engine
        .transport()
        .published()
        .iter()
        .any(|m| m.topic == "$iothub/twin/GET/?$rid=initial_get"));
}

#[test]
fn test_ap_loss_forces_disconnect_and_reset() {
    let mut engine = new_engine();
    connect(&mut engine);
    let associations = engine.transport().associations().len();

    engine.transport_mut().push_link_event(LinkEvent::ApLost);
    let events = engine.poll();

    assert_eq!(engine.session_state(), SessionState::Disconnected);
    assert!(!engine.is_connected());
    assert_eq!(
        events,
        vec![
            EngineEvent::Disconnected,
            EngineEvent::Reset {
                reason: "prerequisites lost"
            }
        ]
    );
    assert_eq!(engine.transport_mut().state(), TransportState::NotASocket);
    assert_eq!(engine.transport().associations().len(), associations + 1);
    assert!(engine.timers().is_armed(TimeoutKind::Wifi));
}

#[test]
fn test_ip_loss_via_direct_notification() {
    let mut engine = new_engine();
    connect(&mut engine);

    engine.on_link_event(LinkEvent::IpLost);
    let events = engine.poll();

    assert!(events.contains(&EngineEvent::Disconnected));
    assert_eq!(engine.ip_address(), None);
}

#[test]
fn test_socket_drop_resets_session() {
    let mut engine = new_engine();
    connect(&mut engine);

    engine.transport_mut().drop_connection();
    let events = engine.poll();

    assert!(events.contains(&EngineEvent::Reset {
        reason: "transport lost"
    }));
    assert_eq!(engine.session_state(), SessionState::Disconnected);
}

#[test]
fn test_broker_disconnect_resets_session() {
    let mut engine = new_engine();
    connect(&mut engine);

    engine.transport_mut().disconnect_broker();
    let events = engine.poll();

    assert!(events.contains(&EngineEvent::Disconnected));
    assert!(events.contains(&EngineEvent::Reset {
        reason: "broker disconnected"
    }));
}

#[test]
fn test_reset_twice_matches_reset_once() {
    let mut engine = new_engine();
    connect(&mut engine);
    let released = engine.transport().released();

    engine.reset();
    let once = engine.status();
    engine.reset();
    let twice = engine.status();

    assert_eq!(once, twice);
    assert_eq!(twice.transport, TransportState::NotASocket);
    assert_eq!(twice.session, SessionState::Disconnected);
    assert!(twice.flags.is_empty());
    // only the first reset had a socket to release
    assert_eq!(engine.transport().released(), released + 1);
}

#[test]
fn test_session_timeout_without_connack() {
    let mut engine = new_engine();
    engine.reset();
    engine.transport_mut().link_up();
    for _ in 0..4 {
        engine.poll();
    }
    engine.transport_mut().complete_connect();
    engine.poll();
    assert_eq!(engine.session_state(), SessionState::Connecting);
    assert!(engine.timers().is_armed(TimeoutKind::Session));

    // 30 s at 500 ms per tick
    let mut events = Vec::new();
    for _ in 0..60 {
        events.extend(engine.poll());
    }
    assert!(events.contains(&EngineEvent::Reset {
        reason: "session timeout"
    }));
    assert_eq!(engine.session_state(), SessionState::Disconnected);
}

#[test]
fn test_rejected_session_marks_error() {
    let mut engine = new_engine();
    engine.reset();
    engine.transport_mut().link_up();
    for _ in 0..4 {
        engine.poll();
    }
    engine.transport_mut().complete_connect();
    engine.poll();

    engine.transport_mut().reject_session(5);
    engine.poll();

    assert!(!engine.is_connected());
    assert!(engine.flags().contains(NetworkingFlags::ERROR));
    assert!(engine.last_error().unwrap().contains("code 5"));
}

#[test]
fn test_wifi_timeout_without_link_resets() {
    let mut engine = new_engine();
    engine.reset();

    // 5 s at 500 ms per tick, nothing ever associates
    let mut events = Vec::new();
    for _ in 0..10 {
        events.extend(engine.poll());
    }
    assert!(events.contains(&EngineEvent::Reset {
        reason: "wifi timeout"
    }));
    assert_eq!(engine.transport().associations().len(), 2);
}

#[test]
fn test_external_timer_signal_is_honoured() {
    let mut engine = new_engine();
    engine.reset();
    engine.poll();

    let handle = engine.timer_handle();
    handle.fire(TimeoutKind::Wifi);
    let events = engine.poll();

    assert!(events.contains(&EngineEvent::Reset {
        reason: "wifi timeout"
    }));
    assert!(!handle.is_pending(TimeoutKind::Wifi));
}

#[test]
fn test_publish_only_on_live_session() {
    let mut engine = new_engine();
    let message = OutboundMessage::new(
        "devices/sensor-1/messages/events/",
        Bytes::from_static(b"{}"),
        QoS::AtLeastOnce,
    );

    assert_eq!(
        engine.publish(&message),
        Err(EngineError::NotConnected {
            state: SessionState::Disconnected
        })
    );

    connect(&mut engine);
    assert!(engine.publish(&message).is_ok());
    assert!(engine
        .transport()
        .published()
        .iter()
        .any(|m| m.topic == "devices/sensor-1/messages/events/"));
}

#[test]
fn test_install_session_reconnects_with_new_identity() {
    let mut engine = new_engine();
    connect(&mut engine);

    engine.install_session(Box::new(ProvisioningSession::new(
        BrokerEndpoint::new("dps.example.net", 8883),
        "0ne00ABC123".to_string(),
        "sensor-1".to_string(),
        None,
        Duration::from_millis(500),
    )));
    let events = engine.poll();

    assert_eq!(engine.session_name(), "provisioning");
    assert!(events.contains(&EngineEvent::Reset {
        reason: "session replaced"
    }));
}

#[test]
fn test_failed_registration_resets_after_delay() {
    let mut engine = new_engine();
    engine.install_session(Box::new(ProvisioningSession::new(
        BrokerEndpoint::new("dps.example.net", 8883),
        "0ne00ABC123".to_string(),
        "sensor-1".to_string(),
        None,
        Duration::from_millis(500),
    )));
    connect(&mut engine);
    assert!(engine.is_connected());
    let associations = engine.transport().associations().len();

    engine.transport_mut().deliver(
        "$dps/registrations/res/200/?$rid=1",
        Bytes::from_static(
            br#"{"operationId":"op1","status":"failed","registrationState":{"errorMessage":"denied"}}"#,
        ),
    );
    let events = engine.poll();

    assert!(events.contains(&EngineEvent::Inbound(SessionSignal::Failed(
        SessionError::RegistrationFailed {
            status: "failed".to_string()
        }
    ))));
    assert!(events.contains(&EngineEvent::Disconnected));
    assert!(events.contains(&EngineEvent::Reset {
        reason: "session failed"
    }));
    assert_eq!(engine.session_state(), SessionState::Disconnected);
    assert!(engine.timers().is_armed(TimeoutKind::CloudReset));

    // Association waits for the 2 s reset delay
    for _ in 0..3 {
        engine.poll();
    }
    assert_eq!(engine.transport().associations().len(), associations);
    engine.poll();
    assert_eq!(engine.transport().associations().len(), associations + 1);
}

#[test]
fn test_ip_reported_once_per_assignment() {
    let mut engine = new_engine();
    connect(&mut engine);

    assert!(engine.needs_ip_report());
    engine.mark_reported();
    assert!(!engine.needs_ip_report());

    engine.on_link_event(LinkEvent::IpAssigned(Ipv4Addr::new(192, 168, 1, 77)));
    assert!(engine.needs_ip_report());
    assert_eq!(engine.ip_address(), Some(Ipv4Addr::new(192, 168, 1, 77)));
}

#[derive(Debug, Clone)]
enum Op {
    Poll,
    LinkUp,
    ApLost,
    IpLost,
    CompleteConnect,
    AcceptSession,
    DropConnection,
    DisconnectBroker,
    FailNextConnect,
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Poll),
        1 => Just(Op::LinkUp),
        1 => Just(Op::ApLost),
        1 => Just(Op::IpLost),
        1 => Just(Op::CompleteConnect),
        1 => Just(Op::AcceptSession),
        1 => Just(Op::DropConnection),
        1 => Just(Op::DisconnectBroker),
        1 => Just(Op::FailNextConnect),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn prop_session_never_outlives_transport(ops in proptest::collection::vec(op(), 1..200)) {
        let mut engine = new_engine();
        engine.reset();

        for op in ops {
            match op {
                Op::Poll => {
                    engine.poll();
                    let status = engine.status();
                    if status.session != SessionState::Disconnected {
                        prop_assert_eq!(status.transport, TransportState::Connected);
                    }
                    if status.session == SessionState::Connected {
                        prop_assert!(status.flags.contains(NetworkingFlags::AP));
                        prop_assert!(status.flags.contains(NetworkingFlags::IP));
                        prop_assert!(status.flags.contains(NetworkingFlags::HOST_IP));
                        prop_assert!(status.flags.contains(NetworkingFlags::SESSION));
                    }
                    prop_assert!(status.flags.prerequisites_hold());
                }
                Op::LinkUp => engine.transport_mut().link_up(),
                Op::ApLost => engine.transport_mut().push_link_event(LinkEvent::ApLost),
                Op::IpLost => engine.transport_mut().push_link_event(LinkEvent::IpLost),
                Op::CompleteConnect => engine.transport_mut().complete_connect(),
                Op::AcceptSession => engine.transport_mut().accept_session(),
                Op::DropConnection => engine.transport_mut().drop_connection(),
                Op::DisconnectBroker => engine.transport_mut().disconnect_broker(),
                Op::FailNextConnect => engine.transport_mut().fail_next_connect(),
                Op::Reset => engine.reset(),
            }
        }
    }
}
