//! Mock transport for testing
//!
//! `MockTransport` implements every transport trait in memory. In scripted
//! mode nothing happens unless the test makes it happen; in simulated mode
//! the mock plays the access point, resolver, hub and provisioning service.

use crate::session::topics::query_param;
use crate::transport::{
    BrokerEvent, BrokerLink, ConnectRequest, Link, LinkEvent, OutboundMessage, Resolver, Socket,
    Subscription, TransportError, TransportState, WifiCredentials,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Behaviour of the in-process cloud used by `MockTransport::simulated`
#[derive(Debug, Clone)]
pub struct Simulation {
    pub device_ip: Ipv4Addr,
    pub broker_ip: IpAddr,
    /// Desired section served to twin GET requests
    pub desired: Value,
    pub desired_version: i64,
    /// Hub handed out by the simulated provisioning service
    pub assigned_hub: String,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            device_ip: Ipv4Addr::new(192, 168, 1, 50),
            broker_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            desired: json!({
                "telemetryInterval": 10,
                "led_y": 1,
            }),
            desired_version: 1,
            assigned_hub: "sim-hub.azure-devices.net".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct MockTransport {
    state: TransportState,
    link_events: VecDeque<LinkEvent>,
    broker_events: VecDeque<BrokerEvent>,
    dns_answer: Option<IpAddr>,
    resolved: Option<IpAddr>,
    fail_next_connect: Option<String>,
    fail_next_associate: bool,
    fail_next_resolve: bool,
    simulation: Option<Simulation>,
    reported_version: i64,
    client_id: Option<String>,

    associations: Vec<WifiCredentials>,
    resolve_requests: Vec<String>,
    socket_connects: Vec<(SocketAddr, String)>,
    connects: Vec<ConnectRequest>,
    subscriptions: Vec<Vec<Subscription>>,
    published: Vec<OutboundMessage>,
    close_calls: usize,
    released: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: TransportState::NotASocket,
            link_events: VecDeque::new(),
            broker_events: VecDeque::new(),
            dns_answer: None,
            resolved: None,
            fail_next_connect: None,
            fail_next_associate: false,
            fail_next_resolve: false,
            simulation: None,
            reported_version: 1,
            client_id: None,
            associations: Vec::new(),
            resolve_requests: Vec::new(),
            socket_connects: Vec::new(),
            connects: Vec::new(),
            subscriptions: Vec::new(),
            published: Vec::new(),
            close_calls: 0,
            released: 0,
        }
    }

    pub fn simulated() -> Self {
        Self::with_simulation(Simulation::default())
    }

    pub fn with_simulation(simulation: Simulation) -> Self {
        Self {
            dns_answer: Some(simulation.broker_ip),
            simulation: Some(simulation),
            ..Self::new()
        }
    }

    // Scripting

    pub fn push_link_event(&mut self, event: LinkEvent) {
        self.link_events.push_back(event);
    }

    /// Queue AP association followed by a DHCP lease
    pub fn link_up(&mut self) {
        self.push_link_event(LinkEvent::ApConnected);
        self.push_link_event(LinkEvent::IpAssigned(Ipv4Addr::new(192, 168, 1, 50)));
    }

    /// Answer every resolve request with `address`
    pub fn resolve_to(&mut self, address: IpAddr) {
        self.dns_answer = Some(address);
    }

    /// Leave resolve requests unanswered
    pub fn resolve_never(&mut self) {
        self.dns_answer = None;
    }

    pub fn complete_connect(&mut self) {
        if self.state == TransportState::Connecting {
            self.state = TransportState::Connected;
        }
    }

    pub fn fail_next_connect(&mut self) {
        self.fail_next_connect_with("TLS handshake refused");
    }

    pub fn fail_next_connect_with<S: Into<String>>(&mut self, message: S) {
        self.fail_next_connect = Some(message.into());
    }

    pub fn fail_next_associate(&mut self) {
        self.fail_next_associate = true;
    }

    pub fn fail_next_resolve(&mut self) {
        self.fail_next_resolve = true;
    }

    pub fn accept_session(&mut self) {
        self.broker_events.push_back(BrokerEvent::ConnAck {
            accepted: true,
            code: 0,
        });
    }

    pub fn reject_session(&mut self, code: u8) {
        self.broker_events
            .push_back(BrokerEvent::ConnAck { accepted: false, code });
    }

    pub fn deliver<S: Into<String>>(&mut self, topic: S, payload: impl Into<Bytes>) {
        self.broker_events.push_back(BrokerEvent::Message {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn disconnect_broker(&mut self) {
        self.broker_events.push_back(BrokerEvent::Disconnected);
    }

    /// Peer closed the socket underneath the session
    pub fn drop_connection(&mut self) {
        if self.state != TransportState::NotASocket {
            self.state = TransportState::Closed;
        }
        self.broker_events.clear();
    }

    pub fn set_state(&mut self, state: TransportState) {
        self.state = state;
    }

    // Inspection

    pub fn associations(&self) -> &[WifiCredentials] {
        &self.associations
    }

    pub fn resolve_requests(&self) -> &[String] {
        &self.resolve_requests
    }

    pub fn socket_connects(&self) -> &[(SocketAddr, String)] {
        &self.socket_connects
    }

    pub fn connects(&self) -> &[ConnectRequest] {
        &self.connects
    }

    pub fn subscriptions(&self) -> &[Vec<Subscription>] {
        &self.subscriptions
    }

    pub fn published(&self) -> &[OutboundMessage] {
        &self.published
    }

    pub fn published_to(&self, topic_prefix: &str) -> Vec<&OutboundMessage> {
        self.published
            .iter()
            .filter(|message| message.topic.starts_with(topic_prefix))
            .collect()
    }

    pub fn take_published(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.published)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    /// Close calls that actually released a descriptor
    pub fn released(&self) -> usize {
        self.released
    }

    fn simulate_reply(&mut self, message: &OutboundMessage) {
        let Some(simulation) = &self.simulation else {
            return;
        };
        let rid = query_param(&message.topic, "$rid").unwrap_or("0").to_string();

        let reply = if message.topic.starts_with("$iothub/twin/GET/") {
            let mut desired = simulation.desired.clone();
            if let Value::Object(map) = &mut desired {
                map.insert("$version".to_string(), json!(simulation.desired_version));
            }
            Some((
                format!("$iothub/twin/res/200/?$rid={rid}"),
                json!({ "desired": desired, "reported": { "$version": self.reported_version } })
                    .to_string(),
            ))
        } else if message.topic.starts_with("$iothub/twin/PATCH/properties/reported/") {
            self.reported_version += 1;
            Some((
                format!(
                    "$iothub/twin/res/204/?$rid={rid}&$version={}",
                    self.reported_version
                ),
                String::new(),
            ))
        } else if message.topic.starts_with("$dps/registrations/PUT/") {
            Some((
                format!("$dps/registrations/res/202/?$rid={rid}&retry-after=1"),
                json!({ "operationId": "sim-operation", "status": "assigning" }).to_string(),
            ))
        } else if message.topic.starts_with("$dps/registrations/GET/") {
            Some((
                format!("$dps/registrations/res/200/?$rid={rid}"),
                json!({
                    "operationId": "sim-operation",
                    "status": "assigned",
                    "registrationState": {
                        "assignedHub": simulation.assigned_hub,
                        "deviceId": self.client_id.clone().unwrap_or_default(),
                    }
                })
                .to_string(),
            ))
        } else {
            None
        };

        if let Some((topic, payload)) = reply {
            self.deliver(topic, payload);
        }
    }
}

impl Link for MockTransport {
    fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError> {
        self.associations.push(credentials.clone());
        if std::mem::take(&mut self.fail_next_associate) {
            return Err(TransportError::Association("radio busy".to_string()));
        }
        if let Some(simulation) = &self.simulation {
            let device_ip = simulation.device_ip;
            self.push_link_event(LinkEvent::ApConnected);
            self.push_link_event(LinkEvent::IpAssigned(device_ip));
        }
        Ok(())
    }

    fn poll_link_event(&mut self) -> Option<LinkEvent> {
        self.link_events.pop_front()
    }
}

impl Resolver for MockTransport {
    fn resolve(&mut self, host: &str) -> Result<(), TransportError> {
        self.resolve_requests.push(host.to_string());
        if std::mem::take(&mut self.fail_next_resolve) {
            return Err(TransportError::Resolve {
                host: host.to_string(),
            });
        }
        if let Some(address) = self.dns_answer {
            self.resolved = Some(address);
        }
        Ok(())
    }

    fn take_resolved(&mut self) -> Option<IpAddr> {
        self.resolved.take()
    }
}

impl Socket for MockTransport {
    fn state(&mut self) -> TransportState {
        if self.simulation.is_some() && self.state == TransportState::Connecting {
            self.state = TransportState::Connected;
        }
        self.state
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.state != TransportState::NotASocket {
            return Err(TransportError::Socket("descriptor already allocated".to_string()));
        }
        self.state = TransportState::Closed;
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr, server_name: &str) -> Result<(), TransportError> {
        if let Some(message) = self.fail_next_connect.take() {
            return Err(TransportError::Socket(message));
        }
        if self.state != TransportState::Closed {
            return Err(TransportError::Socket(format!(
                "cannot connect from {:?}",
                self.state
            )));
        }
        self.socket_connects.push((addr, server_name.to_string()));
        self.state = TransportState::Connecting;
        Ok(())
    }

    fn close(&mut self) {
        self.close_calls += 1;
        if self.state != TransportState::NotASocket {
            self.released += 1;
        }
        self.state = TransportState::NotASocket;
        self.broker_events.clear();
        self.resolved = None;
    }
}

impl BrokerLink for MockTransport {
    fn send_connect(&mut self, request: &ConnectRequest) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected { state: self.state });
        }
        self.connects.push(request.clone());
        self.client_id = Some(request.client_id.clone());
        if self.simulation.is_some() {
            self.accept_session();
        }
        Ok(())
    }

    fn send_subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected { state: self.state });
        }
        self.subscriptions.push(subscriptions.to_vec());
        if self.simulation.is_some() {
            self.broker_events.push_back(BrokerEvent::SubAck {
                granted: subscriptions.len(),
            });
        }
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected { state: self.state });
        }
        self.published.push(message.clone());
        self.simulate_reply(message);
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<BrokerEvent>, TransportError> {
        if !self.state.is_connected() {
            return Ok(None);
        }
        Ok(self.broker_events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QoS;

    #[test]
    fn test_scripted_socket_lifecycle() {
        let mut transport = MockTransport::new();
        assert_eq!(transport.state(), TransportState::NotASocket);

        transport.open().unwrap();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8883);
        transport.connect(addr, "hub").unwrap();
        assert_eq!(transport.state(), TransportState::Connecting);

        transport.complete_connect();
        assert_eq!(transport.state(), TransportState::Connected);

        transport.close();
        transport.close();
        assert_eq!(transport.close_calls(), 2);
        assert_eq!(transport.released(), 1);
    }

    #[test]
    fn test_simulated_twin_get_reply() {
        let mut transport = MockTransport::simulated();
        transport.set_state(TransportState::Connected);
        transport
            .publish(&OutboundMessage::new(
                "$iothub/twin/GET/?$rid=initial_get",
                Bytes::new(),
                QoS::AtMostOnce,
            ))
            .unwrap();

        match transport.poll_event().unwrap() {
            Some(BrokerEvent::Message { topic, payload }) => {
                assert_eq!(topic, "$iothub/twin/res/200/?$rid=initial_get");
                let doc: Value = serde_json::from_slice(&payload).unwrap();
                assert_eq!(doc["desired"]["$version"], json!(1));
                assert_eq!(doc["desired"]["telemetryInterval"], json!(10));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
