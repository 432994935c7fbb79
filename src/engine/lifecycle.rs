use super::{
    EngineError, NetworkingFlags, RetryBudget, SessionState, TimeoutKind, TimerHandle, Timers,
};
use crate::config::TimingConfig;
use crate::error::sanitize_error_message;
use crate::session::{BrokerSession, Outbox, SessionSignal};
use crate::transport::{
    BrokerEvent, LinkEvent, OutboundMessage, TransportPort, TransportState, WifiCredentials,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on broker events handled in one tick
const MAX_BROKER_EVENTS_PER_TICK: usize = 16;

/// Something the application should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Broker session accepted and subscriptions sent
    Connected,
    /// A previously connected session went away
    Disconnected,
    Reset { reason: &'static str },
    Inbound(SessionSignal),
}

/// Snapshot for indicators and the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub transport: TransportState,
    pub session: SessionState,
    pub flags: NetworkingFlags,
    pub session_kind: &'static str,
    pub ip_address: Option<Ipv4Addr>,
    pub broker_address: Option<IpAddr>,
    pub last_error: Option<String>,
    pub ticks: u64,
}

pub struct ConnectionEngine<P: TransportPort> {
    transport: P,
    session: Box<dyn BrokerSession>,
    credentials: WifiCredentials,
    flags: NetworkingFlags,
    session_state: SessionState,
    timers: Timers,
    dns_retry: RetryBudget,
    broker_address: Option<IpAddr>,
    ip_address: Option<Ipv4Addr>,
    cloud_initialized: bool,
    subscribed: bool,
    outbox: Outbox,
    events: Vec<EngineEvent>,
    last_error: Option<String>,
    ticks: u64,
}

impl<P: TransportPort> ConnectionEngine<P> {
    pub fn new(
        transport: P,
        session: Box<dyn BrokerSession>,
        credentials: WifiCredentials,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            transport,
            session,
            credentials,
            flags: NetworkingFlags::empty(),
            session_state: SessionState::Disconnected,
            timers: Timers::new(timing),
            dns_retry: RetryBudget::from_timeout("dns", timing.dns_retry(), timing.tick()),
            broker_address: None,
            ip_address: None,
            cloud_initialized: false,
            subscribed: false,
            outbox: Outbox::default(),
            events: Vec::new(),
            last_error: None,
            ticks: 0,
        }
    }

    /// Run one scheduler tick. Never blocks; at most one connection stage
    /// advances per call.
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        self.ticks += 1;
        let span = crate::engine_span!(tick = self.ticks);
        let _guard = span.enter();

        while let Some(event) = self.transport.poll_link_event() {
            self.apply_link_event(event);
        }

        self.timers.advance();

        if !self.run_scheduled() {
            if let Some(state) = self.enforce_invariants() {
                self.advance(state);
            }
        }

        std::mem::take(&mut self.events)
    }

    /// Tear everything down and start over from WiFi association.
    /// Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.reset_with("requested");
    }

    pub fn is_connected(&self) -> bool {
        self.session_state == SessionState::Connected
    }

    /// Feed a link notification that did not come through the transport
    pub fn on_link_event(&mut self, event: LinkEvent) {
        self.apply_link_event(event);
    }

    pub fn publish(&mut self, message: &OutboundMessage) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected {
                state: self.session_state,
            });
        }
        self.transport.publish(message)?;
        Ok(())
    }

    /// Replace the broker session and reconnect with it
    pub fn install_session(&mut self, session: Box<dyn BrokerSession>) {
        info!(from = self.session.name(), to = session.name(), "Switching broker session");
        self.session = session;
        self.reset_with("session replaced");
    }

    pub fn set_credentials(&mut self, credentials: WifiCredentials) {
        self.credentials = credentials;
    }

    pub fn credentials(&self) -> &WifiCredentials {
        &self.credentials
    }

    pub fn status(&mut self) -> EngineStatus {
        EngineStatus {
            transport: self.transport.state(),
            session: self.session_state,
            flags: self.flags,
            session_kind: self.session.name(),
            ip_address: self.ip_address,
            broker_address: self.broker_address,
            last_error: self.last_error.clone(),
            ticks: self.ticks,
        }
    }

    pub fn flags(&self) -> NetworkingFlags {
        self.flags
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn session_name(&self) -> &'static str {
        self.session.name()
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.ip_address
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// IP assigned on a live session but not yet reported to the twin
    pub fn needs_ip_report(&self) -> bool {
        self.is_connected()
            && self.flags.contains(NetworkingFlags::IP)
            && !self.flags.contains(NetworkingFlags::REPORTED)
    }

    pub fn mark_reported(&mut self) {
        self.flags.insert(NetworkingFlags::REPORTED);
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Handle for an external timer context to signal expiries
    pub fn timer_handle(&self) -> TimerHandle {
        self.timers.handle()
    }

    pub fn transport(&self) -> &P {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut P {
        &mut self.transport
    }

    fn record_error(&mut self, message: &str) {
        self.flags.insert(NetworkingFlags::ERROR);
        self.note_error(message);
    }

    /// Keep the message for status output without raising ERROR
    fn note_error(&mut self, message: &str) {
        self.last_error = Some(sanitize_error_message(message));
    }

    fn apply_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::ApConnected => {
                info!(ssid = %self.credentials.ssid, "Access point connected");
                self.flags.insert(NetworkingFlags::AP);
            }
            LinkEvent::ApLost => {
                warn!("Access point connection lost");
                self.flags.remove(NetworkingFlags::AP);
            }
            LinkEvent::IpAssigned(address) => {
                info!(%address, "IP address assigned");
                self.flags.insert(NetworkingFlags::IP);
                self.flags.remove(NetworkingFlags::ERROR);
                self.flags.remove(NetworkingFlags::REPORTED);
                self.ip_address = Some(address);
            }
            LinkEvent::IpLost => {
                warn!("IP address lost");
                self.flags.remove(NetworkingFlags::IP);
                self.ip_address = None;
            }
        }
    }

    /// Cold start and timer expiries. Returns true when a reset consumed
    /// this tick.
    fn run_scheduled(&mut self) -> bool {
        if !self.cloud_initialized && !self.flags.contains(NetworkingFlags::INIT_PENDING) {
            debug!("Cold start, delaying cloud initialization");
            self.flags.insert(NetworkingFlags::INIT_PENDING);
            self.timers.arm(TimeoutKind::CloudReset);
        }

        if self.timers.take_expired(TimeoutKind::CloudReset)
            && self.flags.contains(NetworkingFlags::INIT_PENDING)
        {
            self.initialize_cloud();
        }

        if self.timers.take_expired(TimeoutKind::Session)
            && !self.flags.contains(NetworkingFlags::SESSION)
        {
            warn!(state = ?self.session_state, "Broker session timed out");
            self.reset_with("session timeout");
            return true;
        }

        if self.timers.take_expired(TimeoutKind::Wifi) {
            let no_link = !self.flags.contains(NetworkingFlags::AP)
                && !self.flags.contains(NetworkingFlags::IP);
            if no_link || self.flags.contains(NetworkingFlags::ERROR) {
                warn!(flags = ?self.flags, "WiFi connect timed out");
                self.reset_with("wifi timeout");
                return true;
            }
            trace!("WiFi timer expired with link up");
        }

        false
    }

    fn initialize_cloud(&mut self) {
        info!(ssid = %self.credentials.ssid, "Initializing cloud connection");
        self.flags.remove(NetworkingFlags::INIT_PENDING);
        self.cloud_initialized = true;
        self.associate();
    }

    fn associate(&mut self) {
        if let Err(e) = self.transport.associate(&self.credentials) {
            error!(error = %e, "WiFi association request failed");
            self.record_error(&e.to_string());
        }
        self.timers.arm(TimeoutKind::Wifi);
    }

    /// Returns the transport state to act on, or None when the tick ended in
    /// a reset
    fn enforce_invariants(&mut self) -> Option<TransportState> {
        let state = self.transport.state();

        if self.session_state != SessionState::Disconnected && !state.is_connected() {
            warn!(transport = ?state, session = ?self.session_state, "Transport left Connected");
            self.reset_with("transport lost");
            return None;
        }

        if !self.flags.prerequisites_hold() {
            warn!(flags = ?self.flags, "Networking prerequisites lost");
            self.reset_with("prerequisites lost");
            return None;
        }

        Some(state)
    }

    fn advance(&mut self, state: TransportState) {
        match state {
            TransportState::NotASocket => self.advance_unallocated(),
            TransportState::Closed => self.advance_closed(),
            TransportState::Connecting => trace!("Socket connect in progress"),
            TransportState::Connected => self.advance_connected(),
            TransportState::Closing => trace!("Socket closing"),
        }
    }

    fn advance_unallocated(&mut self) {
        if !self.flags.has_network() {
            return;
        }

        if !self.flags.contains(NetworkingFlags::HOST_IP) {
            if let Some(address) = self.transport.take_resolved() {
                info!(%address, host = %self.session.endpoint().host, "Broker host resolved");
                self.broker_address = Some(address);
                self.flags.insert(NetworkingFlags::HOST_IP);
                self.dns_retry.cancel();
                return;
            }

            let issue = if self.dns_retry.is_armed() {
                self.dns_retry.tick()
            } else {
                true
            };
            if issue {
                self.request_resolution();
            }
            return;
        }

        match self.transport.open() {
            Ok(()) => debug!("Socket allocated"),
            Err(e) => {
                error!(error = %e, "Socket allocation failed");
                self.record_error(&e.to_string());
            }
        }
    }

    fn request_resolution(&mut self) {
        let host = &self.session.endpoint().host;
        debug!(%host, "Resolving broker host");
        match self.transport.resolve(host) {
            Ok(()) => self.dns_retry.arm(),
            // Unarmed budget: the request is issued again next tick
            Err(e) => {
                warn!(error = %e, "Resolve request failed");
                self.note_error(&e.to_string());
            }
        }
    }

    fn advance_closed(&mut self) {
        let Some(address) = self.broker_address else {
            return;
        };
        if !self.flags.contains(NetworkingFlags::HOST_IP) {
            return;
        }

        let endpoint = self.session.endpoint();
        let target = SocketAddr::new(address, endpoint.port);
        match self.transport.connect(target, &endpoint.host) {
            Ok(()) => {
                debug!(%target, "Socket connecting");
                self.flags.remove(NetworkingFlags::ERROR);
            }
            Err(e) => {
                error!(error = %e, %target, "Socket connect failed");
                self.record_error(&e.to_string());
                if !self.timers.is_armed(TimeoutKind::Wifi) {
                    self.timers.arm(TimeoutKind::Wifi);
                }
            }
        }
    }

    fn advance_connected(&mut self) {
        match self.session_state {
            SessionState::Disconnected => {
                let request = self.session.connect_request();
                match self.transport.send_connect(&request) {
                    Ok(()) => {
                        info!(client_id = %request.client_id, session = self.session.name(), "Broker CONNECT sent");
                        self.timers.arm(TimeoutKind::Session);
                        self.session_state = SessionState::Connecting;
                    }
                    Err(e) => {
                        error!(error = %e, "Broker CONNECT failed");
                        self.record_error(&e.to_string());
                    }
                }
            }
            SessionState::Connecting | SessionState::Connected => self.service(),
        }
    }

    fn service(&mut self) {
        for _ in 0..MAX_BROKER_EVENTS_PER_TICK {
            match self.transport.poll_event() {
                Ok(Some(event)) => {
                    if !self.handle_broker_event(event) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Broker service failed");
                    self.note_error(&e.to_string());
                    break;
                }
            }
        }

        if self.is_connected() {
            self.session.on_tick(&mut self.outbox);
        }
        self.flush_outbox();
    }

    /// Returns false when the event ended the session
    fn handle_broker_event(&mut self, event: BrokerEvent) -> bool {
        match event {
            BrokerEvent::ConnAck { accepted: true, .. } => {
                if self.session_state == SessionState::Connecting {
                    self.session_accepted();
                } else {
                    debug!("Duplicate CONNACK ignored");
                }
            }
            BrokerEvent::ConnAck {
                accepted: false,
                code,
            } => {
                error!(code, "Broker rejected session");
                self.record_error(&format!("CONNACK refused with code {code}"));
            }
            BrokerEvent::SubAck { granted } => debug!(granted, "Subscriptions acknowledged"),
            BrokerEvent::Message { topic, payload } => {
                if !self.is_connected() {
                    debug!(topic = %topic, "Dropping publish received before session accept");
                    return true;
                }
                match self.session.on_message(&topic, &payload, &mut self.outbox) {
                    SessionSignal::Idle => {}
                    SessionSignal::Failed(e) => {
                        error!(error = %e, "Session reported failure");
                        self.record_error(&e.to_string());
                        self.events.push(EngineEvent::Inbound(SessionSignal::Failed(e)));
                        self.reset_deferred("session failed");
                        return false;
                    }
                    signal => self.events.push(EngineEvent::Inbound(signal)),
                }
            }
            BrokerEvent::Disconnected => {
                warn!("Broker closed the session");
                self.reset_with("broker disconnected");
                return false;
            }
        }
        true
    }

    fn session_accepted(&mut self) {
        info!(session = self.session.name(), "Broker session accepted");
        self.session_state = SessionState::Connected;
        self.flags.insert(NetworkingFlags::SESSION);
        self.flags.remove(NetworkingFlags::ERROR);
        self.timers.cancel(TimeoutKind::Session);
        self.timers.cancel(TimeoutKind::CloudReset);

        if !self.subscribed {
            let subscriptions = self.session.subscriptions();
            match self.transport.send_subscribe(&subscriptions) {
                Ok(()) => {
                    debug!(count = subscriptions.len(), "SUBSCRIBE sent");
                    self.subscribed = true;
                }
                Err(e) => {
                    error!(error = %e, "SUBSCRIBE failed");
                    self.record_error(&e.to_string());
                }
            }
        }

        self.session.on_connected(&mut self.outbox);
        self.events.push(EngineEvent::Connected);
    }

    fn flush_outbox(&mut self) {
        for message in self.outbox.drain() {
            if let Err(e) = self.transport.publish(&message) {
                warn!(topic = %message.topic, error = %e, "Session publish failed");
                // Outbox is still borrowed by the drain
                self.last_error = Some(sanitize_error_message(&e.to_string()));
            }
        }
    }

    fn reset_with(&mut self, reason: &'static str) {
        self.teardown(reason);
        self.associate();
    }

    /// Reset, but wait out the reset delay before associating again
    fn reset_deferred(&mut self, reason: &'static str) {
        self.teardown(reason);
        self.flags.insert(NetworkingFlags::INIT_PENDING);
        self.timers.arm(TimeoutKind::CloudReset);
    }

    fn teardown(&mut self, reason: &'static str) {
        info!(reason, "Resetting connection");
        if self.session_state == SessionState::Connected {
            self.events.push(EngineEvent::Disconnected);
        }

        self.session_state = SessionState::Disconnected;
        self.flags.clear();
        self.timers.cancel_all();
        self.dns_retry.cancel();
        self.broker_address = None;
        self.ip_address = None;
        self.subscribed = false;
        self.outbox.clear();
        self.transport.close();
        self.cloud_initialized = true;
        self.events.push(EngineEvent::Reset { reason });
    }
}
