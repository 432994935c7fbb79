//! Device application facade
//!
//! `CloudSync` drives the connection engine once per tick and does the data
//! work that sits on top of a live session: twin reconciliation, direct
//! methods, telemetry publishing and the one-shot IP address report. Serial
//! bytes from the host controller enter through [`CloudSync::feed_serial`].

use crate::config::SyncConfig;
use crate::engine::{ConnectionEngine, EngineEvent, EngineStatus};
use crate::error::{SyncError, SyncResult};
use crate::frame::{Command, DecoderStats, FrameDecoder};
use crate::observability::{DebugLevel, LogLevelHandle};
use crate::session::{
    BrokerEndpoint, BrokerSession, HubSession, ProvisioningSession, SessionSignal, TopicBuilder,
    DEFAULT_MQTTS_PORT,
};
use crate::telemetry::{
    button_payload, handle_command, is_suppressed, telemetry_message, Button, ButtonPress,
    DeviceAction, SensorReading, SlotCommand, TelemetryUpdate,
};
use crate::transport::{LinkEvent, OutboundMessage, QoS, TransportPort, WifiCredentials};
use crate::twin::{
    DeviceTwin, DirtyFlags, LedColor, LedState, ReportOutcome, TwinProperties, TwinReconciler,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Slot updates held while the session is down; the oldest is dropped first
pub const MAX_PENDING_UPDATES: usize = 32;

/// What the application should act on after a tick
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    /// Provisioning assigned a hub; the engine is reconnecting to it
    Provisioned { hub_host: String, device_id: String },
    /// Cloud-to-device message body
    CloudMessage(Bytes),
    Action(DeviceAction),
}

/// Snapshot for the CLI and indicators
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub engine: EngineStatus,
    pub decoder: DecoderStats,
    pub twin_version: Option<i64>,
    pub twin_synced: bool,
    pub telemetry_interval_secs: u32,
    pub pending_updates: usize,
}

pub struct CloudSync<P: TransportPort> {
    device_id: String,
    keep_alive_secs: u16,
    tick: Duration,
    engine: ConnectionEngine<P>,
    decoder: FrameDecoder,
    twin: TwinReconciler,
    /// Set once the initial twin GET has been answered on this session
    twin_synced: bool,
    sensor: SensorReading,
    since_telemetry: Duration,
    pending_updates: VecDeque<TelemetryUpdate>,
    pending_presses: Vec<ButtonPress>,
    press_counts: [u32; 2],
    log_handle: Option<LogLevelHandle>,
}

impl<P: TransportPort> CloudSync<P> {
    pub fn new(transport: P, config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let protocol = config.twin_protocol();
        let model_id = protocol.model_id().map(str::to_owned);
        let session: Box<dyn BrokerSession> = if config.cloud.use_provisioning {
            let id_scope = config.cloud.id_scope.clone().unwrap_or_default();
            Box::new(ProvisioningSession::new(
                config.cloud.provisioning_broker()?,
                id_scope,
                config.device.id.clone(),
                model_id,
                config.timing.tick(),
            ))
        } else {
            Box::new(
                HubSession::new(config.cloud.hub_broker()?, config.device.id.as_str(), model_id)
                    .with_keep_alive(config.cloud.keep_alive_secs),
            )
        };

        let mut device = DeviceTwin::new(
            config.timing.telemetry_interval_secs,
            config.device.firmware_version.as_str(),
        );
        device.debug_level = config.device.debug_level;

        info!(
            device_id = %config.device.id,
            session = session.name(),
            twin_protocol = protocol.name(),
            "Creating cloud sync"
        );

        Ok(Self {
            device_id: config.device.id.clone(),
            keep_alive_secs: config.cloud.keep_alive_secs,
            tick: config.timing.tick(),
            engine: ConnectionEngine::new(
                transport,
                session,
                config.wifi.credentials(),
                &config.timing,
            ),
            decoder: FrameDecoder::new(),
            twin: TwinReconciler::new(protocol, device),
            twin_synced: false,
            sensor: SensorReading::default(),
            since_telemetry: Duration::ZERO,
            pending_updates: VecDeque::new(),
            pending_presses: Vec::new(),
            press_counts: [0; 2],
            log_handle: None,
        })
    }

    /// Let twin and shell debug-level changes adjust the log filter
    pub fn with_log_handle(mut self, handle: LogLevelHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// One scheduler tick: advance the connection, then run the data task
    pub fn tick(&mut self) -> Vec<DeviceEvent> {
        let mut out = Vec::new();

        for event in self.engine.poll() {
            match event {
                EngineEvent::Connected => {
                    self.twin_synced = false;
                    self.since_telemetry = Duration::ZERO;
                    out.push(DeviceEvent::Connected);
                }
                EngineEvent::Disconnected => {
                    self.twin_synced = false;
                    out.push(DeviceEvent::Disconnected);
                }
                EngineEvent::Reset { reason } => debug!(reason, "Engine reset"),
                EngineEvent::Inbound(signal) => self.handle_signal(signal, &mut out),
            }
        }

        if self.engine.is_connected() {
            self.run_data_task();
        }

        out
    }

    /// Feed one byte received from the host controller
    pub fn feed_serial(&mut self, byte: u8) -> SyncResult<()> {
        // Parsed while the frame still borrows the decoder buffer
        let command = match self.decoder.feed(byte) {
            Some(frame) => match frame.command_kind() {
                Command::TelemetryPush => match frame.payload_str() {
                    Ok(data) => SlotCommand::parse(frame.index, data)?,
                    Err(e) => {
                        warn!(index = frame.index, error = %e, "Dropping frame with undecodable payload");
                        return Err(SyncError::Frame(e));
                    }
                },
                Command::Other(command) => {
                    trace!(command, "Ignoring frame");
                    return Ok(());
                }
            },
            None => return Ok(()),
        };
        self.apply_slot_command(command);
        Ok(())
    }

    /// Apply a telemetry slot write from a frame or the shell
    pub fn push_telemetry(&mut self, index: u8, data: &str) -> SyncResult<()> {
        let command = SlotCommand::parse(index, data)?;
        self.apply_slot_command(command);
        Ok(())
    }

    fn apply_slot_command(&mut self, command: SlotCommand) {
        match command {
            SlotCommand::ResetDecoder => {
                info!("Frame decoder reset requested");
                self.decoder.reset();
            }
            SlotCommand::Update(update) => {
                if self.pending_updates.len() == MAX_PENDING_UPDATES {
                    if let Some(dropped) = self.pending_updates.pop_front() {
                        warn!(slot = dropped.name(), "Telemetry queue full, dropping oldest update");
                    }
                }
                debug!(slot = update.name(), "Telemetry update queued");
                self.pending_updates.push_back(update);
            }
        }
    }

    pub fn on_link_event(&mut self, event: LinkEvent) {
        self.engine.on_link_event(event);
    }

    pub fn press_button(&mut self, button: Button) {
        let slot = match button {
            Button::Sw0 => 0,
            Button::Sw1 => 1,
        };
        self.press_counts[slot] = self.press_counts[slot].wrapping_add(1);
        let press_count = self.press_counts[slot];

        match self.pending_presses.iter_mut().find(|p| p.button == button) {
            Some(pending) => pending.press_count = press_count,
            None => self.pending_presses.push(ButtonPress {
                button,
                press_count,
            }),
        }
        debug!(button = button.name(), press_count, "Button pressed");
    }

    pub fn set_sensor_reading(&mut self, reading: SensorReading) {
        self.sensor = reading;
    }

    /// Record a local LED change and report it when a session is up
    pub fn set_led(&mut self, color: LedColor, state: LedState) -> SyncResult<()> {
        let props = self.twin.record_led(color, state);
        self.report_if_connected(props)
    }

    pub fn set_app_property(&mut self, slot: usize, value: i32) -> SyncResult<()> {
        let props = self.twin.record_app_property(slot, value)?;
        self.report_if_connected(props)
    }

    pub fn set_debug_level(&mut self, level: u8) -> SyncResult<()> {
        let debug_level = DebugLevel::from_u8(level)
            .ok_or_else(|| SyncError::invalid_input(format!("debug level {level} is not 0..5")))?;
        let props = self.twin.record_debug_level(level)?;
        self.apply_log_level(debug_level);
        self.report_if_connected(props)
    }

    /// Drop the connection and start over from WiFi association
    pub fn reconnect(&mut self) {
        info!("Reconnect requested");
        self.twin_synced = false;
        self.engine.reset();
    }

    pub fn set_wifi_credentials(&mut self, credentials: WifiCredentials) {
        info!(ssid = %credentials.ssid, "WiFi credentials updated");
        self.engine.set_credentials(credentials);
        self.reconnect();
    }

    pub fn status(&mut self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id.clone(),
            engine: self.engine.status(),
            decoder: self.decoder.stats(),
            twin_version: self.twin.last_version(),
            twin_synced: self.twin_synced,
            telemetry_interval_secs: self.twin.device().telemetry_interval,
            pending_updates: self.pending_updates.len(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn twin(&self) -> &TwinReconciler {
        &self.twin
    }

    pub fn engine(&self) -> &ConnectionEngine<P> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ConnectionEngine<P> {
        &mut self.engine
    }

    fn handle_signal(&mut self, signal: SessionSignal, out: &mut Vec<DeviceEvent>) {
        match signal {
            SessionSignal::Idle => {}
            SessionSignal::Twin { topic, payload } => self.reconcile(&topic, &payload),
            SessionSignal::Method {
                name,
                request_id,
                payload,
            } => {
                let (response, action) = handle_command(&name, &payload);
                if let Err(e) = self.publish(response.into_message(&request_id)) {
                    error!(method = %name, error = %e.sanitized_message(), "Failed to answer direct method");
                }
                if let Some(action) = action {
                    out.push(DeviceEvent::Action(action));
                }
            }
            SessionSignal::CloudToDevice { payload } => {
                info!(len = payload.len(), "Cloud-to-device message received");
                out.push(DeviceEvent::CloudMessage(payload));
            }
            SessionSignal::Assigned {
                hub_host,
                device_id,
            } => {
                info!(hub = %hub_host, device_id = %device_id, "Device provisioned, switching to hub");
                let model_id = self.twin.protocol().model_id().map(str::to_owned);
                let session = HubSession::new(
                    BrokerEndpoint::new(hub_host.as_str(), DEFAULT_MQTTS_PORT),
                    device_id.as_str(),
                    model_id,
                )
                .with_keep_alive(self.keep_alive_secs);
                self.device_id = device_id.clone();
                self.twin_synced = false;
                self.engine.install_session(Box::new(session));
                out.push(DeviceEvent::Provisioned {
                    hub_host,
                    device_id,
                });
            }
            SessionSignal::Failed(e) => debug!(error = %e, "Session failure surfaced"),
        }
    }

    fn reconcile(&mut self, topic: &str, payload: &[u8]) {
        let span = crate::twin_span!(topic = %topic);
        let _guard = span.enter();

        let props = match self.twin.apply_desired(topic, payload) {
            Ok(props) => props,
            Err(e) => {
                warn!(error = %e, "Twin message rejected");
                return;
            }
        };

        if props.is_initial_get() {
            info!(version = ?props.version, "Twin synchronized");
            self.twin_synced = true;
        }
        if props.flags.contains(DirtyFlags::DEBUG_LEVEL) {
            if let Some(level) = DebugLevel::from_u8(props.debug_level) {
                self.apply_log_level(level);
            }
        }

        if let Err(e) = self.report(props) {
            error!(error = %e.sanitized_message(), "Failed to report twin properties");
        }
    }

    fn report_if_connected(&mut self, props: TwinProperties) -> SyncResult<()> {
        if !self.engine.is_connected() {
            debug!(flags = ?props.flags, "Not connected, change goes out with the next full sync");
            return Ok(());
        }
        self.report(props)
    }

    fn report(&mut self, mut props: TwinProperties) -> SyncResult<()> {
        match self.twin.build_reported(&mut props)? {
            ReportOutcome::Patch(patch) => {
                let request_id = self.twin.next_request_id();
                debug!(request_id, len = patch.len(), "Reporting twin properties");
                self.publish(OutboundMessage::new(
                    TopicBuilder::twin_patch_topic(request_id),
                    patch,
                    QoS::AtMostOnce,
                ))
            }
            ReportOutcome::NothingToSend => {
                trace!("No twin changes to report");
                Ok(())
            }
        }
    }

    fn run_data_task(&mut self) {
        if self.engine.needs_ip_report() {
            if let Some(address) = self.engine.ip_address() {
                let props = self.twin.record_ip_address(address.to_string());
                match self.report(props) {
                    Ok(()) => self.engine.mark_reported(),
                    Err(e) => warn!(error = %e.sanitized_message(), "IP address report failed"),
                }
            }
        }

        let disable_mask = self.twin.device().telemetry_disable;
        while let Some(update) = self.pending_updates.pop_front() {
            if is_suppressed(disable_mask, update.index) {
                debug!(slot = update.name(), "Telemetry slot disabled, dropping update");
                continue;
            }
            let message = telemetry_message(&self.device_id, update.to_payload());
            if let Err(e) = self.publish(message) {
                warn!(slot = update.name(), error = %e.sanitized_message(), "Telemetry publish failed");
            }
        }

        if !self.pending_presses.is_empty() {
            let presses = std::mem::take(&mut self.pending_presses);
            match button_payload(&presses) {
                Ok(Some(payload)) => {
                    if let Err(e) = self.publish(telemetry_message(&self.device_id, payload)) {
                        warn!(error = %e.sanitized_message(), "Button event publish failed");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to encode button events"),
            }
        }

        if self.twin_synced {
            self.since_telemetry += self.tick;
            let interval = Duration::from_secs(u64::from(self.twin.device().telemetry_interval));
            if !interval.is_zero() && self.since_telemetry >= interval {
                self.since_telemetry = Duration::ZERO;
                self.publish_sensor_reading();
            }
        }
    }

    fn publish_sensor_reading(&mut self) {
        let payload = match self.sensor.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode sensor reading");
                return;
            }
        };
        trace!(temperature = self.sensor.temperature, light = self.sensor.light, "Publishing sensor telemetry");
        if let Err(e) = self.publish(telemetry_message(&self.device_id, payload)) {
            warn!(error = %e.sanitized_message(), "Sensor telemetry publish failed");
        }
    }

    fn publish(&mut self, message: OutboundMessage) -> SyncResult<()> {
        self.engine.publish(&message)?;
        Ok(())
    }

    fn apply_log_level(&self, level: DebugLevel) {
        if let Some(handle) = &self.log_handle {
            match handle.set(level) {
                Ok(()) => info!(level = ?level, "Log level changed"),
                Err(e) => warn!(error = %e, "Failed to change log level"),
            }
        }
    }
}
