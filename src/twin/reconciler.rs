//! Desired/reported twin reconciliation
//!
//! `apply_desired` turns an inbound twin document into a [`TwinProperties`]
//! pass and folds the recognized values into the device view.
//! `build_reported` serializes a pass into a reported-property patch holding
//! only dirty fields, or every tracked field on the initial full sync.

use super::properties::{DirtyFlags, LedColor, LedState, TwinProperties, APP_PROPERTY_SLOTS};
use super::protocol::TwinProtocol;
use crate::session::topics::{parse_twin_topic, TwinTopic, INITIAL_GET_REQUEST_ID};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROP_TELEMETRY_INTERVAL: &str = "telemetryInterval";
pub const PROP_IP_ADDRESS: &str = "ipAddress";
pub const PROP_FIRMWARE_VERSION: &str = "firmwareVersion";
pub const PROP_DEBUG_LEVEL: &str = "debugLevel";
pub const PROP_TELEMETRY_DISABLE: &str = "telemetryDisable";
const PROP_VERSION: &str = "$version";
const DESIRED_SECTION: &str = "desired";

/// Application slots 3 and 4 are writable from the cloud, 1 and 2 are read-only
const WRITABLE_APP_SLOTS: [usize; 2] = [3, 4];

/// Highest device debug level (trace)
pub const MAX_DEBUG_LEVEL: u8 = 5;

/// Acknowledged version for writable fields reported on the full-sync path
/// without having been part of the received document
const DEFAULT_ACK_VERSION: i64 = 1;

/// Reported patches are bounded like the device-side patch buffer
pub const PATCH_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("Malformed twin document: {message}")]
    MalformedDocument { message: String },

    #[error("Unrecognized twin topic: {topic}")]
    UnexpectedTopic { topic: String },

    #[error("Twin request {request_id} rejected with status {status}")]
    Rejected { status: u16, request_id: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Reported patch of {len} bytes exceeds {max} bytes")]
    PatchTooLarge { len: usize, max: usize },

    #[error("Failed to serialize reported properties: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TwinError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedDocument {
            message: message.into(),
        }
    }

    fn invalid_value<S: Into<String>>(field: &str, message: S) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result of building a reported patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Patch(Bytes),
    /// No dirty fields; the caller skips the publish
    NothingToSend,
}

impl ReportOutcome {
    pub fn is_nothing_to_send(&self) -> bool {
        matches!(self, ReportOutcome::NothingToSend)
    }
}

/// Device-side values carried across reconciliation passes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTwin {
    pub telemetry_interval: u32,
    pub led_yellow: LedState,
    pub led_red: LedState,
    pub led_green: LedState,
    pub led_blue: LedState,
    pub ip_address: Option<String>,
    pub app_properties: [i32; APP_PROPERTY_SLOTS],
    pub debug_level: u8,
    pub telemetry_disable: u16,
    pub firmware_version: String,
}

impl DeviceTwin {
    pub fn new<S: Into<String>>(telemetry_interval: u32, firmware_version: S) -> Self {
        Self {
            telemetry_interval,
            led_yellow: LedState::Off,
            led_red: LedState::Off,
            led_green: LedState::Off,
            led_blue: LedState::Off,
            ip_address: None,
            app_properties: [0; APP_PROPERTY_SLOTS],
            debug_level: 3,
            telemetry_disable: 0,
            firmware_version: firmware_version.into(),
        }
    }

    pub fn led(&self, color: LedColor) -> LedState {
        match color {
            LedColor::Yellow => self.led_yellow,
            LedColor::Red => self.led_red,
            LedColor::Green => self.led_green,
            LedColor::Blue => self.led_blue,
        }
    }

    fn set_led(&mut self, color: LedColor, state: LedState) {
        match color {
            LedColor::Yellow => self.led_yellow = state,
            LedColor::Red => self.led_red = state,
            LedColor::Green => self.led_green = state,
            LedColor::Blue => self.led_blue = state,
        }
    }
}

pub struct TwinReconciler {
    protocol: Box<dyn TwinProtocol>,
    device: DeviceTwin,
    last_version: Option<i64>,
    request_id: u32,
    patch_buf: BytesMut,
}

impl TwinReconciler {
    pub fn new(protocol: Box<dyn TwinProtocol>, device: DeviceTwin) -> Self {
        Self {
            protocol,
            device,
            last_version: None,
            request_id: 0,
            patch_buf: BytesMut::with_capacity(PATCH_CAPACITY),
        }
    }

    pub fn protocol(&self) -> &dyn TwinProtocol {
        self.protocol.as_ref()
    }

    pub fn device(&self) -> &DeviceTwin {
        &self.device
    }

    /// Version seen on the most recent desired-property message
    pub fn last_version(&self) -> Option<i64> {
        self.last_version
    }

    /// Request id for the next reported PATCH
    pub fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    /// Parse an inbound twin message into a reconciliation pass
    pub fn apply_desired(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> Result<TwinProperties, TwinError> {
        let mut props = TwinProperties::new();

        let (topic_version, get_response) = match parse_twin_topic(topic) {
            Some(TwinTopic::Response {
                status, request_id, ..
            }) => {
                let request_id = request_id.unwrap_or_default();
                if !(200..300).contains(&status) {
                    return Err(TwinError::Rejected {
                        status,
                        request_id: request_id.to_string(),
                    });
                }
                if status == 204 || payload.is_empty() {
                    // Acknowledgement of a reported patch, nothing to reconcile
                    debug!(request_id, "reported properties acknowledged");
                    return Ok(props);
                }
                if request_id.eq_ignore_ascii_case(INITIAL_GET_REQUEST_ID) {
                    info!("initial twin GET received");
                    props.flags.insert(DirtyFlags::IS_INITIAL_GET);
                } else {
                    debug!(request_id, "twin GET received");
                }
                (None, true)
            }
            Some(TwinTopic::DesiredPatch { version }) => (version, false),
            None => {
                return Err(TwinError::UnexpectedTopic {
                    topic: topic.to_string(),
                })
            }
        };

        let document: Value = serde_json::from_slice(payload)
            .map_err(|e| TwinError::malformed(format!("invalid JSON: {e}")))?;
        let Value::Object(root) = document else {
            return Err(TwinError::malformed("top-level value is not an object"));
        };

        // A GET response carries the whole twin with the desired part nested
        let desired = if get_response {
            match root.get(DESIRED_SECTION) {
                Some(Value::Object(desired)) => desired.clone(),
                Some(_) => return Err(TwinError::malformed("'desired' is not an object")),
                None => Map::new(),
            }
        } else {
            root
        };

        let version = desired
            .get(PROP_VERSION)
            .and_then(Value::as_i64)
            .or(topic_version);
        match version {
            Some(v) => self.last_version = Some(v),
            None => warn!("twin document carries no version"),
        }
        props.version = version;

        for (key, value) in &desired {
            if key.starts_with('$') {
                continue;
            }
            if let Err(e) = self.apply_field(&mut props, key, value) {
                warn!(field = %key, error = %e, "ignoring twin property");
            }
        }

        debug!(flags = ?props.flags, version = ?props.version, "desired properties applied");
        Ok(props)
    }

    fn apply_field(
        &mut self,
        props: &mut TwinProperties,
        key: &str,
        raw: &Value,
    ) -> Result<(), TwinError> {
        // Desired values arrive either bare or wrapped as {"value": x}
        let value = match raw {
            Value::Object(map) => map.get("value").unwrap_or(raw),
            other => other,
        };

        match key {
            PROP_TELEMETRY_INTERVAL => {
                let interval = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| TwinError::invalid_value(key, "expected unsigned seconds"))?;
                self.device.telemetry_interval = interval;
                props.telemetry_interval = interval;
                props.flags.insert(DirtyFlags::TELEMETRY_INTERVAL);
            }
            "led_y" => {
                let state = value
                    .as_i64()
                    .and_then(LedState::from_twin)
                    .ok_or_else(|| TwinError::invalid_value(key, "expected LED state -1..3"))?;
                if state != LedState::NoChange {
                    self.device.set_led(LedColor::Yellow, state);
                }
                props.led_yellow = self.device.led_yellow;
                props.flags.insert(DirtyFlags::LED_YELLOW);
            }
            PROP_DEBUG_LEVEL => {
                let level = value
                    .as_u64()
                    .filter(|v| *v <= MAX_DEBUG_LEVEL as u64)
                    .ok_or_else(|| TwinError::invalid_value(key, "expected level 0..5"))?
                    as u8;
                self.device.debug_level = level;
                props.debug_level = level;
                props.flags.insert(DirtyFlags::DEBUG_LEVEL);
            }
            PROP_TELEMETRY_DISABLE => {
                let mask = value
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| TwinError::invalid_value(key, "expected 16-bit mask"))?;
                self.device.telemetry_disable = mask;
                props.telemetry_disable = mask;
                props.flags.insert(DirtyFlags::TELEMETRY_DISABLE);
            }
            _ => match writable_app_slot(key) {
                Some(slot) => {
                    let v = value
                        .as_i64()
                        .and_then(|v| i32::try_from(v).ok())
                        .ok_or_else(|| TwinError::invalid_value(key, "expected 32-bit integer"))?;
                    self.device.app_properties[slot - 1] = v;
                    props.app_properties[slot - 1] = v;
                    if let Some(flag) = DirtyFlags::app_property(slot) {
                        props.flags.insert(flag);
                    }
                }
                None => warn!(field = %key, "received unknown twin property"),
            },
        }
        Ok(())
    }

    /// Serialize the dirty part of `props` into a reported patch
    ///
    /// Dirty flags are cleared once the patch is built, so building again from
    /// the same pass yields [`ReportOutcome::NothingToSend`].
    pub fn build_reported(
        &mut self,
        props: &mut TwinProperties,
    ) -> Result<ReportOutcome, TwinError> {
        if props.nothing_dirty() {
            return Ok(ReportOutcome::NothingToSend);
        }

        let full = props.is_initial_get();
        let version = props
            .version
            .or(self.last_version)
            .unwrap_or(DEFAULT_ACK_VERSION);
        let flags = props.flags;
        let device_initiated = props.device_initiated;
        let device = &self.device;
        let protocol = self.protocol.as_ref();
        let mut doc = Map::new();

        let writable = |doc: &mut Map<String, Value>, name: &str, flag: DirtyFlags, value: Value| {
            if flags.contains(flag) && device_initiated {
                // No desired version to acknowledge
                doc.insert(name.to_string(), value);
            } else if flags.contains(flag) {
                doc.insert(name.to_string(), protocol.writable_ack(value, version));
            } else if full {
                doc.insert(name.to_string(), protocol.writable_ack(value, DEFAULT_ACK_VERSION));
            }
        };

        writable(
            &mut doc,
            PROP_TELEMETRY_INTERVAL,
            DirtyFlags::TELEMETRY_INTERVAL,
            json!(pick(flags, DirtyFlags::TELEMETRY_INTERVAL, props.telemetry_interval, device.telemetry_interval)),
        );
        writable(
            &mut doc,
            LedColor::Yellow.property_name(),
            DirtyFlags::LED_YELLOW,
            json!(pick(flags, DirtyFlags::LED_YELLOW, props.led_yellow, device.led_yellow).to_twin()),
        );
        for slot in WRITABLE_APP_SLOTS {
            if let Some(flag) = DirtyFlags::app_property(slot) {
                writable(
                    &mut doc,
                    &app_property_name(slot),
                    flag,
                    json!(pick(flags, flag, props.app_properties[slot - 1], device.app_properties[slot - 1])),
                );
            }
        }
        writable(
            &mut doc,
            PROP_DEBUG_LEVEL,
            DirtyFlags::DEBUG_LEVEL,
            json!(pick(flags, DirtyFlags::DEBUG_LEVEL, props.debug_level, device.debug_level)),
        );
        writable(
            &mut doc,
            PROP_TELEMETRY_DISABLE,
            DirtyFlags::TELEMETRY_DISABLE,
            json!(pick(flags, DirtyFlags::TELEMETRY_DISABLE, props.telemetry_disable, device.telemetry_disable)),
        );

        // Read-only fields are always bare values
        for color in [LedColor::Red, LedColor::Green, LedColor::Blue] {
            let flag = color.dirty_flag();
            if full || flags.contains(flag) {
                let state = pick(flags, flag, props.led(color), device.led(color));
                doc.insert(color.property_name().to_string(), json!(state.to_twin()));
            }
        }
        for slot in [1, 2] {
            if let Some(flag) = DirtyFlags::app_property(slot) {
                if full || flags.contains(flag) {
                    let value = pick(flags, flag, props.app_properties[slot - 1], device.app_properties[slot - 1]);
                    doc.insert(app_property_name(slot), json!(value));
                }
            }
        }
        if full || flags.contains(DirtyFlags::IP_ADDRESS) {
            let ip = if flags.contains(DirtyFlags::IP_ADDRESS) {
                props.ip_address.as_ref()
            } else {
                device.ip_address.as_ref()
            };
            if let Some(ip) = ip {
                doc.insert(PROP_IP_ADDRESS.to_string(), json!(ip));
            }
        }
        if full {
            doc.insert(
                PROP_FIRMWARE_VERSION.to_string(),
                json!(device.firmware_version),
            );
        }

        self.patch_buf.clear();
        serde_json::to_writer((&mut self.patch_buf).writer(), &Value::Object(doc))?;
        if self.patch_buf.len() > PATCH_CAPACITY {
            let len = self.patch_buf.len();
            self.patch_buf.clear();
            return Err(TwinError::PatchTooLarge {
                len,
                max: PATCH_CAPACITY,
            });
        }

        props.flags = DirtyFlags::empty();
        Ok(ReportOutcome::Patch(self.patch_buf.split().freeze()))
    }

    /// Pass reporting every tracked field, used after the initial GET
    pub fn full_sync(&self) -> TwinProperties {
        let mut props = TwinProperties::new();
        props.flags.insert(DirtyFlags::IS_INITIAL_GET);
        props.version = self.last_version;
        props
    }

    /// Device-side LED change. `NoChange` leaves the LED and the report alone.
    pub fn record_led(&mut self, color: LedColor, state: LedState) -> TwinProperties {
        let mut props = TwinProperties::new();
        if state == LedState::NoChange {
            return props;
        }
        self.device.set_led(color, state);
        props.set_led(color, state);
        props.device_initiated = true;
        props
    }

    pub fn record_ip_address<S: Into<String>>(&mut self, ip_address: S) -> TwinProperties {
        let ip_address = ip_address.into();
        self.device.ip_address = Some(ip_address.clone());
        let mut props = TwinProperties::new();
        props.ip_address = Some(ip_address);
        props.flags.insert(DirtyFlags::IP_ADDRESS);
        props
    }

    /// Device-side write of application slot `1..=4`
    pub fn record_app_property(
        &mut self,
        slot: usize,
        value: i32,
    ) -> Result<TwinProperties, TwinError> {
        let flag = DirtyFlags::app_property(slot).ok_or_else(|| {
            TwinError::invalid_value(&format!("property_{slot}"), "slot must be 1..4")
        })?;
        self.device.app_properties[slot - 1] = value;
        let mut props = TwinProperties::new();
        props.app_properties[slot - 1] = value;
        props.flags.insert(flag);
        props.device_initiated = true;
        Ok(props)
    }

    pub fn record_debug_level(&mut self, level: u8) -> Result<TwinProperties, TwinError> {
        if level > MAX_DEBUG_LEVEL {
            return Err(TwinError::invalid_value(PROP_DEBUG_LEVEL, "expected level 0..5"));
        }
        self.device.debug_level = level;
        let mut props = TwinProperties::new();
        props.debug_level = level;
        props.flags.insert(DirtyFlags::DEBUG_LEVEL);
        props.device_initiated = true;
        Ok(props)
    }
}

fn pick<T>(flags: DirtyFlags, flag: DirtyFlags, from_pass: T, from_device: T) -> T {
    if flags.contains(flag) {
        from_pass
    } else {
        from_device
    }
}

pub fn app_property_name(slot: usize) -> String {
    format!("property_{slot}")
}

fn writable_app_slot(key: &str) -> Option<usize> {
    let slot: usize = key.strip_prefix("property_")?.parse().ok()?;
    WRITABLE_APP_SLOTS.contains(&slot).then_some(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twin::protocol::{PlainHub, PlugAndPlay};

    const DESIRED_TOPIC: &str = "$iothub/twin/PATCH/properties/desired/?$version=7";
    const INITIAL_GET_TOPIC: &str = "$iothub/twin/res/200/?$rid=initial_get";

    fn pnp_reconciler() -> TwinReconciler {
        TwinReconciler::new(
            Box::new(PlugAndPlay::new("dtmi:com:example:Device;1")),
            DeviceTwin::new(10, "1.0.0"),
        )
    }

    fn patch_json(outcome: ReportOutcome) -> Value {
        match outcome {
            ReportOutcome::Patch(bytes) => serde_json::from_slice(&bytes).unwrap(),
            ReportOutcome::NothingToSend => panic!("expected a patch"),
        }
    }

    #[test]
    fn test_apply_desired_telemetry_interval() {
        let mut twin = pnp_reconciler();
        let props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"telemetryInterval":{"value":30},"$version":7}"#)
            .unwrap();

        assert!(props.flags.contains(DirtyFlags::TELEMETRY_INTERVAL));
        assert_eq!(props.telemetry_interval, 30);
        assert_eq!(props.version, Some(7));
        assert_eq!(twin.last_version(), Some(7));
        assert_eq!(twin.device().telemetry_interval, 30);
    }

    #[test]
    fn test_build_reported_envelope_echoes_version() {
        let mut twin = pnp_reconciler();
        let mut props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"telemetryInterval":{"value":30},"$version":7}"#)
            .unwrap();

        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(
            patch,
            json!({"telemetryInterval": {"value": 30, "ac": 200, "av": 7, "ad": "Success"}})
        );
    }

    #[test]
    fn test_build_reported_twice_is_nothing_to_send() {
        let mut twin = pnp_reconciler();
        let mut props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"telemetryInterval":5,"$version":2}"#)
            .unwrap();

        assert!(!twin.build_reported(&mut props).unwrap().is_nothing_to_send());
        assert!(twin.build_reported(&mut props).unwrap().is_nothing_to_send());
    }

    #[test]
    fn test_non_object_document_is_malformed() {
        let mut twin = pnp_reconciler();
        let err = twin.apply_desired(DESIRED_TOPIC, b"[1,2,3]").unwrap_err();
        assert!(matches!(err, TwinError::MalformedDocument { .. }));

        let err = twin.apply_desired(DESIRED_TOPIC, b"{not json").unwrap_err();
        assert!(matches!(err, TwinError::MalformedDocument { .. }));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut twin = pnp_reconciler();
        let props = twin
            .apply_desired(
                DESIRED_TOPIC,
                br#"{"mystery":1,"led_y":1,"nested":{"a":true},"$version":7}"#,
            )
            .unwrap();

        assert_eq!(props.flags, DirtyFlags::LED_YELLOW);
        assert_eq!(props.led_yellow, LedState::On);
    }

    #[test]
    fn test_invalid_known_field_is_skipped() {
        let mut twin = pnp_reconciler();
        let props = twin
            .apply_desired(
                DESIRED_TOPIC,
                br#"{"telemetryInterval":"fast","debugLevel":9,"property_3":12,"$version":7}"#,
            )
            .unwrap();

        assert!(!props.flags.contains(DirtyFlags::TELEMETRY_INTERVAL));
        assert!(!props.flags.contains(DirtyFlags::DEBUG_LEVEL));
        assert!(props.flags.contains(DirtyFlags::APP_PROPERTY_3));
        assert_eq!(twin.device().app_properties[2], 12);
    }

    #[test]
    fn test_version_falls_back_to_topic() {
        let mut twin = pnp_reconciler();
        let props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"led_y":3}"#)
            .unwrap();
        assert_eq!(props.version, Some(7));
    }

    #[test]
    fn test_out_of_order_version_is_last_write_wins() {
        let mut twin = pnp_reconciler();
        twin.apply_desired(DESIRED_TOPIC, br#"{"led_y":1,"$version":9}"#)
            .unwrap();
        twin.apply_desired(DESIRED_TOPIC, br#"{"led_y":2,"$version":4}"#)
            .unwrap();
        assert_eq!(twin.last_version(), Some(4));
        assert_eq!(twin.device().led_yellow, LedState::Off);
    }

    #[test]
    fn test_led_no_change_reports_current_state() {
        let mut twin = pnp_reconciler();
        twin.record_led(LedColor::Yellow, LedState::Blink);
        let mut props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"led_y":-1,"$version":3}"#)
            .unwrap();

        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch["led_y"]["value"], json!(3));
    }

    #[test]
    fn test_initial_get_full_sync() {
        let mut twin = pnp_reconciler();
        twin.record_ip_address("192.168.1.20");
        let payload = br#"{"desired":{"telemetryInterval":15,"$version":4},"reported":{"$version":1}}"#;
        let mut props = twin.apply_desired(INITIAL_GET_TOPIC, payload).unwrap();
        assert!(props.is_initial_get());

        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch["telemetryInterval"]["value"], json!(15));
        assert_eq!(patch["telemetryInterval"]["av"], json!(4));
        // Not part of the desired document, acknowledged as default
        assert_eq!(patch["led_y"]["av"], json!(1));
        assert_eq!(patch["led_r"], json!(2));
        assert_eq!(patch["ipAddress"], json!("192.168.1.20"));
        assert_eq!(patch["firmwareVersion"], json!("1.0.0"));
        assert_eq!(patch["property_1"], json!(0));
        assert!(patch.get("property_3").is_some());
    }

    #[test]
    fn test_initial_get_with_non_object_desired_is_malformed() {
        let mut twin = pnp_reconciler();
        let err = twin
            .apply_desired(INITIAL_GET_TOPIC, br#"{"desired":5}"#)
            .unwrap_err();
        assert!(matches!(err, TwinError::MalformedDocument { .. }));
    }

    #[test]
    fn test_reported_ack_is_empty_pass() {
        let mut twin = pnp_reconciler();
        let mut props = twin
            .apply_desired("$iothub/twin/res/204/?$rid=3&$version=8", b"")
            .unwrap();
        assert!(props.nothing_dirty());
        assert!(twin.build_reported(&mut props).unwrap().is_nothing_to_send());
    }

    #[test]
    fn test_rejected_status_is_error() {
        let mut twin = pnp_reconciler();
        let err = twin
            .apply_desired("$iothub/twin/res/400/?$rid=3", b"{}")
            .unwrap_err();
        assert!(matches!(err, TwinError::Rejected { status: 400, .. }));
    }

    #[test]
    fn test_unexpected_topic() {
        let mut twin = pnp_reconciler();
        let err = twin.apply_desired("devices/x/messages/devicebound/", b"{}").unwrap_err();
        assert!(matches!(err, TwinError::UnexpectedTopic { .. }));
    }

    #[test]
    fn test_plain_hub_reports_bare_values() {
        let mut twin = TwinReconciler::new(Box::new(PlainHub), DeviceTwin::new(10, "1.0.0"));
        let mut props = twin
            .apply_desired(DESIRED_TOPIC, br#"{"telemetryInterval":30,"$version":7}"#)
            .unwrap();

        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch, json!({"telemetryInterval": 30}));
    }

    #[test]
    fn test_local_led_change_reports_read_only_value() {
        let mut twin = pnp_reconciler();
        let mut props = twin.record_led(LedColor::Blue, LedState::On);
        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch, json!({"led_b": 1}));
    }

    #[test]
    fn test_local_led_no_change_is_not_reported() {
        let mut twin = pnp_reconciler();
        twin.record_led(LedColor::Red, LedState::Blink);

        let mut props = twin.record_led(LedColor::Red, LedState::NoChange);
        assert!(props.nothing_dirty());
        assert!(twin.build_reported(&mut props).unwrap().is_nothing_to_send());
        assert_eq!(twin.device().led_red, LedState::Blink);
    }

    #[test]
    fn test_local_debug_level_reported_without_desired_ack() {
        let mut twin = pnp_reconciler();
        twin.apply_desired(DESIRED_TOPIC, br#"{"telemetryInterval":20,"$version":7}"#)
            .unwrap();

        let mut props = twin.record_debug_level(4).unwrap();
        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch, json!({"debugLevel": 4}));

        let mut props = twin.record_app_property(3, 11).unwrap();
        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch, json!({"property_3": 11}));
    }

    #[test]
    fn test_record_app_property_bounds() {
        let mut twin = pnp_reconciler();
        assert!(twin.record_app_property(0, 1).is_err());
        assert!(twin.record_app_property(5, 1).is_err());

        let mut props = twin.record_app_property(2, -7).unwrap();
        let patch = patch_json(twin.build_reported(&mut props).unwrap());
        assert_eq!(patch, json!({"property_2": -7}));
    }

    #[test]
    fn test_request_ids_increment() {
        let mut twin = pnp_reconciler();
        assert_eq!(twin.next_request_id(), 1);
        assert_eq!(twin.next_request_id(), 2);
    }
}
