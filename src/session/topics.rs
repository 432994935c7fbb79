//! Broker topic construction, filter matching and topic parsing
//!
//! Topic strings follow the hub and provisioning-service MQTT conventions:
//! request ids, versions and retry hints travel as `?key=value&...` query
//! parameters in the final topic level.

use thiserror::Error;

/// Request id used for the twin GET issued right after the session opens
pub const INITIAL_GET_REQUEST_ID: &str = "initial_get";

pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const METHODS_FILTER: &str = "$iothub/methods/POST/#";
pub const DPS_RESPONSE_FILTER: &str = "$dps/registrations/res/#";

/// Topic builders for every published topic
pub struct TopicBuilder;

impl TopicBuilder {
    pub fn telemetry_topic(device_id: &str) -> String {
        format!("devices/{device_id}/messages/events/")
    }

    pub fn cloud_to_device_filter(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    pub fn twin_patch_topic(request_id: u32) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }

    pub fn method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    pub fn dps_register_topic(request_id: u32) -> String {
        format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
    }

    pub fn dps_status_topic(request_id: u32, operation_id: &str) -> String {
        format!(
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
        )
    }
}

/// MQTT filter match with `+` and `#` wildcards
///
/// `$`-prefixed topics are matched literally like any other topic, since the
/// device subscribes to `$iothub/...` and `$dps/...` filters explicitly.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut levels = topic.split('/');

    for expected in filter.split('/') {
        if expected == "#" {
            return true;
        }
        match levels.next() {
            Some(_) if expected == "+" => continue,
            Some(level) if level == expected => continue,
            _ => return false,
        }
    }

    levels.next().is_none()
}

/// Value of `key` in the topic's trailing `?a=b&c=d` query
pub fn query_param<'a>(topic: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = topic.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Topic levels before the query part, with empty levels dropped
fn path_levels(topic: &str) -> Vec<&str> {
    let path = topic.split_once('?').map_or(topic, |(path, _)| path);
    path.split('/').filter(|level| !level.is_empty()).collect()
}

/// Twin topics delivered to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinTopic<'a> {
    /// `$iothub/twin/res/{status}/?$rid=..` answering a GET or a reported PATCH
    Response {
        status: u16,
        request_id: Option<&'a str>,
        version: Option<i64>,
    },
    /// `$iothub/twin/PATCH/properties/desired/?$version=..`
    DesiredPatch { version: Option<i64> },
}

pub fn parse_twin_topic(topic: &str) -> Option<TwinTopic<'_>> {
    let version = query_param(topic, "$version").and_then(|v| v.parse().ok());

    match path_levels(topic).as_slice() {
        ["$iothub", "twin", "res", status] => Some(TwinTopic::Response {
            status: status.parse().ok()?,
            request_id: query_param(topic, "$rid"),
            version,
        }),
        ["$iothub", "twin", "PATCH", "properties", "desired"] => {
            Some(TwinTopic::DesiredPatch { version })
        }
        _ => None,
    }
}

/// `$iothub/methods/POST/{name}/?$rid={rid}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodTopic<'a> {
    pub name: &'a str,
    pub request_id: &'a str,
}

pub fn parse_method_topic(topic: &str) -> Option<MethodTopic<'_>> {
    match path_levels(topic).as_slice() {
        ["$iothub", "methods", "POST", name] => Some(MethodTopic {
            name: *name,
            request_id: query_param(topic, "$rid")?,
        }),
        _ => None,
    }
}

/// `$dps/registrations/res/{status}/?$rid=..&retry-after=..`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningTopic<'a> {
    pub status: u16,
    pub request_id: Option<&'a str>,
    pub retry_after_secs: Option<u32>,
}

pub fn parse_provisioning_topic(topic: &str) -> Option<ProvisioningTopic<'_>> {
    match path_levels(topic).as_slice() {
        ["$dps", "registrations", "res", status] => Some(ProvisioningTopic {
            status: status.parse().ok()?,
            request_id: query_param(topic, "$rid"),
            retry_after_secs: query_param(topic, "retry-after").and_then(|v| v.parse().ok()),
        }),
        _ => None,
    }
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Provisioning ID scopes look like `0neXXXXXXXX`
pub fn validate_id_scope(id_scope: &str) -> Result<(), ValidationError> {
    let valid = id_scope.len() == 11
        && id_scope.starts_with("0ne")
        && id_scope[3..].chars().all(|c| c.is_ascii_alphanumeric());

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdScope(id_scope.to_string()))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Invalid ID scope '{0}', expected 0neXXXXXXXX")]
    InvalidIdScope(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(
            TopicBuilder::telemetry_topic("sensor-1"),
            "devices/sensor-1/messages/events/"
        );
        assert_eq!(
            TopicBuilder::twin_get_topic(INITIAL_GET_REQUEST_ID),
            "$iothub/twin/GET/?$rid=initial_get"
        );
        assert_eq!(
            TopicBuilder::twin_patch_topic(3),
            "$iothub/twin/PATCH/properties/reported/?$rid=3"
        );
        assert_eq!(
            TopicBuilder::method_response_topic(202, "7"),
            "$iothub/methods/res/202/?$rid=7"
        );
    }

    #[test]
    fn test_topic_matches_dollar_topics() {
        assert!(topic_matches(
            "$iothub/twin/res/200/?$rid=initial_get",
            TWIN_RESPONSE_FILTER
        ));
        assert!(topic_matches(
            "$iothub/twin/PATCH/properties/desired/?$version=4",
            TWIN_DESIRED_FILTER
        ));
        assert!(topic_matches("$iothub/methods/POST/reboot/?$rid=1", METHODS_FILTER));
        assert!(!topic_matches("$iothub/methods/POST/reboot/?$rid=1", TWIN_RESPONSE_FILTER));
    }

    #[test]
    fn test_topic_matches_wildcards() {
        assert!(topic_matches("a/b/c", "a/+/c"));
        assert!(topic_matches("a/b/c", "a/#"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c/d", "a/+/c"));
        assert!(topic_matches(
            "devices/d1/messages/devicebound/%24.to=x",
            &TopicBuilder::cloud_to_device_filter("d1")
        ));
    }

    #[test]
    fn test_parse_twin_response() {
        let parsed = parse_twin_topic("$iothub/twin/res/200/?$rid=initial_get").unwrap();
        assert_eq!(
            parsed,
            TwinTopic::Response {
                status: 200,
                request_id: Some("initial_get"),
                version: None
            }
        );

        let ack = parse_twin_topic("$iothub/twin/res/204/?$rid=5&$version=12").unwrap();
        assert_eq!(
            ack,
            TwinTopic::Response {
                status: 204,
                request_id: Some("5"),
                version: Some(12)
            }
        );
    }

    #[test]
    fn test_parse_desired_patch() {
        assert_eq!(
            parse_twin_topic("$iothub/twin/PATCH/properties/desired/?$version=9"),
            Some(TwinTopic::DesiredPatch { version: Some(9) })
        );
        assert_eq!(parse_twin_topic("$iothub/methods/POST/x/?$rid=1"), None);
        assert_eq!(parse_twin_topic("$iothub/twin/res/abc/?$rid=1"), None);
    }

    #[test]
    fn test_parse_method_topic() {
        let method = parse_method_topic("$iothub/methods/POST/sendMsg/?$rid=42").unwrap();
        assert_eq!(method.name, "sendMsg");
        assert_eq!(method.request_id, "42");
        assert!(parse_method_topic("$iothub/methods/POST/sendMsg/").is_none());
    }

    #[test]
    fn test_parse_provisioning_topic() {
        let parsed =
            parse_provisioning_topic("$dps/registrations/res/202/?$rid=1&retry-after=3").unwrap();
        assert_eq!(parsed.status, 202);
        assert_eq!(parsed.request_id, Some("1"));
        assert_eq!(parsed.retry_after_secs, Some(3));
    }

    #[test]
    fn test_validate_id_scope() {
        assert!(validate_id_scope("0ne0012ABCD").is_ok());
        assert!(validate_id_scope("0ne001").is_err());
        assert!(validate_id_scope("1ne0012ABCD").is_err());
        assert!(validate_id_scope("0ne0012AB-D").is_err());
    }

    #[test]
    fn test_validate_device_id_examples() {
        assert!(validate_device_id("sam-iot_01.a").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("dev/1"),
            Err(ValidationError::InvalidDeviceIdChar('/'))
        );
    }

    proptest! {
        #[test]
        fn hash_filter_matches_any_suffix(suffix in "[a-z0-9/]{0,24}") {
            let topic = format!("$iothub/twin/res/{suffix}");
            prop_assert!(topic_matches(&topic, TWIN_RESPONSE_FILTER));
        }

        #[test]
        fn valid_device_ids_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_device_id(&id).is_ok());
        }
    }
}
