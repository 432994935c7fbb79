use super::topics::{
    parse_method_topic, topic_matches, TopicBuilder, INITIAL_GET_REQUEST_ID, METHODS_FILTER,
    TWIN_DESIRED_FILTER, TWIN_RESPONSE_FILTER,
};
use super::{BrokerEndpoint, BrokerSession, Outbox, SessionSignal};
use crate::transport::{ConnectRequest, OutboundMessage, QoS, Subscription};
use bytes::Bytes;
use tracing::{debug, info, warn};

pub const HUB_API_VERSION: &str = "2021-04-12";
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 240;

/// Device-to-hub session
#[derive(Debug, Clone)]
pub struct HubSession {
    endpoint: BrokerEndpoint,
    device_id: String,
    model_id: Option<String>,
    keep_alive_secs: u16,
    c2d_filter: String,
}

impl HubSession {
    pub fn new<S: Into<String>>(endpoint: BrokerEndpoint, device_id: S, model_id: Option<String>) -> Self {
        let device_id = device_id.into();
        Self {
            c2d_filter: TopicBuilder::cloud_to_device_filter(&device_id),
            endpoint,
            device_id,
            model_id,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive_secs: u16) -> Self {
        self.keep_alive_secs = keep_alive_secs;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn username(&self) -> String {
        let mut username = format!(
            "{}/{}/?api-version={}",
            self.endpoint.host, self.device_id, HUB_API_VERSION
        );
        if let Some(model_id) = &self.model_id {
            username.push_str("&model-id=");
            username.push_str(model_id);
        }
        username
    }
}

impl BrokerSession for HubSession {
    fn name(&self) -> &'static str {
        "hub"
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            client_id: self.device_id.clone(),
            username: self.username(),
            keep_alive_secs: self.keep_alive_secs,
            clean_session: true,
        }
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(self.c2d_filter.as_str(), QoS::AtMostOnce),
            Subscription::new(METHODS_FILTER, QoS::AtMostOnce),
            Subscription::new(TWIN_RESPONSE_FILTER, QoS::AtMostOnce),
            Subscription::new(TWIN_DESIRED_FILTER, QoS::AtMostOnce),
        ]
    }

    fn on_connected(&mut self, outbox: &mut Outbox) {
        info!(device_id = %self.device_id, hub = %self.endpoint.host, "Hub session established, requesting twin");
        outbox.push(OutboundMessage::new(
            TopicBuilder::twin_get_topic(INITIAL_GET_REQUEST_ID),
            Bytes::new(),
            QoS::AtMostOnce,
        ));
    }

    fn on_message(&mut self, topic: &str, payload: &Bytes, _outbox: &mut Outbox) -> SessionSignal {
        if topic_matches(topic, TWIN_RESPONSE_FILTER) || topic_matches(topic, TWIN_DESIRED_FILTER) {
            return SessionSignal::Twin {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
        }

        if topic_matches(topic, METHODS_FILTER) {
            return match parse_method_topic(topic) {
                Some(method) => SessionSignal::Method {
                    name: method.name.to_string(),
                    request_id: method.request_id.to_string(),
                    payload: payload.clone(),
                },
                None => {
                    warn!(topic = %topic, "Method invocation without request id");
                    SessionSignal::Idle
                }
            };
        }

        if topic_matches(topic, &self.c2d_filter) {
            return SessionSignal::CloudToDevice {
                payload: payload.clone(),
            };
        }

        debug!(topic = %topic, "Ignoring publish on unrouted topic");
        SessionSignal::Idle
    }
}
