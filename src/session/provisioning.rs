use super::topics::{parse_provisioning_topic, TopicBuilder, DPS_RESPONSE_FILTER};
use super::{BrokerEndpoint, BrokerSession, Outbox, SessionError, SessionSignal};
use crate::engine::RetryBudget;
use crate::transport::{ConnectRequest, OutboundMessage, QoS, Subscription};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DPS_API_VERSION: &str = "2019-03-31";
/// Used when the service gives no `retry-after` hint
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 3;
/// A fresh registration starts when no assignment arrives in this window
pub const REGISTER_RETRY_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    #[serde(default)]
    operation_id: Option<String>,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug)]
struct PendingQuery {
    operation_id: String,
    countdown: RetryBudget,
}

/// Device provisioning service registration session
#[derive(Debug)]
pub struct ProvisioningSession {
    endpoint: BrokerEndpoint,
    id_scope: String,
    device_id: String,
    model_id: Option<String>,
    tick: Duration,
    request_id: u32,
    pending_query: Option<PendingQuery>,
    register_retry: RetryBudget,
    assigned: bool,
}

impl ProvisioningSession {
    pub fn new<S: Into<String>>(
        endpoint: BrokerEndpoint,
        id_scope: S,
        device_id: S,
        model_id: Option<String>,
        tick: Duration,
    ) -> Self {
        Self {
            endpoint,
            id_scope: id_scope.into(),
            device_id: device_id.into(),
            model_id,
            tick,
            request_id: 0,
            pending_query: None,
            register_retry: RetryBudget::from_timeout(
                "dps_register",
                Duration::from_secs(REGISTER_RETRY_SECS),
                tick,
            ),
            assigned: false,
        }
    }

    pub fn username(&self) -> String {
        format!(
            "{}/registrations/{}/api-version={}",
            self.id_scope, self.device_id, DPS_API_VERSION
        )
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn register_payload(&self) -> Bytes {
        let body = match &self.model_id {
            Some(model_id) => json!({ "payload": { "modelId": model_id } }),
            None => json!({ "payload": {} }),
        };
        Bytes::from(body.to_string())
    }

    fn send_register(&mut self, outbox: &mut Outbox) {
        let request_id = self.next_request_id();
        debug!(request_id, "Sending provisioning registration");
        self.pending_query = None;
        outbox.push(OutboundMessage::new(
            TopicBuilder::dps_register_topic(request_id),
            self.register_payload(),
            QoS::AtMostOnce,
        ));
        self.register_retry.arm();
    }

    fn schedule_query(&mut self, operation_id: String, retry_after_secs: Option<u32>) {
        let secs = retry_after_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let mut countdown = RetryBudget::from_timeout(
            "dps_query",
            Duration::from_secs(u64::from(secs)),
            self.tick,
        );
        countdown.arm();
        debug!(operation_id = %operation_id, secs, "Polling registration status later");
        self.pending_query = Some(PendingQuery {
            operation_id,
            countdown,
        });
    }
}

impl BrokerSession for ProvisioningSession {
    fn name(&self) -> &'static str {
        "provisioning"
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            client_id: self.device_id.clone(),
            username: self.username(),
            keep_alive_secs: super::hub::DEFAULT_KEEP_ALIVE_SECS,
            clean_session: true,
        }
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(DPS_RESPONSE_FILTER, QoS::AtMostOnce)]
    }

    fn on_connected(&mut self, outbox: &mut Outbox) {
        info!(id_scope = %self.id_scope, device_id = %self.device_id, "Provisioning session established");
        self.pending_query = None;
        self.send_register(outbox);
    }

    fn on_message(&mut self, topic: &str, payload: &Bytes, _outbox: &mut Outbox) -> SessionSignal {
        let Some(parsed) = parse_provisioning_topic(topic) else {
            debug!(topic = %topic, "Ignoring publish outside provisioning responses");
            return SessionSignal::Idle;
        };

        let response: RegistrationResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) if parsed.status >= 300 => {
                warn!(status = parsed.status, error = %e, "Provisioning request rejected");
                return SessionSignal::Failed(SessionError::UnexpectedStatus {
                    status: parsed.status,
                });
            }
            Err(e) => {
                return SessionSignal::Failed(SessionError::MalformedResponse {
                    message: e.to_string(),
                });
            }
        };

        match response.status.as_str() {
            "assigned" => {
                let state = response.registration_state.unwrap_or(RegistrationState {
                    assigned_hub: None,
                    device_id: None,
                    error_message: None,
                });
                match (state.assigned_hub, state.device_id) {
                    (Some(hub_host), Some(device_id)) => {
                        info!(hub = %hub_host, device_id = %device_id, "Device assigned to hub");
                        self.assigned = true;
                        self.pending_query = None;
                        self.register_retry.cancel();
                        SessionSignal::Assigned {
                            hub_host,
                            device_id,
                        }
                    }
                    _ => SessionSignal::Failed(SessionError::MalformedResponse {
                        message: "assigned response without hub or device id".to_string(),
                    }),
                }
            }
            "assigning" | "unassigned" => match response.operation_id {
                Some(operation_id) => {
                    self.schedule_query(operation_id, parsed.retry_after_secs);
                    SessionSignal::Idle
                }
                None => SessionSignal::Failed(SessionError::MalformedResponse {
                    message: "pending registration without operation id".to_string(),
                }),
            },
            other => {
                let detail = response
                    .registration_state
                    .and_then(|state| state.error_message)
                    .unwrap_or_default();
                error!(status = %other, detail = %detail, "Provisioning registration failed");
                self.pending_query = None;
                self.register_retry.cancel();
                SessionSignal::Failed(SessionError::RegistrationFailed {
                    status: other.to_string(),
                })
            }
        }
    }

    fn on_tick(&mut self, outbox: &mut Outbox) {
        if self.assigned {
            return;
        }

        let due = self
            .pending_query
            .as_mut()
            .is_some_and(|query| query.countdown.tick());
        if due {
            let request_id = self.next_request_id();
            if let Some(query) = self.pending_query.as_mut() {
                outbox.push(OutboundMessage::new(
                    TopicBuilder::dps_status_topic(request_id, &query.operation_id),
                    Bytes::new(),
                    QoS::AtMostOnce,
                ));
                // Asked again unless a reply reschedules it first
                query.countdown.arm();
            }
        }

        if self.register_retry.tick() {
            warn!("No provisioning response, retrying registration");
            self.send_register(outbox);
        }
    }
}
