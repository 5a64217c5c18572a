//! Model-based client test
//!
//! [`ModelRunner`] drives a client through a random sequence of operations
//! while keeping its own model of what the broker should have: which topics
//! are subscribed and which retained messages exist. After every operation
//! it checks the client against the model. Each operation is written to a
//! replay log first, so a failing sequence can be reproduced exactly with
//! [`ModelRunner::replay`].
//!
//! Random choices come from a seeded [`StdRng`]: the same seed against the
//! same broker produces the same sequence.

use crate::client::{ActionResult, ClientCallback, ConnectOptions, MqttClient};
use crate::error::MqttError;
use crate::protocol::QoS;
use crate::replay::{ReplayEvent, ReplayParseError, ReplayRecorder};
use crate::testing::RecordingCallback;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Operation weights while connected: disconnect, subscribe, unsubscribe,
/// publish, pendingDeliveryTokens
const CONNECTED_TABLE: [f64; 5] = [0.05, 0.2, 0.2, 0.5, 0.05];

/// Operation weights while disconnected: connect, pendingDeliveryTokens,
/// disconnect
const DISCONNECTED_TABLE: [f64; 3] = [0.5, 0.2, 0.3];

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{operation} failed: {source}")]
    Client {
        operation: &'static str,
        #[source]
        source: MqttError,
    },

    #[error("Client state mismatch [expected:{expected}][actual:{actual}]")]
    StateMismatch { expected: bool, actual: bool },

    #[error("Subscription state mismatch [topic:{topic}][expected:{expected}]")]
    SubscriptionMismatch { topic: String, expected: bool },

    #[error("Unsubscribe reported existed={reported} [topic:{topic}][expected:{expected}]")]
    UnsubscribeResultMismatch {
        topic: String,
        expected: bool,
        reported: bool,
    },

    #[error("message timeout [topic:{topic}]")]
    MessageTimeout { topic: String },

    #[error("pre-existing retained message [expectedTopic:{expected_topic}][receivedTopic:{received_topic}]")]
    PreExistingRetained {
        expected_topic: String,
        received_topic: String,
    },

    #[error("message topic mismatch [expectedTopic:{expected}][receivedTopic:{received}]")]
    TopicMismatch { expected: String, received: String },

    #[error("message payload mismatch [topic:{topic}][expectedPayload:{expected}][receivedPayload:{received}]")]
    PayloadMismatch {
        topic: String,
        expected: String,
        received: String,
    },

    #[error("message retained flag mismatch [topic:{topic}][expected:{expected}]")]
    RetainedMismatch { topic: String, expected: bool },

    #[error("no retained message known for [topic:{0}]")]
    UnknownRetained(String),

    #[error("Unexpected pending tokens [expected:{expected}][actual:{actual}]")]
    PendingTokens { expected: usize, actual: usize },

    #[error(transparent)]
    Parse(#[from] ReplayParseError),

    #[error("replay log: {0}")]
    Log(#[from] std::io::Error),
}

fn client_error(operation: &'static str) -> impl FnOnce(MqttError) -> ModelError {
    move |source| ModelError::Client { operation, source }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub seed: u64,
    /// How long to wait for an expected message
    pub message_timeout: Duration,
    /// Drain timeout handed to `disconnect`
    pub disconnect_timeout: Duration,
    /// Upper bound on waiting for any token
    pub operation_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            message_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(15),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelReport {
    pub steps: usize,
    pub operations: BTreeMap<&'static str, usize>,
    pub messages_checked: usize,
}

pub struct ModelRunner {
    client: MqttClient,
    callback: Arc<RecordingCallback>,
    settings: ModelSettings,
    rng: StdRng,
    subscribed_topics: BTreeMap<String, QoS>,
    retained_publishes: BTreeMap<String, String>,
    clean_session: bool,
    recorder: Option<ReplayRecorder>,
    report: ModelReport,
}

impl ModelRunner {
    /// Take over `client`: its callback is replaced by the runner's
    pub async fn new(
        client: MqttClient,
        settings: ModelSettings,
        recorder: Option<ReplayRecorder>,
    ) -> Result<Self, ModelError> {
        let callback = RecordingCallback::new();
        let installed: Arc<dyn ClientCallback> = callback.clone();
        client
            .set_callback(Some(installed))
            .await
            .map_err(client_error("set_callback"))?;

        Ok(Self {
            client,
            callback,
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            subscribed_topics: BTreeMap::new(),
            retained_publishes: BTreeMap::new(),
            clean_session: true,
            recorder,
            report: ModelReport::default(),
        })
    }

    pub fn client(&self) -> &MqttClient {
        &self.client
    }

    pub fn report(&self) -> &ModelReport {
        &self.report
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed_topics.keys().cloned().collect()
    }

    /// Clear state left by earlier runs with a clean connect and disconnect.
    /// Not recorded in the log.
    pub async fn initialise(&mut self) -> Result<(), ModelError> {
        let timeout = Some(self.settings.operation_timeout);
        self.client
            .connect(ConnectOptions::default().clean_session(true))
            .await
            .map_err(client_error("connect"))?
            .wait_for_completion(timeout)
            .await
            .map_err(client_error("connect"))?;
        self.client
            .disconnect(self.settings.disconnect_timeout)
            .await
            .map_err(client_error("disconnect"))?
            .wait_for_completion(timeout)
            .await
            .map_err(client_error("disconnect"))?;
        self.callback.drain_messages().await;
        Ok(())
    }

    /// Run `steps` randomly chosen operations
    pub async fn run(&mut self, steps: usize) -> Result<ModelReport, ModelError> {
        info!(steps, seed = self.settings.seed, "Starting model run");
        let result = self.run_steps(steps).await;
        self.finish(result).await
    }

    /// Reproduce a recorded sequence, checking the recorded expectations
    pub async fn replay(&mut self, events: &[ReplayEvent]) -> Result<ModelReport, ModelError> {
        info!(events = events.len(), "Replaying recorded operations");
        let result = self.replay_events(events).await;
        self.finish(result).await
    }

    async fn run_steps(&mut self, steps: usize) -> Result<(), ModelError> {
        for _ in 0..steps {
            if self.client.is_connected() {
                match self.option(&CONNECTED_TABLE) {
                    Some(0) => self.disconnect(self.clean_session, true).await?,
                    Some(1) => self.random_subscribe().await?,
                    Some(2) => self.random_unsubscribe().await?,
                    Some(3) => self.random_publish().await?,
                    Some(4) => self.pending_delivery_tokens(None)?,
                    _ => {}
                }
            } else {
                match self.option(&DISCONNECTED_TABLE) {
                    Some(0) => {
                        let clean_session = self.rng.gen_bool(0.5);
                        self.connect(clean_session).await?;
                    }
                    // Every disconnect drains in-flight work
                    Some(1) => self.pending_delivery_tokens(Some(0))?,
                    Some(2) => self.disconnect(self.clean_session, false).await?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn replay_events(&mut self, events: &[ReplayEvent]) -> Result<(), ModelError> {
        for event in events {
            match event.clone() {
                ReplayEvent::Connect { clean_session } => self.connect(clean_session).await?,
                ReplayEvent::Disconnect {
                    clean_session,
                    is_connected,
                } => self.disconnect(clean_session, is_connected).await?,
                ReplayEvent::Subscribe {
                    topic,
                    qos,
                    expect_retained,
                } => self.subscribe(topic, qos, expect_retained).await?,
                ReplayEvent::Unsubscribe { topic, existing } => {
                    self.unsubscribe(topic, existing).await?
                }
                ReplayEvent::Publish {
                    topic,
                    payload,
                    qos,
                    retained,
                    subscribed,
                    wait_for_completion,
                } => {
                    self.publish(topic, payload, qos, retained, subscribed, wait_for_completion)
                        .await?
                }
                ReplayEvent::PendingDeliveryTokens { count } => {
                    self.pending_delivery_tokens(Some(count))?
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self, result: Result<(), ModelError>) -> Result<ModelReport, ModelError> {
        if let Err(e) = &result {
            error!(step = self.report.steps, error = %e, "Model check failed");
            if let Some(recorder) = self.recorder.as_mut() {
                let _ = recorder.note(&format!("Failure: {e}"));
            }
        }

        if self.client.is_connected() {
            match self.client.disconnect(self.settings.disconnect_timeout).await {
                Ok(token) => {
                    if let Err(e) = token
                        .wait_for_completion(Some(self.settings.operation_timeout))
                        .await
                    {
                        warn!(error = %e, "Final disconnect did not complete");
                    }
                }
                Err(e) => warn!(error = %e, "Final disconnect rejected"),
            }
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.flush()?;
        }

        result.map(|()| {
            info!(steps = self.report.steps, "Model run passed");
            self.report.clone()
        })
    }

    fn option(&mut self, table: &[f64]) -> Option<usize> {
        let n: f64 = self.rng.gen();
        let mut cumulative = 0.0;
        for (index, weight) in table.iter().enumerate() {
            cumulative += weight;
            if cumulative > n {
                return Some(index);
            }
        }
        None
    }

    fn random_id(&mut self) -> String {
        let bytes: [u8; 16] = self.rng.gen();
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }

    fn pick<V>(&mut self, map: &BTreeMap<String, V>) -> Option<String> {
        if map.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..map.len());
        map.keys().nth(index).cloned()
    }

    fn random_qos(&mut self) -> QoS {
        match self.rng.gen_range(0..3u8) {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn record(&mut self, event: ReplayEvent) -> Result<(), ModelError> {
        self.report.steps += 1;
        *self.report.operations.entry(event.name()).or_default() += 1;
        info!(step = self.report.steps, event = %event, "Model step");
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&event)?;
        }
        Ok(())
    }

    // Operations

    pub async fn connect(&mut self, clean_session: bool) -> Result<(), ModelError> {
        self.record(ReplayEvent::Connect { clean_session })?;
        if clean_session {
            self.subscribed_topics.clear();
        }
        self.clean_session = clean_session;

        self.client
            .connect(ConnectOptions::default().clean_session(clean_session))
            .await
            .map_err(client_error("connect"))?
            .wait_for_completion(Some(self.settings.operation_timeout))
            .await
            .map_err(client_error("connect"))?;
        Ok(())
    }

    pub async fn disconnect(&mut self, clean_session: bool, expected_connected: bool) -> Result<(), ModelError> {
        let actual = self.client.is_connected();
        self.record(ReplayEvent::Disconnect {
            clean_session,
            is_connected: actual,
        })?;
        if expected_connected != actual {
            return Err(ModelError::StateMismatch {
                expected: expected_connected,
                actual,
            });
        }
        if actual && clean_session {
            self.subscribed_topics.clear();
        }

        match self.client.disconnect(self.settings.disconnect_timeout).await {
            Ok(token) => {
                token
                    .wait_for_completion(Some(self.settings.operation_timeout))
                    .await
                    .map_err(client_error("disconnect"))?;
            }
            Err(MqttError::AlreadyDisconnected) if !expected_connected => {}
            Err(e) => return Err(client_error("disconnect")(e)),
        }
        Ok(())
    }

    async fn random_subscribe(&mut self) -> Result<(), ModelError> {
        let retained = self.retained_publishes.clone();
        let (topic, expect_retained) = match self.rng.gen_range(0..5) {
            0 if !retained.is_empty() => match self.pick(&retained) {
                Some(topic) => (topic, true),
                None => (self.random_id(), false),
            },
            _ => (self.random_id(), false),
        };
        let qos = self.random_qos();
        self.subscribe(topic, qos, expect_retained).await
    }

    pub async fn subscribe(&mut self, topic: String, qos: QoS, expect_retained: bool) -> Result<(), ModelError> {
        self.record(ReplayEvent::Subscribe {
            topic: topic.clone(),
            qos,
            expect_retained,
        })?;
        self.subscribed_topics.insert(topic.clone(), qos);

        self.client
            .subscribe(topic.clone(), qos, expect_retained)
            .await
            .map_err(client_error("subscribe"))?
            .wait_for_completion(Some(self.settings.operation_timeout))
            .await
            .map_err(client_error("subscribe"))?;

        if expect_retained {
            let payload = self
                .retained_publishes
                .get(&topic)
                .cloned()
                .ok_or_else(|| ModelError::UnknownRetained(topic.clone()))?;
            self.wait_for_message(&topic, &payload, true).await?;
        }
        Ok(())
    }

    async fn random_unsubscribe(&mut self) -> Result<(), ModelError> {
        let subscribed = self.subscribed_topics.clone();
        let picked = if self.rng.gen_bool(0.5) {
            self.pick(&subscribed)
        } else {
            None
        };
        match picked {
            Some(topic) => self.unsubscribe(topic, true).await,
            None => {
                let topic = self.random_id();
                self.unsubscribe(topic, false).await
            }
        }
    }

    pub async fn unsubscribe(&mut self, topic: String, existing: bool) -> Result<(), ModelError> {
        self.record(ReplayEvent::Unsubscribe {
            topic: topic.clone(),
            existing,
        })?;

        let result = self
            .client
            .unsubscribe(topic.clone())
            .await
            .map_err(client_error("unsubscribe"))?
            .wait_for_completion(Some(self.settings.operation_timeout))
            .await
            .map_err(client_error("unsubscribe"))?;

        let in_model = self.subscribed_topics.remove(&topic).is_some();
        if existing != in_model {
            return Err(ModelError::SubscriptionMismatch {
                topic,
                expected: existing,
            });
        }
        if let ActionResult::Unsubscribed { existed } = result {
            if existed != existing {
                return Err(ModelError::UnsubscribeResultMismatch {
                    topic,
                    expected: existing,
                    reported: existed,
                });
            }
        }
        Ok(())
    }

    async fn random_publish(&mut self) -> Result<(), ModelError> {
        let subscribed_topics = self.subscribed_topics.clone();
        let picked = if self.rng.gen_bool(0.5) {
            self.pick(&subscribed_topics)
        } else {
            None
        };
        let (topic, subscribed) = match picked {
            Some(topic) => (topic, true),
            None => (self.random_id(), false),
        };
        let payload = self.random_id();
        let qos = self.random_qos();
        let retained = self.rng.gen_range(0..3) == 0;

        // A retained publish must land before a later subscriber can expect it
        let wait_for_completion = retained || self.rng.gen_range(0..1000) == 1;
        self.publish(topic, payload, qos, retained, subscribed, wait_for_completion)
            .await?;

        if wait_for_completion && retained && qos == QoS::AtMostOnce {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    pub async fn publish(
        &mut self,
        topic: String,
        payload: String,
        qos: QoS,
        retained: bool,
        subscribed: bool,
        wait_for_completion: bool,
    ) -> Result<(), ModelError> {
        self.record(ReplayEvent::Publish {
            topic: topic.clone(),
            payload: payload.clone(),
            qos,
            retained,
            subscribed,
            wait_for_completion,
        })?;
        if subscribed != self.subscribed_topics.contains_key(&topic) {
            return Err(ModelError::SubscriptionMismatch {
                topic,
                expected: subscribed,
            });
        }
        if retained {
            self.retained_publishes.insert(topic.clone(), payload.clone());
        }

        let token = self
            .client
            .publish(topic.clone(), payload.clone(), qos, retained)
            .await
            .map_err(client_error("publish"))?;
        if retained || wait_for_completion {
            token
                .wait_for_completion(Some(self.settings.operation_timeout))
                .await
                .map_err(client_error("publish"))?;
        }

        if subscribed {
            self.wait_for_message(&topic, &payload, false).await?;
        }
        Ok(())
    }

    /// Record the pending delivery token count; `expected` is only checked
    /// while disconnected
    pub fn pending_delivery_tokens(&mut self, expected: Option<usize>) -> Result<(), ModelError> {
        let actual = self.client.pending_delivery_tokens().len();
        self.record(ReplayEvent::PendingDeliveryTokens { count: actual })?;
        match expected {
            Some(expected) if !self.client.is_connected() && expected != actual => {
                Err(ModelError::PendingTokens { expected, actual })
            }
            _ => Ok(()),
        }
    }

    async fn wait_for_message(&mut self, topic: &str, payload: &str, expect_retained: bool) -> Result<(), ModelError> {
        let message = self
            .callback
            .next_message(self.settings.message_timeout)
            .await
            .ok_or_else(|| ModelError::MessageTimeout {
                topic: topic.to_string(),
            })?;
        self.report.messages_checked += 1;

        if message.topic != topic {
            if message.retained && !expect_retained {
                return Err(ModelError::PreExistingRetained {
                    expected_topic: topic.to_string(),
                    received_topic: message.topic,
                });
            }
            return Err(ModelError::TopicMismatch {
                expected: topic.to_string(),
                received: message.topic,
            });
        }
        let received = message.payload_str();
        if received != payload {
            if message.retained && !expect_retained {
                return Err(ModelError::PreExistingRetained {
                    expected_topic: topic.to_string(),
                    received_topic: message.topic.clone(),
                });
            }
            return Err(ModelError::PayloadMismatch {
                topic: topic.to_string(),
                expected: payload.to_string(),
                received: received.into_owned(),
            });
        }
        if message.retained != expect_retained {
            return Err(ModelError::RetainedMismatch {
                topic: topic.to_string(),
                expected: expect_retained,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSettings;
    use crate::persistence::MemoryPersistence;
    use crate::testing::MockBroker;

    async fn runner(seed: u64) -> (MockBroker, ModelRunner) {
        let broker = MockBroker::new();
        let client = MqttClient::new(
            "model-unit",
            Arc::new(broker.clone()),
            Arc::new(MemoryPersistence::new()),
            ClientSettings::default(),
        )
        .unwrap();
        let settings = ModelSettings {
            seed,
            message_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let runner = ModelRunner::new(client, settings, None).await.unwrap();
        (broker, runner)
    }

    #[test]
    fn test_option_tables_sum_to_one() {
        let connected: f64 = CONNECTED_TABLE.iter().sum();
        let disconnected: f64 = DISCONNECTED_TABLE.iter().sum();
        assert!((connected - 1.0).abs() < 1e-9);
        assert!((disconnected - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_same_seed_same_topics() {
        let (_b1, mut first) = runner(7).await;
        let (_b2, mut second) = runner(7).await;
        assert_eq!(first.random_id(), second.random_id());
        assert_eq!(first.option(&CONNECTED_TABLE), second.option(&CONNECTED_TABLE));
    }

    #[tokio::test]
    async fn test_short_run_passes() {
        let (_broker, mut runner) = runner(42).await;
        runner.initialise().await.unwrap();

        let report = runner.run(60).await.unwrap();
        assert_eq!(report.steps, 60);
        assert!(!runner.client().is_connected());
    }

    #[tokio::test]
    async fn test_detects_state_mismatch() {
        let (_broker, mut runner) = runner(1).await;

        let error = runner.disconnect(true, true).await.unwrap_err();
        assert!(matches!(
            error,
            ModelError::StateMismatch {
                expected: true,
                actual: false
            }
        ));
    }

    #[tokio::test]
    async fn test_detects_subscription_mismatch() {
        let (_broker, mut runner) = runner(1).await;
        runner.connect(true).await.unwrap();

        let error = runner
            .unsubscribe("never-subscribed".to_string(), true)
            .await
            .unwrap_err();
        assert!(matches!(error, ModelError::SubscriptionMismatch { expected: true, .. }));
    }
}
