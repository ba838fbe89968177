//! Broker-backed message bus over MQTT
//!
//! Channels map onto broker topics under a configurable prefix
//! (`algoforge/agent/results` for `agent.results`), published at QoS 1 for
//! at-least-once delivery. Locally the bus composes the in-process fan-out:
//! packets arriving from the broker are decoded back into events and handed
//! to the same per-subscription queues the in-memory backend uses, so
//! handler semantics are identical across back-ends.

use crate::bus::channels::{canonicalize_channel, validate_channel};
use crate::bus::memory::InMemoryBus;
use crate::bus::{BusError, EventHandler, MessageBus, SubscriptionToken};
use crate::protocol::Event;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event as MqttEvent, MqttOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connection settings for the broker-backed bus.
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    /// Broker URL, e.g. `mqtt://localhost:1883`.
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "algoforge".to_string(),
            keep_alive_secs: 30,
            topic_prefix: "algoforge".to_string(),
        }
    }
}

fn topic_for_channel(prefix: &str, channel: &str) -> String {
    format!("{}/{}", prefix, channel.replace('.', "/"))
}

fn channel_for_topic(prefix: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    Some(rest.replace('/', "."))
}

/// Broker-backed [`MessageBus`].
pub struct MqttBus {
    client: AsyncClient,
    local: InMemoryBus,
    config: MqttBusConfig,
    connected: Arc<AtomicBool>,
    /// channel -> (broker ref-count), plus token -> channel for unsubscribe.
    routing: Mutex<MqttRouting>,
}

#[derive(Default)]
struct MqttRouting {
    channel_refs: HashMap<String, usize>,
    token_channels: HashMap<SubscriptionToken, String>,
}

impl MqttBus {
    /// Connect to the broker and start the event-loop task.
    pub async fn connect(config: MqttBusConfig) -> Result<Arc<Self>, BusError> {
        let parsed = url::Url::parse(&config.broker_url)
            .map_err(|e| BusError::TransportUnavailable(format!("invalid broker url: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| {
                BusError::TransportUnavailable("broker url has no host".to_string())
            })?
            .to_string();
        let port = parsed.port().unwrap_or(1883);

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_start(true);

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let bus = Arc::new(Self {
            client,
            local: InMemoryBus::new(),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            routing: Mutex::new(MqttRouting::default()),
        });

        let loop_bus = Arc::downgrade(&bus);
        let connected = bus.connected.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt bus connected to broker");
                        connected.store(true, Ordering::Relaxed);
                        if let Some(bus) = loop_bus.upgrade() {
                            bus.resubscribe_all().await;
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        let Some(bus) = loop_bus.upgrade() else { break };
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        bus.handle_incoming(&topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.swap(false, Ordering::Relaxed) {
                            warn!(error = %e, "mqtt bus lost broker connection");
                        }
                        if loop_bus.strong_count() == 0 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("mqtt bus event loop stopped");
        });

        Ok(bus)
    }

    async fn handle_incoming(&self, topic: &str, payload: &[u8]) {
        let Some(channel) = channel_for_topic(&self.config.topic_prefix, topic) else {
            debug!(topic = %topic, "ignoring packet outside bus prefix");
            return;
        };
        let event: Event = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping undecodable bus packet");
                return;
            }
        };
        // Local re-publish validates again and fans out to subscribers.
        if let Err(e) = self.local.publish(&channel, event).await {
            warn!(channel = %channel, error = %e, "incoming broker event rejected");
        }
    }

    async fn resubscribe_all(&self) {
        let channels: Vec<String> = {
            let routing = self.routing.lock().await;
            routing.channel_refs.keys().cloned().collect()
        };
        for channel in channels {
            let topic = topic_for_channel(&self.config.topic_prefix, &channel);
            if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                warn!(topic = %topic, error = %e, "resubscribe after reconnect failed");
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, channel: &str, event: Event) -> Result<(), BusError> {
        event.validate()?;
        let channel = canonicalize_channel(channel);
        validate_channel(&channel)?;

        let topic = topic_for_channel(&self.config.topic_prefix, &channel);
        let payload = serde_json::to_vec(&event)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::TransportUnavailable(e.to_string()))
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, BusError> {
        let channel = canonicalize_channel(channel);
        let token = self.local.subscribe(&channel, handler).await?;

        let mut routing = self.routing.lock().await;
        let refs = routing.channel_refs.entry(channel.clone()).or_insert(0);
        *refs += 1;
        let first = *refs == 1;
        routing.token_channels.insert(token, channel.clone());
        drop(routing);

        if first {
            let topic = topic_for_channel(&self.config.topic_prefix, &channel);
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::TransportUnavailable(e.to_string()))?;
        }
        Ok(token)
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), BusError> {
        self.local.unsubscribe(token).await?;

        let mut routing = self.routing.lock().await;
        let Some(channel) = routing.token_channels.remove(&token) else {
            return Ok(());
        };
        let last = match routing.channel_refs.get_mut(&channel) {
            Some(refs) => {
                *refs = refs.saturating_sub(1);
                *refs == 0
            }
            None => false,
        };
        if last {
            routing.channel_refs.remove(&channel);
        }
        drop(routing);

        if last {
            let topic = topic_for_channel(&self.config.topic_prefix, &channel);
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| BusError::TransportUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
