//! Broker connection lifecycle.
//!
//! [`BrokerLink`] is a statum typestate machine with three states:
//!
//! ```text
//! Idle ──connect()──► Online ──shutdown()──► Closed
//! ```
//!
//! Going `Online` spawns the event loop task, which polls rumqttc, re-subscribes after
//! every `ConnAck` and forwards [`BrokerEvent`]s to the synchronizer. The subscription is
//! queued from a helper task so the event loop keeps draining requests while it waits;
//! `Connected` is only reported once it is queued. Reconnects are left
//! to rumqttc: after a connection error the task waits one fixed `reconnect_period` and
//! polls again, there is no backoff.

use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, Outgoing, Packet, QoS, SubscribeFilter, SubscribeReasonCode,
};
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{BrokerEvent, InboundMessage};
use crate::sync::error::PublishError;
use crate::sync::synchronizer::CommandSink;

/// Upper bound for flushing the DISCONNECT packet on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Idle,
    Online,
    Closed,
}

#[machine]
pub struct BrokerLink<S: LinkState> {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    subscriptions: Vec<String>,
    pump: Option<JoinHandle<()>>,
    closing: CancellationToken,
}

impl<S: LinkState> BrokerLink<S> {
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

impl BrokerLink<Idle> {
    pub fn create(config: MqttConfig, subscriptions: Vec<String>) -> Self {
        info!(
            "Creating broker link to {} as '{}'",
            config.endpoint, config.client_id
        );
        let (client, eventloop) = AsyncClient::new(config.options(), config.channel_capacity);

        Self::new(
            config,
            client,
            Some(eventloop),
            subscriptions,
            None,
            CancellationToken::new(),
        )
    }

    /// Starts the event loop task. Events are delivered on `events` until shutdown.
    pub fn connect(mut self, events: mpsc::Sender<BrokerEvent>) -> BrokerLink<Online> {
        match self.eventloop.take() {
            Some(eventloop) => {
                let task = run_event_loop(
                    eventloop,
                    self.client.clone(),
                    self.subscriptions.clone(),
                    events,
                    self.closing.clone(),
                    self.config.reconnect_period,
                );
                self.pump = Some(tokio::spawn(task));
                info!(
                    "Broker event loop spawned for {} (topics: {:?})",
                    self.config.endpoint, self.subscriptions
                );
            }
            None => error!("Broker link has no event loop, staying offline"),
        }

        self.transition()
    }
}

impl BrokerLink<Online> {
    /// Sends DISCONNECT and waits a bounded time for the event loop to flush it.
    pub async fn shutdown(mut self) -> BrokerLink<Closed> {
        info!("Shutting down broker link to {}", self.config.endpoint);
        self.closing.cancel();

        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
        }

        if let Some(pump) = self.pump.take() {
            let abort = pump.abort_handle();
            match tokio::time::timeout(DISCONNECT_GRACE, pump).await {
                Ok(Ok(())) => debug!("Broker event loop finished"),
                Ok(Err(e)) => warn!("Broker event loop ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Broker event loop did not stop within {:?}, aborting",
                        DISCONNECT_GRACE
                    );
                    abort.abort();
                }
            }
        }

        self.transition()
    }

    /// Stops the event loop without a DISCONNECT. Used when the owner is dropped.
    pub fn abort(&mut self) {
        self.closing.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl CommandSink for AsyncClient {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::Client(e.to_string()))
    }
}

/// Queues the subscriptions, waiting for room if commands filled the request queue
/// while offline, then reports the link as connected.
async fn request_subscriptions(
    client: AsyncClient,
    subscriptions: Vec<String>,
    events: mpsc::Sender<BrokerEvent>,
) {
    if !subscriptions.is_empty() {
        let filters = subscriptions
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
        if let Err(e) = client.subscribe_many(filters).await {
            error!("Subscription error for {:?}: {}", subscriptions, e);
            let _ = events
                .send(BrokerEvent::SubscribeFailed(format!(
                    "Failed to subscribe to {}: {}",
                    subscriptions.join(", "),
                    e
                )))
                .await;
            return;
        }
        debug!("Subscriptions to {:?} requested", subscriptions);
    }

    if events.send(BrokerEvent::Connected).await.is_err() {
        debug!("Synchronizer is gone, connection not reported");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    events: mpsc::Sender<BrokerEvent>,
    closing: CancellationToken,
    reconnect_period: Duration,
) {
    info!("Broker event loop started");
    let mut subscriber: Option<JoinHandle<()>> = None;

    loop {
        let forwarded = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(
                    "Connected to broker (session present: {})",
                    ack.session_present
                );
                if let Some(previous) = subscriber.take() {
                    previous.abort();
                }
                subscriber = Some(tokio::spawn(request_subscriptions(
                    client.clone(),
                    subscriptions.clone(),
                    events.clone(),
                )));
                None
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BrokerEvent::Message(
                InboundMessage::from_topic(publish.topic, publish.payload.to_vec()),
            )),
            Ok(Event::Incoming(Packet::PubAck(ack))) => Some(BrokerEvent::PublishAcked(ack.pkid)),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!("Broker rejected subscription (packet {})", ack.pkid);
                    Some(BrokerEvent::SubscribeFailed(format!(
                        "Broker rejected subscription (packet {})",
                        ack.pkid
                    )))
                } else {
                    None
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the connection");
                if let Some(pending) = subscriber.take() {
                    pending.abort();
                }
                Some(BrokerEvent::Offline)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => Some(BrokerEvent::PublishSent(pkid)),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnect sent, stopping broker event loop");
                break;
            }
            Ok(_) => None,
            Err(e) => {
                if let Some(pending) = subscriber.take() {
                    pending.abort();
                }
                if closing.is_cancelled() {
                    debug!("Broker event loop stopped during shutdown: {}", e);
                    break;
                }
                error!("MQTT client error: {}", e);
                if events.send(BrokerEvent::Error(e.to_string())).await.is_err() {
                    break;
                }

                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_period) => {}
                }
                info!("Reconnecting to MQTT broker...");
                Some(BrokerEvent::Reconnecting)
            }
        };

        if let Some(event) = forwarded {
            if events.send(event).await.is_err() {
                debug!("Synchronizer is gone, stopping broker event loop");
                break;
            }
        }
    }

    if let Some(pending) = subscriber {
        pending.abort();
    }
    info!("Broker event loop finished");
}
