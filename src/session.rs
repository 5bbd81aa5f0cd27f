//! Session-scoped broker connection and the views attached to it.
//!
//! A [`Session`] owns exactly one [`BrokerLink`] and one synchronizer task. Views do not
//! connect on their own; they are handed a [`ViewHandle`] that reads the shared state and
//! forwards intents. The topic set subscribed is the union of what the mounted views need.
//!
//! Dropping a session cancels the synchronizer and stops the event loop, so no broker
//! message is processed after teardown starts, whichever way the owner exits.

use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Settings};
use crate::mqtt::config::{MqttConfig, TopicNames};
use crate::mqtt::message_manager::BrokerEvent;
use crate::mqtt::mqtt_handler::{BrokerLink, Online};
use crate::sync::commands::{CommandReceipt, Intent};
use crate::sync::model::DashboardState;
use crate::sync::synchronizer::{CommandSink, Synchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Dashboard,
    RelayControls,
    Logs,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Dashboard, ViewKind::RelayControls, ViewKind::Logs];

    /// Topics this view needs to be subscribed.
    pub fn topics<'a>(&self, names: &'a TopicNames) -> Vec<&'a str> {
        match self {
            ViewKind::Dashboard | ViewKind::RelayControls => vec![names.status.as_str()],
            ViewKind::Logs => vec![names.logs.as_str()],
        }
    }

    pub fn accepts(&self, intent: &Intent) -> bool {
        match self {
            ViewKind::Dashboard => matches!(
                intent,
                Intent::Start
                    | Intent::Stop
                    | Intent::EmergencyStop
                    | Intent::SetFrequency(_)
                    | Intent::FrequencyInput(_)
            ),
            ViewKind::RelayControls => matches!(intent, Intent::ToggleRelay(_)),
            ViewKind::Logs => false,
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ViewKind::Dashboard => write!(f, "Dashboard"),
            ViewKind::RelayControls => write!(f, "Relay Controls"),
            ViewKind::Logs => write!(f, "Logs"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{view} view does not accept {intent}")]
    IntentNotSupported { view: ViewKind, intent: String },

    #[error("Session is closed")]
    Closed,

    #[error("Intent queue is full")]
    Busy,

    #[error("{0} view is not mounted in this session")]
    NotMounted(ViewKind),
}

/// An intent on its way to the synchronizer, optionally with a reply channel.
#[derive(Debug)]
pub struct IntentRequest {
    pub intent: Intent,
    pub response_tx: Option<oneshot::Sender<CommandReceipt>>,
}

/// What a view gets from the session.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    kind: ViewKind,
    state: watch::Receiver<DashboardState>,
    intents: mpsc::Sender<IntentRequest>,
}

impl ViewHandle {
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn state(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    /// Waits for the next state change.
    pub async fn changed(&mut self) -> Result<(), SessionError> {
        self.state.changed().await.map_err(|_| SessionError::Closed)
    }

    /// Fire and forget.
    pub fn dispatch(&self, intent: Intent) -> Result<(), SessionError> {
        self.check(&intent)?;
        self.intents
            .try_send(IntentRequest {
                intent,
                response_tx: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Busy,
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    /// Sends an intent and waits for its receipt.
    pub async fn submit(&self, intent: Intent) -> Result<CommandReceipt, SessionError> {
        self.check(&intent)?;
        let (response_tx, response_rx) = oneshot::channel();
        self.intents
            .send(IntentRequest {
                intent,
                response_tx: Some(response_tx),
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        response_rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn receiver(&self) -> watch::Receiver<DashboardState> {
        self.state.clone()
    }

    fn check(&self, intent: &Intent) -> Result<(), SessionError> {
        if self.kind.accepts(intent) {
            Ok(())
        } else {
            Err(SessionError::IntentNotSupported {
                view: self.kind,
                intent: intent.to_string(),
            })
        }
    }
}

/// A view either runs against a session or shows why it cannot.
#[derive(Debug)]
pub enum MountedView {
    Live(ViewHandle),
    Blocked { kind: ViewKind, error: String },
}

impl MountedView {
    pub fn kind(&self) -> ViewKind {
        match self {
            MountedView::Live(handle) => handle.kind(),
            MountedView::Blocked { kind, .. } => *kind,
        }
    }
}

pub fn mount_view(session: &Result<Session, ConfigError>, kind: ViewKind) -> MountedView {
    let mounted = match session {
        Ok(session) => session.mount(kind).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match mounted {
        Ok(handle) => MountedView::Live(handle),
        Err(error) => {
            warn!("{} view blocked: {}", kind, error);
            MountedView::Blocked { kind, error }
        }
    }
}

pub struct Session {
    link: Option<BrokerLink<Online>>,
    views: Vec<ViewKind>,
    state: watch::Receiver<DashboardState>,
    intents: mpsc::Sender<IntentRequest>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Connects once for all `views`. Must be called inside a tokio runtime.
    pub fn open(config: MqttConfig, settings: &Settings, views: &[ViewKind]) -> Self {
        let mut subscriptions: Vec<String> = Vec::new();
        for view in views {
            for topic in view.topics(&config.topics) {
                if !subscriptions.iter().any(|t| t == topic) {
                    subscriptions.push(topic.to_string());
                }
            }
        }
        info!(
            "Opening session for {} with views {:?}",
            config.credentials, views
        );

        let capacity = config.channel_capacity;
        let topics = config.topics.clone();
        let link = BrokerLink::create(config, subscriptions);

        let synchronizer = Synchronizer::new(
            link.client(),
            topics,
            settings.inbound_policy,
            settings.log_capacity,
        );
        synchronizer.mark_connecting();
        let state = synchronizer.subscribe();

        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (intent_tx, intent_rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_synchronizer(
            synchronizer,
            event_rx,
            intent_rx,
            shutdown.clone(),
        ));

        Self {
            link: Some(link.connect(event_tx)),
            views: views.to_vec(),
            state,
            intents: intent_tx,
            shutdown,
            worker: Some(worker),
        }
    }

    pub fn mount(&self, kind: ViewKind) -> Result<ViewHandle, SessionError> {
        if !self.views.contains(&kind) {
            return Err(SessionError::NotMounted(kind));
        }
        Ok(ViewHandle {
            kind,
            state: self.state.clone(),
            intents: self.intents.clone(),
        })
    }

    /// Stops processing, then disconnects from the broker.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Synchronizer task ended abnormally: {}", e);
            }
        }
        if let Some(link) = self.link.take() {
            let _closed = link.shutdown().await;
        }
        info!("Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(link) = self.link.as_mut() {
            debug!("Session dropped without shutdown, aborting broker link");
            link.abort();
        }
    }
}

async fn run_synchronizer<K: CommandSink>(
    mut synchronizer: Synchronizer<K>,
    mut events: mpsc::Receiver<BrokerEvent>,
    mut intents: mpsc::Receiver<IntentRequest>,
    shutdown: CancellationToken,
) {
    debug!("Synchronizer task started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(event) = events.recv() => synchronizer.handle_event(event),
            Some(request) = intents.recv() => {
                let receipt = synchronizer.handle_intent(request.intent);
                if let Some(response_tx) = request.response_tx {
                    if response_tx.send(receipt).is_err() {
                        debug!("Intent caller went away before its receipt");
                    }
                }
            }
            else => break,
        }
    }
    synchronizer.reset();
    debug!("Synchronizer task finished");
}
