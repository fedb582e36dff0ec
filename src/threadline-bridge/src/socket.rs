//! Socket Mode connection loop.
//!
//! `BridgeBot` keeps one WebSocket open to Slack, acknowledges every envelope
//! before looking at it, and spawns one bridge turn per accepted event.
//!
//! ```rust,ignore
//! use threadline_bridge::{BridgeBot, BridgeConfig};
//!
//! let config = BridgeConfig::from_env()?;
//! let bot = BridgeBot::new(&config)?;
//! bot.start().await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::backend::BackendClient;
use crate::bridge::{ConversationBridge, TurnOutcome};
use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatch, EventDispatcher};
use crate::error::{BridgeError, BridgeResult, SlackError, SlackResult};
use crate::events::{EventPayload, PlatformEvent, SocketModeAck, SocketModeEnvelope};
use crate::slack::SlackClient;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection behavior.
#[derive(Debug, Clone)]
pub struct BotOptions {
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Ping interval for WebSocket keep-alive.
    pub ping_interval: Duration,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// How a single WebSocket connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Shutdown,
    Reconnect,
}

/// Socket Mode front end of the bridge.
pub struct BridgeBot {
    slack: SlackClient,
    bridge: Arc<ConversationBridge>,
    dispatcher: EventDispatcher,
    bot_user_id: String,
    options: BotOptions,
    shutdown_tx: broadcast::Sender<()>,
    /// Turns still running; drained before `start` returns.
    turns: Mutex<JoinSet<()>>,
}

impl BridgeBot {
    /// Create a bot and a bridge sharing one Slack client.
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        let slack = SlackClient::new(config)
            .map_err(|e| BridgeError::Configuration(format!("Slack client: {}", e)))?;
        let backend = BackendClient::new(config)
            .map_err(|e| BridgeError::Configuration(format!("Backend client: {}", e)))?;
        let bridge = Arc::new(ConversationBridge::with_clients(
            config,
            Arc::new(slack.clone()),
            Arc::new(backend),
        ));
        Ok(Self::with_bridge(config, slack, bridge, BotOptions::default()))
    }

    /// Create a bot around an existing Slack client and bridge.
    pub fn with_bridge(
        config: &BridgeConfig,
        slack: SlackClient,
        bridge: Arc<ConversationBridge>,
        options: BotOptions,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            slack,
            bridge,
            dispatcher: EventDispatcher::new(config.bot_user_id()),
            bot_user_id: config.bot_user_id().to_string(),
            options,
            shutdown_tx,
            turns: Mutex::new(JoinSet::new()),
        }
    }

    /// Verify the bot token, then run until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> SlackResult<()> {
        info!("Starting Slack bridge bot...");
        let shutdown_rx = self.shutdown_tx.subscribe();

        let user_id = self.slack.auth_test().await?;
        if user_id != self.bot_user_id {
            warn!(
                "auth.test returned user {} but SLACK_BOT_USER_ID is {}; history roles use the configured id",
                user_id, self.bot_user_id
            );
        } else {
            info!("Authenticated as bot user: {}", user_id);
        }

        let result = self.run_socket_mode(shutdown_rx).await;
        self.drain_turns().await;
        result
    }

    /// Ask the connection loop to stop.
    pub fn shutdown(&self) {
        info!("Shutting down Slack bridge bot...");
        let _ = self.shutdown_tx.send(());
    }

    async fn run_socket_mode(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SlackResult<()> {
        loop {
            let outcome = match self.slack.open_socket_url().await {
                Ok(ws_url) => {
                    info!("Connecting to Socket Mode...");
                    self.connect_and_run(&ws_url, &mut shutdown_rx).await
                }
                Err(e @ SlackError::Auth(_)) => return Err(e),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(ConnectionEnd::Shutdown) => {
                    info!("Socket Mode connection closed gracefully");
                    return Ok(());
                }
                Ok(ConnectionEnd::Reconnect) => {
                    info!("Reconnecting to Socket Mode");
                }
                Err(e) => {
                    error!("Socket Mode connection error: {}", e);
                    info!("Reconnecting in {:?}...", self.options.reconnect_delay);
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_run(
        &self,
        ws_url: &str,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SlackResult<ConnectionEnd> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut write, read) = ws_stream.split();

        let (msg_tx, mut msg_rx) = mpsc::channel::<WsMessage>(100);

        let write_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let ping_tx = msg_tx.clone();
        let ping_interval = self.options.ping_interval;
        let ping_task = tokio::spawn(async move {
            let mut interval = interval(ping_interval);
            loop {
                interval.tick().await;
                if ping_tx.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        let result = self.process_messages(read, msg_tx, shutdown_rx).await;

        ping_task.abort();
        write_task.abort();

        result
    }

    async fn process_messages(
        &self,
        mut read: SplitStream<WsConnection>,
        msg_tx: mpsc::Sender<WsMessage>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SlackResult<ConnectionEnd> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    return Ok(ConnectionEnd::Shutdown);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(end) = self.handle_socket_message(&text, &msg_tx).await {
                                return Ok(end);
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = msg_tx.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Ok(ConnectionEnd::Reconnect);
                        }
                        Some(Err(e)) => {
                            return Err(SlackError::WebSocket(e.to_string()));
                        }
                        None => {
                            return Ok(ConnectionEnd::Reconnect);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Ack, then route one envelope. Returns `Some` when the connection must end.
    async fn handle_socket_message(
        &self,
        text: &str,
        msg_tx: &mpsc::Sender<WsMessage>,
    ) -> Option<ConnectionEnd> {
        let envelope: SocketModeEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("Failed to parse Socket Mode envelope: {}", e);
                return None;
            }
        };

        if !envelope.envelope_id.is_empty() {
            match serde_json::to_string(&SocketModeAck::new(&envelope.envelope_id)) {
                Ok(ack) => {
                    let _ = msg_tx.send(WsMessage::Text(ack)).await;
                }
                Err(e) => error!("Failed to encode ack: {}", e),
            }
        }

        match envelope.envelope_type.as_str() {
            "events_api" => {
                if let Some(retry) = envelope.retry_attempt {
                    debug!(
                        "Envelope {} is retry {} ({:?})",
                        envelope.envelope_id, retry, envelope.retry_reason
                    );
                }
                if let Some(payload) = envelope.payload {
                    self.dispatch(payload);
                }
                None
            }
            "hello" => {
                info!("Socket Mode connection established");
                None
            }
            "disconnect" => {
                info!("Received disconnect request from Slack");
                Some(ConnectionEnd::Reconnect)
            }
            other => {
                debug!("Unhandled envelope type: {}", other);
                None
            }
        }
    }

    fn dispatch(&self, payload: EventPayload) {
        if let Dispatch::Handle(event) = self.dispatcher.classify(&payload) {
            self.spawn_turn(event);
        }
    }

    fn spawn_turn(&self, event: PlatformEvent) {
        let bridge = self.bridge.clone();
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);

        // Reap finished turns so the set only holds live ones
        while let Some(finished) = turns.try_join_next() {
            if let Err(e) = finished {
                error!("Turn task failed: {}", e);
            }
        }

        turns.spawn(async move {
            match bridge.handle_event(event).await {
                TurnOutcome::Replied { .. } => {}
                outcome => debug!("Turn ended with {:?}", outcome),
            }
        });
    }

    /// Wait for every in-flight turn so none is cut off before its reply.
    async fn drain_turns(&self) {
        let mut turns = std::mem::take(
            &mut *self.turns.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if turns.is_empty() {
            return;
        }

        info!("Waiting for {} in-flight turn(s)...", turns.len());
        while let Some(finished) = turns.join_next().await {
            if let Err(e) = finished {
                error!("Turn task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::{ProvisionOutcome, WorkflowBackend, WorkflowInput, WorkflowOutput};
    use crate::config::RawBridgeConfig;
    use crate::error::BackendResult;
    use crate::events::EventKind;
    use crate::slack::{SlackMessage, SlackPlatform};

    fn config() -> BridgeConfig {
        RawBridgeConfig {
            slack_bot_token: Some("xoxb-test".to_string()),
            slack_app_token: Some("xapp-test".to_string()),
            slack_signing_secret: Some("secret".to_string()),
            slack_bot_user_id: Some("UBOT".to_string()),
            workflow_id: Some("wf-1".to_string()),
            backend_base_url: Some("http://127.0.0.1:9".to_string()),
            backend_api_key: Some("key".to_string()),
            slack_api_base: Some("http://127.0.0.1:9/api".to_string()),
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn bot() -> BridgeBot {
        BridgeBot::new(&config()).unwrap()
    }

    /// Slack that serves one mention and records replies.
    #[derive(Default)]
    struct RecordingSlack {
        posted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SlackPlatform for RecordingSlack {
        async fn fetch_message(&self, _channel: &str, ts: &str) -> SlackResult<Vec<SlackMessage>> {
            Ok(vec![SlackMessage {
                user: Some("U1".to_string()),
                bot_id: None,
                subtype: None,
                text: "<@UBOT> hello".to_string(),
                ts: ts.to_string(),
            }])
        }

        async fn fetch_thread(
            &self,
            _channel: &str,
            _thread_ts: &str,
        ) -> SlackResult<Vec<SlackMessage>> {
            Ok(Vec::new())
        }

        async fn post_message(
            &self,
            _channel: &str,
            text: &str,
            _thread_ts: Option<&str>,
        ) -> SlackResult<String> {
            self.posted.lock().unwrap().push(text.to_string());
            Ok("2.0".to_string())
        }
    }

    /// Backend whose workflow run takes `delay`.
    struct SlowBackend {
        delay: Duration,
    }

    #[async_trait]
    impl WorkflowBackend for SlowBackend {
        async fn create_user(
            &self,
            _external_id: &str,
            _metadata: &serde_json::Value,
        ) -> BackendResult<ProvisionOutcome> {
            Ok(ProvisionOutcome::Created {
                id: "user-1".to_string(),
            })
        }

        async fn create_session(
            &self,
            _workflow_id: &str,
            _user_id: &str,
            _external_id: &str,
        ) -> BackendResult<ProvisionOutcome> {
            Ok(ProvisionOutcome::Created {
                id: "sess-1".to_string(),
            })
        }

        async fn run_workflow(
            &self,
            _workflow_id: &str,
            _input: &WorkflowInput,
        ) -> BackendResult<WorkflowOutput> {
            tokio::time::sleep(self.delay).await;
            Ok(WorkflowOutput {
                assistant_message: Some("slow answer".to_string()),
            })
        }
    }

    fn mention(ts: &str) -> PlatformEvent {
        PlatformEvent {
            event_id: format!("Ev-{}", ts),
            kind: EventKind::Mention,
            channel_id: "C1".to_string(),
            thread_root_ts: None,
            event_ts: ts.to_string(),
            author_id: "U1".to_string(),
            is_from_bot: false,
            raw_text: "<@UBOT> hello".to_string(),
            team_id: Some("T1".to_string()),
        }
    }

    fn ack_of(msg: WsMessage) -> serde_json::Value {
        match msg {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text ack, got {:?}", other),
        }
    }

    #[test]
    fn test_default_options() {
        let options = BotOptions::default();
        assert_eq!(options.reconnect_delay, Duration::from_secs(5));
        assert_eq!(options.ping_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_envelope_is_acked_before_routing() {
        let bot = bot();
        let (tx, mut rx) = mpsc::channel(4);

        let end = bot
            .handle_socket_message(
                r#"{"envelope_id":"env-1","type":"events_api","payload":{"type":"event_callback","event":{"type":"reaction_added"}}}"#,
                &tx,
            )
            .await;

        assert_eq!(end, None);
        assert_eq!(
            ack_of(rx.recv().await.unwrap()),
            serde_json::json!({"envelope_id": "env-1"})
        );
    }

    #[tokio::test]
    async fn test_disconnect_requests_reconnect() {
        let bot = bot();
        let (tx, mut rx) = mpsc::channel(4);

        let end = bot
            .handle_socket_message(r#"{"envelope_id":"env-2","type":"disconnect"}"#, &tx)
            .await;

        assert_eq!(end, Some(ConnectionEnd::Reconnect));
        assert_eq!(
            ack_of(rx.recv().await.unwrap()),
            serde_json::json!({"envelope_id": "env-2"})
        );
    }

    #[tokio::test]
    async fn test_hello_and_garbage_keep_connection() {
        let bot = bot();
        let (tx, mut rx) = mpsc::channel(4);

        assert_eq!(
            bot.handle_socket_message(r#"{"type":"hello"}"#, &tx).await,
            None
        );
        assert_eq!(bot.handle_socket_message("not json", &tx).await, None);
        // hello carries no envelope id, so nothing is acked
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_turn() {
        let config = config();
        let slack = Arc::new(RecordingSlack::default());
        let bridge = Arc::new(ConversationBridge::with_clients(
            &config,
            slack.clone(),
            Arc::new(SlowBackend {
                delay: Duration::from_millis(100),
            }),
        ));
        let bot = BridgeBot::with_bridge(
            &config,
            SlackClient::new(&config).unwrap(),
            bridge,
            BotOptions::default(),
        );

        bot.spawn_turn(mention("1.0"));
        tokio::task::yield_now().await;
        assert!(slack.posted.lock().unwrap().is_empty());

        bot.drain_turns().await;

        assert_eq!(*slack.posted.lock().unwrap(), vec!["slow answer".to_string()]);
        assert!(bot.turns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_turns_are_reaped() {
        let config = config();
        let slack = Arc::new(RecordingSlack::default());
        let bridge = Arc::new(ConversationBridge::with_clients(
            &config,
            slack.clone(),
            Arc::new(SlowBackend {
                delay: Duration::ZERO,
            }),
        ));
        let bot = BridgeBot::with_bridge(
            &config,
            SlackClient::new(&config).unwrap(),
            bridge,
            BotOptions::default(),
        );

        bot.spawn_turn(mention("1.0"));
        bot.drain_turns().await;
        bot.spawn_turn(mention("2.0"));

        // The first set was drained, so only the new turn is tracked
        assert_eq!(bot.turns.lock().unwrap().len(), 1);
        bot.drain_turns().await;
        assert_eq!(slack.posted.lock().unwrap().len(), 2);
    }
}
