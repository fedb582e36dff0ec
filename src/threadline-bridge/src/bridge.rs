//! The conversation bridge: one inbound event in, one reply out.
//!
//! ```text
//! Received -> IdentityResolved -> SessionResolved -> HistoryBuilt -> Invoked -> Replied
//!     \______________________________________________________________/
//!                               Failed -> fallback reply
//! ```
//!
//! Every failure is caught here and turned into a single fallback reply; the
//! caller never sees an error and the end user never sees internal detail.

use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backend::{BackendClient, WorkflowBackend};
use crate::config::BridgeConfig;
use crate::dedup::RecentEvents;
use crate::error::{BridgeError, BridgeResult};
use crate::events::PlatformEvent;
use crate::history::{HistoryReconstructor, HistorySource};
use crate::identity::IdentityResolver;
use crate::session::SessionResolver;
use crate::slack::{SlackClient, SlackPlatform};
use crate::thread_lock::ThreadLocks;
use crate::turn::{TurnExecutor, TurnStage};

/// Reply sent when any stage of a turn fails.
pub const ERROR_FALLBACK_TEXT: &str = "Sorry, I encountered an error processing your request.";

/// Reply sent when the workflow answered with nothing usable.
pub const EMPTY_FALLBACK_TEXT: &str =
    "Sorry, there was an issue processing your request. Please try again.";

/// Why a turn ended in a fallback reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// A stage failed; carries [`BridgeError::kind`].
    Error(&'static str),
    /// The workflow returned no assistant message.
    EmptyOutput,
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The assistant's answer was posted.
    Replied { text: String },
    /// A fallback reply was posted. `last_stage` is the last stage reached.
    Fallback {
        last_stage: TurnStage,
        reason: FallbackReason,
    },
    /// The message was already handled inside the dedup window.
    Duplicate,
}

/// Composes the resolvers, history reconstruction and turn execution.
pub struct ConversationBridge {
    workflow_id: String,
    platform: Arc<dyn SlackPlatform>,
    identity: IdentityResolver,
    sessions: SessionResolver,
    history: HistoryReconstructor,
    executor: TurnExecutor,
    recent: RecentEvents,
    thread_locks: ThreadLocks,
}

impl ConversationBridge {
    /// Build a bridge talking to the real Slack and backend APIs.
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        let platform = SlackClient::new(config)
            .map_err(|e| BridgeError::Configuration(format!("Slack client: {}", e)))?;
        let backend = BackendClient::new(config)
            .map_err(|e| BridgeError::Configuration(format!("Backend client: {}", e)))?;
        Ok(Self::with_clients(
            config,
            Arc::new(platform),
            Arc::new(backend),
        ))
    }

    /// Build a bridge on top of arbitrary platform and backend implementations.
    pub fn with_clients(
        config: &BridgeConfig,
        platform: Arc<dyn SlackPlatform>,
        backend: Arc<dyn WorkflowBackend>,
    ) -> Self {
        Self {
            workflow_id: config.workflow_id().to_string(),
            identity: IdentityResolver::new(backend.clone()),
            sessions: SessionResolver::new(backend.clone()),
            history: HistoryReconstructor::new(platform.clone(), config.bot_user_id()),
            executor: TurnExecutor::new(backend),
            platform,
            recent: RecentEvents::new(config.dedup_window(), config.dedup_capacity()),
            thread_locks: ThreadLocks::new(),
        }
    }

    /// Handle one dispatched event end to end, including the reply.
    pub async fn handle_event(&self, event: PlatformEvent) -> TurnOutcome {
        let span = info_span!(
            "turn",
            event_id = %event.event_id,
            channel = %event.channel_id,
            thread = %event.thread_key(),
        );

        async {
            if !self.recent.mark(&event.message_key()) {
                info!("Skipping already handled message {}", event.message_key());
                return TurnOutcome::Duplicate;
            }

            let _thread_guard = self
                .thread_locks
                .acquire(&format!("{}:{}", event.channel_id, event.thread_key()))
                .await;

            let mut stage = TurnStage::Received;
            match self.run_turn(&event, &mut stage).await {
                Ok(Some(text)) => {
                    self.reply(&event, &text).await;
                    info!("Turn replied");
                    TurnOutcome::Replied { text }
                }
                Ok(None) => {
                    warn!("Workflow returned no assistant message");
                    self.reply(&event, EMPTY_FALLBACK_TEXT).await;
                    TurnOutcome::Fallback {
                        last_stage: stage,
                        reason: FallbackReason::EmptyOutput,
                    }
                }
                Err(e) => {
                    error!(
                        stage = %stage,
                        kind = e.kind(),
                        "Turn failed: {}",
                        e
                    );
                    self.reply(&event, ERROR_FALLBACK_TEXT).await;
                    TurnOutcome::Fallback {
                        last_stage: stage,
                        reason: FallbackReason::Error(e.kind()),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_turn(
        &self,
        event: &PlatformEvent,
        stage: &mut TurnStage,
    ) -> BridgeResult<Option<String>> {
        let metadata = serde_json::json!({
            "platform": "slack",
            "team_id": event.team_id,
            "channel_id": event.channel_id,
        });
        let user_id = self
            .identity
            .resolve_user(&event.author_id, &metadata)
            .await?;
        *stage = TurnStage::IdentityResolved;

        let session_id = self
            .sessions
            .resolve_session(&self.workflow_id, &user_id, event.thread_key())
            .await?;
        *stage = TurnStage::SessionResolved;

        let conversation = self
            .history
            .build_history(HistorySource::for_event(event))
            .await?;
        *stage = TurnStage::HistoryBuilt;
        debug!(
            "Built history with {} prior turn(s) for session {}",
            conversation.history.len(),
            session_id
        );

        let answer = self
            .executor
            .execute_turn(
                &self.workflow_id,
                &session_id,
                &conversation.current_message,
                conversation.history,
            )
            .await?;
        *stage = TurnStage::Invoked;

        Ok(answer)
    }

    /// Post into the event's thread. Failures are logged and dropped.
    async fn reply(&self, event: &PlatformEvent, text: &str) {
        if let Err(e) = self
            .platform
            .post_message(&event.channel_id, text, Some(event.thread_key()))
            .await
        {
            error!("Failed to post reply: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{ProvisionOutcome, WorkflowInput, WorkflowOutput};
    use crate::config::RawBridgeConfig;
    use crate::error::{BackendError, BackendResult, SlackError, SlackResult};
    use crate::events::EventKind;
    use crate::history::{ConversationTurn, Role};
    use crate::slack::SlackMessage;

    fn config() -> BridgeConfig {
        RawBridgeConfig {
            slack_bot_token: Some("xoxb-test".to_string()),
            slack_app_token: Some("xapp-test".to_string()),
            slack_signing_secret: Some("secret".to_string()),
            slack_bot_user_id: Some("UBOT".to_string()),
            workflow_id: Some("wf-1".to_string()),
            backend_base_url: Some("http://localhost:1".to_string()),
            backend_api_key: Some("key".to_string()),
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn msg(user: &str, text: &str, ts: &str) -> SlackMessage {
        SlackMessage {
            user: Some(user.to_string()),
            bot_id: None,
            subtype: None,
            text: text.to_string(),
            ts: ts.to_string(),
        }
    }

    /// In-memory Slack: threads keyed by root ts, posted replies recorded.
    #[derive(Default)]
    struct FakeSlack {
        threads: Mutex<HashMap<String, Vec<SlackMessage>>>,
        posted: Mutex<Vec<(String, String, Option<String>)>>,
        fail_history: bool,
    }

    impl FakeSlack {
        fn with_thread(root: &str, messages: Vec<SlackMessage>) -> Self {
            let slack = Self::default();
            slack
                .threads
                .lock()
                .unwrap()
                .insert(root.to_string(), messages);
            slack
        }

        fn posted_texts(&self) -> Vec<String> {
            self.posted
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text, _)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SlackPlatform for FakeSlack {
        async fn fetch_message(&self, _channel: &str, ts: &str) -> SlackResult<Vec<SlackMessage>> {
            if self.fail_history {
                return Err(SlackError::Timeout("history".to_string()));
            }
            Ok(self
                .threads
                .lock()
                .unwrap()
                .get(ts)
                .and_then(|messages| messages.first().cloned())
                .into_iter()
                .collect())
        }

        async fn fetch_thread(
            &self,
            _channel: &str,
            thread_ts: &str,
        ) -> SlackResult<Vec<SlackMessage>> {
            if self.fail_history {
                return Err(SlackError::Timeout("replies".to_string()));
            }
            Ok(self
                .threads
                .lock()
                .unwrap()
                .get(thread_ts)
                .cloned()
                .unwrap_or_default())
        }

        async fn post_message(
            &self,
            channel: &str,
            text: &str,
            thread_ts: Option<&str>,
        ) -> SlackResult<String> {
            let mut posted = self.posted.lock().unwrap();
            posted.push((
                channel.to_string(),
                text.to_string(),
                thread_ts.map(str::to_string),
            ));
            let ts = format!("{}.0", 100 + posted.len());

            // Replies land in the thread like they do on Slack
            if let Some(root) = thread_ts {
                if let Some(thread) = self.threads.lock().unwrap().get_mut(root) {
                    thread.push(msg("UBOT", text, &ts));
                }
            }
            Ok(ts)
        }
    }

    /// In-memory backend with scripted failures and a delay on workflow runs.
    struct FakeBackend {
        users: Mutex<HashMap<String, String>>,
        sessions: Mutex<HashMap<String, String>>,
        session_status: Option<u16>,
        answer: Option<String>,
        run_delay: Duration,
        runs: Mutex<Vec<WorkflowInput>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight_per_session: Mutex<usize>,
    }

    impl FakeBackend {
        fn answering(answer: Option<&str>) -> Self {
            Self {
                users: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                session_status: None,
                answer: answer.map(str::to_string),
                run_delay: Duration::ZERO,
                runs: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight_per_session: Mutex::new(0),
            }
        }

        fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WorkflowBackend for FakeBackend {
        async fn create_user(
            &self,
            external_id: &str,
            _metadata: &serde_json::Value,
        ) -> BackendResult<ProvisionOutcome> {
            let mut users = self.users.lock().unwrap();
            if let Some(id) = users.get(external_id) {
                return Ok(ProvisionOutcome::AlreadyExists {
                    id: Some(id.clone()),
                });
            }
            let id = format!("user-{}", users.len() + 1);
            users.insert(external_id.to_string(), id.clone());
            Ok(ProvisionOutcome::Created { id })
        }

        async fn create_session(
            &self,
            _workflow_id: &str,
            _user_id: &str,
            external_id: &str,
        ) -> BackendResult<ProvisionOutcome> {
            if let Some(status) = self.session_status {
                return Err(BackendError::Status {
                    status,
                    body: "internal detail".to_string(),
                });
            }
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(id) = sessions.get(external_id) {
                return Ok(ProvisionOutcome::AlreadyExists {
                    id: Some(id.clone()),
                });
            }
            let id = format!("sess-{}", sessions.len() + 1);
            sessions.insert(external_id.to_string(), id.clone());
            Ok(ProvisionOutcome::Created { id })
        }

        async fn run_workflow(
            &self,
            _workflow_id: &str,
            input: &WorkflowInput,
        ) -> BackendResult<WorkflowOutput> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let count = in_flight.entry(input.session_id.clone()).or_insert(0);
                *count += 1;
                let mut max = self.max_in_flight_per_session.lock().unwrap();
                *max = (*max).max(*count);
            }

            tokio::time::sleep(self.run_delay).await;

            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if let Some(count) = in_flight.get_mut(&input.session_id) {
                    *count -= 1;
                }
            }
            self.runs.lock().unwrap().push(input.clone());
            Ok(WorkflowOutput {
                assistant_message: self.answer.clone(),
            })
        }
    }

    fn mention(ts: &str, text: &str) -> PlatformEvent {
        PlatformEvent {
            event_id: format!("Ev-{}", ts),
            kind: EventKind::Mention,
            channel_id: "C1".to_string(),
            thread_root_ts: None,
            event_ts: ts.to_string(),
            author_id: "U1".to_string(),
            is_from_bot: false,
            raw_text: text.to_string(),
            team_id: Some("T1".to_string()),
        }
    }

    fn reply(root: &str, ts: &str) -> PlatformEvent {
        PlatformEvent {
            event_id: format!("Ev-{}", ts),
            kind: EventKind::Reply,
            channel_id: "C1".to_string(),
            thread_root_ts: Some(root.to_string()),
            event_ts: ts.to_string(),
            author_id: "U1".to_string(),
            is_from_bot: false,
            raw_text: String::new(),
            team_id: Some("T1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fresh_mention_replies_in_new_thread() {
        let slack = Arc::new(FakeSlack::with_thread(
            "1.0",
            vec![msg("U1", "<@UBOT> hello", "1.0")],
        ));
        let backend = Arc::new(FakeBackend::answering(Some("hi there")));
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend.clone());

        let outcome = bridge.handle_event(mention("1.0", "<@UBOT> hello")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                text: "hi there".to_string()
            }
        );
        let runs = backend.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].user_message, "<@UBOT> hello");
        assert!(runs[0].message_history.is_empty());
        assert_eq!(
            *slack.posted.lock().unwrap(),
            vec![(
                "C1".to_string(),
                "hi there".to_string(),
                Some("1.0".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_thread_reply_sends_history() {
        let slack = Arc::new(FakeSlack::with_thread(
            "1.0",
            vec![
                msg("U1", "m1", "1.0"),
                msg("UBOT", "m2", "2.0"),
                msg("U1", "m3", "3.0"),
            ],
        ));
        let backend = Arc::new(FakeBackend::answering(Some("m4")));
        let bridge = ConversationBridge::with_clients(&config(), slack, backend.clone());

        bridge.handle_event(reply("1.0", "3.0")).await;

        let runs = backend.runs.lock().unwrap();
        assert_eq!(runs[0].user_message, "m3");
        assert_eq!(
            runs[0].message_history,
            vec![
                ConversationTurn::new(Role::User, "m1"),
                ConversationTurn::new(Role::Assistant, "m2"),
            ]
        );
        assert_eq!(runs[0].session_id, "sess-1");
    }

    #[tokio::test]
    async fn test_same_thread_reuses_session() {
        let slack = Arc::new(FakeSlack::with_thread(
            "1.0",
            vec![msg("U1", "m1", "1.0"), msg("U1", "m2", "2.0")],
        ));
        let backend = Arc::new(FakeBackend::answering(Some("ok")));
        let bridge = ConversationBridge::with_clients(&config(), slack, backend.clone());

        bridge.handle_event(mention("1.0", "m1")).await;
        bridge.handle_event(reply("1.0", "2.0")).await;

        let runs = backend.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].session_id, runs[1].session_id);
    }

    #[tokio::test]
    async fn test_empty_answer_sends_issue_fallback() {
        let slack = Arc::new(FakeSlack::with_thread("1.0", vec![msg("U1", "hi", "1.0")]));
        let backend = Arc::new(FakeBackend::answering(Some("")));
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend);

        let outcome = bridge.handle_event(mention("1.0", "hi")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Fallback {
                last_stage: TurnStage::Invoked,
                reason: FallbackReason::EmptyOutput,
            }
        );
        assert_eq!(slack.posted_texts(), vec![EMPTY_FALLBACK_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn test_session_failure_sends_error_fallback_without_invocation() {
        let slack = Arc::new(FakeSlack::with_thread("1.0", vec![msg("U1", "hi", "1.0")]));
        let backend = Arc::new(FakeBackend {
            session_status: Some(500),
            ..FakeBackend::answering(Some("never"))
        });
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend.clone());

        let outcome = bridge.handle_event(mention("1.0", "hi")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Fallback {
                last_stage: TurnStage::IdentityResolved,
                reason: FallbackReason::Error("provisioning"),
            }
        );
        assert_eq!(backend.run_count(), 0);
        let posted = slack.posted_texts();
        assert_eq!(posted, vec![ERROR_FALLBACK_TEXT.to_string()]);
        assert!(!posted[0].contains("internal detail"));
    }

    #[tokio::test]
    async fn test_history_failure_sends_error_fallback() {
        let slack = Arc::new(FakeSlack {
            fail_history: true,
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::answering(Some("never")));
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend.clone());

        let outcome = bridge.handle_event(reply("1.0", "2.0")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Fallback {
                last_stage: TurnStage::SessionResolved,
                reason: FallbackReason::Error("history_fetch"),
            }
        );
        assert_eq!(backend.run_count(), 0);
        assert_eq!(slack.posted_texts(), vec![ERROR_FALLBACK_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_skipped() {
        let slack = Arc::new(FakeSlack::with_thread("1.0", vec![msg("U1", "hi", "1.0")]));
        let backend = Arc::new(FakeBackend::answering(Some("once")));
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend.clone());

        let first = bridge.handle_event(mention("1.0", "hi")).await;
        let second = bridge.handle_event(mention("1.0", "hi")).await;

        assert!(matches!(first, TurnOutcome::Replied { .. }));
        assert_eq!(second, TurnOutcome::Duplicate);
        assert_eq!(backend.run_count(), 1);
        assert_eq!(slack.posted_texts().len(), 1);
    }

    #[tokio::test]
    async fn test_same_thread_turns_do_not_overlap() {
        let slack = Arc::new(FakeSlack::with_thread(
            "1.0",
            vec![
                msg("U1", "m1", "1.0"),
                msg("U1", "m2", "2.0"),
                msg("U1", "m3", "3.0"),
            ],
        ));
        let backend = Arc::new(FakeBackend {
            run_delay: Duration::from_millis(20),
            ..FakeBackend::answering(Some("ok"))
        });
        let bridge = Arc::new(ConversationBridge::with_clients(
            &config(),
            slack,
            backend.clone(),
        ));

        let handles: Vec<_> = ["2.0", "3.0"]
            .into_iter()
            .map(|ts| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.handle_event(reply("1.0", ts)).await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                TurnOutcome::Replied { .. }
            ));
        }

        assert_eq!(backend.run_count(), 2);
        assert_eq!(*backend.max_in_flight_per_session.lock().unwrap(), 1);

        let mut answered: Vec<String> = backend
            .runs
            .lock()
            .unwrap()
            .iter()
            .map(|run| run.user_message.clone())
            .collect();
        answered.sort();
        assert_eq!(answered, vec!["m2".to_string(), "m3".to_string()]);
    }

    #[tokio::test]
    async fn test_queued_turns_answer_their_own_message() {
        let slack = Arc::new(FakeSlack::with_thread(
            "1.0",
            vec![
                msg("U1", "m1", "1.0"),
                msg("U1", "m2", "2.0"),
                msg("U1", "m3", "3.0"),
            ],
        ));
        let backend = Arc::new(FakeBackend::answering(Some("BOT-ANSWER")));
        let bridge = ConversationBridge::with_clients(&config(), slack.clone(), backend.clone());

        bridge.handle_event(reply("1.0", "2.0")).await;
        bridge.handle_event(reply("1.0", "3.0")).await;

        // Both answers were appended to the thread after m3
        assert_eq!(slack.threads.lock().unwrap()["1.0"].len(), 5);

        let runs = backend.runs.lock().unwrap();
        assert_eq!(runs[0].user_message, "m2");
        assert_eq!(
            runs[0].message_history,
            vec![ConversationTurn::new(Role::User, "m1")]
        );
        assert_eq!(runs[1].user_message, "m3");
        assert_eq!(
            runs[1].message_history,
            vec![
                ConversationTurn::new(Role::User, "m1"),
                ConversationTurn::new(Role::User, "m2"),
            ]
        );
    }
}
