use super::handler::{Outcome, Pipeline};
use super::hub::{EventHub, Subscription};
use super::{
    ChatResolver, RelayError, SourceChat, SourceMessage, StateStore, WatchMode, WatchState,
};
use crate::prelude::*;
use crate::{err, Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Orchestrates the watches. There is at most one active watch at a time.
pub(crate) struct Relay {
    pipeline: Arc<Pipeline>,
    resolver: ChatResolver,
    hub: Arc<EventHub>,
    state: StateStore,
    active: Mutex<Option<ActiveWatch>>,
}

struct ActiveWatch {
    mode: WatchMode,

    /// Identifiers of the chats as they were specified by the user
    identifiers: Vec<String>,

    /// Dropping these unregisters the chats from the hub
    _subscriptions: Vec<Subscription>,

    /// Dropping this stops the workers. The messages that are already being
    /// handled are not interrupted, but the queued ones are discarded.
    _stop: watch::Sender<()>,
}

#[derive(Debug)]
pub(crate) struct WatchSummary {
    pub(crate) mode: WatchMode,
    pub(crate) watched: Vec<SourceChat>,

    /// Identifiers that couldn't be resolved
    pub(crate) failed: Vec<(String, Error)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SummaryPlan {
    /// Number of messages that will be relayed in background
    pub(crate) scheduled: usize,

    /// Mode of the watch that was stopped to make room for the summary
    pub(crate) stopped: Option<WatchMode>,
}

impl Relay {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        resolver: ChatResolver,
        hub: Arc<EventHub>,
        state: StateStore,
    ) -> Self {
        Self {
            pipeline,
            resolver,
            hub,
            state,
            active: Default::default(),
        }
    }

    pub(crate) fn resolver(&self) -> &ChatResolver {
        &self.resolver
    }

    /// Replaces the current watch with the new one. Identifiers that can't be
    /// resolved are skipped. If none of them can be resolved, the current
    /// watch stays intact and [`RelayError::NoChannelsResolved`] is returned.
    #[instrument(skip(self))]
    pub(crate) async fn start(
        &self,
        mode: WatchMode,
        identifiers: Vec<String>,
    ) -> Result<WatchSummary> {
        let mut active = self.active.lock().await;

        let mut watched = vec![];
        let mut resolved_identifiers = vec![];
        let mut failed = vec![];
        let mut seen = HashSet::new();

        for identifier in identifiers {
            match self.resolver.resolve(&identifier).await {
                Ok(chat) => {
                    if seen.insert(chat.id) {
                        watched.push(chat);
                        resolved_identifiers.push(identifier);
                    } else {
                        debug!(%identifier, chat_id = chat.id, "Skipping duplicate chat");
                    }
                }
                Err(err) => {
                    warn!(
                        err = tracing_err(&err),
                        %identifier,
                        "Skipping the chat that couldn't be resolved"
                    );
                    failed.push((identifier, err));
                }
            }
        }

        if watched.is_empty() {
            return Err(err!(RelayError::NoChannelsResolved {
                identifiers: failed
                    .into_iter()
                    .map(|(identifier, _)| identifier)
                    .collect::<Vec<_>>(),
            }));
        }

        if let Some(prev) = active.take() {
            info!(
                prev_mode = %prev.mode,
                prev_chats = ?prev.identifiers,
                "Stopping the previous watch"
            );
        }

        let (stop, stopped) = watch::channel(());

        let subscriptions = watched.iter().map_collect(|chat| {
            let (subscription, messages) = self.hub.subscribe(chat.id);
            tokio::spawn(
                run_worker(self.pipeline.clone(), mode, messages, stopped.clone())
                    .instrument(info_span!("watch_worker", chat_id = chat.id, %mode)),
            );
            subscription
        });

        *active = Some(ActiveWatch {
            mode,
            identifiers: resolved_identifiers.clone(),
            _subscriptions: subscriptions,
            _stop: stop,
        });

        info!(chats = ?resolved_identifiers, "Started watching");

        self.save_state(&WatchState::new(mode, resolved_identifiers)).await;

        Ok(WatchSummary {
            mode,
            watched,
            failed,
        })
    }

    /// Returns the mode of the watch that was stopped, if any
    #[instrument(skip(self))]
    pub(crate) async fn stop(&self) -> Option<WatchMode> {
        let prev = self.active.lock().await.take();

        if let Some(prev) = &prev {
            info!(mode = %prev.mode, chats = ?prev.identifiers, "Stopped watching");
        }

        if let Err(err) = self.state.clear().await {
            warn!(err = tracing_err(&err), "Failed to clear the watch state");
        }

        prev.map(|prev| prev.mode)
    }

    pub(crate) async fn current(&self) -> Option<(WatchMode, Vec<String>)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| (active.mode, active.identifiers.clone()))
    }

    /// Starts the watch saved in the state file, if any
    pub(crate) async fn resume(&self) -> Result<Option<WatchSummary>> {
        let state = self.state.load().await;

        let Some((mode, identifiers)) = state.active() else {
            info!("There is no saved watch to resume");
            return Ok(None);
        };

        info!(%mode, chats = ?identifiers, "Resuming the saved watch");

        self.start(mode, identifiers.to_vec()).await.map(Some)
    }

    /// Writes the current watch to the state file
    pub(crate) async fn persist(&self) -> Result {
        let state = match self.current().await {
            Some((mode, identifiers)) => WatchState::new(mode, identifiers),
            None => WatchState::default(),
        };
        self.state.save(&state).await
    }

    /// Relays the latest `count` messages of the chat, oldest first, with
    /// `interval` between them. The ad filter isn't applied, the messages
    /// were requested explicitly. Texts are rewritten in AI mode.
    ///
    /// The current watch is stopped first. The messages are sent in background.
    #[instrument(skip(self))]
    pub(crate) async fn summarize(
        &self,
        mode: WatchMode,
        identifier: &str,
        count: usize,
        interval: Duration,
    ) -> Result<SummaryPlan> {
        let Some(mut delays) = delays_since_start(interval, count) else {
            return Err(err!(RelayError::ScheduleTooLong { count, interval }));
        };

        let stopped = self.stop().await;

        let chat = self.resolver.resolve(identifier).await?;
        let messages: Vec<_> = self
            .pipeline
            .source
            .recent_messages(&chat, count)
            .await?
            .into_iter()
            .filter(|message| !message.text.trim().is_empty() || message.media.is_some())
            .collect();

        let texts: Vec<_> = messages.iter().map_collect(|message| message.text.clone());

        let texts = match mode {
            WatchMode::Plain => texts,
            WatchMode::Ai => self.pipeline.rewrite_batch(&texts).await,
        };

        let scheduled = messages.len();
        let pipeline = self.pipeline.clone();

        let span = info_span!("summarize_delivery", chat_id = chat.id, %mode, scheduled);

        delays.truncate(scheduled);

        tokio::spawn(
            async move {
                let start = tokio::time::Instant::now();

                for (delay, (message, text)) in delays.into_iter().zip(messages.iter().zip(&texts)) {
                    tokio::time::sleep(delay.saturating_sub(start.elapsed())).await;

                    let outcome = pipeline.deliver(message, text).await;
                    if outcome != Outcome::Relayed {
                        warn!(
                            message_id = message.id,
                            outcome = <&str>::from(outcome),
                            "Message from the summary wasn't relayed as is"
                        );
                    }
                }

                info!("Finished relaying the summary");
            }
            .instrument(span),
        );

        Ok(SummaryPlan { scheduled, stopped })
    }

    async fn save_state(&self, state: &WatchState) {
        if let Err(err) = self.state.save(state).await {
            warn!(err = tracing_err(&err), "Failed to save the watch state");
        }
    }
}

/// Delays for sending `count` messages `interval` apart. `None` if they
/// overflow [`Duration`].
fn delays_since_start(interval: Duration, count: usize) -> Option<Vec<Duration>> {
    (0..count)
        .map(|index| interval.checked_mul(u32::try_from(index).ok()?))
        .collect()
}

async fn run_worker(
    pipeline: Arc<Pipeline>,
    mode: WatchMode,
    mut messages: mpsc::Receiver<SourceMessage>,
    mut stopped: watch::Receiver<()>,
) {
    debug!("Worker started");

    loop {
        let message = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        pipeline.handle(mode, message).await;
    }

    debug!("Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::tests::{Sent, TestEnv};
    use crate::ErrorKind;
    use assert_matches::assert_matches;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|&id| id.to_owned()).collect()
    }

    #[test_log::test(tokio::test)]
    async fn unresolved_chats_are_skipped() {
        let env = TestEnv::new().await;
        let relay = env.relay();

        let summary = relay
            .start(WatchMode::Plain, ids(&["@a", "@missing", "@b"]))
            .await
            .unwrap();

        let watched: Vec<_> = summary.watched.iter().map_collect(|chat| chat.id);
        assert_eq!(watched, [TestEnv::CHAT_A, TestEnv::CHAT_B]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "@missing");

        assert_eq!(
            relay.current().await,
            Some((WatchMode::Plain, ids(&["@a", "@b"])))
        );
        assert_eq!(
            env.state().load().await,
            WatchState::new(WatchMode::Plain, ids(&["@a", "@b"]))
        );
    }

    #[test_log::test(tokio::test)]
    async fn nothing_resolved_keeps_the_current_watch() {
        let env = TestEnv::new().await;
        let relay = env.relay();

        relay.start(WatchMode::Plain, ids(&["@a"])).await.unwrap();

        let err = relay
            .start(WatchMode::Ai, ids(&["@missing"]))
            .await
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Relay {
                source: RelayError::NoChannelsResolved { identifiers }
            }
            if identifiers == &ids(&["@missing"])
        );
        assert_eq!(relay.current().await, Some((WatchMode::Plain, ids(&["@a"]))));
    }

    #[test_log::test(tokio::test)]
    async fn only_the_latest_watch_receives_events() {
        let env = TestEnv::new().await;
        let relay = env.relay();

        relay.start(WatchMode::Plain, ids(&["@a"])).await.unwrap();
        relay.start(WatchMode::Plain, ids(&["@b"])).await.unwrap();

        assert!(!env.hub.publish(env.chat_message(TestEnv::CHAT_A, 1, "Из канала A")));
        assert!(env.hub.publish(env.chat_message(TestEnv::CHAT_B, 2, "Из канала B")));

        env.destination.wait_for(1).await;

        // Give the stale worker a chance to misbehave
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(env.destination.sent(), [Sent::text("Из канала B")]);
        assert_eq!(env.hub.subscribed_chats(), [TestEnv::CHAT_B]);
    }

    #[test_log::test(tokio::test)]
    async fn stop_unsubscribes_and_clears_state() {
        let env = TestEnv::new().await;
        let relay = env.relay();

        relay.start(WatchMode::Ai, ids(&["@a"])).await.unwrap();

        assert_eq!(relay.stop().await, Some(WatchMode::Ai));
        assert_eq!(relay.stop().await, None);

        assert!(!env.hub.publish(env.chat_message(TestEnv::CHAT_A, 1, "После остановки")));
        assert_eq!(relay.current().await, None);
        assert_eq!(env.state().load().await, WatchState::default());
    }

    #[test_log::test(tokio::test)]
    async fn saved_watch_is_resumed() {
        let env = TestEnv::new().await;

        env.state()
            .save(&WatchState::new(WatchMode::Plain, ids(&["@b"])))
            .await
            .unwrap();

        let relay = env.relay();
        let summary = relay.resume().await.unwrap().unwrap();

        assert_eq!(summary.mode, WatchMode::Plain);
        assert_eq!(env.hub.subscribed_chats(), [TestEnv::CHAT_B]);

        env.hub
            .publish(env.chat_message(TestEnv::CHAT_B, 1, "Новость"));

        env.destination.wait_for(1).await;
        assert_eq!(env.destination.sent(), [Sent::text("Новость")]);
    }

    #[test_log::test(tokio::test)]
    async fn nothing_to_resume() {
        let env = TestEnv::new().await;
        assert!(env.relay().resume().await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn messages_of_a_chat_are_relayed_in_order() {
        let env = TestEnv::new().await;
        let relay = env.relay();

        relay.start(WatchMode::Plain, ids(&["@a"])).await.unwrap();

        for id in 1..=5 {
            env.hub
                .publish(env.chat_message(TestEnv::CHAT_A, id, &format!("Новость {id}")));
        }

        env.destination.wait_for(5).await;

        let expected: Vec<_> = (1..=5).map_collect(|id| Sent::text(&format!("Новость {id}")));
        assert_eq!(env.destination.sent(), expected);
    }

    #[test_log::test(tokio::test)]
    async fn summary_is_relayed_oldest_first_without_ad_filter() {
        let env = TestEnv::new().await;
        env.source.set_recent_messages(
            TestEnv::CHAT_A,
            vec![
                env.chat_message(TestEnv::CHAT_A, 1, "Первая"),
                env.chat_message(TestEnv::CHAT_A, 2, ""),
                env.chat_message(TestEnv::CHAT_A, 3, "Подпишитесь на канал"),
            ],
        );

        let relay = env.relay();
        let plan = relay
            .summarize(WatchMode::Plain, "@a", 3, Duration::from_millis(10))
            .await
            .unwrap();

        // The empty message is skipped
        assert_eq!(
            plan,
            SummaryPlan {
                scheduled: 2,
                stopped: None,
            }
        );

        env.destination.wait_for(2).await;

        assert_eq!(
            env.destination.sent(),
            [Sent::text("Первая"), Sent::text("Подпишитесь на канал")]
        );
    }

    #[test_log::test(tokio::test)]
    async fn summary_in_ai_mode_rewrites_texts() {
        let env = TestEnv::new().await;
        env.mock_llm_answer("Переписано").await;
        env.source.set_recent_messages(
            TestEnv::CHAT_B,
            vec![
                env.chat_message(TestEnv::CHAT_B, 1, "Первая"),
                env.chat_message(TestEnv::CHAT_B, 2, "Вторая"),
            ],
        );

        let plan = env
            .relay()
            .summarize(WatchMode::Ai, "@b", 2, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(plan.scheduled, 2);

        env.destination.wait_for(2).await;
        assert_eq!(
            env.destination.sent(),
            [Sent::text("Переписано"), Sent::text("Переписано")]
        );
    }

    #[test_log::test(tokio::test)]
    async fn summary_stops_the_current_watch() {
        let env = TestEnv::new().await;
        env.source.set_recent_messages(
            TestEnv::CHAT_B,
            vec![env.chat_message(TestEnv::CHAT_B, 1, "Сводка")],
        );

        let relay = env.relay();
        relay.start(WatchMode::Ai, ids(&["@a"])).await.unwrap();

        let plan = relay
            .summarize(WatchMode::Plain, "@b", 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            plan,
            SummaryPlan {
                scheduled: 1,
                stopped: Some(WatchMode::Ai),
            }
        );
        assert_eq!(relay.current().await, None);
        assert!(env.hub.subscribed_chats().is_empty());
        assert_eq!(env.state().load().await, WatchState::default());

        env.destination.wait_for(1).await;
        assert_eq!(env.destination.sent(), [Sent::text("Сводка")]);
    }

    #[test_log::test(tokio::test)]
    async fn overflowing_summary_schedule_is_rejected() {
        let env = TestEnv::new().await;
        let relay = env.relay();
        relay.start(WatchMode::Plain, ids(&["@a"])).await.unwrap();

        let err = relay
            .summarize(WatchMode::Plain, "@a", 3, Duration::MAX)
            .await
            .unwrap_err();

        assert!(err.is_user_error());
        assert_matches!(
            err.kind(),
            ErrorKind::Relay {
                source: RelayError::ScheduleTooLong { count: 3, .. }
            }
        );

        // Nothing is stopped when the request is invalid
        assert_eq!(relay.current().await, Some((WatchMode::Plain, ids(&["@a"]))));
    }

    #[test]
    fn summary_delays() {
        let second = Duration::from_secs(1);
        assert_eq!(
            delays_since_start(second, 3).unwrap(),
            [Duration::ZERO, second, second * 2]
        );
        assert_eq!(delays_since_start(Duration::MAX, 2).unwrap()[1], Duration::MAX);
        assert_eq!(delays_since_start(Duration::MAX, 3), None);
        assert!(delays_since_start(second, 0).unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn summary_of_unknown_chat_fails() {
        let env = TestEnv::new().await;

        let err = env
            .relay()
            .summarize(WatchMode::Plain, "@missing", 1, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(err.is_user_error());
    }
}
