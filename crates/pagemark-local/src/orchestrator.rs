//! Readiness/retry delivery of highlight requests to a page agent.

use crate::config::DeliveryConfig;
use crate::registry::TabRegistry;
use pagemark_core::{
    AgentRequest, AgentResponse, AgentTransport, HighlightReason, HighlightRequest, TabId,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Created,
    WaitingForLoad,
    Attempting,
    Succeeded,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Matched { matches: usize },
    NoMatch { reason: HighlightReason },
    Errored { message: String },
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    fn from_response(resp: AgentResponse) -> Self {
        match resp {
            AgentResponse::Highlight(r) if r.success && r.matches_found > 0 => Self::Matched {
                matches: r.matches_found,
            },
            AgentResponse::Highlight(r) => Self::NoMatch { reason: r.reason },
            AgentResponse::Error { message } => Self::Errored { message },
            other => Self::Errored {
                message: format!("unexpected reply: {other:?}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Backoff slept right before this attempt.
    pub waited_before_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub state: DeliveryState,
    pub transitions: Vec<DeliveryState>,
    pub attempts: Vec<AttemptRecord>,
    /// Outcome of the one-shot direct delivery after exhaustion.
    pub fallback: Option<AttemptOutcome>,
}

impl DeliveryReport {
    fn new() -> Self {
        Self {
            state: DeliveryState::Created,
            transitions: vec![DeliveryState::Created],
            attempts: Vec::new(),
            fallback: None,
        }
    }

    fn enter(&mut self, state: DeliveryState) {
        tracing::debug!(from = ?self.state, to = ?state, "delivery transition");
        self.state = state;
        self.transitions.push(state);
    }

    pub fn succeeded(&self) -> bool {
        self.state == DeliveryState::Succeeded
    }

    /// Matches realized by the successful attempt, or by the fallback.
    pub fn matches_found(&self) -> usize {
        self.attempts
            .iter()
            .map(|a| &a.outcome)
            .chain(self.fallback.iter())
            .find_map(|o| match o {
                AttemptOutcome::Matched { matches } => Some(*matches),
                _ => None,
            })
            .unwrap_or(0)
    }
}

/// Drives one request at a time through `Created → WaitingForLoad → Attempting →
/// {Succeeded, Exhausted}`. Attempts of a request are strictly sequential.
pub struct DeliveryOrchestrator<T: AgentTransport + ?Sized> {
    transport: Arc<T>,
    registry: Arc<TabRegistry>,
    config: DeliveryConfig,
}

impl<T: AgentTransport + ?Sized> DeliveryOrchestrator<T> {
    pub fn new(transport: Arc<T>, registry: Arc<TabRegistry>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub async fn deliver(&self, request: &HighlightRequest) -> DeliveryReport {
        let tab = request.tab;
        let req = request.to_agent_request();
        let mut report = DeliveryReport::new();

        report.enter(DeliveryState::WaitingForLoad);
        if self
            .registry
            .wait_for_load(tab, self.config.load_timeout)
            .await
        {
            tokio::time::sleep(self.config.initial_delay).await;
        } else {
            tracing::warn!(%tab, "page did not finish loading; counting as a failed attempt");
            report.attempts.push(AttemptRecord {
                attempt: 1,
                waited_before_ms: 0,
                outcome: AttemptOutcome::TimedOut,
            });
        }

        report.enter(DeliveryState::Attempting);
        let mut attempt = report.attempts.len() as u32 + 1;
        while attempt <= self.config.max_attempts {
            let backoff = self.config.backoff_unit * (attempt - 1);
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
            }
            let outcome = self.attempt(tab, &req).await;
            tracing::info!(%tab, attempt, ?outcome, "delivery attempt");
            let done = outcome.is_success();
            report.attempts.push(AttemptRecord {
                attempt,
                waited_before_ms: backoff.as_millis() as u64,
                outcome,
            });
            if done {
                report.enter(DeliveryState::Succeeded);
                return report;
            }
            attempt += 1;
        }

        report.enter(DeliveryState::Exhausted);
        let fallback = self.fallback(tab, &req).await;
        tracing::info!(%tab, outcome = ?fallback, "direct delivery after exhausted retries");
        report.fallback = Some(fallback);
        report
    }

    async fn attempt(&self, tab: TabId, req: &AgentRequest) -> AttemptOutcome {
        match tokio::time::timeout(self.config.attempt_timeout, self.transport.send(tab, req)).await
        {
            Err(_) => AttemptOutcome::TimedOut,
            Ok(Err(e)) => AttemptOutcome::Errored {
                message: e.to_string(),
            },
            Ok(Ok(resp)) => AttemptOutcome::from_response(resp),
        }
    }

    /// One shot, no retry bookkeeping.
    async fn fallback(&self, tab: TabId, req: &AgentRequest) -> AttemptOutcome {
        match tokio::time::timeout(
            self.config.attempt_timeout,
            self.transport.deliver_direct(tab, req),
        )
        .await
        {
            Err(_) => AttemptOutcome::TimedOut,
            Ok(Err(e)) => AttemptOutcome::Errored {
                message: e.to_string(),
            },
            Ok(Ok(resp)) => AttemptOutcome::from_response(resp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagemark_core::{Error, HighlightReply, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Hang,
        Fail,
        NoMatch,
        Match(usize),
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Script>>,
        sends: Mutex<Vec<Instant>>,
        direct: AtomicUsize,
        direct_reply: Script,
    }

    impl ScriptedTransport {
        fn new(script: &[Script], direct_reply: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                sends: Mutex::new(Vec::new()),
                direct: AtomicUsize::new(0),
                direct_reply,
            })
        }

        fn sends(&self) -> Vec<Instant> {
            self.sends.lock().unwrap().clone()
        }

        async fn play(step: Script) -> Result<AgentResponse> {
            match step {
                Script::Hang => std::future::pending().await,
                Script::Fail => Err(Error::Delivery("receiving end does not exist".into())),
                Script::NoMatch => Ok(AgentResponse::Highlight(HighlightReply::no_matches())),
                Script::Match(n) => Ok(AgentResponse::Highlight(HighlightReply::from_count(n))),
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentTransport for ScriptedTransport {
        async fn send(&self, _tab: TabId, _req: &AgentRequest) -> Result<AgentResponse> {
            self.sends.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail);
            Self::play(step).await
        }

        async fn deliver_direct(&self, _tab: TabId, _req: &AgentRequest) -> Result<AgentResponse> {
            self.direct.fetch_add(1, Ordering::SeqCst);
            Self::play(self.direct_reply).await
        }
    }

    fn loaded_registry(tab: TabId) -> Arc<TabRegistry> {
        let reg = Arc::new(TabRegistry::new());
        reg.begin_load(tab, "https://example.com/");
        reg.mark_complete(tab);
        reg
    }

    fn request(tab: TabId) -> HighlightRequest {
        HighlightRequest {
            targets: vec!["brown fox".to_string()],
            tab,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_silent_attempts_then_success() {
        let tab = TabId(1);
        let t = ScriptedTransport::new(&[Script::Hang, Script::Hang, Script::Match(2)], Script::Fail);
        let o = DeliveryOrchestrator::new(t.clone(), loaded_registry(tab), DeliveryConfig::default());

        let report = o.deliver(&request(tab)).await;

        assert_eq!(report.state, DeliveryState::Succeeded);
        assert_eq!(
            report.transitions,
            vec![
                DeliveryState::Created,
                DeliveryState::WaitingForLoad,
                DeliveryState::Attempting,
                DeliveryState::Succeeded
            ]
        );
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(report.attempts[1].outcome, AttemptOutcome::TimedOut);
        assert_eq!(report.matches_found(), 2);
        let waits: Vec<u64> = report.attempts.iter().map(|a| a.waited_before_ms).collect();
        assert_eq!(waits, vec![0, 500, 1000]);
        assert!(report.fallback.is_none());
        assert_eq!(t.direct.load(Ordering::SeqCst), 0);

        let sends = t.sends();
        assert_eq!(sends.len(), 3);
        let gap1 = sends[1] - sends[0];
        let gap2 = sends[2] - sends[1];
        assert!(gap2 > gap1, "backoff must grow: {gap1:?} then {gap2:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_fires_exactly_one_direct_delivery() {
        let tab = TabId(2);
        let t = ScriptedTransport::new(&[Script::Fail, Script::NoMatch, Script::Hang], Script::Fail);
        let o = DeliveryOrchestrator::new(t.clone(), loaded_registry(tab), DeliveryConfig::default());

        let report = o.deliver(&request(tab)).await;

        assert_eq!(report.state, DeliveryState::Exhausted);
        assert_eq!(report.attempts.len(), 3);
        assert!(matches!(report.attempts[0].outcome, AttemptOutcome::Errored { .. }));
        assert_eq!(
            report.attempts[1].outcome,
            AttemptOutcome::NoMatch {
                reason: HighlightReason::NoMatchesFound
            }
        );
        assert_eq!(t.direct.load(Ordering::SeqCst), 1);
        assert!(matches!(report.fallback, Some(AttemptOutcome::Errored { .. })));

        // Nothing else happens afterwards.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(t.sends().len(), 3);
        assert_eq!(t.direct.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_success_is_reported_but_state_stays_exhausted() {
        let tab = TabId(3);
        let t = ScriptedTransport::new(&[Script::Fail, Script::Fail, Script::Fail], Script::Match(1));
        let o = DeliveryOrchestrator::new(t.clone(), loaded_registry(tab), DeliveryConfig::default());
        let report = o.deliver(&request(tab)).await;
        assert_eq!(report.state, DeliveryState::Exhausted);
        assert_eq!(report.fallback, Some(AttemptOutcome::Matched { matches: 1 }));
        assert_eq!(report.matches_found(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn load_timeout_counts_as_first_attempt() {
        let tab = TabId(4);
        let reg = Arc::new(TabRegistry::new());
        reg.begin_load(tab, "https://example.com/");
        let t = ScriptedTransport::new(&[Script::Match(1)], Script::Fail);
        let o = DeliveryOrchestrator::new(t.clone(), reg, DeliveryConfig::default());

        let report = o.deliver(&request(tab)).await;

        assert_eq!(report.state, DeliveryState::Succeeded);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(report.attempts[1].attempt, 2);
        assert_eq!(report.attempts[1].waited_before_ms, 500);
        assert_eq!(t.sends().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_waits_for_initial_delay() {
        let tab = TabId(5);
        let t = ScriptedTransport::new(&[Script::Match(1)], Script::Fail);
        let o = DeliveryOrchestrator::new(t.clone(), loaded_registry(tab), DeliveryConfig::default());
        let start = Instant::now();
        let report = o.deliver(&request(tab)).await;
        assert!(report.succeeded());
        assert!(t.sends()[0] - start >= Duration::from_millis(1000));
    }
}
