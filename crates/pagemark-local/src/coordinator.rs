//! Control-surface decision: highlight in the open page, or hand off and navigate.

use crate::orchestrator::{DeliveryOrchestrator, DeliveryReport};
use crate::terms::{extract_terms, DEFAULT_MAX_TERMS};
use pagemark_core::{
    now_epoch_ms, same_page, ActiveTab, AgentTransport, Browser, HandoffStorage,
    HighlightRequest, PendingHandoff, RetrievalResult, TabId,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenPath {
    InPage,
    Navigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStatus {
    /// In-page delivery realized at least one mark.
    Highlighted,
    /// In-page delivery ran but nothing was marked.
    NotHighlighted,
    /// Nothing to look for; the page is shown as is.
    NoPositions,
    /// Page opened; the agent will highlight from the hand-off.
    HandedOff,
    NavigationFailed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenOutcome {
    pub path: OpenPath,
    pub status: OpenStatus,
    pub tab: Option<TabId>,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReport>,
    pub handoff_stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpenOutcome {
    fn new(path: OpenPath, status: OpenStatus, targets: Vec<String>) -> Self {
        Self {
            path,
            status,
            tab: None,
            targets,
            delivery: None,
            handoff_stored: false,
            error: None,
        }
    }
}

/// Targets for a result: its own positions verbatim, else terms from the snippet,
/// else terms from the content.
pub fn plan_targets(result: &RetrievalResult) -> Vec<String> {
    if let Some(positions) = result.highlight_positions.as_ref().filter(|p| !p.is_empty()) {
        let mut out: Vec<String> = Vec::new();
        for p in positions {
            if !out.contains(&p.term) {
                out.push(p.term.clone());
            }
        }
        return out;
    }
    let from_snippet = result
        .snippet
        .as_deref()
        .map(|s| extract_terms(s, DEFAULT_MAX_TERMS))
        .unwrap_or_default();
    if !from_snippet.is_empty() {
        return from_snippet;
    }
    extract_terms(&result.content, DEFAULT_MAX_TERMS)
}

pub struct Coordinator {
    browser: Arc<dyn Browser>,
    handoff: Arc<dyn HandoffStorage>,
    orchestrator: DeliveryOrchestrator<dyn AgentTransport>,
}

impl Coordinator {
    pub fn new(
        browser: Arc<dyn Browser>,
        handoff: Arc<dyn HandoffStorage>,
        orchestrator: DeliveryOrchestrator<dyn AgentTransport>,
    ) -> Self {
        Self {
            browser,
            handoff,
            orchestrator,
        }
    }

    /// Open `result` for the user. Never fails; problems are reported in the outcome.
    pub async fn open_result(
        &self,
        result: &RetrievalResult,
        active: Option<&ActiveTab>,
    ) -> OpenOutcome {
        let targets = plan_targets(result);
        let deadline = self.orchestrator.config().end_to_end_timeout;

        if let Some(active) = active.filter(|a| same_page(&a.url, &result.url)) {
            if targets.is_empty() {
                let mut out = OpenOutcome::new(OpenPath::InPage, OpenStatus::NoPositions, targets);
                out.tab = Some(active.tab);
                return out;
            }
            let request = HighlightRequest {
                targets: targets.clone(),
                tab: active.tab,
            };
            tracing::info!(tab = %active.tab, url = result.url.as_str(), "highlighting in open page");
            let delivered =
                tokio::time::timeout(deadline, self.orchestrator.deliver(&request)).await;
            let mut out = OpenOutcome::new(OpenPath::InPage, OpenStatus::TimedOut, targets);
            out.tab = Some(active.tab);
            if let Ok(report) = delivered {
                out.status = if report.matches_found() > 0 {
                    OpenStatus::Highlighted
                } else {
                    OpenStatus::NotHighlighted
                };
                out.delivery = Some(report);
            }
            return out;
        }

        let mut out = OpenOutcome::new(OpenPath::Navigation, OpenStatus::HandedOff, targets);
        match self
            .handoff
            .put(PendingHandoff::for_result(result, now_epoch_ms()))
        {
            Ok(()) => out.handoff_stored = true,
            Err(e) => tracing::warn!(error = %e, "could not store hand-off; opening unhighlighted"),
        }
        tracing::info!(url = result.url.as_str(), "navigating to result");
        match tokio::time::timeout(deadline, self.browser.open(&result.url, None)).await {
            Ok(Ok(tab)) => out.tab = Some(tab),
            Ok(Err(e)) => {
                out.status = OpenStatus::NavigationFailed;
                out.error = Some(e.to_string());
            }
            Err(_) => out.status = OpenStatus::TimedOut,
        }
        out
    }
}
