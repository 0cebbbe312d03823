//! Page agent: the page-embedded side of the message contract.
//!
//! A `PageAgent` owns one document. `spawn_agent` runs it as a single task that
//! processes its inbox one message at a time, so highlight passes never interleave.

use crate::config::HighlightConfig;
use crate::dom::{Document, NodeId};
use crate::highlight::{inside_mark, ApplyOutcome, Highlighter};
use crate::locator::locate;
use crate::results::{clean_content, is_confidential_url};
use crate::scanner::{page_text, scan};
use crate::terms::{extract_terms, DEFAULT_MAX_TERMS};
use pagemark_core::{
    AgentEvent, AgentRequest, AgentResponse, Error, ExtractContentReply, HandoffStorage,
    HighlightPosition, HighlightReply, PendingHandoff, ReadyReply, Result, Target,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const INBOX_CAPACITY: usize = 32;

/// Serialized view of an agent's page.
#[derive(Debug, Clone, Serialize)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
    pub marks: usize,
    pub focus: Option<NodeId>,
}

/// What happened when the agent started on a freshly loaded page.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub handoff_consumed: bool,
    pub highlight: Option<HighlightReply>,
    pub announcement: AgentEvent,
}

pub struct PageAgent {
    doc: Document,
    url: String,
    highlighter: Highlighter,
    per_term_cap: usize,
    pending_emphasis: Option<u64>,
}

impl PageAgent {
    pub fn new(html: &str, url: &str, config: &HighlightConfig) -> Self {
        Self::from_document(Document::parse_html(html), url, config.per_term_cap)
    }

    pub fn from_document(doc: Document, url: &str, per_term_cap: usize) -> Self {
        Self {
            doc,
            url: url.to_string(),
            highlighter: Highlighter::new(),
            per_term_cap: per_term_cap.max(1),
            pending_emphasis: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn highlighter(&self) -> &Highlighter {
        &self.highlighter
    }

    pub fn snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            url: self.url.clone(),
            html: self.doc.to_html(),
            marks: self.highlighter.marks().len(),
            focus: self.highlighter.focus(),
        }
    }

    pub fn handle(&mut self, req: &AgentRequest) -> AgentResponse {
        tracing::debug!(action = req.name(), url = self.url.as_str(), "agent request");
        match req {
            AgentRequest::ExtractContent => AgentResponse::ExtractContent(self.extract_content()),
            AgentRequest::Highlight { positions } => {
                AgentResponse::Highlight(self.highlight(positions))
            }
            AgentRequest::IsReady => AgentResponse::IsReady(ReadyReply { ready: true }),
        }
    }

    /// Validate an untrusted envelope and answer it; malformed input gets an error reply.
    pub fn handle_json(&mut self, raw: &str) -> AgentResponse {
        match AgentRequest::from_json_str(raw) {
            Ok(req) => self.handle(&req),
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed agent request");
                AgentResponse::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    pub fn extract_content(&self) -> ExtractContentReply {
        if is_confidential_url(&self.url) {
            tracing::info!(url = self.url.as_str(), "not extracting confidential page");
            return ExtractContentReply {
                content: String::new(),
            };
        }
        ExtractContentReply {
            content: clean_content(&page_text(&self.doc)),
        }
    }

    pub fn highlight(&mut self, positions: &[HighlightPosition]) -> HighlightReply {
        let targets: Vec<Target> = positions
            .iter()
            .filter_map(|p| Target::parse(&p.term))
            .collect();
        if targets.is_empty() {
            return HighlightReply::no_positions();
        }
        let outcome = self.run_pass(&targets);
        HighlightReply::from_count(outcome.matches_applied)
    }

    /// One pass over all targets; each target is located against a fresh scan.
    /// Text already marked earlier in the pass is not searched again.
    fn run_pass(&mut self, targets: &[Target]) -> ApplyOutcome {
        let cap = self.per_term_cap;
        let mut pass = self.highlighter.begin(&mut self.doc);
        for target in targets {
            let doc = pass.document();
            let units: Vec<_> = scan(doc)
                .into_iter()
                .filter(|u| !inside_mark(doc, u.node))
                .collect();
            let candidates = locate(target.as_str(), &units);
            pass.apply(&candidates, cap);
        }
        let outcome = pass.finish();
        if let Some(anchor) = outcome.anchor {
            self.pending_emphasis = Some(anchor.generation);
        }
        tracing::info!(
            url = self.url.as_str(),
            targets = targets.len(),
            matches = outcome.matches_applied,
            "highlight pass"
        );
        outcome
    }

    /// Generation whose emphasis still needs a timed revert.
    pub fn take_pending_emphasis(&mut self) -> Option<u64> {
        self.pending_emphasis.take()
    }

    pub fn revert_emphasis(&mut self, generation: u64) -> bool {
        self.highlighter.revert_emphasis(&mut self.doc, generation)
    }

    /// Consume a pending hand-off for this page (if any), highlight from it, and
    /// produce the readiness announcement.
    pub fn on_load(&mut self, handoff: Option<&dyn HandoffStorage>) -> LoadReport {
        let record = match handoff.map(|h| h.take_if_matching(&self.url)) {
            Some(Ok(r)) => r,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "could not read hand-off");
                None
            }
            None => None,
        };
        let handoff_consumed = record.is_some();
        let highlight = record.map(|r| {
            let terms = handoff_terms(&r);
            let positions: Vec<HighlightPosition> =
                terms.into_iter().map(HighlightPosition::term).collect();
            self.highlight(&positions)
        });
        LoadReport {
            handoff_consumed,
            highlight,
            announcement: AgentEvent::ContentScriptReady {
                url: self.url.clone(),
            },
        }
    }
}

/// Snippet first, full content second.
fn handoff_terms(record: &PendingHandoff) -> Vec<String> {
    let from_snippet = record
        .snippet
        .as_deref()
        .map(|s| extract_terms(s, DEFAULT_MAX_TERMS))
        .unwrap_or_default();
    if !from_snippet.is_empty() {
        return from_snippet;
    }
    record
        .content
        .as_deref()
        .map(|c| extract_terms(c, DEFAULT_MAX_TERMS))
        .unwrap_or_default()
}

enum Envelope {
    Request {
        req: AgentRequest,
        reply: oneshot::Sender<AgentResponse>,
    },
    Snapshot {
        reply: oneshot::Sender<PageSnapshot>,
    },
    RevertEmphasis {
        generation: u64,
    },
}

/// Cheap, cloneable address of a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Envelope>,
    url: String,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("url", &self.url)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl AgentHandle {
    pub async fn request(&self, req: AgentRequest) -> Result<AgentResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Request { req, reply })
            .await
            .map_err(|_| Error::Delivery(format!("agent for {} is gone", self.url)))?;
        rx.await
            .map_err(|_| Error::Delivery(format!("agent for {} dropped the reply", self.url)))
    }

    pub async fn snapshot(&self) -> Result<PageSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Snapshot { reply })
            .await
            .map_err(|_| Error::Delivery(format!("agent for {} is gone", self.url)))?;
        rx.await
            .map_err(|_| Error::Delivery(format!("agent for {} dropped the reply", self.url)))
    }
}

/// Run `agent` on its own task.
///
/// The task first consumes the hand-off (if any) and only then announces readiness
/// on the returned receiver. It stops once every handle is dropped.
pub fn spawn_agent(
    mut agent: PageAgent,
    handoff: Option<Arc<dyn HandoffStorage>>,
    emphasis: Duration,
) -> (AgentHandle, oneshot::Receiver<AgentEvent>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(INBOX_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();
    let weak = tx.downgrade();
    let handle = AgentHandle {
        tx,
        url: agent.url().to_string(),
    };

    tokio::spawn(async move {
        let report = agent.on_load(handoff.as_deref());
        schedule_revert(&weak, agent.take_pending_emphasis(), emphasis);
        let _ = ready_tx.send(report.announcement);

        while let Some(msg) = rx.recv().await {
            match msg {
                Envelope::Request { req, reply } => {
                    let resp = agent.handle(&req);
                    schedule_revert(&weak, agent.take_pending_emphasis(), emphasis);
                    let _ = reply.send(resp);
                }
                Envelope::Snapshot { reply } => {
                    let _ = reply.send(agent.snapshot());
                }
                Envelope::RevertEmphasis { generation } => {
                    agent.revert_emphasis(generation);
                }
            }
        }
        tracing::debug!(url = agent.url(), "page agent stopped");
    });

    (handle, ready_rx)
}

fn schedule_revert(weak: &mpsc::WeakSender<Envelope>, generation: Option<u64>, after: Duration) {
    let Some(generation) = generation else {
        return;
    };
    let weak = weak.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(tx) = weak.upgrade() {
            let _ = tx.send(Envelope::RevertEmphasis { generation }).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::MemoryHandoffStore;
    use crate::highlight::{EMPHASIS_CLASS, MARK_ATTR};
    use pagemark_core::{now_epoch_ms, HighlightReason};

    const URL: &str = "https://example.com/rivers";
    const PAGE: &str = "<html><head><title>Rivers</title></head><body>\
        <nav>Menu Search</nav>\
        <p>The quick brown fox jumps over the lazy dog</p>\
        <p>The river delta floods every spring after the snow melts.</p>\
        </body></html>";

    fn agent() -> PageAgent {
        PageAgent::new(PAGE, URL, &HighlightConfig::default())
    }

    fn positions(terms: &[&str]) -> Vec<HighlightPosition> {
        terms.iter().map(|t| HighlightPosition::term(*t)).collect()
    }

    #[test]
    fn highlight_reports_reason_codes() {
        let mut a = agent();
        assert_eq!(a.highlight(&[]).reason, HighlightReason::NoPositions);
        assert_eq!(
            a.highlight(&positions(&["ab", "  "])).reason,
            HighlightReason::NoPositions
        );

        let r = a.highlight(&positions(&["brown fox"]));
        assert!(r.success);
        assert_eq!(r.matches_found, 1);
        assert_eq!(r.reason, HighlightReason::Success);

        let r = a.highlight(&positions(&["zzzqqq not present anywhere"]));
        assert!(!r.success);
        assert_eq!(r.reason, HighlightReason::NoMatchesFound);
    }

    #[test]
    fn multiple_targets_share_one_generation() {
        let mut a = agent();
        let r = a.highlight(&positions(&["brown fox", "river delta"]));
        assert_eq!(r.matches_found, 2);
        let doc = a.document();
        let gens: Vec<&str> = doc
            .descendants(doc.root())
            .filter_map(|id| doc.attr(id, MARK_ATTR))
            .collect();
        assert_eq!(gens, vec!["1", "1"]);
    }

    #[test]
    fn overlapping_targets_count_each_mark_once() {
        let mut a = agent();
        let r = a.highlight(&positions(&["brown fox jumps", "brown fox"]));
        assert_eq!(r.matches_found, 1);
        let doc = a.document();
        let marks: Vec<NodeId> = doc
            .descendants(doc.root())
            .filter(|id| doc.attr(*id, MARK_ATTR).is_some())
            .collect();
        assert_eq!(marks.len(), 1);
        assert!(!inside_mark(doc, marks[0]));
        assert!(doc.to_html().contains(">brown fox jumps</mark>"));
    }

    #[test]
    fn repeated_highlight_keeps_one_generation() {
        let mut a = agent();
        assert_eq!(a.highlight(&positions(&["brown fox"])).matches_found, 1);
        let r = a.highlight(&positions(&["lazy dog", "river delta"]));
        assert_eq!(r.matches_found, 2);

        let doc = a.document();
        let gens: Vec<&str> = doc
            .descendants(doc.root())
            .filter_map(|id| doc.attr(id, MARK_ATTR))
            .collect();
        assert_eq!(gens, vec!["2", "2"]);
        assert_eq!(a.highlighter().marks().len(), 2);
        assert!(a
            .highlighter()
            .marks()
            .iter()
            .all(|m| m.generation == 2));
        assert!(!doc.to_html().contains(">brown fox</mark>"));
    }

    #[test]
    fn extract_content_respects_confidential_pages() {
        let a = agent();
        let content = a.extract_content().content;
        assert!(content.contains("The quick brown fox"));
        assert!(!content.contains("Menu"));

        let private = PageAgent::new(
            PAGE,
            "https://mail.google.com/mail/u/0",
            &HighlightConfig::default(),
        );
        assert_eq!(private.extract_content().content, "");
    }

    #[test]
    fn handle_json_rejects_malformed_envelopes() {
        let mut a = agent();
        assert!(matches!(a.handle_json("{}"), AgentResponse::Error { .. }));
        assert!(matches!(a.handle_json("not json"), AgentResponse::Error { .. }));
        assert!(matches!(
            a.handle_json(r#"{"action":"teleport"}"#),
            AgentResponse::Error { .. }
        ));
        assert_eq!(
            a.handle_json(r#"{"action":"isReady"}"#),
            AgentResponse::IsReady(ReadyReply { ready: true })
        );
    }

    #[test]
    fn on_load_consumes_matching_handoff() {
        let store = MemoryHandoffStore::new(Duration::from_secs(300));
        store
            .put(PendingHandoff {
                content: Some("unrelated content".to_string()),
                snippet: Some(
                    "...The river delta floods every spring after the snow melts...".to_string(),
                ),
                url: URL.to_string(),
                timestamp: now_epoch_ms(),
                source_label: None,
            })
            .unwrap();
        let mut a = agent();
        let report = a.on_load(Some(&store as &dyn HandoffStorage));
        assert!(report.handoff_consumed);
        assert_eq!(report.highlight.unwrap().matches_found, 1);
        assert_eq!(
            report.announcement,
            AgentEvent::ContentScriptReady {
                url: URL.to_string()
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn on_load_ignores_handoff_for_other_page() {
        let store = MemoryHandoffStore::new(Duration::from_secs(300));
        store
            .put(PendingHandoff {
                content: Some("The quick brown fox".to_string()),
                snippet: None,
                url: "https://example.com/elsewhere".to_string(),
                timestamp: now_epoch_ms(),
                source_label: None,
            })
            .unwrap();
        let mut a = agent();
        let report = a.on_load(Some(&store as &dyn HandoffStorage));
        assert!(!report.handoff_consumed);
        assert!(report.highlight.is_none());
        assert!(store.is_empty());
        assert!(a.highlighter().marks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_agent_serves_requests_and_reverts_emphasis() {
        let (handle, ready) = spawn_agent(agent(), None, Duration::from_millis(2000));
        let event = ready.await.unwrap();
        assert_eq!(
            event,
            AgentEvent::ContentScriptReady {
                url: URL.to_string()
            }
        );

        let resp = handle
            .request(AgentRequest::Highlight {
                positions: positions(&["lazy dog"]),
            })
            .await
            .unwrap();
        assert_eq!(resp.as_highlight().matches_found, 1);
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.html.contains(EMPHASIS_CLASS));
        assert!(snap.focus.is_some());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let snap = handle.snapshot().await.unwrap();
        assert!(!snap.html.contains(EMPHASIS_CLASS));
        assert_eq!(snap.marks, 1);
    }

    #[tokio::test]
    async fn agent_runs_while_any_handle_lives() {
        let (handle, ready) = spawn_agent(agent(), None, Duration::from_millis(10));
        ready.await.unwrap();
        let other = handle.clone();
        drop(handle);
        // A live handle keeps the agent running.
        assert!(other.request(AgentRequest::IsReady).await.is_ok());
    }
}
