use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("mutation failed: {0}")]
    Mutation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("page load failed: {0}")]
    PageLoad(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Targets shorter than this (after trimming) are treated as "nothing to do".
pub const MIN_TARGET_CHARS: usize = 3;

/// Identifier of one page instance (a browser tab in the extension world).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

/// A validated string the caller wants located in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target(String);

impl Target {
    /// Returns `None` for targets shorter than [`MIN_TARGET_CHARS`] after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let t = raw.trim();
        if t.chars().count() < MIN_TARGET_CHARS {
            return None;
        }
        Some(Self(t.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }
}

/// Precision class of the strategy that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Exact = 1,
    Keyword = 2,
    Phrase = 3,
    Shingle = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightPosition {
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl HighlightPosition {
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            start: None,
            end: None,
        }
    }
}

/// One ranked fragment returned by the retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub highlight_positions: Option<Vec<HighlightPosition>>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub chunk_id: Option<String>,
}

/// Machine-readable outcome reported to the visual layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightReason {
    NoPositions,
    Success,
    NoMatchesFound,
    Error,
}

impl HighlightReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPositions => "no_positions",
            Self::Success => "success",
            Self::NoMatchesFound => "no_matches_found",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightReply {
    pub success: bool,
    pub matches_found: usize,
    pub reason: HighlightReason,
}

impl HighlightReply {
    pub fn no_positions() -> Self {
        Self {
            success: false,
            matches_found: 0,
            reason: HighlightReason::NoPositions,
        }
    }

    pub fn no_matches() -> Self {
        Self {
            success: false,
            matches_found: 0,
            reason: HighlightReason::NoMatchesFound,
        }
    }

    pub fn error() -> Self {
        Self {
            success: false,
            matches_found: 0,
            reason: HighlightReason::Error,
        }
    }

    pub fn from_count(matches_found: usize) -> Self {
        if matches_found == 0 {
            return Self::no_matches();
        }
        Self {
            success: true,
            matches_found,
            reason: HighlightReason::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractContentReply {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyReply {
    pub ready: bool,
}

/// Request envelope sent to a page agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentRequest {
    ExtractContent,
    Highlight { positions: Vec<HighlightPosition> },
    IsReady,
}

impl AgentRequest {
    /// Validate an untrusted envelope at the receiving boundary.
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        if v.get("action").and_then(|a| a.as_str()).is_none() {
            return Err(Error::Protocol("missing string field `action`".to_string()));
        }
        serde_json::from_value(v.clone()).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let v: serde_json::Value =
            serde_json::from_str(s).map_err(|e| Error::Protocol(e.to_string()))?;
        Self::from_json(&v)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExtractContent => "extractContent",
            Self::Highlight { .. } => "highlight",
            Self::IsReady => "isReady",
        }
    }
}

/// Reply envelope; the `action` tag mirrors the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentResponse {
    ExtractContent(ExtractContentReply),
    Highlight(HighlightReply),
    IsReady(ReadyReply),
    Error { message: String },
}

impl AgentResponse {
    /// Highlight reply view; any other shape counts as an errored highlight.
    pub fn as_highlight(&self) -> HighlightReply {
        match self {
            Self::Highlight(r) => r.clone(),
            _ => HighlightReply::error(),
        }
    }
}

/// Announcement emitted once by a page agent after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentEvent {
    ContentScriptReady { url: String },
}

/// Ordered targets for one page instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightRequest {
    pub targets: Vec<String>,
    pub tab: TabId,
}

impl HighlightRequest {
    pub fn to_agent_request(&self) -> AgentRequest {
        AgentRequest::Highlight {
            positions: self
                .targets
                .iter()
                .map(|t| HighlightPosition::term(t.clone()))
                .collect(),
        }
    }
}

/// Short-lived state carried across one navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingHandoff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub url: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
}

impl PendingHandoff {
    pub fn for_result(result: &RetrievalResult, now_ms: u64) -> Self {
        Self {
            content: Some(result.content.clone()).filter(|s| !s.trim().is_empty()),
            snippet: result.snippet.clone().filter(|s| !s.trim().is_empty()),
            url: result.url.clone(),
            timestamp: now_ms,
            source_label: result.title.clone(),
        }
    }

    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp))
    }
}

/// Canonical form used for "same page" comparisons: normalized scheme/host, no fragment.
pub fn canonical_url(url: &str) -> String {
    if let Ok(mut u) = url::Url::parse(url.trim()) {
        u.set_fragment(None);
        return u.to_string();
    }
    url.trim().to_string()
}

pub fn same_page(a: &str, b: &str) -> bool {
    canonical_url(a) == canonical_url(b)
}

pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTab {
    pub tab: TabId,
    pub url: String,
}

/// Message channel from the coordinating context to page agents.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver a request through the agent's regular message channel.
    async fn send(&self, tab: TabId, req: &AgentRequest) -> Result<AgentResponse>;

    /// One-shot best-effort path that bypasses readiness bookkeeping.
    async fn deliver_direct(&self, tab: TabId, req: &AgentRequest) -> Result<AgentResponse>;
}

/// Page navigation as seen by the coordinating context.
#[async_trait::async_trait]
pub trait Browser: Send + Sync {
    /// Navigate `tab` (or a new page instance when `None`) to `url`.
    async fn open(&self, url: &str, tab: Option<TabId>) -> Result<TabId>;
}

/// Single-slot store for the hand-off written before a navigation.
pub trait HandoffStorage: Send + Sync {
    /// Overwrites any unconsumed record.
    fn put(&self, handoff: PendingHandoff) -> Result<()>;

    /// The only read path. Always deletes the stored record.
    fn take_if_matching(&self, current_url: &str) -> Result<Option<PendingHandoff>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_rejects_short_after_trim() {
        assert!(Target::parse("  ab  ").is_none());
        assert!(Target::parse("").is_none());
        let t = Target::parse("  abc ").unwrap();
        assert_eq!(t.as_str(), "abc");
        assert_eq!(t.char_len(), 3);
    }

    #[test]
    fn tier_orders_by_precision() {
        assert!(Tier::Exact < Tier::Keyword);
        assert!(Tier::Phrase < Tier::Shingle);
        assert_eq!(serde_json::to_value(Tier::Shingle).unwrap(), "shingle");
    }

    #[test]
    fn highlight_request_envelope_shape() {
        let req = AgentRequest::Highlight {
            positions: vec![HighlightPosition::term("brown fox")],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"action": "highlight", "positions": [{"term": "brown fox"}]})
        );
        assert_eq!(AgentRequest::from_json(&v).unwrap(), req);
    }

    #[test]
    fn reply_envelope_uses_camel_case_fields() {
        let r = AgentResponse::Highlight(HighlightReply::from_count(2));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["action"], "highlight");
        assert_eq!(v["matchesFound"], 2);
        assert_eq!(v["reason"], "success");
        assert_eq!(v["success"], true);
    }

    #[test]
    fn from_json_rejects_unknown_or_missing_action() {
        assert!(matches!(
            AgentRequest::from_json(&serde_json::json!({"positions": []})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            AgentRequest::from_json(&serde_json::json!({"action": "selfDestruct"})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            AgentRequest::from_json(&serde_json::json!({"action": "highlight", "positions": "x"})),
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            AgentRequest::from_json_str(r#"{"action":"isReady"}"#).unwrap(),
            AgentRequest::IsReady
        );
    }

    #[test]
    fn handoff_record_shape_is_camel_case() {
        let h = PendingHandoff {
            content: None,
            snippet: Some("s".to_string()),
            url: "https://example.com/a".to_string(),
            timestamp: 5,
            source_label: Some("Example".to_string()),
        };
        let v = serde_json::to_value(&h).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "snippet": "s",
                "url": "https://example.com/a",
                "timestamp": 5,
                "sourceLabel": "Example"
            })
        );
    }

    #[test]
    fn same_page_ignores_fragment_and_host_case() {
        assert!(same_page(
            "https://Example.com/docs#intro",
            "https://example.com/docs"
        ));
        assert!(!same_page("https://example.com/docs", "https://example.com/other"));
        assert!(same_page("not a url ", "not a url"));
    }
}
