//! In-process session host: page agents per tab, reachable through the same traits a
//! real browser integration would implement.

use crate::agent::{spawn_agent, AgentHandle, PageAgent, PageSnapshot};
use crate::config::PagemarkConfig;
use crate::coordinator::Coordinator;
use crate::orchestrator::DeliveryOrchestrator;
use crate::registry::TabRegistry;
use pagemark_core::{
    canonical_url, ActiveTab, AgentEvent, AgentRequest, AgentResponse, AgentTransport, Browser,
    Error, HandoffStorage, Result, TabId,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where page HTML comes from.
#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct MemoryPages {
    pages: HashMap<String, String>,
}

impl MemoryPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.insert(url, html);
        self
    }

    pub fn insert(&mut self, url: &str, html: impl Into<String>) {
        self.pages.insert(canonical_url(url), html.into());
    }
}

#[async_trait::async_trait]
impl PageSource for MemoryPages {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.pages
            .get(&canonical_url(url))
            .cloned()
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }
}

/// Mirror layout: `<root>/<host>/<path>`, with `index.html` for directory paths.
#[derive(Debug, Clone)]
pub struct DirPages {
    root: PathBuf,
}

impl DirPages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, url: &str) -> Result<PathBuf> {
        let u = url::Url::parse(url.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let host = u
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("no host in {url}")))?;
        let mut p = self.root.join(host);
        for seg in u.path().split('/').filter(|s| !s.is_empty() && *s != "..") {
            p.push(seg);
        }
        if u.path().ends_with('/') {
            p.push("index.html");
        }
        Ok(p)
    }
}

#[async_trait::async_trait]
impl PageSource for DirPages {
    async fn fetch(&self, url: &str) -> Result<String> {
        let path = self.path_for(url)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::PageLoad(format!("{}: {e}", path.display())))
    }
}

pub struct LocalSession {
    pages: Arc<dyn PageSource>,
    registry: Arc<TabRegistry>,
    handoff: Arc<dyn HandoffStorage>,
    config: PagemarkConfig,
    agents: Mutex<HashMap<TabId, AgentHandle>>,
    active: Mutex<Option<ActiveTab>>,
    next_tab: AtomicU32,
}

impl LocalSession {
    pub fn new(
        pages: Arc<dyn PageSource>,
        handoff: Arc<dyn HandoffStorage>,
        config: PagemarkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages,
            registry: Arc::new(TabRegistry::new()),
            handoff,
            config,
            agents: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            next_tab: AtomicU32::new(1),
        })
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<TabId, AgentHandle>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> Arc<TabRegistry> {
        self.registry.clone()
    }

    pub fn handoff(&self) -> Arc<dyn HandoffStorage> {
        self.handoff.clone()
    }

    pub fn config(&self) -> &PagemarkConfig {
        &self.config
    }

    /// Most recently opened tab.
    pub fn active_tab(&self) -> Option<ActiveTab> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn agent(&self, tab: TabId) -> Option<AgentHandle> {
        self.agents().get(&tab).cloned()
    }

    pub async fn snapshot(&self, tab: TabId) -> Result<PageSnapshot> {
        let handle = self
            .agent(tab)
            .ok_or_else(|| Error::NotFound(format!("no page in {tab}")))?;
        handle.snapshot().await
    }

    pub fn close(&self, tab: TabId) {
        self.agents().remove(&tab);
        self.registry.remove(tab);
    }

    pub fn orchestrator(self: &Arc<Self>) -> DeliveryOrchestrator<dyn AgentTransport> {
        let transport: Arc<dyn AgentTransport> = self.clone();
        DeliveryOrchestrator::new(transport, self.registry(), self.config.delivery.clone())
    }

    pub fn coordinator(self: &Arc<Self>) -> Coordinator {
        let browser: Arc<dyn Browser> = self.clone();
        Coordinator::new(browser, self.handoff(), self.orchestrator())
    }
}

#[async_trait::async_trait]
impl Browser for LocalSession {
    async fn open(&self, url: &str, tab: Option<TabId>) -> Result<TabId> {
        let tab = tab.unwrap_or_else(|| TabId(self.next_tab.fetch_add(1, Ordering::SeqCst)));
        // The previous page of this tab (and its agent) goes away with the navigation.
        self.agents().remove(&tab);
        self.registry.begin_load(tab, url);
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveTab {
            tab,
            url: url.to_string(),
        });

        let html = match self.pages.fetch(url).await {
            Ok(html) => html,
            Err(e) => {
                self.registry.remove(tab);
                return Err(Error::PageLoad(e.to_string()));
            }
        };
        let agent = PageAgent::new(&html, url, &self.config.highlight);
        let (handle, ready) = spawn_agent(
            agent,
            Some(self.handoff.clone()),
            self.config.highlight.emphasis,
        );
        self.agents().insert(tab, handle);
        self.registry.mark_complete(tab);
        tracing::debug!(%tab, url, "page loaded");

        let registry = self.registry.clone();
        let loaded_url = url.to_string();
        tokio::spawn(async move {
            if let Ok(AgentEvent::ContentScriptReady { url }) = ready.await {
                // Ignore announcements from a page the tab already navigated away from.
                if registry.get(tab).map(|s| s.url == loaded_url).unwrap_or(false) {
                    tracing::debug!(%tab, url = url.as_str(), "agent ready");
                    registry.mark_agent_ready(tab);
                }
            }
        });
        Ok(tab)
    }
}

#[async_trait::async_trait]
impl AgentTransport for LocalSession {
    async fn send(&self, tab: TabId, req: &AgentRequest) -> Result<AgentResponse> {
        let ready = self.registry.get(tab).map(|s| s.agent_ready).unwrap_or(false);
        if !ready {
            return Err(Error::Delivery(format!("no agent listening in {tab}")));
        }
        let handle = self
            .agent(tab)
            .ok_or_else(|| Error::Delivery(format!("no agent listening in {tab}")))?;
        handle.request(req.clone()).await
    }

    async fn deliver_direct(&self, tab: TabId, req: &AgentRequest) -> Result<AgentResponse> {
        let handle = self
            .agent(tab)
            .ok_or_else(|| Error::Delivery(format!("no page in {tab}")))?;
        handle.request(req.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::MemoryHandoffStore;
    use pagemark_core::HighlightPosition;
    use std::time::Duration;

    const URL: &str = "https://example.com/rivers";
    const PAGE: &str = "<html><body><p>The quick brown fox jumps over the lazy dog</p></body></html>";

    fn session() -> Arc<LocalSession> {
        let pages = MemoryPages::new().with_page(URL, PAGE);
        LocalSession::new(
            Arc::new(pages),
            Arc::new(MemoryHandoffStore::new(Duration::from_secs(300))),
            PagemarkConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn open_spawns_agent_and_marks_ready() {
        let s = session();
        let tab = s.open(URL, None).await.unwrap();
        assert!(s.registry().wait_for_load(tab, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(s.registry().get(tab).unwrap().agent_ready);
        assert_eq!(s.active_tab().unwrap().tab, tab);

        let resp = s
            .send(
                tab,
                &AgentRequest::Highlight {
                    positions: vec![HighlightPosition::term("lazy dog")],
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.as_highlight().matches_found, 1);
        assert!(s.snapshot(tab).await.unwrap().html.contains("<mark"));
    }

    #[tokio::test]
    async fn missing_page_is_a_load_error() {
        let s = session();
        let err = s.open("https://example.com/missing", None).await.unwrap_err();
        assert!(matches!(err, Error::PageLoad(_)));
    }

    #[tokio::test]
    async fn send_to_unknown_tab_fails_as_delivery() {
        let s = session();
        let err = s.send(TabId(42), &AgentRequest::IsReady).await.unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
        let err = s
            .deliver_direct(TabId(42), &AgentRequest::IsReady)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }

    #[test]
    fn dir_pages_map_urls_to_files() {
        let d = DirPages::new("/srv/mirror");
        assert_eq!(
            d.path_for("https://example.com/a/b.html").unwrap(),
            PathBuf::from("/srv/mirror/example.com/a/b.html")
        );
        assert_eq!(
            d.path_for("https://example.com/").unwrap(),
            PathBuf::from("/srv/mirror/example.com/index.html")
        );
        assert!(d.path_for("not a url").is_err());
    }
}
