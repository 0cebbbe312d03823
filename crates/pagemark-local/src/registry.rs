//! Per-tab load and agent-readiness tracking for the coordinating context.

use pagemark_core::TabId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loading,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabState {
    pub url: String,
    pub status: LoadStatus,
    /// Set when the page agent announced itself.
    pub agent_ready: bool,
}

/// Tabs are updated by the host; waiters are woken through a change counter.
#[derive(Debug)]
pub struct TabRegistry {
    tabs: Mutex<HashMap<TabId, TabState>>,
    changed: watch::Sender<u64>,
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TabRegistry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0u64);
        Self {
            tabs: Mutex::new(HashMap::new()),
            changed,
        }
    }

    fn tabs(&self) -> MutexGuard<'_, HashMap<TabId, TabState>> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// A navigation started; the previous agent of this tab is gone.
    pub fn begin_load(&self, tab: TabId, url: &str) {
        self.tabs().insert(
            tab,
            TabState {
                url: url.to_string(),
                status: LoadStatus::Loading,
                agent_ready: false,
            },
        );
        self.notify();
    }

    pub fn mark_complete(&self, tab: TabId) {
        if let Some(t) = self.tabs().get_mut(&tab) {
            t.status = LoadStatus::Complete;
        }
        self.notify();
    }

    pub fn mark_agent_ready(&self, tab: TabId) {
        if let Some(t) = self.tabs().get_mut(&tab) {
            t.agent_ready = true;
        }
        self.notify();
    }

    pub fn remove(&self, tab: TabId) {
        self.tabs().remove(&tab);
        self.notify();
    }

    pub fn get(&self, tab: TabId) -> Option<TabState> {
        self.tabs().get(&tab).cloned()
    }

    pub fn is_loaded(&self, tab: TabId) -> bool {
        self.get(tab)
            .map(|t| t.status == LoadStatus::Complete)
            .unwrap_or(false)
    }

    /// Wait until `tab` finished loading. Returns `false` on timeout.
    pub async fn wait_for_load(&self, tab: TabId, timeout: Duration) -> bool {
        let mut rx = self.changed.subscribe();
        let wait = async {
            loop {
                if self.is_loaded(tab) {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender lives in `self`; unreachable while borrowed.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
