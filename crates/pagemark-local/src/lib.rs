pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dom;
pub mod handoff;
pub mod highlight;
pub mod locator;
pub mod orchestrator;
pub mod registry;
pub mod results;
pub mod scanner;
pub mod session;
pub mod terms;
pub mod textprep;

pub use agent::{spawn_agent, AgentHandle, PageAgent, PageSnapshot};
pub use config::PagemarkConfig;
pub use coordinator::{plan_targets, Coordinator, OpenOutcome, OpenPath, OpenStatus};
pub use dom::{Document, NodeId};
pub use handoff::{FsHandoffStore, MemoryHandoffStore};
pub use highlight::{ApplyOutcome, Highlighter};
pub use locator::{locate, Candidate};
pub use orchestrator::{DeliveryOrchestrator, DeliveryReport, DeliveryState};
pub use registry::TabRegistry;
pub use scanner::{scan, TextUnit};
pub use session::{DirPages, LocalSession, MemoryPages, PageSource};
pub use terms::extract_terms;

use pagemark_core::HandoffStorage;
use std::sync::Arc;

/// Hand-off store for `config`: file-backed when a directory is configured.
pub fn handoff_store(config: &config::HandoffConfig) -> Arc<dyn HandoffStorage> {
    match &config.dir {
        Some(dir) => Arc::new(FsHandoffStore::new(dir, config.max_age)),
        None => Arc::new(MemoryHandoffStore::new(config.max_age)),
    }
}
