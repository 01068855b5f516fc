use crate::types::{AgentError, Direction, PageId, PageSummary, Point, Snapshot};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Low-level page action with element references already resolved to coordinates.
#[derive(Clone, Debug, PartialEq)]
pub enum PageCommand {
    Goto { url: String },
    Click { at: Point },
    /// Focus the field at `at`, clear it, type `text` and press Enter.
    TypeText { at: Point, text: String },
    ScrollPage { direction: Direction },
    ScrollAt { at: Point, direction: Direction },
    Back,
}

#[async_trait]
pub trait PageStateProvider: Send + Sync {
    async fn snapshot(&self, page: &PageId) -> Result<Snapshot, AgentError>;
    async fn perform(&self, page: &PageId, command: &PageCommand) -> Result<(), AgentError>;
    /// One summary per open page, in page-index order.
    async fn summaries(&self) -> Result<Vec<PageSummary>, AgentError>;
}

/// The browsing session's page collection.
#[async_trait]
pub trait PagePool: Send + Sync {
    async fn open_page(&self) -> Result<PageId, AgentError>;
    async fn page_at(&self, index: usize) -> Option<PageId>;
}

/// Pages currently handed to an executor. A page is leased to at most one task at a time.
#[derive(Default)]
pub struct PageLeases {
    leased: Mutex<HashSet<PageId>>,
}

impl PageLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the page is already leased.
    pub fn try_acquire(&self, page: &PageId) -> bool {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        leased.insert(page.clone())
    }

    pub fn release(&self, page: &PageId) {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        leased.remove(page);
    }

    pub fn is_leased(&self, page: &PageId) -> bool {
        let leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        leased.contains(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_page_is_leased_once() {
        let leases = PageLeases::new();
        let page = PageId("p1".into());
        assert!(leases.try_acquire(&page));
        assert!(!leases.try_acquire(&page));
        assert!(leases.is_leased(&page));
        leases.release(&page);
        assert!(!leases.is_leased(&page));
        assert!(leases.try_acquire(&page));
    }
}
