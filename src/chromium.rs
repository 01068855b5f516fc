use crate::browser::{Browser, Tab};
use crate::page::{PageCommand, PagePool, PageStateProvider};
use crate::types::{AgentError, PageId, PageSummary, Snapshot};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

const PAGE_SCROLL_STEP: f64 = 500.0;
const ELEMENT_SCROLL_STEP: f64 = 200.0;
const SUMMARY_ELEMENTS: usize = 30;
const SUMMARY_TEXT_CHARS: usize = 100;

fn page_err(e: anyhow::Error) -> AgentError {
    AgentError::Page(e.to_string())
}

/// Chromium-backed page collection shared by every session of the process.
pub struct ChromiumPages {
    browser: Browser,
    tabs: RwLock<Vec<(PageId, Tab)>>,
}

impl ChromiumPages {
    /// Wraps a running browser and opens the default tab (page index 0).
    pub async fn new(browser: Browser) -> Result<Self, AgentError> {
        let pages = Self { browser, tabs: RwLock::new(Vec::new()) };
        pages.open_page().await?;
        Ok(pages)
    }

    async fn tab(&self, page: &PageId) -> Result<Tab, AgentError> {
        self.tabs
            .read()
            .await
            .iter()
            .find(|(id, _)| id == page)
            .map(|(_, tab)| tab.clone())
            .ok_or_else(|| AgentError::Page(format!("unknown page {page}")))
    }
}

#[async_trait]
impl PagePool for ChromiumPages {
    async fn open_page(&self) -> Result<PageId, AgentError> {
        let tab = self.browser.new_tab().await.map_err(page_err)?;
        let id = PageId::generate();
        let mut tabs = self.tabs.write().await;
        tabs.push((id.clone(), tab));
        info!(page = %id, page_index = tabs.len() - 1, "opened page");
        Ok(id)
    }

    async fn page_at(&self, index: usize) -> Option<PageId> {
        self.tabs.read().await.get(index).map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl PageStateProvider for ChromiumPages {
    async fn snapshot(&self, page: &PageId) -> Result<Snapshot, AgentError> {
        let tab = self.tab(page).await?;
        tab.wait_for_stable().await;
        let elements = tab.interactive_elements().await.map_err(page_err)?;
        let image_png = tab.screenshot_png().await.map_err(page_err)?;
        let url = tab.url().await.ok();
        debug!(page = %page, elements = elements.len(), "snapshot taken");
        Ok(Snapshot { url, image_png, elements })
    }

    async fn perform(&self, page: &PageId, command: &PageCommand) -> Result<(), AgentError> {
        let tab = self.tab(page).await?;
        let outcome = match command {
            PageCommand::Goto { url } => {
                let out = tab.goto(url).await;
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                out
            }
            PageCommand::Click { at } => tab.click(at.x, at.y).await,
            PageCommand::TypeText { at, text } => tab.type_text(at.x, at.y, text).await,
            PageCommand::ScrollPage { direction } => {
                let (dx, dy) = direction.delta(PAGE_SCROLL_STEP);
                tab.scroll_by(dx, dy).await
            }
            PageCommand::ScrollAt { at, direction } => {
                let (dx, dy) = direction.delta(ELEMENT_SCROLL_STEP);
                tab.wheel_at(at.x, at.y, dx, dy).await
            }
            PageCommand::Back => tab.back().await,
        };
        outcome.map_err(page_err)
    }

    async fn summaries(&self) -> Result<Vec<PageSummary>, AgentError> {
        let tabs: Vec<Tab> = self.tabs.read().await.iter().map(|(_, t)| t.clone()).collect();
        let mut out = Vec::with_capacity(tabs.len());
        for (page_index, tab) in tabs.iter().enumerate() {
            let url = tab.url().await.unwrap_or_default();
            let (title, elements_summary) = tab
                .summary(SUMMARY_ELEMENTS, SUMMARY_TEXT_CHARS)
                .await
                .unwrap_or_default();
            out.push(PageSummary {
                page_index,
                domain: PageSummary::domain_of(&url),
                url,
                title,
                elements_summary,
            });
        }
        Ok(out)
    }
}
