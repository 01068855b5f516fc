use crate::types::{Element, ElementSummary};
use anyhow::{anyhow, Result};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const MARK_PAGE_JS: &str = include_str!("js/mark_page.js");

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    /// Pause before each snapshot so late content can render.
    pub settle: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1280, 800),
            settle: Duration::from_millis(3000),
        }
    }
}

pub struct Browser {
    inner: OxideBrowser,
    cfg: BrowserConfig,
    _handler: JoinHandle<()>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per run avoids the ProcessSingleton lock when Chromium restarts quickly.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webcrew-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (inner, mut handler) = OxideBrowser::launch(bcfg).await?;
        let handler = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Ok(Self { inner, cfg, _handler: handler })
    }

    /// Attaches to an already running Chromium through its DevTools websocket.
    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let (inner, mut handler) = OxideBrowser::connect(ws_url).await?;
        let handler = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Ok(Self { inner, cfg, _handler: handler })
    }

    pub async fn new_tab(&self) -> Result<Tab> {
        let page = self.inner.new_page("about:blank").await?;
        if let Some(ua) = &self.cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let tab = Tab { page, cfg: self.cfg.clone() };
        // a zero-sized viewport breaks screenshots
        tab.force_viewport().await?;
        Ok(tab)
    }
}

#[derive(Deserialize)]
struct MarkedPage {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Deserialize)]
struct SummaryPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    elements: Vec<ElementSummary>,
}

/// The element window is cut before empty texts are dropped, so a page full
/// of icon buttons can summarize to fewer than `limit` entries.
fn summary_script(limit: usize, max_chars: usize) -> String {
    format!(
        r#"
        (function() {{
          const out = [];
          const candidates = Array.from(document.querySelectorAll("button, a, input, h1, h2, h3")).slice(0, {limit});
          for (const el of candidates) {{
            const text = ((el.innerText || el.placeholder || "") + "").trim();
            if (text) out.push({{tag: el.tagName.toLowerCase(), text: Array.from(text).slice(0, {max_chars}).join("")}});
          }}
          return JSON.stringify({{title: document.title, elements: out}});
        }})()
        "#
    )
}

/// One Chromium tab.
#[derive(Clone)]
pub struct Tab {
    page: Page,
    cfg: BrowserConfig,
}

impl Tab {
    async fn force_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.cfg.viewport.0 as i64)
            .height(self.cfg.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    async fn eval_json<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        let raw: String = self.page.evaluate(script).await?.into_value()?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.move_mouse(Point { x, y }).await?.execute(pressed).await?;
        self.page.execute(released).await?;
        sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn press_key(&self, key: &str, code: &str, key_code: i64, text: Option<&str>) -> Result<()> {
        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key)
            .code(code)
            .windows_virtual_key_code(key_code);
        if let Some(text) = text {
            down = down.text(text);
        }
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .code(code)
            .windows_virtual_key_code(key_code);
        self.page.execute(down.build().map_err(|e| anyhow!(e))?).await?;
        self.page.execute(up.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    /// Focuses the field under (x, y), replaces its content with `text` and submits with Enter.
    pub async fn type_text(&self, x: f64, y: f64, text: &str) -> Result<()> {
        self.click(x, y).await?;
        let clear = r#"
            (function() {
              const el = document.activeElement;
              if (!el) return false;
              if ('value' in el) {
                el.value = '';
                el.dispatchEvent(new Event('input', {bubbles: true}));
              } else if (el.isContentEditable) {
                el.textContent = '';
              }
              return true;
            })()
        "#;
        self.page.evaluate(clear).await?;
        self.page.execute(InsertTextParams::new(text)).await?;
        self.press_key("Enter", "Enter", 13, Some("\r")).await?;
        sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    pub async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.page.evaluate(format!("window.scrollBy({dx}, {dy});")).await?;
        Ok(())
    }

    /// Mouse-wheel at a point, which scrolls whatever container sits under it.
    pub async fn wheel_at(&self, x: f64, y: f64, dx: f64, dy: f64) -> Result<()> {
        let wheel = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x)
            .y(y)
            .delta_x(dx)
            .delta_y(dy)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.move_mouse(Point { x, y }).await?.execute(wheel).await?;
        Ok(())
    }

    pub async fn back(&self) -> Result<()> {
        self.page.evaluate("window.history.back()").await?;
        sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(false)
                        .build(),
                )
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force viewport and retry once
                    self.force_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }

    pub async fn interactive_elements(&self) -> Result<Vec<Element>> {
        let marked: MarkedPage = self.eval_json(MARK_PAGE_JS.to_string()).await?;
        Ok(marked.elements)
    }

    /// Title plus the non-empty texts among the first `limit` headings/controls, each cut to `max_chars`.
    pub async fn summary(&self, limit: usize, max_chars: usize) -> Result<(String, Vec<ElementSummary>)> {
        let payload: SummaryPayload = self.eval_json(summary_script(limit, max_chars)).await?;
        Ok((payload.title, payload.elements))
    }

    pub async fn wait_for_stable(&self) {
        sleep(self.cfg.settle).await;
    }
}
