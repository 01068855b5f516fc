use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webcrew::server::{router, AppState};
use webcrew::{
    Browser, BrowserConfig, ChromiumPages, Coordinator, CoordinatorConfig, ExecutorConfig, GeminiClient, GeminiConfig,
    SessionStore,
};

#[derive(Parser, Debug)]
#[command(name = "webcrew", about = "Conversational browsing agent over a websocket")]
struct Args {
    /// Address the websocket server listens on.
    #[arg(long, env = "WEBCREW_LISTEN", default_value = "0.0.0.0:8000")]
    listen: String,

    /// Show the browser window.
    #[arg(long)]
    headful: bool,

    /// Attach to a running Chromium instead of launching one.
    #[arg(long, env = "CHROME_WS_URL")]
    chrome_ws: Option<String>,

    /// Actions a single browsing task may take before giving up.
    #[arg(long, default_value_t = 25)]
    max_iterations: usize,

    /// Pause before each snapshot, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let gateway = Arc::new(GeminiClient::new(GeminiConfig::default())?);

    let browser_cfg = BrowserConfig {
        headless: !args.headful,
        settle: Duration::from_millis(args.settle_ms),
        ..Default::default()
    };
    let browser = match args.chrome_ws.as_deref().map(str::trim).filter(|ws| !ws.is_empty()) {
        Some(ws) => Browser::connect(ws, browser_cfg).await?,
        None => Browser::launch(browser_cfg).await?,
    };
    let pages = Arc::new(ChromiumPages::new(browser).await?);

    let cfg = CoordinatorConfig {
        executor: ExecutorConfig { max_iterations: args.max_iterations, ..Default::default() },
        ..Default::default()
    };
    let state = AppState {
        coordinator: Arc::new(Coordinator::new(gateway, pages, cfg)),
        sessions: Arc::new(SessionStore::new()),
    };

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "webcrew listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
