//! Render-mode driver: loads the start page in headless Chromium, saves
//! every successful response the browser receives, then saves the rendered
//! DOM with its asset references pointed at the captured files.
//!
//! Capture is a producer/consumer pair joined on one task. The producer
//! turns network events into capture requests on a bounded channel, so a
//! slow disk stalls event intake instead of buffering bodies without limit.
//! The consumer pulls each body out of the browser and writes it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, GetResponseBodyParams, RequestId, ResourceType, SetCookiesParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::context::RunContext;
use crate::css::{is_stylesheet_path, localize_stylesheet};
use crate::error::FetchError;
use crate::rewriter::{AssetResolver, DocumentRewriter, LinkHandling};
use crate::state::{AttemptResult, Localized};
use crate::url_filter::is_fetchable;

/// A finished response whose body should be saved.
#[derive(Debug, Clone)]
struct CapturedResponse {
    request_id: RequestId,
    url: Url,
}

/// Network state published by the producer for the quiescence wait.
#[derive(Debug, Clone, Copy)]
struct Activity {
    last_event: Instant,
    in_flight: usize,
}

impl Activity {
    fn now() -> Self {
        Self {
            last_event: Instant::now(),
            in_flight: 0,
        }
    }
}

pub struct RenderDriver<'a> {
    ctx: &'a RunContext,
}

impl<'a> RenderDriver<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Launch failure is returned as an error. Anything that goes wrong
    /// after launch is logged, recorded against the start page, and the
    /// browser is shut down either way.
    pub async fn run(&self) -> Result<()> {
        let start_url = self.ctx.config.start_url.clone();
        info!(url = %start_url, "starting render mirror");

        let (mut browser, handler) = self.launch().await?;

        let result = self.capture(&browser).await;

        if let Err(err) = browser.close().await {
            warn!(error = %err, "failed to close browser");
        }
        if let Err(err) = browser.wait().await {
            debug!(error = %err, "browser process did not exit cleanly");
        }
        handler.abort();

        match result {
            Ok(path) => {
                info!(url = %start_url, path = %path.display(), "saved rendered page");
                self.ctx.record_page_saved(start_url.as_str());
            }
            Err(err) => {
                warn!(url = %start_url, error = %format!("{:#}", err), "render failed");
                self.ctx.record_page_failed(start_url.as_str(), format!("{:#}", err));
            }
        }
        Ok(())
    }

    async fn launch(&self) -> Result<(Browser, JoinHandle<()>)> {
        let options = &self.ctx.config.render;
        let (width, height) = options.viewport;

        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                ..Viewport::default()
            })
            .request_timeout(options.navigation_timeout)
            .no_sandbox();
        if let Some(chrome) = &options.chrome_executable {
            builder = builder.chrome_executable(chrome);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
        });

        debug!(width, height, "headless browser launched");
        Ok((browser, handler))
    }

    /// Drives one page from blank to saved. Returns where the page was
    /// written.
    async fn capture(&self, browser: &Browser) -> Result<PathBuf> {
        let config = &self.ctx.config;
        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        page.execute(EnableParams::default())
            .await
            .context("Failed to enable network events")?;
        page.execute(SetUserAgentOverrideParams::new(config.user_agent.clone()))
            .await
            .context("Failed to set user agent")?;
        self.install_cookies(&page).await?;

        let requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let responses = page.event_listener::<EventResponseReceived>().await?;
        let finished = page.event_listener::<EventLoadingFinished>().await?;
        let failed = page.event_listener::<EventLoadingFailed>().await?;

        let (captures_tx, captures_rx) = mpsc::channel(config.render.capture_buffer.max(1));
        let (activity_tx, activity_rx) = watch::channel(Activity::now());

        // Dropping the producer closes the channel; the consumer then drains
        // what is queued and returns.
        let settle = async {
            tokio::select! {
                result = self.settle(&page, activity_rx) => result,
                _ = produce(requests, responses, finished, failed, captures_tx, activity_tx) => {
                    Err(anyhow!("browser event stream closed during navigation"))
                }
            }
        };
        let (settled, stylesheets) = tokio::join!(settle, self.consume(&page, captures_rx));
        let base_url = settled?;

        let html = page.content().await.context("Failed to read rendered DOM")?;

        if config.rewrite_css {
            for (url, path) in stylesheets {
                localize_stylesheet(AssetResolver::Recorded(self.ctx), url, path).await;
            }
        }

        let local_path = self.ctx.mapper.local_path_for(&config.start_url);
        let rewriter = DocumentRewriter::new(AssetResolver::Recorded(self.ctx), LinkHandling::Ignore);
        let result = rewriter
            .rewrite_at(&html, &base_url, local_path.clone())
            .await
            .context("Failed to rewrite rendered page")?;

        self.ctx
            .files
            .write_atomic(&local_path, result.markup.as_bytes())
            .await
            .with_context(|| format!("Failed to save {:?}", local_path))?;

        if let Err(err) = page.close().await {
            debug!(error = %err, "failed to close page");
        }
        Ok(local_path)
    }

    async fn install_cookies(&self, page: &Page) -> Result<()> {
        let config = &self.ctx.config;
        if config.cookies.is_empty() {
            return Ok(());
        }
        let domain = config.start_url.host_str().unwrap_or_default();

        let cookies = config
            .cookies
            .iter()
            .map(|(name, value)| {
                CookieParam::builder()
                    .name(name.as_str())
                    .value(value.as_str())
                    .domain(domain)
                    .path("/")
                    .build()
                    .map_err(|e| anyhow!("Invalid cookie {}: {}", name, e))
            })
            .collect::<Result<Vec<_>>>()?;

        page.execute(SetCookiesParams::new(cookies))
            .await
            .context("Failed to install cookies")?;
        debug!(count = config.cookies.len(), domain, "cookies installed");
        Ok(())
    }

    /// Navigates, then waits for the network to go quiet and for the grace
    /// period. Returns the URL the page ended up at.
    async fn settle(&self, page: &Page, activity: watch::Receiver<Activity>) -> Result<Url> {
        let options = &self.ctx.config.render;
        let start_url = &self.ctx.config.start_url;

        match tokio::time::timeout(options.navigation_timeout, page.goto(start_url.as_str())).await
        {
            Ok(Ok(_)) => debug!(url = %start_url, "navigation complete"),
            Ok(Err(err)) => return Err(err).context("Navigation failed"),
            Err(_) => warn!(
                url = %start_url,
                timeout_secs = options.navigation_timeout.as_secs(),
                "navigation timed out, capturing what has loaded"
            ),
        }

        if !wait_for_quiescence(&activity, options.idle_window, options.quiescence_timeout).await {
            warn!(
                timeout_secs = options.quiescence_timeout.as_secs(),
                "network did not go quiet, continuing"
            );
        }
        tokio::time::sleep(options.grace_period).await;

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .and_then(|url| Url::parse(&url).ok())
            .filter(|url| !url.cannot_be_a_base())
            .unwrap_or_else(|| start_url.clone());
        Ok(final_url)
    }

    /// Saves queued responses until the channel closes. Returns the
    /// stylesheets written by this run.
    async fn consume(
        &self,
        page: &Page,
        mut captures: mpsc::Receiver<CapturedResponse>,
    ) -> Vec<(Url, PathBuf)> {
        let mut stylesheets = Vec::new();

        while let Some(capture) = captures.recv().await {
            let (result, first) = self
                .ctx
                .downloaded
                .attempt_once(capture.url.as_str(), || self.store(page, &capture))
                .await;
            match result {
                Ok(Localized { path, fetched }) => {
                    if first && fetched && is_stylesheet_path(&path) {
                        stylesheets.push((capture.url, path));
                    }
                }
                Err(err) => debug!(url = %capture.url, error = %err, "response not captured"),
            }
        }

        stylesheets
    }

    async fn store(&self, page: &Page, capture: &CapturedResponse) -> AttemptResult {
        let url = capture.url.as_str();
        let path = self.ctx.mapper.local_path_for(&capture.url);
        if self.ctx.files.file_exists(&path).await {
            debug!(url, path = %path.display(), "already on disk");
            return Ok(Localized {
                path,
                fetched: false,
            });
        }

        let response = page
            .execute(GetResponseBodyParams::new(capture.request_id.clone()))
            .await
            .map_err(|err| FetchError::Network {
                url: url.to_string(),
                message: format!("response body unavailable: {}", err),
            })?;

        let bytes = decode_body(&response.result.body, response.result.base64_encoded).map_err(
            |err| FetchError::Network {
                url: url.to_string(),
                message: format!("undecodable response body: {}", err),
            },
        )?;

        self.ctx
            .files
            .write_atomic(&path, &bytes)
            .await
            .map_err(|err| FetchError::io(&path, &err))?;

        debug!(url, bytes = bytes.len(), path = %path.display(), "captured response");
        Ok(Localized {
            path,
            fetched: true,
        })
    }
}

/// Turns browser network events into capture requests and activity
/// updates. Runs until the event streams end or the consumer goes away.
async fn produce(
    mut requests: EventStream<EventRequestWillBeSent>,
    mut responses: EventStream<EventResponseReceived>,
    mut finished: EventStream<EventLoadingFinished>,
    mut failed: EventStream<EventLoadingFailed>,
    captures: mpsc::Sender<CapturedResponse>,
    activity: watch::Sender<Activity>,
) {
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut awaiting_body: HashMap<String, CapturedResponse> = HashMap::new();

    let publish = |in_flight: &HashSet<String>| {
        activity.send_replace(Activity {
            last_event: Instant::now(),
            in_flight: in_flight.len(),
        });
    };

    loop {
        tokio::select! {
            Some(event) = requests.next() => {
                in_flight.insert(event.request_id.inner().clone());
                publish(&in_flight);
            }
            Some(event) = responses.next() => {
                publish(&in_flight);
                let response = &event.response;
                let is_document = event.r#type == ResourceType::Document;
                if let Some(url) = capture_target(&response.url, response.status, is_document) {
                    awaiting_body.insert(
                        event.request_id.inner().clone(),
                        CapturedResponse {
                            request_id: event.request_id.clone(),
                            url,
                        },
                    );
                }
            }
            Some(event) = finished.next() => {
                let id = event.request_id.inner();
                in_flight.remove(id);
                publish(&in_flight);
                if let Some(capture) = awaiting_body.remove(id) {
                    if captures.send(capture).await.is_err() {
                        break;
                    }
                }
            }
            Some(event) = failed.next() => {
                let id = event.request_id.inner();
                in_flight.remove(id);
                awaiting_body.remove(id);
                publish(&in_flight);
            }
            else => break,
        }
    }
}

/// Which responses get saved: successful, fetchable, and not a document
/// (the rendered DOM replaces the start page's raw HTML).
fn capture_target(url: &str, status: i64, is_document: bool) -> Option<Url> {
    if status != 200 || is_document || !is_fetchable(url) {
        return None;
    }
    let mut url = Url::parse(url).ok()?;
    url.set_fragment(None);
    Some(url)
}

fn decode_body(body: &str, base64_encoded: bool) -> Result<Vec<u8>, base64::DecodeError> {
    if base64_encoded {
        STANDARD.decode(body)
    } else {
        Ok(body.as_bytes().to_vec())
    }
}

/// Waits until nothing is in flight and no event has arrived for `idle`.
/// Gives up after `bound`; returns whether quiescence was reached.
async fn wait_for_quiescence(
    activity: &watch::Receiver<Activity>,
    idle: Duration,
    bound: Duration,
) -> bool {
    let deadline = Instant::now() + bound;
    loop {
        let now = Instant::now();
        let snapshot = *activity.borrow();
        let quiet_at = snapshot.last_event + idle;

        if snapshot.in_flight == 0 && now >= quiet_at {
            return true;
        }
        if now >= deadline {
            return false;
        }

        let wake = if snapshot.in_flight == 0 {
            quiet_at
        } else {
            now + idle
        };
        tokio::time::sleep_until(wake.min(deadline)).await;
    }
}
