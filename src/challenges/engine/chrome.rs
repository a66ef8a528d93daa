//! Chrome DevTools Protocol engine.
//!
//! Each session is its own Chrome process with a throwaway profile directory,
//! started with `--remote-debugging-port=0`. The DevTools endpoint is read from
//! the process' stderr, a page target is opened through `/json/new` and the
//! page is driven over a websocket. Dropping a session kills the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{
    EngineCookie, EngineError, EngineResult, PageProbe, RenderSession, RenderingEngine,
    probe_expression,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";

/// Hides the common automation tells before any page script runs.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters);
}
"#;

#[derive(Debug, Clone)]
pub struct ChromeConfig {
    pub executable: PathBuf,
    pub headless: bool,
    pub window_size: (u32, u32),
    pub resource_limit_mb: u32,
    pub launch_timeout: Duration,
    pub command_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("google-chrome"),
            headless: true,
            window_size: (1920, 1080),
            resource_limit_mb: 512,
            launch_timeout: Duration::from_secs(20),
            command_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
        }
    }
}

impl ChromeConfig {
    /// Command-line flags with automation markers suppressed.
    pub fn args(&self, user_data_dir: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "--remote-debugging-port=0".to_string(),
            format!("--user-data-dir={}", user_data_dir.display()),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-features=VizDisplayCompositor".to_string(),
            "--disable-software-rasterizer".to_string(),
            "--disable-plugins".to_string(),
            "--memory-pressure-off".to_string(),
            format!("--js-flags=--max-old-space-size={}", self.resource_limit_mb),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            format!("--window-size={},{}", self.window_size.0, self.window_size.1),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }
}

/// Pull the browser websocket endpoint out of a Chrome stderr line.
pub fn parse_devtools_line(line: &str) -> Option<Url> {
    let raw = line.trim().strip_prefix(DEVTOOLS_PREFIX)?;
    Url::parse(raw.trim()).ok()
}

async fn read_endpoint(lines: &mut Lines<BufReader<ChildStderr>>) -> EngineResult<Url> {
    while let Some(line) = lines.next_line().await? {
        if let Some(endpoint) = parse_devtools_line(&line) {
            return Ok(endpoint);
        }
        log::trace!("chrome: {line}");
    }
    Err(EngineError::Launch("chrome exited before exposing devtools".into()))
}

/// HTTP base (`http://host:port`) for a DevTools websocket endpoint.
pub fn http_base(ws_endpoint: &Url) -> Option<String> {
    let host = ws_endpoint.host_str()?;
    let port = ws_endpoint.port_or_known_default()?;
    Some(format!("http://{host}:{port}"))
}

/// Launches one Chrome process per session.
#[derive(Debug, Clone)]
pub struct ChromeEngine {
    config: ChromeConfig,
    http: reqwest::Client,
}

impl ChromeEngine {
    pub fn new(config: ChromeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn wait_for_endpoint(&self, child: &mut Child) -> EngineResult<Url> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Launch("chrome stderr not captured".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let endpoint = tokio::time::timeout(self.config.launch_timeout, read_endpoint(&mut lines))
            .await
            .map_err(|_| EngineError::Launch("timed out waiting for devtools endpoint".into()))??;

        // Keep draining so a full pipe never stalls the browser.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log::trace!("chrome: {line}");
            }
        });

        Ok(endpoint)
    }

    async fn start(&self, child: &mut Child) -> EngineResult<CdpConnection> {
        let endpoint = self.wait_for_endpoint(child).await?;
        let page_ws = self.open_page(&endpoint).await?;
        let cdp = CdpConnection::connect(&page_ws, self.config.command_timeout).await?;

        cdp.call("Page.enable", json!({})).await?;
        cdp.call("Network.enable", json!({})).await?;
        cdp.call("Runtime.enable", json!({})).await?;
        cdp.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": STEALTH_SCRIPT }),
        )
        .await?;

        log::info!("chrome session ready at {endpoint}");
        Ok(cdp)
    }

    async fn open_page(&self, endpoint: &Url) -> EngineResult<String> {
        let base = http_base(endpoint)
            .ok_or_else(|| EngineError::Launch(format!("unusable devtools endpoint {endpoint}")))?;
        let target: Value = self
            .http
            .put(format!("{base}/json/new?about:blank"))
            .send()
            .await
            .map_err(|err| EngineError::Launch(format!("/json/new failed: {err}")))?
            .json()
            .await
            .map_err(|err| EngineError::Launch(format!("bad /json/new response: {err}")))?;

        target
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Launch("no webSocketDebuggerUrl in /json/new response".into())
            })
    }
}

impl Default for ChromeEngine {
    fn default() -> Self {
        Self::new(ChromeConfig::default())
    }
}

#[async_trait]
impl RenderingEngine for ChromeEngine {
    async fn launch(&self) -> EngineResult<Box<dyn RenderSession>> {
        let user_data_dir =
            std::env::temp_dir().join(format!("quietfetch-chrome-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&user_data_dir).await?;

        let mut child = Command::new(&self.config.executable)
            .args(self.config.args(&user_data_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::Launch(format!("{}: {err}", self.config.executable.display()))
            })?;

        let cdp = match self.start(&mut child).await {
            Ok(cdp) => cdp,
            Err(err) => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_dir_all(&user_data_dir).await;
                return Err(err);
            }
        };

        Ok(Box::new(ChromeSession {
            child,
            cdp,
            user_data_dir,
            closed: false,
        }))
    }
}

/// Command/response channel over one page websocket.
struct CdpConnection {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl CdpConnection {
    async fn connect(ws_url: &str, timeout: Duration) -> EngineResult<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|err| EngineError::Protocol(format!("websocket connect failed: {err}")))?;
        let (writer, reader) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(Self::read_loop(reader, Arc::clone(&pending)));

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            reader,
            timeout,
        })
    }

    async fn read_loop(mut reader: SplitStream<WsStream>, pending: PendingMap) {
        while let Some(message) = reader.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("devtools websocket error: {err}");
                    break;
                }
            };

            let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                log::debug!("unparseable devtools message: {text}");
                continue;
            };
            // Events carry no id and are not needed here.
            let Some(id) = payload.get("id").and_then(Value::as_u64) else {
                continue;
            };

            let sender = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(sender) = sender {
                let outcome = match payload.get("error") {
                    Some(error) => Err(error.to_string()),
                    None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = sender.send(outcome);
            }
        }

        // Wake every caller still waiting; their senders drop here.
        pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    async fn call(&self, method: &str, params: Value) -> EngineResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        self.writer
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|err| EngineError::Protocol(format!("{method}: {err}")))?;

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(EngineError::Protocol(format!("{method}: {error}"))),
            Ok(Err(_)) => Err(EngineError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(EngineError::Protocol(format!(
                    "{method}: no response within {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn evaluate(&self, expression: &str) -> EngineResult<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(EngineError::Protocol(format!("script raised: {details}")));
        }
        Ok(result
            .get("result")
            .and_then(|inner| inner.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct ChromeSession {
    child: Child,
    cdp: CdpConnection,
    user_data_dir: PathBuf,
    closed: bool,
}

fn storage_map(value: Value) -> HashMap<String, String> {
    match value {
        Value::Object(entries) => entries
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()> {
        self.cdp
            .call("Network.setUserAgentOverride", json!({ "userAgent": user_agent }))
            .await
            .map(drop)
    }

    async fn set_extra_headers(&mut self, headers: &[(String, String)]) -> EngineResult<()> {
        let map: serde_json::Map<String, Value> = headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        self.cdp
            .call("Network.setExtraHTTPHeaders", json!({ "headers": map }))
            .await
            .map(drop)
    }

    async fn navigate(&mut self, url: &Url) -> EngineResult<()> {
        let result = self.cdp.call("Page.navigate", json!({ "url": url.as_str() })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(EngineError::Protocol(format!("navigation failed: {error}")));
        }
        Ok(())
    }

    async fn probe(&mut self) -> EngineResult<PageProbe> {
        let value = self.cdp.evaluate(&probe_expression()).await?;
        serde_json::from_value(value)
            .map_err(|err| EngineError::Protocol(format!("bad probe result: {err}")))
    }

    async fn cookies(&mut self, url: &Url) -> EngineResult<Vec<EngineCookie>> {
        let result = self
            .cdp
            .call("Network.getCookies", json!({ "urls": [url.as_str()] }))
            .await?;
        let cookies = result.get("cookies").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(cookies)
            .map_err(|err| EngineError::Protocol(format!("bad cookie list: {err}")))
    }

    async fn user_agent(&mut self) -> EngineResult<String> {
        let value = self.cdp.evaluate("navigator.userAgent").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn storage(&mut self) -> EngineResult<(HashMap<String, String>, HashMap<String, String>)> {
        let local = self
            .cdp
            .evaluate("Object.fromEntries(Object.entries(window.localStorage))")
            .await?;
        let session = self
            .cdp
            .evaluate("Object.fromEntries(Object.entries(window.sessionStorage))")
            .await?;
        Ok((storage_map(local), storage_map(session)))
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.cdp.call("Browser.close", json!({})).await {
            log::debug!("Browser.close failed, killing process: {err}");
        }
        let _ = self.child.kill().await;
        if let Err(err) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            log::debug!("could not remove {}: {err}", self.user_data_dir.display());
        }
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.start_kill();
            let _ = std::fs::remove_dir_all(&self.user_data_dir);
        }
    }
}
