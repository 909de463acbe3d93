//! chromiumoxide による NYCServ セッション実装

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::captcha::Challenge;
use crate::config::AcquisitionConfig;
use crate::error::PipelineError;
use crate::proxy::ProxyEndpoint;
use crate::traits::{LookupSession, SessionLauncher};

use super::detail::DetailCells;

const WIDGET_SELECTOR: &str = ".g-recaptcha";
const IMAGE_CAPTCHA_SELECTOR: &str = "img[alt*='captcha']";
/// ページ安定待機のタイムアウト（ミリ秒）
const PAGE_STABLE_TIMEOUT_MS: u64 = 10000;
const PAGE_STABLE_CHECK_INTERVAL_MS: u64 = 300;

/// Chrome を起動してセッションを作るランチャー
pub struct ChromeLauncher {
    headless: bool,
    chrome_path: Option<String>,
    request_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(config: &AcquisitionConfig) -> Self {
        Self {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            request_timeout: config.browser_timeout,
        }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(
        &self,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn LookupSession>, PipelineError> {
        info!("Launching browser for NYCServ lookup...");

        // ユニークなユーザーデータディレクトリを生成
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("nycserv-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&user_data_dir)
            .window_size(1280, 800)
            .no_sandbox()
            .request_timeout(self.request_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = proxy {
            info!("Binding browser to proxy {}", proxy);
            builder = builder.arg(format!("--proxy-server={}", proxy.server()));
        }

        let browser_config = builder
            .build()
            .map_err(|e| PipelineError::BrowserInit(format!("ブラウザ設定エラー: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| PipelineError::BrowserInit(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {:?}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(PipelineError::BrowserInit(e.to_string()));
            }
        };

        let mut session = ChromeSession {
            browser,
            page,
            handler_task,
            auth_task: None,
            user_data_dir,
        };

        if let Some(proxy) = proxy.filter(|p| p.has_credentials()) {
            match answer_proxy_auth(&session.page, proxy).await {
                Ok(task) => session.auth_task = Some(task),
                Err(e) => {
                    let _ = session.close().await;
                    return Err(e);
                }
            }
        }

        info!("Browser launched");
        Ok(Box::new(session))
    }
}

/// プロキシ認証に応答するタスクを起動する
///
/// Fetch ドメインを有効にすると全リクエストが一時停止するため、停止イベントは即座に再開させる。
async fn answer_proxy_auth(
    page: &Page,
    proxy: &ProxyEndpoint,
) -> Result<JoinHandle<()>, PipelineError> {
    let mut auth_events = page
        .event_listener::<EventAuthRequired>()
        .await
        .map_err(|e| PipelineError::BrowserInit(e.to_string()))?;
    let mut paused_events = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| PipelineError::BrowserInit(e.to_string()))?;

    let credentials = AuthChallengeResponse::builder()
        .response(AuthChallengeResponseResponse::ProvideCredentials)
        .username(proxy.username.clone().unwrap_or_default())
        .password(proxy.password.clone().unwrap_or_default())
        .build()
        .map_err(|e| PipelineError::BrowserInit(format!("プロキシ認証設定エラー: {}", e)))?;

    page.execute(EnableParams::builder().handle_auth_requests(true).build())
        .await
        .map_err(|e| PipelineError::BrowserInit(format!("プロキシ認証設定エラー: {}", e)))?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = paused_events.next() => {
                    if let Err(e) = page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                    {
                        debug!("Failed to continue request: {}", e);
                    }
                }
                Some(event) = auth_events.next() => {
                    if let Err(e) = page
                        .execute(ContinueWithAuthParams::new(
                            event.request_id.clone(),
                            credentials.clone(),
                        ))
                        .await
                    {
                        debug!("Failed to answer proxy auth: {}", e);
                    }
                }
                else => break,
            }
        }
    }))
}

#[derive(Debug, Deserialize)]
struct FetchedDocument {
    status: u16,
    data: Option<String>,
}

/// 1つのページを専有するブラウザセッション
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    auth_task: Option<JoinHandle<()>>,
    user_data_dir: PathBuf,
}

impl ChromeSession {
    async fn eval<T: DeserializeOwned>(&self, script: &str) -> Result<T, PipelineError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(PipelineError::JavaScript)?;

        self.page
            .evaluate_expression(params)
            .await
            .map_err(|e| PipelineError::JavaScript(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| PipelineError::JavaScript(e.to_string()))
    }

    async fn wait_for_navigation(&self) -> Result<(), PipelineError> {
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| PipelineError::Navigation(e.to_string()))?;
        Ok(())
    }

    /// ページが安定するまで待機（HTML長が連続3回同じ）
    async fn wait_stable(&self) {
        let start = Instant::now();
        let timeout = Duration::from_millis(PAGE_STABLE_TIMEOUT_MS);
        let mut last_len: Option<usize> = None;
        let mut stable_count = 0;
        const REQUIRED_STABLE_CHECKS: u32 = 3;

        while start.elapsed() < timeout {
            match self.eval::<usize>("document.documentElement.outerHTML.length").await {
                Ok(len) => {
                    if last_len == Some(len) {
                        stable_count += 1;
                        if stable_count >= REQUIRED_STABLE_CHECKS {
                            debug!("Page stable after {:?}", start.elapsed());
                            return;
                        }
                    } else {
                        stable_count = 0;
                    }
                    last_len = Some(len);
                }
                Err(e) => {
                    debug!("Page stable check error: {}", e);
                    stable_count = 0;
                }
            }
            sleep(Duration::from_millis(PAGE_STABLE_CHECK_INTERVAL_MS)).await;
        }

        warn!("Page stable timeout after {:?}, proceeding anyway", start.elapsed());
    }

    async fn settle_after_navigation(&self) -> Result<(), PipelineError> {
        self.wait_for_navigation().await?;
        self.wait_stable().await;
        Ok(())
    }
}

/// JS 文字列リテラル
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl LookupSession for ChromeSession {
    async fn open_search(&mut self, url: &str) -> Result<(), PipelineError> {
        info!("Opening NYCServ search page: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| PipelineError::Navigation(e.to_string()))?;
        self.settle_after_navigation().await
    }

    async fn fill_search(&mut self, plate: &str, state: &str) -> Result<(), PipelineError> {
        let script = format!(
            r#"
            (() => {{
                const plate = document.querySelector('input[name="plateNumber"]');
                const state = document.querySelector('select[name="registrationState"]');
                if (!plate || !state) {{
                    return false;
                }}
                plate.value = {plate};
                plate.dispatchEvent(new Event('input', {{ bubbles: true }}));
                state.value = {state};
                state.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return state.value === {state};
            }})()
            "#,
            plate = js_str(plate),
            state = js_str(state),
        );

        if !self.eval::<bool>(&script).await? {
            return Err(PipelineError::ElementNotFound(
                "検索フォーム (plateNumber / registrationState)".into(),
            ));
        }
        debug!("Search form filled: {} ({})", plate, state);
        Ok(())
    }

    async fn detect_challenge(&mut self) -> Result<Option<Challenge>, PipelineError> {
        let site_key: Option<String> = self
            .eval(&format!(
                r#"
                (() => {{
                    const el = document.querySelector({selector});
                    return el ? el.getAttribute('data-sitekey') : null;
                }})()
                "#,
                selector = js_str(WIDGET_SELECTOR),
            ))
            .await?;

        if let Some(site_key) = site_key.filter(|k| !k.is_empty()) {
            let page_url = self
                .page
                .url()
                .await
                .map_err(|e| PipelineError::Navigation(e.to_string()))?
                .unwrap_or_default();
            debug!("reCAPTCHA widget detected (sitekey={})", site_key);
            return Ok(Some(Challenge::Widget { site_key, page_url }));
        }

        let has_image: bool = self
            .eval(&format!(
                "document.querySelector({}) !== null",
                js_str(IMAGE_CAPTCHA_SELECTOR)
            ))
            .await?;
        if has_image {
            let image = self
                .page
                .find_element(IMAGE_CAPTCHA_SELECTOR)
                .await
                .map_err(|e| PipelineError::ElementNotFound(format!("CAPTCHA画像: {}", e)))?
                .screenshot(CaptureScreenshotFormat::Png)
                .await
                .map_err(|e| PipelineError::JavaScript(format!("CAPTCHA画像の取得: {}", e)))?;
            debug!("Image CAPTCHA detected ({} bytes)", image.len());
            return Ok(Some(Challenge::Image { image }));
        }

        Ok(None)
    }

    async fn inject_widget_token(&mut self, token: &str) -> Result<(), PipelineError> {
        let script = format!(
            r#"
            (() => {{
                const field = document.getElementById('g-recaptcha-response');
                if (!field) {{
                    return false;
                }}
                field.innerHTML = {token};
                field.value = {token};
                return true;
            }})()
            "#,
            token = js_str(token),
        );
        if !self.eval::<bool>(&script).await? {
            return Err(PipelineError::ElementNotFound("g-recaptcha-response".into()));
        }
        Ok(())
    }

    async fn fill_image_answer(&mut self, answer: &str) -> Result<(), PipelineError> {
        let script = format!(
            r#"
            (() => {{
                const field = document.querySelector('input[name="captcha"]');
                if (!field) {{
                    return false;
                }}
                field.value = {answer};
                return true;
            }})()
            "#,
            answer = js_str(answer),
        );
        if !self.eval::<bool>(&script).await? {
            return Err(PipelineError::ElementNotFound("input[name='captcha']".into()));
        }
        Ok(())
    }

    async fn submit_search(&mut self) -> Result<(), PipelineError> {
        let clicked: bool = self
            .eval(
                r#"
                (() => {
                    const btn = document.querySelector('input[type="submit"]');
                    if (btn) {
                        btn.click();
                        return true;
                    }
                    return false;
                })()
                "#,
            )
            .await?;
        if !clicked {
            return Err(PipelineError::ElementNotFound("検索ボタン (input[type='submit'])".into()));
        }

        self.settle_after_navigation().await?;
        info!("Search submitted, result listing loaded");
        Ok(())
    }

    async fn open_detail(&mut self, summons_number: &str) -> Result<bool, PipelineError> {
        let script = format!(
            r#"
            (() => {{
                const id = {id};
                const links = document.querySelectorAll('a[href]');
                for (let i = 0; i < links.length; i++) {{
                    if (links[i].getAttribute('href').indexOf(id) >= 0) {{
                        links[i].click();
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            id = js_str(summons_number),
        );

        if !self.eval::<bool>(&script).await? {
            return Ok(false);
        }
        self.settle_after_navigation().await?;
        Ok(true)
    }

    async fn read_detail(&mut self) -> Result<DetailCells, PipelineError> {
        self.eval(
            r#"
            (() => {
                const cells = Array.from(document.querySelectorAll('td'));
                const cellText = (label) => {
                    const cell = cells.find(td => td.textContent.indexOf(label) >= 0);
                    return cell ? cell.textContent.trim() : null;
                };
                return {
                    amount_due: cellText('Amount Due'),
                    status: cellText('Status'),
                    hearing: cellText('Hearing'),
                };
            })()
            "#,
        )
        .await
    }

    async fn document_link(&mut self) -> Result<Option<String>, PipelineError> {
        self.eval(
            r#"
            (() => {
                const link = document.querySelector('a[href*="ShowImage"]');
                return link ? link.href : null;
            })()
            "#,
        )
        .await
    }

    async fn fetch_document(&mut self, url: &str) -> Result<Vec<u8>, PipelineError> {
        // ページのセッション（クッキー・プロキシ）のまま取得する
        let script = format!(
            r#"
            (async () => {{
                const resp = await fetch({url}, {{ credentials: 'include' }});
                if (!resp.ok) {{
                    return {{ status: resp.status, data: null }};
                }}
                const bytes = new Uint8Array(await resp.arrayBuffer());
                let binary = '';
                for (let i = 0; i < bytes.length; i += 0x8000) {{
                    binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
                }}
                return {{ status: resp.status, data: btoa(binary) }};
            }})()
            "#,
            url = js_str(url),
        );

        let fetched: FetchedDocument = self.eval(&script).await?;
        let data = fetched.data.ok_or_else(|| {
            PipelineError::Download(format!("HTTP {} for {}", fetched.status, url))
        })?;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| PipelineError::Download(format!("invalid document payload: {}", e)))
    }

    async fn return_to_listing(&mut self) -> Result<(), PipelineError> {
        self.page
            .evaluate("history.back()")
            .await
            .map_err(|e| PipelineError::Navigation(e.to_string()))?;
        self.settle_after_navigation().await
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        info!("ブラウザを終了中...");

        if let Some(task) = self.auth_task.take() {
            task.abort();
        }
        let closed = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::BrowserInit(format!("ブラウザ終了エラー: {}", e)));
        self.handler_task.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!("Failed to remove user data dir: {}", e);
        }

        info!("ブラウザ終了完了");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_str_escapes() {
        assert_eq!(js_str("AW716M"), "\"AW716M\"");
        assert_eq!(js_str("a\"b'c\n"), "\"a\\\"b'c\\n\"");
    }

    #[test]
    fn test_launcher_from_config() {
        let config = AcquisitionConfig::default()
            .with_headless(false)
            .with_browser_timeout(Duration::from_secs(45));
        let launcher = ChromeLauncher::new(&config);
        assert!(!launcher.headless);
        assert_eq!(launcher.request_timeout, Duration::from_secs(45));
    }

    #[tokio::test]
    #[ignore] // 実環境テスト用: cargo test test_chrome_session_live -- --ignored --nocapture
    async fn test_chrome_session_live() {
        let launcher = ChromeLauncher::new(&AcquisitionConfig::default());
        let mut session = launcher.launch(None).await.expect("Failed to launch browser");
        session
            .open_search(super::super::NYCSERV_SEARCH_URL)
            .await
            .expect("Failed to open search page");
        let challenge = session.detect_challenge().await.expect("Failed to inspect page");
        println!("Challenge: {:?}", challenge.map(|c| c.kind()));
        session.close().await.expect("Failed to close browser");
    }
}
