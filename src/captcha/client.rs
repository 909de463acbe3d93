//! 2Captcha クライアント実装
//!
//! 登録 → ポーリング → {解答 | 失敗 | タイムアウト} の状態遷移を扱う

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::PipelineError;
use crate::proxy::ProxyEndpoint;

use super::types::{CaptchaOutcome, CaptchaStats, CaptchaTask, Challenge, ChallengeKind, SolverReply};

/// ソルバーAPIとの通信
#[async_trait]
pub trait SolverTransport: Send + Sync {
    /// チャレンジの登録 (POST in.php)
    async fn submit(&self, form: &[(&str, String)]) -> Result<SolverReply, PipelineError>;

    /// 結果取得・残高・評価 (GET res.php)
    async fn query(&self, params: &[(&str, String)]) -> Result<SolverReply, PipelineError>;
}

pub struct TwoCaptchaTransport {
    client: reqwest::Client,
    base_url: String,
}

impl TwoCaptchaTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn read_reply(resp: reqwest::Response) -> Result<SolverReply, PipelineError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl SolverTransport for TwoCaptchaTransport {
    async fn submit(&self, form: &[(&str, String)]) -> Result<SolverReply, PipelineError> {
        let url = format!("{}/in.php", self.base_url);
        let resp = self.client.post(&url).form(form).send().await?;
        Self::read_reply(resp).await
    }

    async fn query(&self, params: &[(&str, String)]) -> Result<SolverReply, PipelineError> {
        let url = format!("{}/res.php", self.base_url);
        let resp = self.client.get(&url).query(params).send().await?;
        Self::read_reply(resp).await
    }
}

/// CAPTCHA 解答クライアント
pub struct CaptchaClient {
    api_key: Option<String>,
    transport: Box<dyn SolverTransport>,
    timeout: Duration,
    poll_interval: Duration,
    stats: CaptchaStats,
}

impl CaptchaClient {
    pub fn new(config: &AcquisitionConfig) -> Result<Self, PipelineError> {
        let transport = TwoCaptchaTransport::new(config.captcha_base_url.clone())?;
        Ok(Self::with_transport(
            config.captcha_api_key.clone(),
            Box::new(transport),
            config.captcha_timeout,
            config.captcha_poll_interval,
        ))
    }

    pub fn with_transport(
        api_key: Option<String>,
        transport: Box<dyn SolverTransport>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            transport,
            timeout,
            poll_interval,
            stats: CaptchaStats::default(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn stats(&self) -> &CaptchaStats {
        &self.stats
    }

    fn key(&self) -> Result<&str, PipelineError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Captcha("no 2Captcha API key configured".into()))
    }

    /// ウィジェット型チャレンジを登録
    pub async fn submit_widget_challenge(
        &self,
        site_key: &str,
        page_url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<CaptchaTask, PipelineError> {
        let mut form = vec![
            ("key", self.key()?.to_string()),
            ("method", "userrecaptcha".to_string()),
            ("googlekey", site_key.to_string()),
            ("pageurl", page_url.to_string()),
            ("json", "1".to_string()),
        ];
        if let Some(proxy) = proxy {
            form.push(("proxy", proxy.solver_descriptor()));
            form.push(("proxytype", proxy.solver_type()));
        }
        self.submit(ChallengeKind::Widget, &form).await
    }

    /// 画像チャレンジを登録
    pub async fn submit_image_challenge(&self, image: &[u8]) -> Result<CaptchaTask, PipelineError> {
        let form = vec![
            ("key", self.key()?.to_string()),
            ("method", "base64".to_string()),
            ("body", base64::engine::general_purpose::STANDARD.encode(image)),
            ("json", "1".to_string()),
        ];
        self.submit(ChallengeKind::Image, &form).await
    }

    async fn submit(
        &self,
        kind: ChallengeKind,
        form: &[(&str, String)],
    ) -> Result<CaptchaTask, PipelineError> {
        let reply = self.transport.submit(form).await?;
        if !reply.is_ok() {
            return Err(PipelineError::Captcha(format!(
                "submit rejected: {}",
                reply.error_code()
            )));
        }

        let task = CaptchaTask {
            id: reply.request_text(),
            kind,
            created_at: Instant::now(),
        };
        debug!("{:?} challenge submitted with task ID: {}", kind, task.id);
        Ok(task)
    }

    /// 解答が出るまでポーリングする
    ///
    /// 未完了応答と通信エラーのみ再試行し、タスク作成からの経過が上限を超えたら `TimedOut`。
    pub async fn await_result(&mut self, task: &CaptchaTask) -> CaptchaOutcome {
        let budget = self.timeout.saturating_sub(task.created_at.elapsed());

        let outcome = match timeout(budget, self.poll(&task.id)).await {
            Ok(Ok(token)) => CaptchaOutcome::Solved {
                task_id: task.id.clone(),
                token,
            },
            Ok(Err(reason)) => {
                error!("CAPTCHA solving error: {}", reason);
                CaptchaOutcome::Failed {
                    task_id: Some(task.id.clone()),
                    reason,
                }
            }
            Err(_) => {
                error!("CAPTCHA solving timeout after {:?}", task.created_at.elapsed());
                CaptchaOutcome::TimedOut {
                    task_id: task.id.clone(),
                    elapsed: task.created_at.elapsed(),
                }
            }
        };

        self.stats.record(task.kind, &outcome);
        outcome
    }

    async fn poll(&self, task_id: &str) -> Result<String, String> {
        let key = self.key().map_err(|e| e.to_string())?;
        let params = [
            ("key", key.to_string()),
            ("action", "get".to_string()),
            ("id", task_id.to_string()),
            ("json", "1".to_string()),
        ];

        loop {
            match self.transport.query(&params).await {
                Ok(reply) if reply.is_ok() => return Ok(reply.request_text()),
                Ok(reply) if reply.is_not_ready() => {
                    debug!("Task {} not ready yet", task_id);
                }
                Ok(reply) => return Err(reply.error_code()),
                Err(e) => {
                    warn!("Error polling for CAPTCHA result: {}", e);
                }
            }
            sleep(self.poll_interval).await;
        }
    }

    /// 登録から解答までを一括で行う
    pub async fn solve(
        &mut self,
        challenge: &Challenge,
        proxy: Option<&ProxyEndpoint>,
    ) -> CaptchaOutcome {
        let kind = challenge.kind();
        info!("Solving {:?} CAPTCHA", kind);

        let submitted = match challenge {
            Challenge::Widget { site_key, page_url } => {
                self.submit_widget_challenge(site_key, page_url, proxy).await
            }
            Challenge::Image { image } => self.submit_image_challenge(image).await,
        };

        let outcome = match submitted {
            Ok(task) => return self.await_result(&task).await,
            Err(e) => {
                error!("Failed to submit {:?} CAPTCHA: {}", kind, e);
                CaptchaOutcome::Failed {
                    task_id: None,
                    reason: e.to_string(),
                }
            }
        };

        self.stats.record(kind, &outcome);
        outcome
    }

    /// アカウント残高 (USD)
    pub async fn get_balance(&self) -> Result<f64, PipelineError> {
        let params = [
            ("key", self.key()?.to_string()),
            ("action", "getbalance".to_string()),
            ("json", "1".to_string()),
        ];
        let reply = self.transport.query(&params).await?;
        if !reply.is_ok() {
            return Err(PipelineError::Captcha(format!(
                "failed to get balance: {}",
                reply.error_code()
            )));
        }

        let balance = reply
            .request_text()
            .parse::<f64>()
            .map_err(|e| PipelineError::Captcha(format!("invalid balance: {}", e)))?;
        info!("2Captcha balance: ${:.3}", balance);
        Ok(balance)
    }

    pub async fn report_good(&self, task_id: &str) -> Result<bool, PipelineError> {
        self.report("reportgood", task_id).await
    }

    pub async fn report_bad(&self, task_id: &str) -> Result<bool, PipelineError> {
        self.report("reportbad", task_id).await
    }

    async fn report(&self, action: &str, task_id: &str) -> Result<bool, PipelineError> {
        let params = [
            ("key", self.key()?.to_string()),
            ("action", action.to_string()),
            ("id", task_id.to_string()),
            ("json", "1".to_string()),
        ];
        Ok(self.transport.query(&params).await?.is_ok())
    }
}
