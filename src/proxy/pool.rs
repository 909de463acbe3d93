//! プロキシプール実装
//!
//! ラウンドロビン/ランダムで健全なプロキシを払い出し、定期的に疎通確認する

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::PipelineError;

use super::types::{PoolStats, ProxyEndpoint};

/// この回数失敗したら即座に unhealthy へ移す
pub const FAILURE_THRESHOLD: u32 = 3;

/// 1エンドポイントの疎通確認
#[async_trait]
pub trait ProxyProber: Send + Sync {
    /// 成功時は応答時間を返す
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, PipelineError>;
}

/// エコーURLへプロキシ経由でGETする確認器
pub struct HttpProber {
    probe_url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(probe_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, PipelineError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(endpoint.url())?)
            .timeout(self.timeout)
            .build()?;

        let start = Instant::now();
        let resp = client.get(&self.probe_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Api {
                status: status.as_u16(),
                body: format!("HTTP {}", status),
            });
        }
        Ok(start.elapsed())
    }
}

/// プロキシプール
///
/// `healthy`/`unhealthy` は `endpoints` へのインデックスで、常に健全フラグから一意に決まる。
pub struct ProxyPool {
    endpoints: Vec<ProxyEndpoint>,
    healthy: Vec<usize>,
    unhealthy: Vec<usize>,
    cursor: usize,
    check_interval: Duration,
    last_sweep: Option<Instant>,
    prober: Box<dyn ProxyProber>,
}

impl ProxyPool {
    /// 設定のプロキシ一覧から作成（解析できない指定は読み飛ばす）
    pub fn new(config: &AcquisitionConfig) -> Self {
        let endpoints = config
            .proxies
            .iter()
            .filter_map(|raw| match ProxyEndpoint::parse(raw) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!("Skipping proxy: {}", e);
                    None
                }
            })
            .collect();

        let prober = HttpProber::new(config.proxy_probe_url.clone(), config.proxy_probe_timeout);
        Self::with_prober(endpoints, config.proxy_check_interval, Box::new(prober))
    }

    pub fn with_prober(
        endpoints: Vec<ProxyEndpoint>,
        check_interval: Duration,
        prober: Box<dyn ProxyProber>,
    ) -> Self {
        info!("Initialized proxy pool with {} proxies", endpoints.len());
        let mut pool = Self {
            endpoints,
            healthy: Vec::new(),
            unhealthy: Vec::new(),
            cursor: 0,
            check_interval,
            last_sweep: None,
            prober,
        };
        pool.rebuild_partitions();
        pool
    }

    /// 次の健全なプロキシ（ラウンドロビン）
    pub async fn get_next(&mut self) -> Option<ProxyEndpoint> {
        self.sweep_if_stale().await;

        if self.healthy.is_empty() {
            warn!("No healthy proxies available");
            return None;
        }

        let idx = self.healthy[self.cursor % self.healthy.len()];
        self.cursor = (self.cursor + 1) % self.healthy.len();

        let endpoint = &mut self.endpoints[idx];
        endpoint.last_used = Some(Utc::now());
        debug!("Using proxy: {}", endpoint);
        Some(endpoint.clone())
    }

    /// 健全なプロキシからランダムに1つ
    pub async fn get_random(&mut self) -> Option<ProxyEndpoint> {
        self.sweep_if_stale().await;

        let idx = *self.healthy.choose(&mut rand::thread_rng())?;
        let endpoint = &mut self.endpoints[idx];
        endpoint.last_used = Some(Utc::now());
        Some(endpoint.clone())
    }

    /// 失敗を記録し、閾値に達したら次回の確認を待たずに unhealthy へ移す
    pub fn report_failure(&mut self, endpoint: &ProxyEndpoint, reason: &str) {
        let Some(idx) = self
            .endpoints
            .iter()
            .position(|e| e.same_endpoint(endpoint))
        else {
            debug!("Failure reported for unknown proxy {}", endpoint);
            return;
        };

        let entry = &mut self.endpoints[idx];
        entry.failures += 1;
        warn!(
            "Proxy failure: {} ({} failures) - {}",
            entry, entry.failures, reason
        );

        if entry.failures >= FAILURE_THRESHOLD && entry.healthy {
            entry.healthy = false;
            error!("Marked proxy as unhealthy: {}", entry);
            self.rebuild_partitions();
        }
    }

    async fn sweep_if_stale(&mut self) {
        let stale = self
            .last_sweep
            .map(|last| last.elapsed() > self.check_interval)
            .unwrap_or(true);
        if stale {
            self.check_health().await;
        }
    }

    /// 全プロキシを並行に疎通確認する
    ///
    /// 確認結果は全て揃ってから反映するため、カウンタ更新は待機点を跨がない。
    pub async fn check_health(&mut self) {
        info!("Checking proxy health...");

        let probes = self.endpoints.iter().map(|e| self.prober.probe(e));
        let results = join_all(probes).await;

        let now = Utc::now();
        for (endpoint, result) in self.endpoints.iter_mut().zip(results) {
            endpoint.last_checked = Some(now);
            match result {
                Ok(response_time) => {
                    endpoint.healthy = true;
                    endpoint.response_time = response_time;
                    endpoint.success_count += 1;
                    endpoint.failures = endpoint.failures.saturating_sub(1);
                    debug!("Proxy {} healthy ({:?})", endpoint, response_time);
                }
                Err(e) => {
                    endpoint.healthy = false;
                    endpoint.failures += 1;
                    debug!("Proxy {} unhealthy: {}", endpoint, e);
                }
            }
        }

        self.rebuild_partitions();
        self.last_sweep = Some(Instant::now());

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            self.healthy.len(),
            self.unhealthy.len()
        );
    }

    fn rebuild_partitions(&mut self) {
        let (healthy, unhealthy): (Vec<usize>, Vec<usize>) =
            (0..self.endpoints.len()).partition(|&i| self.endpoints[i].healthy);
        self.healthy = healthy;
        self.unhealthy = unhealthy;
    }

    pub fn has_healthy(&self) -> bool {
        !self.healthy.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }

    pub fn healthy_endpoints(&self) -> Vec<&ProxyEndpoint> {
        self.healthy.iter().map(|&i| &self.endpoints[i]).collect()
    }

    pub fn unhealthy_endpoints(&self) -> Vec<&ProxyEndpoint> {
        self.unhealthy.iter().map(|&i| &self.endpoints[i]).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let healthy = self.healthy_endpoints();
        let times: Vec<Duration> = healthy
            .iter()
            .map(|e| e.response_time)
            .filter(|t| !t.is_zero())
            .collect();
        let average_response_time = if times.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(times.iter().sum::<Duration>().as_secs_f64() / times.len() as f64)
        };

        let describe = |e: &&ProxyEndpoint| format!("{} ({:.2}s)", e, e.response_time.as_secs_f64());
        let best_proxy = healthy.iter().min_by_key(|e| e.response_time).map(describe);
        let worst_proxy = healthy.iter().max_by_key(|e| e.response_time).map(describe);

        let last_health_check = self
            .endpoints
            .iter()
            .filter_map(|e| e.last_checked)
            .max();

        PoolStats {
            total_proxies: self.endpoints.len(),
            healthy_proxies: self.healthy.len(),
            unhealthy_proxies: self.unhealthy.len(),
            average_response_time,
            best_proxy,
            worst_proxy,
            last_health_check,
            check_interval: self.check_interval,
        }
    }
}
