use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower::Service;
use tracing::{error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::PipelineError;
use crate::nycserv::Enhancer;
use crate::open_data::{Violation, ViolationsApi};

pub const NO_CAPTCHA_KEY_WARNING: &str =
    "Web scraping requested but no 2Captcha API key configured";

/// 違反取得リクエスト
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub plate: String,
    pub state: String,
    /// NYCServ で補足するか
    pub enhance: bool,
    pub download_documents: bool,
    /// Open Data から取得する最大件数
    pub max_records: Option<usize>,
    /// 補足対象の最大件数（未指定なら設定値）
    pub max_enhance: Option<usize>,
}

impl AcquisitionRequest {
    pub fn new(plate: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            plate: plate.into(),
            state: state.into(),
            enhance: true,
            download_documents: true,
            max_records: None,
            max_enhance: None,
        }
    }

    pub fn with_enhance(mut self, enhance: bool) -> Self {
        self.enhance = enhance;
        self
    }

    pub fn with_download_documents(mut self, download: bool) -> Self {
        self.download_documents = download;
        self
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }

    pub fn with_max_enhance(mut self, max: usize) -> Self {
        self.max_enhance = Some(max);
        self
    }
}

/// 取得結果
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionResult {
    pub plate: String,
    pub state: String,
    pub violations: Vec<Violation>,
    /// 補足上限で切り詰める前の件数
    pub total_violations: usize,
    pub enhanced_violations: usize,
    pub downloaded_documents: usize,
    pub success: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub fetch_time: Duration,
    pub enhancement_time: Duration,
    pub total_time: Duration,
}

impl AcquisitionResult {
    fn empty(plate: String, state: String) -> Self {
        Self {
            plate,
            state,
            violations: Vec::new(),
            total_violations: 0,
            enhanced_violations: 0,
            downloaded_documents: 0,
            success: false,
            error: None,
            warnings: Vec::new(),
            fetch_time: Duration::ZERO,
            enhancement_time: Duration::ZERO,
            total_time: Duration::ZERO,
        }
    }
}

/// Open Data 検索と NYCServ 補足を順に実行する
pub struct HybridCoordinator {
    config: AcquisitionConfig,
    api: ViolationsApi,
    enhancer: Enhancer,
}

impl HybridCoordinator {
    pub fn new(config: AcquisitionConfig) -> Result<Self, PipelineError> {
        let api = ViolationsApi::new(&config)?;
        let enhancer = Enhancer::new(&config)?;
        Ok(Self::from_parts(config, api, enhancer))
    }

    pub fn from_parts(config: AcquisitionConfig, api: ViolationsApi, enhancer: Enhancer) -> Self {
        Self {
            config,
            api,
            enhancer,
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn api(&self) -> &ViolationsApi {
        &self.api
    }

    pub fn enhancer(&self) -> &Enhancer {
        &self.enhancer
    }

    /// 違反データを取得し、必要なら補足する
    ///
    /// 失敗扱いになるのは Open Data 検索が1件も返さずにエラーになった場合のみ。
    pub async fn acquire(&mut self, req: AcquisitionRequest) -> AcquisitionResult {
        let start = Instant::now();
        info!("Acquiring violations for {} ({})", req.plate, req.state);

        let outcome = self
            .api
            .search_violations(&req.plate, &req.state, req.max_records)
            .await;

        let mut result = AcquisitionResult::empty(outcome.plate.clone(), outcome.state.clone());
        result.fetch_time = outcome.elapsed;

        if !outcome.success {
            result.error = outcome.error;
            result.total_time = start.elapsed();
            error!(
                "Acquisition failed for {} ({}): {}",
                result.plate,
                result.state,
                result.error.as_deref().unwrap_or_default()
            );
            return result;
        }

        // 途中ページの失敗は部分結果として扱う
        if let Some(partial) = outcome.error {
            warn!("{}", partial);
            result.warnings.push(partial);
        }

        let mut violations = outcome.violations;
        result.total_violations = violations.len();

        if req.enhance {
            if !self.config.has_captcha_key() {
                warn!("{}", NO_CAPTCHA_KEY_WARNING);
                result.warnings.push(NO_CAPTCHA_KEY_WARNING.to_string());
            } else if !violations.is_empty() {
                let cap = req.max_enhance.unwrap_or(self.config.max_enhance);
                violations.truncate(cap);

                let enhance_start = Instant::now();
                violations = self
                    .enhancer
                    .enhance(
                        violations,
                        &result.plate,
                        &result.state,
                        req.download_documents,
                    )
                    .await;
                result.enhancement_time = enhance_start.elapsed();
            }
        }

        result.enhanced_violations = violations.iter().filter(|v| v.enhanced_by_scraping).count();
        result.downloaded_documents = violations
            .iter()
            .filter(|v| v.local_pdf_path.is_some())
            .count();
        result.violations = violations;
        result.success = true;
        result.total_time = start.elapsed();

        info!(
            "Acquisition complete: {} violations ({} enhanced, {} documents) in {:.2}s",
            result.total_violations,
            result.enhanced_violations,
            result.downloaded_documents,
            result.total_time.as_secs_f64()
        );
        result
    }
}

/// tower::Serviceを実装した違反取得サービス
///
/// コーディネーターは1つを共有し、リクエストは順に処理する。
#[derive(Clone)]
pub struct AcquisitionService {
    coordinator: Arc<Mutex<HybridCoordinator>>,
}

impl AcquisitionService {
    pub fn new(coordinator: HybridCoordinator) -> Self {
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
        }
    }

    pub fn from_config(config: AcquisitionConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(HybridCoordinator::new(config)?))
    }
}

impl Service<AcquisitionRequest> for AcquisitionService {
    type Response = AcquisitionResult;
    type Error = PipelineError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: AcquisitionRequest) -> Self::Future {
        info!("取得リクエスト受信: plate={}, state={}", req.plate, req.state);

        let coordinator = self.coordinator.clone();
        Box::pin(async move {
            let mut coordinator = coordinator.lock().await;
            Ok(coordinator.acquire(req).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::ScriptedSolver;
    use crate::nycserv::{test_enhancer, FakeSite};
    use crate::open_data::{test_page, ScriptedFetcher};
    use crate::proxy::{pool_of, ScriptedProber};
    use serde_json::json;

    fn coordinator(
        config: AcquisitionConfig,
        fetcher: &ScriptedFetcher,
        site: &FakeSite,
        download_path: &std::path::Path,
    ) -> HybridCoordinator {
        let api = ViolationsApi::with_fetcher(Box::new(fetcher.clone()), &config);
        let enhancer = test_enhancer(
            site,
            &ScriptedSolver::default(),
            pool_of(&[], &ScriptedProber::default()),
            download_path,
        );
        HybridCoordinator::from_parts(config, api, enhancer)
    }

    fn base_of(pages: &[Vec<serde_json::Value>]) -> Vec<Violation> {
        pages
            .iter()
            .flatten()
            .map(|raw| Violation::from_raw(raw, "AW716M", "NJ").unwrap())
            .collect()
    }

    #[test]
    fn test_acquisition_request_builder() {
        let req = AcquisitionRequest::new("aw716m", "nj")
            .with_enhance(false)
            .with_download_documents(false)
            .with_max_records(10)
            .with_max_enhance(3);

        assert_eq!(req.plate, "aw716m");
        assert!(!req.enhance);
        assert!(!req.download_documents);
        assert_eq!(req.max_records, Some(10));
        assert_eq!(req.max_enhance, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_captcha_key_skips_enhancement_with_warning() {
        let first = vec![
            json!({ "summons_number": "8776543210", "amount_due": "115.00", "violation": "NO PARKING" }),
            json!({ "summons_number": "8776543211", "payment_amount": "65", "amount_due": "0" }),
        ];
        let fetcher = ScriptedFetcher::new(vec![Ok(first.clone())]);
        let site = FakeSite::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(AcquisitionConfig::default(), &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(AcquisitionRequest::new("AW716M", "NJ"))
            .await;

        assert!(result.success);
        assert_eq!(result.enhanced_violations, 0);
        assert_eq!(result.warnings, vec![NO_CAPTCHA_KEY_WARNING.to_string()]);
        assert_eq!(result.total_violations, 2);

        let expected = base_of(&[first]);
        assert_eq!(result.violations.len(), expected.len());
        for (got, want) in result.violations.iter().zip(&expected) {
            assert_eq!(got.key(), want.key());
            assert_eq!(got.status, want.status);
            assert_eq!(got.amount_due, want.amount_due);
            assert!(!got.enhanced_by_scraping);
        }
        assert!(site.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_captcha_key_warns_on_empty_search() {
        let fetcher = ScriptedFetcher::new(vec![Ok(Vec::new())]);
        let site = FakeSite::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(AcquisitionConfig::default(), &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(AcquisitionRequest::new("NOPLATE", "NY"))
            .await;

        assert!(result.success);
        assert!(result.violations.is_empty());
        assert_eq!(result.warnings, vec![NO_CAPTCHA_KEY_WARNING.to_string()]);
        assert!(site.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_fails_result() {
        let fetcher = ScriptedFetcher::new(vec![Err(PipelineError::Api {
            status: 503,
            body: "unavailable".into(),
        })]);
        let site = FakeSite::default();
        let tmp = tempfile::tempdir().unwrap();
        let config = AcquisitionConfig::default().with_captcha_api_key("key");
        let mut coordinator = coordinator(config, &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(AcquisitionRequest::new("AW716M", "NJ"))
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("API search failed"));
        assert!(result.violations.is_empty());
        assert!(site.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enhancement_capped_and_counted() {
        let fetcher = ScriptedFetcher::new(vec![Ok(test_page(0, 5))]);
        let base = base_of(&[test_page(0, 5)]);
        let mut site = FakeSite::listing(&base);
        site.document = Some(b"%PDF".to_vec());
        let tmp = tempfile::tempdir().unwrap();
        let config = AcquisitionConfig::default()
            .with_captcha_api_key("key")
            .with_max_enhance(3);
        let mut coordinator = coordinator(config, &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(AcquisitionRequest::new("AW716M", "NJ"))
            .await;

        assert!(result.success);
        assert_eq!(result.total_violations, 5);
        assert_eq!(result.violations.len(), 3);
        assert_eq!(result.enhanced_violations, 3);
        assert_eq!(result.downloaded_documents, 3);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_cap_overrides_config() {
        let fetcher = ScriptedFetcher::new(vec![Ok(test_page(0, 4))]);
        let base = base_of(&[test_page(0, 4)]);
        let site = FakeSite::listing(&base);
        let tmp = tempfile::tempdir().unwrap();
        let config = AcquisitionConfig::default().with_captcha_api_key("key");
        let mut coordinator = coordinator(config, &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(
                AcquisitionRequest::new("AW716M", "NJ")
                    .with_max_enhance(2)
                    .with_download_documents(false),
            )
            .await;

        assert_eq!(result.violations.len(), 2);
        assert_eq!(result.enhanced_violations, 2);
        assert_eq!(result.downloaded_documents, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enhance_not_requested() {
        let fetcher = ScriptedFetcher::new(vec![Ok(test_page(0, 2))]);
        let site = FakeSite::default();
        let tmp = tempfile::tempdir().unwrap();
        let config = AcquisitionConfig::default().with_captcha_api_key("key");
        let mut coordinator = coordinator(config, &fetcher, &site, tmp.path());

        let result = coordinator
            .acquire(AcquisitionRequest::new("AW716M", "NJ").with_enhance(false))
            .await;

        assert!(result.success);
        assert_eq!(result.violations.len(), 2);
        assert!(result.warnings.is_empty());
        assert!(site.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_call() {
        let fetcher = ScriptedFetcher::new(vec![Ok(test_page(0, 1))]);
        let site = FakeSite::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut service = AcquisitionService::new(coordinator(
            AcquisitionConfig::default(),
            &fetcher,
            &site,
            tmp.path(),
        ));

        let result = service
            .call(AcquisitionRequest::new("aw716m", "nj").with_enhance(false))
            .await
            .unwrap();

        assert_eq!(result.plate, "AW716M");
        assert_eq!(result.state, "NJ");
        assert_eq!(result.violations.len(), 1);
    }

    #[tokio::test]
    #[ignore] // 実環境テスト用: cargo test test_acquire_live -- --ignored --nocapture
    async fn test_acquire_live() {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

        let mut coordinator =
            HybridCoordinator::new(AcquisitionConfig::from_env()).expect("Failed to build coordinator");
        let result = coordinator
            .acquire(AcquisitionRequest::new("AW716M", "NJ").with_enhance(false))
            .await;

        println!("Success: {}", result.success);
        println!("Violations: {}", result.total_violations);
        assert!(result.success);
    }
}
