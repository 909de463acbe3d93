//! NYC Open Data API クライアント実装
//!
//! ページング・レート制限付きで違反レコードを取得し正規化する

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::PipelineError;

use super::types::{FetchOutcome, FetchStats, Violation};

/// 1ページ分のクエリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub plate: String,
    pub state: String,
    pub limit: usize,
    pub offset: usize,
}

impl PageQuery {
    /// SODA クエリパラメータ
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "$where",
                format!(
                    "plate='{}' AND registration_state='{}'",
                    escape_literal(&self.plate),
                    escape_literal(&self.state)
                ),
            ),
            ("$limit", self.limit.to_string()),
            ("$offset", self.offset.to_string()),
            ("$order", "issue_date DESC".to_string()),
        ]
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// データソースからの1ページ取得
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Value>, PipelineError>;

    fn endpoint(&self) -> &str;
}

/// reqwest による SODA エンドポイント取得
pub struct SodaFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl SodaFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PageFetcher for SodaFetcher {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Value>, PipelineError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&query.params())
            .send()
            .await?;
        let status = resp.status();
        info!(status = status.as_u16(), "API response status");

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }
}

/// 違反データ検索クライアント
///
/// レート制限の基準時刻と統計はインスタンス単位で保持する。
pub struct ViolationsApi {
    fetcher: Box<dyn PageFetcher>,
    page_size: usize,
    page_pause: Duration,
    min_interval: Duration,
    requests_per_minute: u32,
    timeout: Duration,
    last_request: Option<Instant>,
    stats: FetchStats,
}

impl ViolationsApi {
    pub fn new(config: &AcquisitionConfig) -> Result<Self, PipelineError> {
        let fetcher = SodaFetcher::new(config.api_base_url.clone(), config.api_timeout)?;
        Ok(Self::with_fetcher(Box::new(fetcher), config))
    }

    pub fn with_fetcher(fetcher: Box<dyn PageFetcher>, config: &AcquisitionConfig) -> Self {
        Self {
            fetcher,
            page_size: config.page_size.max(1),
            page_pause: config.page_pause,
            min_interval: config.min_request_interval(),
            requests_per_minute: config.requests_per_minute,
            timeout: config.api_timeout,
            last_request: None,
            stats: FetchStats::default(),
        }
    }

    /// ナンバープレートと州で違反を検索する
    ///
    /// 途中のページで失敗した場合はそれまでの結果とエラーを併せて返す。
    /// 1件も取れずにエラーになった場合のみ `success == false`。
    pub async fn search_violations(
        &mut self,
        plate: &str,
        state: &str,
        limit: Option<usize>,
    ) -> FetchOutcome {
        let start = Instant::now();
        let plate = plate.trim().to_uppercase();
        let state = state.trim().to_uppercase();
        info!(plate = %plate, state = %state, "Searching violations");

        self.rate_limit().await;

        let (raw, fetch_error) = self.fetch_all(&plate, &state, limit).await;

        let mut violations = Vec::with_capacity(raw.len());
        for item in &raw {
            match Violation::from_raw(item, &plate, &state) {
                Ok(v) => violations.push(v),
                Err(e) => warn!("Failed to parse violation: {}", e),
            }
        }

        let success = !(violations.is_empty() && fetch_error.is_some());
        let error = fetch_error.map(|e| format!("API search failed: {}", e));
        let elapsed = start.elapsed();

        if success {
            info!(
                count = violations.len(),
                raw = raw.len(),
                "Found violations in {:.2}s",
                elapsed.as_secs_f64()
            );
        } else {
            error!("{}", error.as_deref().unwrap_or_default());
        }

        FetchOutcome {
            plate,
            state,
            violations,
            raw_count: raw.len(),
            elapsed,
            success,
            error,
        }
    }

    /// 最小リクエスト間隔に満たなければ残り時間だけ待機
    async fn rate_limit(&mut self) {
        if let Some(last) = self.last_request {
            let since = last.elapsed();
            if since < self.min_interval {
                let wait = self.min_interval - since;
                debug!("Rate limiting: waiting {:?}", wait);
                sleep(wait).await;
            }
        }
    }

    async fn fetch_all(
        &mut self,
        plate: &str,
        state: &str,
        limit: Option<usize>,
    ) -> (Vec<Value>, Option<PipelineError>) {
        let mut all: Vec<Value> = Vec::new();
        let mut offset = 0;

        info!(
            "Fetching violations for {} ({}) from {}",
            plate,
            state,
            self.fetcher.endpoint()
        );

        loop {
            let page_limit = match limit {
                Some(max) => self.page_size.min(max.saturating_sub(all.len())),
                None => self.page_size,
            };
            if page_limit == 0 {
                break;
            }

            let query = PageQuery {
                plate: plate.to_string(),
                state: state.to_string(),
                limit: page_limit,
                offset,
            };
            debug!("API request params: {:?}", query.params());

            let sent = Instant::now();
            self.last_request = Some(sent);
            let page = self.fetcher.fetch_page(&query).await;
            self.stats.record(sent.elapsed());

            let batch = match page {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Error fetching batch at offset {}: {}", offset, e);
                    return (all, Some(e));
                }
            };
            info!("Received {} violations in this batch", batch.len());

            let batch_len = batch.len();
            all.extend(batch);

            if let Some(max) = limit {
                if all.len() >= max {
                    all.truncate(max);
                    break;
                }
            }
            if batch_len < self.page_size {
                break;
            }

            offset += self.page_size;
            sleep(self.page_pause).await;
        }

        info!("Fetched {} total violations", all.len());
        (all, None)
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    pub fn endpoint(&self) -> &str {
        self.fetcher.endpoint()
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// 決められたページを順に返す取得器
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedFetcher {
        pages: Arc<Mutex<VecDeque<Result<Vec<Value>, PipelineError>>>>,
        queries: Arc<Mutex<Vec<PageQuery>>>,
        sent_at: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn new(pages: Vec<Result<Vec<Value>, PipelineError>>) -> Self {
            Self {
                pages: Arc::new(Mutex::new(pages.into())),
                ..Default::default()
            }
        }

        pub(crate) fn queries(&self) -> Vec<PageQuery> {
            self.queries.lock().unwrap().clone()
        }

        fn sent_at(&self) -> Vec<Instant> {
            self.sent_at.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Value>, PipelineError> {
            self.queries.lock().unwrap().push(query.clone());
            self.sent_at.lock().unwrap().push(Instant::now());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        fn endpoint(&self) -> &str {
            "scripted://violations"
        }
    }

    pub(crate) fn page(start: usize, len: usize) -> Vec<Value> {
        (start..start + len)
            .map(|i| json!({ "summons_number": format!("{:010}", i), "amount_due": "65" }))
            .collect()
    }

    fn api(fetcher: &ScriptedFetcher, config: &AcquisitionConfig) -> ViolationsApi {
        ViolationsApi::with_fetcher(Box::new(fetcher.clone()), config)
    }

    #[test]
    fn test_page_query_params() {
        let query = PageQuery {
            plate: "O'NEIL".into(),
            state: "NY".into(),
            limit: 1000,
            offset: 2000,
        };
        let params = query.params();
        assert_eq!(params[0].1, "plate='O''NEIL' AND registration_state='NY'");
        assert_eq!(params[1], ("$limit", "1000".to_string()));
        assert_eq!(params[2], ("$offset", "2000".to_string()));
        assert_eq!(params[3], ("$order", "issue_date DESC".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paginates_until_short_page() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1000)), Ok(page(1000, 1000)), Ok(page(2000, 250))]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations(" aw716m ", "nj", None).await;

        assert!(outcome.success);
        assert_eq!(outcome.violations.len(), 2250);
        assert_eq!(outcome.plate, "AW716M");
        assert_eq!(outcome.state, "NJ");
        let offsets: Vec<usize> = fetcher.queries().iter().map(|q| q.offset).collect();
        assert_eq!(offsets, vec![0, 1000, 2000]);
        assert_eq!(api.stats().total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_between_pages() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1000)), Ok(page(1000, 1000)), Ok(page(2000, 5))]);
        let config = AcquisitionConfig::default();
        let mut api = api(&fetcher, &config);

        let outcome = api.search_violations("P", "NY", None).await;

        assert_eq!(outcome.violations.len(), 2005);
        let sent = fetcher.sent_at();
        assert_eq!(sent.len(), 3);
        assert!(sent[1] - sent[0] >= config.page_pause);
        assert!(sent[2] - sent[1] >= config.page_pause);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_needs_empty_terminal_page() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1000)), Ok(Vec::new())]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("P", "NY", None).await;

        assert_eq!(outcome.violations.len(), 1000);
        assert_eq!(fetcher.queries().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncates_to_limit() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1000)), Ok(page(1000, 600))]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("P", "NY", Some(1500)).await;

        assert_eq!(outcome.violations.len(), 1500);
        let limits: Vec<usize> = fetcher.queries().iter().map(|q| q.limit).collect();
        assert_eq!(limits, vec![1000, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_on_mid_pagination_error() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(0, 1000)),
            Err(PipelineError::Api {
                status: 503,
                body: "unavailable".into(),
            }),
        ]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("P", "NY", None).await;

        assert!(outcome.success);
        assert_eq!(outcome.violations.len(), 1000);
        assert!(outcome.error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_without_results_fails() {
        let fetcher = ScriptedFetcher::new(vec![Err(PipelineError::Api {
            status: 403,
            body: "forbidden".into(),
        })]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("P", "NY", None).await;

        assert!(!outcome.success);
        assert!(outcome.violations.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_search_is_success() {
        let fetcher = ScriptedFetcher::new(vec![Ok(Vec::new())]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("NOPLATE", "NY", None).await;

        assert!(outcome.success);
        assert!(outcome.violations.is_empty());
        assert!(outcome.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_records_are_skipped() {
        let mut batch = page(0, 3);
        batch.push(json!({ "fine_amount": "65" }));
        batch.push(json!(null));
        let fetcher = ScriptedFetcher::new(vec![Ok(batch)]);
        let mut api = api(&fetcher, &AcquisitionConfig::default());

        let outcome = api.search_violations("P", "NY", None).await;

        assert_eq!(outcome.raw_count, 5);
        assert_eq!(outcome.violations.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_between_searches() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1)), Ok(page(1, 1))]);
        let config = AcquisitionConfig::default().with_requests_per_minute(60);
        let mut api = api(&fetcher, &config);

        api.search_violations("P", "NY", None).await;
        api.search_violations("P", "NY", None).await;

        let sent = fetcher.sent_at();
        assert_eq!(sent.len(), 2);
        assert!(sent[1] - sent[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_search_is_not_delayed() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(0, 1))]);
        let config = AcquisitionConfig::default().with_requests_per_minute(1);
        let mut api = api(&fetcher, &config);

        let start = Instant::now();
        api.search_violations("P", "NY", None).await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
