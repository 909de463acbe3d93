//! NYCServ 補足スクレイパー
//!
//! 検索 → CAPTCHA → 一覧 → 各詳細の順に巡回し、取得できた項目だけをレコードに反映する。
//! 検索完了までの失敗は全体を諦めて元の一覧を返し、詳細ページ単位の失敗はそのレコードだけを諦める。

use tracing::{debug, error, info, warn};

use crate::captcha::{CaptchaClient, CaptchaOutcome, Challenge};
use crate::config::AcquisitionConfig;
use crate::error::PipelineError;
use crate::open_data::{Enrichment, Violation};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::traits::{LookupSession, SessionLauncher};

use super::browser::ChromeLauncher;
use super::documents::DocumentStore;

pub const NYCSERV_SEARCH_URL: &str = "https://nycserv.nyc.gov/NYCServWeb/PVO_Search.jsp";

pub struct Enhancer {
    launcher: Box<dyn SessionLauncher>,
    solver: CaptchaClient,
    proxies: ProxyPool,
    documents: DocumentStore,
    search_url: String,
}

impl Enhancer {
    pub fn new(config: &AcquisitionConfig) -> Result<Self, PipelineError> {
        Ok(Self::with_parts(
            Box::new(ChromeLauncher::new(config)),
            CaptchaClient::new(config)?,
            ProxyPool::new(config),
            DocumentStore::new(&config.download_path),
        ))
    }

    pub fn with_parts(
        launcher: Box<dyn SessionLauncher>,
        solver: CaptchaClient,
        proxies: ProxyPool,
        documents: DocumentStore,
    ) -> Self {
        Self {
            launcher,
            solver,
            proxies,
            documents,
            search_url: NYCSERV_SEARCH_URL.to_string(),
        }
    }

    pub fn with_search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = url.into();
        self
    }

    pub fn solver(&self) -> &CaptchaClient {
        &self.solver
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// 違反一覧を補足する
    ///
    /// 戻り値は常に入力と同じ件数・同じ順序。
    pub async fn enhance(
        &mut self,
        violations: Vec<Violation>,
        plate: &str,
        state: &str,
        download_documents: bool,
    ) -> Vec<Violation> {
        if violations.is_empty() {
            return violations;
        }
        info!(
            "Enhancing {} violations for {} ({}) via NYCServ",
            violations.len(),
            plate,
            state
        );

        let proxy = if self.proxies.is_empty() {
            None
        } else {
            self.proxies.get_next().await
        };

        let mut session = match self.launcher.launch(proxy.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start browser session: {}", e);
                if let Some(proxy) = &proxy {
                    self.proxies.report_failure(proxy, &e.to_string());
                }
                return violations;
            }
        };

        if let Err(e) = self
            .run_search(session.as_mut(), plate, state, proxy.as_ref())
            .await
        {
            error!("NYCServ search failed, returning base records: {}", e);
            if let (true, Some(proxy)) = (e.is_retryable(), &proxy) {
                self.proxies.report_failure(proxy, &e.to_string());
            }
            close_session(session.as_mut()).await;
            return violations;
        }

        let mut enhanced = Vec::with_capacity(violations.len());
        for violation in violations {
            match self
                .enhance_one(session.as_mut(), &violation, download_documents)
                .await
            {
                Ok(enrichment) => enhanced.push(violation.enrich(enrichment)),
                Err(e) => {
                    warn!(
                        "Failed to enhance summons {}: {}",
                        violation.summons_number, e
                    );
                    enhanced.push(violation);
                }
            }
        }

        close_session(session.as_mut()).await;

        let count = enhanced.iter().filter(|v| v.enhanced_by_scraping).count();
        info!("Enhanced {}/{} violations", count, enhanced.len());
        enhanced
    }

    /// 検索ページを開いて一覧表示まで進める
    async fn run_search(
        &mut self,
        session: &mut dyn LookupSession,
        plate: &str,
        state: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<(), PipelineError> {
        session.prepare_search(&self.search_url, plate, state).await?;

        if let Some(challenge) = session.detect_challenge().await? {
            let token = match self.solver.solve(&challenge, proxy).await {
                CaptchaOutcome::Solved { token, .. } => token,
                CaptchaOutcome::Failed { reason, .. } => {
                    return Err(PipelineError::Captcha(format!("unsolved: {}", reason)));
                }
                CaptchaOutcome::TimedOut { elapsed, .. } => {
                    return Err(PipelineError::Captcha(format!(
                        "unsolved: timed out after {:?}",
                        elapsed
                    )));
                }
            };

            match challenge {
                Challenge::Widget { .. } => session.inject_widget_token(&token).await?,
                Challenge::Image { .. } => session.fill_image_answer(&token).await?,
            }
        } else {
            debug!("No CAPTCHA on search page");
        }

        session.submit_search().await
    }

    async fn enhance_one(
        &self,
        session: &mut dyn LookupSession,
        violation: &Violation,
        download_documents: bool,
    ) -> Result<Enrichment, PipelineError> {
        if !session.open_detail(&violation.summons_number).await? {
            debug!("No detail link for summons {}", violation.summons_number);
            return Ok(Enrichment::default());
        }

        let collected = self
            .collect_detail(session, &violation.summons_number, download_documents)
            .await;

        // 一覧に戻れないと後続のリンク探索が失敗するが、このレコードの結果は使える
        if let Err(e) = session.return_to_listing().await {
            warn!("Failed to return to listing: {}", e);
        }

        collected
    }

    async fn collect_detail(
        &self,
        session: &mut dyn LookupSession,
        summons_number: &str,
        download_documents: bool,
    ) -> Result<Enrichment, PipelineError> {
        let mut enrichment = session.read_detail().await?.to_enrichment();

        if download_documents {
            match self.download_document(session, summons_number).await {
                Ok(path) => enrichment.local_pdf_path = path,
                Err(e) => warn!("Document download failed for {}: {}", summons_number, e),
            }
        }

        Ok(enrichment)
    }

    async fn download_document(
        &self,
        session: &mut dyn LookupSession,
        summons_number: &str,
    ) -> Result<Option<std::path::PathBuf>, PipelineError> {
        let Some(url) = session.document_link().await? else {
            return Ok(None);
        };
        let bytes = session.fetch_document(&url).await?;
        Ok(Some(self.documents.save(summons_number, &bytes).await?))
    }
}

async fn close_session(session: &mut dyn LookupSession) {
    if let Err(e) = session.close().await {
        warn!("Failed to close browser session: {}", e);
    }
}
