use async_trait::async_trait;

use crate::captcha::Challenge;
use crate::error::PipelineError;
use crate::nycserv::DetailCells;
use crate::proxy::ProxyEndpoint;

/// NYCServ 検索サイトを操作する1つのブラウザセッション
#[async_trait]
pub trait LookupSession: Send {
    /// 検索ページを開く
    async fn open_search(&mut self, url: &str) -> Result<(), PipelineError>;

    /// ナンバープレートと州を入力
    async fn fill_search(&mut self, plate: &str, state: &str) -> Result<(), PipelineError>;

    /// CAPTCHA の検出（なければ `None`）
    async fn detect_challenge(&mut self) -> Result<Option<Challenge>, PipelineError>;

    async fn inject_widget_token(&mut self, token: &str) -> Result<(), PipelineError>;

    async fn fill_image_answer(&mut self, answer: &str) -> Result<(), PipelineError>;

    /// 検索実行（一覧表示まで待機）
    async fn submit_search(&mut self) -> Result<(), PipelineError>;

    /// 召喚番号の詳細リンクを開く。リンクがなければ `Ok(false)`
    async fn open_detail(&mut self, summons_number: &str) -> Result<bool, PipelineError>;

    async fn read_detail(&mut self) -> Result<DetailCells, PipelineError>;

    /// 詳細ページ上の書類リンク
    async fn document_link(&mut self) -> Result<Option<String>, PipelineError>;

    async fn fetch_document(&mut self, url: &str) -> Result<Vec<u8>, PipelineError>;

    /// 詳細ページから一覧へ戻る
    async fn return_to_listing(&mut self) -> Result<(), PipelineError>;

    /// リソース解放
    async fn close(&mut self) -> Result<(), PipelineError>;

    /// 検索ページを開き入力まで行う
    async fn prepare_search(&mut self, url: &str, plate: &str, state: &str) -> Result<(), PipelineError> {
        self.open_search(url).await?;
        self.fill_search(plate, state).await
    }
}

/// セッションの起動（プロキシ指定があれば送信元をそれに固定する）
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(
        &self,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn LookupSession>, PipelineError>;
}
