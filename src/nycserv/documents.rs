//! 取得した書類 (PDF) の保存先

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    /// `<download_path>/documents` に保存する
    pub fn new(download_path: impl AsRef<Path>) -> Self {
        Self {
            dir: download_path.as_ref().join("documents"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 書類IDに対応するファイルパス（ファイル名に使えない文字は `_` に置換）
    pub fn path_for(&self, document_id: &str) -> PathBuf {
        let safe: String = document_id
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.pdf", safe))
    }

    pub async fn save(&self, document_id: &str, bytes: &[u8]) -> Result<PathBuf, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::Download(format!(
                "empty document for {}",
                document_id
            )));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(document_id);
        tokio::fs::write(&path, bytes).await?;

        info!("Downloaded document: {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }
}
