use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("ダウンロードエラー: {0}")]
    Download(String),

    #[error("HTTPエラー: {0}")]
    Http(#[from] reqwest::Error),

    #[error("APIエラー {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON解析エラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("不正なレコード: {0}")]
    InvalidRecord(String),

    #[error("CAPTCHAエラー: {0}")]
    Captcha(String),

    #[error("不正なプロキシ指定: {0}")]
    InvalidProxy(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

impl PipelineError {
    /// 通信レベルの一時的な失敗かどうか
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Http(_) | PipelineError::Timeout(_) | PipelineError::Navigation(_) => {
                true
            }
            PipelineError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_retryability() {
        let throttled = PipelineError::Api {
            status: 429,
            body: String::new(),
        };
        let server = PipelineError::Api {
            status: 503,
            body: String::new(),
        };
        let bad_request = PipelineError::Api {
            status: 400,
            body: "bad $where".into(),
        };

        assert!(throttled.is_retryable());
        assert!(server.is_retryable());
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!PipelineError::Captcha("ERROR_CAPTCHA_UNSOLVABLE".into()).is_retryable());
        assert!(!PipelineError::ElementNotFound("a[href*='123']".into()).is_retryable());
        assert!(PipelineError::Timeout("poll".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::Api {
            status: 500,
            body: "oops".into(),
        };
        assert_eq!(err.to_string(), "APIエラー 500: oops");
    }
}
