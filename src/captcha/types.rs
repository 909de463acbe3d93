//! CAPTCHA 関連の型定義

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// 解答待ちを示すソルバーの応答
pub const NOT_READY: &str = "CAPCHA_NOT_READY";

/// チャレンジの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// reCAPTCHA v2 などの対話型ウィジェット
    Widget,
    Image,
}

impl ChallengeKind {
    /// 1件あたりの概算コスト (USD)
    pub fn cost(&self) -> f64 {
        match self {
            ChallengeKind::Widget => 0.002,
            ChallengeKind::Image => 0.001,
        }
    }
}

/// ページ上で検出したチャレンジ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Widget { site_key: String, page_url: String },
    Image { image: Vec<u8> },
}

impl Challenge {
    pub fn kind(&self) -> ChallengeKind {
        match self {
            Challenge::Widget { .. } => ChallengeKind::Widget,
            Challenge::Image { .. } => ChallengeKind::Image,
        }
    }
}

/// ソルバーに登録済みのタスク
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub id: String,
    pub kind: ChallengeKind,
    pub created_at: Instant,
}

/// 解答の最終結果
#[derive(Debug, Clone, PartialEq)]
pub enum CaptchaOutcome {
    Solved {
        task_id: String,
        token: String,
    },
    /// 登録失敗時は `task_id` なし
    Failed {
        task_id: Option<String>,
        reason: String,
    },
    TimedOut {
        task_id: String,
        elapsed: Duration,
    },
}

impl CaptchaOutcome {
    pub fn token(&self) -> Option<&str> {
        match self {
            CaptchaOutcome::Solved { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, CaptchaOutcome::Solved { .. })
    }
}

/// in.php / res.php の JSON 応答 (`json=1`)
#[derive(Debug, Clone, Deserialize)]
pub struct SolverReply {
    pub status: i64,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub error_text: Option<String>,
}

impl SolverReply {
    pub fn ok(request: impl Into<String>) -> Self {
        Self {
            status: 1,
            request: Value::String(request.into()),
            error_text: None,
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            status: 0,
            request: Value::String(code.into()),
            error_text: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 1
    }

    pub fn request_text(&self) -> String {
        match &self.request {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// エラーコード（`error_text` がなければ `request`）
    pub fn error_code(&self) -> String {
        self.error_text
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.request_text())
    }

    pub fn is_not_ready(&self) -> bool {
        !self.is_ok() && (self.request_text() == NOT_READY || self.error_text.as_deref() == Some(NOT_READY))
    }
}

/// ソルバー統計
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptchaStats {
    pub total_solved: u64,
    pub total_failed: u64,
    pub total_cost: f64,
}

impl CaptchaStats {
    pub fn record(&mut self, kind: ChallengeKind, outcome: &CaptchaOutcome) {
        if outcome.is_solved() {
            self.total_solved += 1;
            self.total_cost += kind.cost();
        } else {
            self.total_failed += 1;
        }
    }

    /// 成功率 (%)
    pub fn success_rate(&self) -> f64 {
        let attempts = self.total_solved + self.total_failed;
        if attempts == 0 {
            0.0
        } else {
            self.total_solved as f64 / attempts as f64 * 100.0
        }
    }
}
