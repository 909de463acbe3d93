//! 駐車違反データの型定義

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// NYCServ の召喚状画像エンドポイント
const SUMMONS_IMAGE_URL: &str = "http://nycserv.nyc.gov/NYCServWeb/ShowImage";

/// 支払い状況（金額から導出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationStatus {
    Paid,
    Outstanding,
    Unknown,
}

impl ViolationStatus {
    pub fn derive(amount_due: f64, payment_amount: f64) -> Self {
        if amount_due <= 0.0 && payment_amount > 0.0 {
            ViolationStatus::Paid
        } else if amount_due > 0.0 {
            ViolationStatus::Outstanding
        } else {
            ViolationStatus::Unknown
        }
    }
}

/// 駐車違反レコード
///
/// 識別キーは (plate, state, summons_number)。Open Data API 由来の項目は
/// 解析後に変更されず、スクレイピングは [`Violation::enrich`] で補足項目のみを追加する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub plate: String,
    pub state: String,
    pub license_type: Option<String>,
    pub summons_number: String,
    pub violation_code: Option<String>,
    pub violation_description: Option<String>,

    pub issue_date: Option<String>,
    pub violation_time: Option<String>,
    pub judgment_entry_date: Option<String>,

    pub fine_amount: f64,
    pub penalty_amount: f64,
    pub interest_amount: f64,
    pub reduction_amount: f64,
    pub payment_amount: f64,
    pub amount_due: f64,

    pub violation_location: Option<String>,
    pub precinct: Option<String>,
    pub county: Option<String>,
    pub issuing_agency: Option<String>,

    pub status: ViolationStatus,
    pub pdf_available: bool,
    pub summons_image_url: Option<String>,

    // スクレイピングで補足される項目
    pub hearing_status: Option<String>,
    pub hearing_date: Option<String>,
    pub current_amount_due: Option<f64>,
    pub local_pdf_path: Option<PathBuf>,
    pub enhanced_by_scraping: bool,

    pub last_updated: DateTime<Utc>,
}

impl Violation {
    /// APIの生レコードを正規化する
    ///
    /// 数値項目は欠損・解析不能なら 0.0、文字列項目は前後の空白を除去し空なら `None`。
    /// 召喚番号がないレコードは識別できないためエラーとする。
    pub fn from_raw(raw: &Value, plate: &str, state: &str) -> Result<Self, PipelineError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PipelineError::InvalidRecord(format!("not an object: {}", raw)))?;

        let text = |key: &str| obj.get(key).and_then(clean_str);
        let amount = |key: &str| obj.get(key).map(clean_amount).unwrap_or(0.0);

        let summons_number = text("summons_number")
            .ok_or_else(|| PipelineError::InvalidRecord("missing summons_number".into()))?;

        let amount_due = amount("amount_due");
        let payment_amount = amount("payment_amount");

        Ok(Self {
            plate: plate.to_string(),
            state: text("registration_state").unwrap_or_else(|| state.to_string()),
            license_type: text("license_type"),
            summons_image_url: Some(summons_image_url(&summons_number)),
            pdf_available: true,
            summons_number,
            violation_code: text("violation_code"),
            violation_description: text("violation_description"),
            issue_date: text("issue_date"),
            violation_time: text("violation_time"),
            judgment_entry_date: text("judgment_entry_date"),
            fine_amount: amount("fine_amount"),
            penalty_amount: amount("penalty_amount"),
            interest_amount: amount("interest_amount"),
            reduction_amount: amount("reduction_amount"),
            payment_amount,
            amount_due,
            violation_location: text("violation_location")
                .or_else(|| text("street_name"))
                .or_else(|| text("house_number")),
            precinct: text("precinct"),
            county: text("county"),
            issuing_agency: text("issuing_agency"),
            status: ViolationStatus::derive(amount_due, payment_amount),
            hearing_status: None,
            hearing_date: None,
            current_amount_due: None,
            local_pdf_path: None,
            enhanced_by_scraping: false,
            last_updated: Utc::now(),
        })
    }

    pub fn key(&self) -> (&str, &str, &str) {
        (&self.plate, &self.state, &self.summons_number)
    }

    /// スクレイピング結果を反映する（空の補足なら何も変えない）
    pub fn enrich(mut self, enrichment: Enrichment) -> Self {
        if enrichment.is_empty() {
            return self;
        }
        if let Some(amount) = enrichment.current_amount_due {
            self.current_amount_due = Some(amount);
        }
        if let Some(status) = enrichment.hearing_status {
            self.hearing_status = Some(status);
        }
        if let Some(date) = enrichment.hearing_date {
            self.hearing_date = Some(date);
        }
        if let Some(path) = enrichment.local_pdf_path {
            self.local_pdf_path = Some(path);
        }
        self.enhanced_by_scraping = true;
        self.last_updated = Utc::now();
        self
    }
}

/// 召喚番号から NYCServ の画像URLを組み立てる
pub fn summons_image_url(summons_number: &str) -> String {
    let search_id = base64::engine::general_purpose::STANDARD.encode(summons_number.as_bytes());
    format!(
        "{}?searchID={}&locationName=_____________________",
        SUMMONS_IMAGE_URL, search_id
    )
}

fn clean_str(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn clean_amount(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0)
}

/// 詳細ページから得た補足情報
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub current_amount_due: Option<f64>,
    pub hearing_status: Option<String>,
    pub hearing_date: Option<String>,
    pub local_pdf_path: Option<PathBuf>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.current_amount_due.is_none()
            && self.hearing_status.is_none()
            && self.hearing_date.is_none()
            && self.local_pdf_path.is_none()
    }
}

/// 1回の検索結果
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub plate: String,
    pub state: String,
    pub violations: Vec<Violation>,
    /// 正規化前のレコード数
    pub raw_count: usize,
    pub elapsed: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// クライアント単位の統計
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchStats {
    pub total_requests: u64,
    pub total_response_time: Duration,
}

impl FetchStats {
    pub fn record(&mut self, latency: Duration) {
        self.total_requests += 1;
        self.total_response_time += latency;
    }

    pub fn average_response_time(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_response_time.as_secs_f64() / self.total_requests as f64)
    }
}
