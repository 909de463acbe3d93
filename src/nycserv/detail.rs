//! 詳細ページのセル解析

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::open_data::Enrichment;

/// ラベル付きセルの生テキスト
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DetailCells {
    #[serde(default)]
    pub amount_due: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub hearing: Option<String>,
}

fn amount_re() -> &'static Regex {
    static AMOUNT_RE: OnceLock<Regex> = OnceLock::new();
    AMOUNT_RE.get_or_init(|| {
        Regex::new(r"\$\s*([0-9][0-9,]*(?:\.[0-9]+)?)").expect("amount pattern is valid")
    })
}

/// `$` の直後にある最初の数値
pub fn parse_amount(text: &str) -> Option<f64> {
    let captures = amount_re().captures(text)?;
    captures[1].replace(',', "").parse::<f64>().ok()
}

fn non_blank(text: &Option<String>) -> Option<String> {
    text.as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

impl DetailCells {
    pub fn to_enrichment(&self) -> Enrichment {
        Enrichment {
            current_amount_due: self.amount_due.as_deref().and_then(parse_amount),
            hearing_status: non_blank(&self.status),
            hearing_date: non_blank(&self.hearing),
            local_pdf_path: None,
        }
    }
}
