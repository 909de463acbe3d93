//! NYC Open Data 駐車違反 API モジュール
//!
//! 公開データセットを検索し、正規化した違反レコードを返す

mod client;
mod types;

pub use client::{PageFetcher, PageQuery, SodaFetcher, ViolationsApi};
pub use types::{
    summons_image_url, Enrichment, FetchOutcome, FetchStats, Violation, ViolationStatus,
};

#[cfg(test)]
pub(crate) use client::tests::{page as test_page, ScriptedFetcher};
