//! NYCServ 補足スクレイピングモジュール
//!
//! Open Data にない現在の支払額・審理状況・書類を NYCServ の検索サイトから取得する

mod browser;
mod detail;
mod documents;
mod scraper;

pub use browser::{ChromeLauncher, ChromeSession};
pub use detail::{parse_amount, DetailCells};
pub use documents::DocumentStore;
pub use scraper::{Enhancer, NYCSERV_SEARCH_URL};

#[cfg(test)]
pub(crate) use scraper::tests::{enhancer as test_enhancer, FakeSite};
