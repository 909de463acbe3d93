//! NYC 駐車違反取得ライブラリ
//!
//! - NYC Open Data (SODA) から違反データを一括取得
//! - NYCServ 検索サイトをブラウザで巡回し、現在の支払額・審理状況・書類を補足
//! - CAPTCHA は 2Captcha、送信元はプロキシプールで分散
//!
//! # 使用例
//!
//! ```rust,ignore
//! use violation_scraper::{AcquisitionConfig, AcquisitionRequest, AcquisitionService};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut service = AcquisitionService::from_config(AcquisitionConfig::from_env()).unwrap();
//!
//!     let request = AcquisitionRequest::new("AW716M", "NJ")
//!         .with_max_enhance(10)
//!         .with_download_documents(false);
//!
//!     let result = service.call(request).await.unwrap();
//!     println!("Violations: {} ({} enhanced)", result.total_violations, result.enhanced_violations);
//! }
//! ```
//!
//! # Open Data のみ
//!
//! ```rust,ignore
//! use violation_scraper::{AcquisitionConfig, ViolationsApi};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut api = ViolationsApi::new(&AcquisitionConfig::default()).unwrap();
//!     let outcome = api.search_violations("AW716M", "NJ", Some(100)).await;
//!     println!("Found: {}", outcome.violations.len());
//! }
//! ```

pub mod captcha;
pub mod config;
pub mod error;
pub mod nycserv;
pub mod open_data;
pub mod proxy;
pub mod service;
pub mod traits;

// 主要な型をリエクスポート
pub use config::AcquisitionConfig;
pub use error::PipelineError;
pub use service::{AcquisitionRequest, AcquisitionResult, AcquisitionService, HybridCoordinator};
pub use traits::{LookupSession, SessionLauncher};

pub use captcha::{CaptchaClient, CaptchaOutcome, Challenge};
pub use nycserv::{ChromeLauncher, Enhancer};
pub use open_data::{Violation, ViolationStatus, ViolationsApi};
pub use proxy::{ProxyEndpoint, ProxyPool};
