//! プロキシプールモジュール
//!
//! ブラウザセッションの送信元を分散させるためのプロキシを管理する

mod pool;
mod types;

pub use pool::{HttpProber, ProxyPool, ProxyProber, FAILURE_THRESHOLD};
pub use types::{PoolStats, ProxyEndpoint, ProxyScheme};

#[cfg(test)]
pub(crate) use pool::tests::{pool_of, ScriptedProber};
