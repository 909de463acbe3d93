//! 2Captcha ソルバーモジュール
//!
//! ウィジェット型・画像型チャレンジを外部ソルバーへ委託する

mod client;
mod types;

pub use client::{CaptchaClient, SolverTransport, TwoCaptchaTransport};
pub use types::{
    CaptchaOutcome, CaptchaStats, CaptchaTask, Challenge, ChallengeKind, SolverReply, NOT_READY,
};

#[cfg(test)]
pub(crate) use client::tests::{client as test_client, ScriptedSolver};
