//! 调用失败的两层表示
//!
//! InvocationFailure 是 worker 看到的原始失败（后端错误 / 超时 / 取消）；
//! PromptError 是经 classifier 翻译后唯一允许交给调用方的错误分类。

use thiserror::Error;

use crate::llm::LlmError;

/// Jan 本地模型未激活时给用户的固定指引
pub const JAN_MODEL_NOT_ACTIVE: &str =
    "Selected Jan model is not active. Download and make it active or add API Key in Jan settings.";

/// 面向调用方的错误分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    /// 本地模型未激活，用户可自行修复
    #[error("{0}")]
    ModelNotActive(String),

    /// 网络或提供方侧失败，携带原始信息
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// 被新的提交或显式取消抢占，不向最终用户展示
    #[error("Cancelled")]
    Cancelled,
}

impl PromptError {
    /// 刚写入的 User 消息是否需要撤销；Cancelled 的撤销由取消方完成
    pub fn rolls_back_memory(&self) -> bool {
        !matches!(self, PromptError::Cancelled)
    }

    /// 是否需要向用户报告
    pub fn is_reportable(&self) -> bool {
        !matches!(self, PromptError::Cancelled)
    }
}

/// worker 侧的原始失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationFailure {
    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("deadline of {secs}s elapsed")]
    Timeout { secs: u64 },

    #[error("interrupted")]
    Cancelled,
}

/// worker 在交付结果之前连同请求上下文一起消失（通常是运行时正在关闭）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Prompt worker stopped before resolving the request")]
pub struct WorkerStopped;
