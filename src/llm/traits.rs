//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / 本地 Jan、Ollama、LM Studio / Mock）实现 LlmClient：给定有序消息，返回生成文本或原始错误。
//! 原始错误只在 core::classifier 中被翻译成 PromptError，不会直接交给调用方。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 后端调用的原始失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 网络 / 服务端错误，保留原始信息便于诊断
    #[error("{0}")]
    Request(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model returned no content")]
    EmptyResponse,

    /// 调用任务异常退出（panic 等）
    #[error("Model call aborted: {0}")]
    Aborted(String),
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
