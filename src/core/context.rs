//! 请求上下文与调用结果
//!
//! RequestContext 由调用方构造并移交给编排器，在 Completion 中原样交还；编排器只会写入 elapsed。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::default_timeout_secs;
use crate::core::error::PromptError;
use crate::llm::{LanguageModel, LlmClient};
use crate::memory::{Attachment, ConversationKey, Message};

/// 一次提交的全部输入
#[derive(Clone)]
pub struct RequestContext {
    pub key: ConversationKey,
    pub user_input: String,
    pub attachments: Vec<Attachment>,
    pub model: LanguageModel,
    pub client: Arc<dyn LlmClient>,
    /// 超时（秒），None 时为 60
    pub timeout_secs: Option<u64>,
    /// 成功完成后由编排器写入
    pub elapsed: Option<Duration>,
}

impl RequestContext {
    pub fn new(
        key: ConversationKey,
        user_input: impl Into<String>,
        model: LanguageModel,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            key,
            user_input: user_input.into(),
            attachments: Vec::new(),
            model,
            client,
            timeout_secs: None,
            elapsed: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn effective_timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or_else(default_timeout_secs)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("key", &self.key)
            .field("user_input", &self.user_input)
            .field("attachments", &self.attachments.len())
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

/// 成功生成的回复
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedReply {
    pub message: Message,
    pub elapsed: Duration,
}

/// 一次提交的最终结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationOutcome {
    Generated(GeneratedReply),
    /// 已分类、需要报告给用户的失败
    Failed(PromptError),
    /// 什么也没发生：提交被去抖，或调用已被取消 / 抢占
    Skipped,
}

impl InvocationOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, InvocationOutcome::Skipped)
    }

    pub fn reply(&self) -> Option<&GeneratedReply> {
        match self {
            InvocationOutcome::Generated(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&PromptError> {
        match self {
            InvocationOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// 交还给调用方：上下文（可能已写入 elapsed）+ 结果
#[derive(Debug)]
pub struct Completion {
    pub context: RequestContext,
    pub outcome: InvocationOutcome,
}
