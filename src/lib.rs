//! promptexec - 单会话 LLM 调用编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求上下文、错误分类、单飞调用编排器
//! - **llm**: LLM 客户端抽象、提供方标识与实现（OpenAI 兼容 / Mock）
//! - **memory**: 按会话隔离的对话历史与用户消息组装
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{
    Completion, InvocationOutcome, PromptError, PromptOrchestrator, RequestContext,
};
