//! LLM 层：客户端抽象、提供方标识与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod provider;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use provider::{LanguageModel, ModelProvider};
pub use traits::{LlmClient, LlmError};

use crate::config::LlmSection;

/// 根据 [llm] 配置创建模型句柄与客户端：Mock 直接回显，其余走 OpenAI 兼容端点
pub fn create_client(cfg: &LlmSection) -> (LanguageModel, Arc<dyn LlmClient>) {
    let model = LanguageModel::new(cfg.provider, cfg.model.clone());

    if cfg.provider == ModelProvider::Mock {
        tracing::warn!("Provider is mock, replies are echoes of the input");
        return (model, Arc::new(MockLlmClient));
    }

    let base_url = cfg
        .base_url
        .clone()
        .or_else(|| cfg.provider.default_base_url().map(String::from));
    let api_key = std::env::var(&cfg.api_key_env).ok().or_else(|| {
        // 本地服务通常不校验 Key，给一个占位值避免回落到 OPENAI_API_KEY
        cfg.provider.is_local().then(|| "local".to_string())
    });

    tracing::info!(
        "Using {} LLM ({}) at {}",
        cfg.provider,
        cfg.model,
        base_url.as_deref().unwrap_or("default endpoint")
    );
    let client = OpenAiClient::new(base_url.as_deref(), &cfg.model, api_key.as_deref());
    (model, Arc::new(client))
}
