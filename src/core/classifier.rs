//! 错误分类：原始失败 + 提供方 → PromptError
//!
//! 纯函数，不读记忆、无副作用；编排器只通过这里把原始错误交给调用方。

use crate::core::error::{InvocationFailure, PromptError, JAN_MODEL_NOT_ACTIVE};
use crate::llm::ModelProvider;

pub fn classify(failure: &InvocationFailure, provider: ModelProvider) -> PromptError {
    match failure {
        InvocationFailure::Timeout { secs } => PromptError::Timeout { secs: *secs },
        InvocationFailure::Cancelled => PromptError::Cancelled,
        InvocationFailure::Provider(_) if provider.reports_inactive_model() => {
            PromptError::ModelNotActive(inactive_model_message(provider))
        }
        InvocationFailure::Provider(e) => PromptError::ProviderUnavailable(e.to_string()),
    }
}

fn inactive_model_message(provider: ModelProvider) -> String {
    match provider {
        ModelProvider::Jan => JAN_MODEL_NOT_ACTIVE.to_string(),
        other => format!("Selected {} model is not active.", other),
    }
}
