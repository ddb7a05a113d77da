//! 模型提供方标识与模型句柄
//!
//! ModelProvider 决定默认端点、是否存在「本地模型未激活」这一类错误；
//! LanguageModel 决定会话首条 System 消息是否可发送（OpenAI o1 系列不接受）。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 支持的提供方
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAi,
    DeepSeek,
    Jan,
    Ollama,
    LmStudio,
    /// 任意 OpenAI 兼容端点，需配置 base_url
    Custom,
    Mock,
}

impl ModelProvider {
    /// 该提供方的默认 API 地址；None 表示使用客户端库默认值或必须显式配置
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ModelProvider::DeepSeek => Some("https://api.deepseek.com"),
            ModelProvider::Jan => Some("http://localhost:1337/v1"),
            ModelProvider::Ollama => Some("http://localhost:11434/v1"),
            ModelProvider::LmStudio => Some("http://localhost:1234/v1"),
            ModelProvider::OpenAi | ModelProvider::Custom | ModelProvider::Mock => None,
        }
    }

    /// 本地服务可能处于「模型未下载 / 未启动」状态，任何非超时失败都归因于此
    pub fn reports_inactive_model(&self) -> bool {
        matches!(self, ModelProvider::Jan)
    }

    /// 本地提供方不需要真实 API Key
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ModelProvider::Jan | ModelProvider::Ollama | ModelProvider::LmStudio | ModelProvider::Mock
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "OpenAI",
            ModelProvider::DeepSeek => "DeepSeek",
            ModelProvider::Jan => "Jan",
            ModelProvider::Ollama => "Ollama",
            ModelProvider::LmStudio => "LMStudio",
            ModelProvider::Custom => "CustomOpenAI",
            ModelProvider::Mock => "Mock",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 已解析的模型：提供方 + 模型名
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageModel {
    pub provider: ModelProvider,
    pub model_name: String,
}

impl LanguageModel {
    pub fn new(provider: ModelProvider, model_name: impl Into<String>) -> Self {
        Self {
            provider,
            model_name: model_name.into(),
        }
    }

    /// o1 推理模型拒绝 system 角色消息
    pub fn accepts_system_message(&self) -> bool {
        !(self.provider == ModelProvider::OpenAi
            && self.model_name.to_lowercase().starts_with("o1"))
    }
}

impl fmt::Display for LanguageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_name)
    }
}
