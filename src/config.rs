//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PROMPTEXEC__*` 覆盖（双下划线表示嵌套，如 `PROMPTEXEC__LLM__PROVIDER=jan`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::llm::ModelProvider;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [app] 段：应用名与系统提示词
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话为空时写入的 system 提示词（会再拼接固定的格式后缀）
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// 若设置且可读，覆盖 system_prompt
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: default_system_prompt(),
            system_prompt_file: None,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a software developer with expert knowledge in any programming language.".to_string()
}

impl AppSection {
    /// 优先读取 system_prompt_file，失败时回退到 system_prompt
    pub fn resolve_system_prompt(&self) -> String {
        self.system_prompt_file
            .as_ref()
            .and_then(|p| match std::fs::read_to_string(p) {
                Ok(s) => Some(s.trim().to_string()),
                Err(e) => {
                    tracing::warn!("System prompt file {} unreadable ({}), using inline prompt", p.display(), e);
                    None
                }
            })
            .unwrap_or_else(|| self.system_prompt.clone())
    }
}

/// [llm] 段：提供方、模型、端点与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: ModelProvider,
    #[serde(default = "default_model")]
    pub model: String,
    /// 未设置时使用提供方默认地址
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 单次模型调用超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> ModelProvider {
    ModelProvider::Mock
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

pub(crate) fn default_timeout_secs() -> u64 {
    60
}

/// 仓库内置配置的候选位置，取第一个存在的
const DEFAULT_CONFIG_CANDIDATES: [&str; 3] = [
    "config/default.toml",
    "../config/default.toml",
    "default.toml",
];

/// 组装 AppConfig，后叠加的源覆盖先前的键：
/// 内置 default.toml → 命令行指定的文件（不存在时忽略）→ `PROMPTEXEC__SECTION__KEY` 环境变量。
/// 所有源都缺失时得到各字段的默认值
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let bundled = DEFAULT_CONFIG_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists());
    let explicit = config_path.filter(|path| path.exists());

    let mut sources = config::Config::builder();
    for path in bundled.into_iter().map(Path::to_path_buf).chain(explicit) {
        tracing::debug!(path = %path.display(), "Loading config file");
        sources = sources.add_source(config::File::from(path));
    }

    sources
        .add_source(
            config::Environment::with_prefix("PROMPTEXEC")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
