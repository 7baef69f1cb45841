use btb_citation::context::{
    ContextBudget, AUDIT_REFERENCE_CHAR_BUDGET, AUDIT_TARGET_CHAR_BUDGET, CHAT_DOC_CHAR_BUDGET,
};
use btb_citation::extract::MAX_PDF_PAGES;
use btb_llm::ModelProviderConfig;
use serde::Deserialize;
use tracing::info;

pub const CONFIG_ENV: &str = "BTB_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub model_provider: ModelCfgYaml,
    #[serde(default)]
    pub extractor: Option<ExtractorCfg>,
    #[serde(default)]
    pub storage: StorageCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
}

#[derive(Debug, Deserialize)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ModelCfgYaml {
    pub kind: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractorCfg {
    pub url: Option<String>,
    pub token_env: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_pdf_pages: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StorageCfg {
    pub path: String,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            path: "data/bythebook".into(),
        }
    }
}

impl StorageCfg {
    /// 路径为空时不落盘，项目设置只保存在内存里
    pub fn persistent_path(&self) -> Option<&str> {
        let path = self.path.trim();
        (!path.is_empty()).then_some(path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsCfg {
    pub chat_doc_chars: usize,
    pub audit_reference_chars: usize,
    pub audit_target_chars: usize,
    pub max_upload_bytes: usize,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            chat_doc_chars: CHAT_DOC_CHAR_BUDGET,
            audit_reference_chars: AUDIT_REFERENCE_CHAR_BUDGET,
            audit_target_chars: AUDIT_TARGET_CHAR_BUDGET,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl LimitsCfg {
    pub fn budget(&self) -> ContextBudget {
        ContextBudget {
            chat_doc_chars: self.chat_doc_chars,
            audit_reference_chars: self.audit_reference_chars,
            audit_target_chars: self.audit_target_chars,
        }
    }
}

impl ExtractorCfg {
    pub fn max_pdf_pages(&self) -> usize {
        self.max_pdf_pages.unwrap_or(MAX_PDF_PAGES)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms.unwrap_or(15_000))
    }
}

impl AppConfig {
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// 按 kind 构造模型配置，API key 从 api_key_env 指定的环境变量读取
    pub fn model_provider_config(&self) -> anyhow::Result<ModelProviderConfig> {
        self.model_provider_config_with(|key| std::env::var(key).ok())
    }

    fn model_provider_config_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ModelProviderConfig> {
        let m = &self.model_provider;
        let read_key = |default_env: &str| -> anyhow::Result<String> {
            let key = m.api_key_env.as_deref().unwrap_or(default_env);
            lookup(key).ok_or_else(|| anyhow::anyhow!("missing env {}", key))
        };
        let cfg = match m.kind.as_str() {
            "gemini" => ModelProviderConfig::Gemini {
                api_url: m.api_url.clone(),
                api_key: read_key("GEMINI_API_KEY")?,
                model: m.model.clone(),
            },
            "openai_compat" => ModelProviderConfig::OpenAiCompat {
                base_url: m
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".into()),
                api_key: read_key("OPENAI_API_KEY")?,
                model: m.model.clone(),
            },
            "anthropic" => ModelProviderConfig::Anthropic {
                api_url: m.api_url.clone(),
                api_key: read_key("ANTHROPIC_API_KEY")?,
                model: m.model.clone(),
            },
            other => anyhow::bail!("unsupported model provider kind={}", other),
        };
        Ok(cfg)
    }
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let s = std::fs::read_to_string(&path)?;
    let cfg = AppConfig::parse(&s)?;
    info!(path = %path, "load_config: {:?}", cfg);
    Ok(cfg)
}
