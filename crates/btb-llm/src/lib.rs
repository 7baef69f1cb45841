use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use btb_error::{BtbError, Result};

/// 发送给模型的一段内容：文本或带 MIME 类型的二进制
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Binary { data: Vec<u8>, mime_type: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn binary(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Part::Binary {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(t),
            Part::Binary { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    /// 要求模型只输出 JSON
    pub json_mode: bool,
}

/// 模型调用能力：系统指令 + 有序内容片段 -> 文本
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, system: &str, parts: &[Part], options: &GenerateOptions)
        -> Result<String>;
}

fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// 将非 2xx 响应映射为错误；413 或提到 token 的 400 视为上下文超限
fn classify_failure(provider: &str, status: u16, body: &str) -> BtbError {
    let token_limit = status == 400 && body.to_ascii_lowercase().contains("token");
    if status == 413 || token_limit {
        BtbError::ContextTooLarge {
            provider: provider.to_string(),
            message: format!("status={} body={}", status, body),
        }
    } else {
        BtbError::LlmService {
            provider: provider.to_string(),
            message: format!("status={} body={}", status, body),
        }
    }
}

async fn ensure_success(provider: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let txt = resp.text().await.unwrap_or_default();
    Err(classify_failure(provider, status, &txt))
}

fn network_error(e: reqwest::Error) -> BtbError {
    BtbError::Network {
        operation: "http_request".to_string(),
        message: e.to_string(),
    }
}

// ========== Google Gemini ==========

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,   // e.g. gemini-2.5-pro
    pub api_url: String, // default https://generativelanguage.googleapis.com
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Deserialize)]
struct GeminiRespPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GeminiRespContent {
    #[serde(default)]
    parts: Vec<GeminiRespPart>,
}

#[derive(Deserialize)]
struct GeminiRespCandidate {
    content: Option<GeminiRespContent>,
}

#[derive(Deserialize)]
struct GeminiResp {
    #[serde(default)]
    candidates: Vec<GeminiRespCandidate>,
}

fn gemini_request(system: &str, parts: &[Part], options: &GenerateOptions) -> GeminiReq {
    let system_instruction = if system.trim().is_empty() {
        None
    } else {
        Some(GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text {
                text: system.to_string(),
            }],
        })
    };
    let parts = parts
        .iter()
        .map(|p| match p {
            Part::Text(text) => GeminiPart::Text { text: text.clone() },
            Part::Binary { data, mime_type } => GeminiPart::Inline {
                inline_data: GeminiInlineData {
                    mime_type: mime_type.clone(),
                    data: encode_base64(data),
                },
            },
        })
        .collect();
    GeminiReq {
        system_instruction,
        contents: vec![GeminiContent {
            role: Some("user"),
            parts,
        }],
        generation_config: GeminiGenerationConfig {
            temperature: options.temperature,
            response_mime_type: options.json_mode.then_some("application/json"),
        },
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    #[instrument(skip(self, system, parts), fields(model = %self.cfg.model, parts = parts.len()))]
    async fn generate(
        &self,
        system: &str,
        parts: &[Part],
        options: &GenerateOptions,
    ) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.cfg.api_url.trim_end_matches('/'),
            self.cfg.model
        );
        let body = gemini_request(system, parts, options);

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let resp = ensure_success("gemini", resp).await?;

        let data: GeminiResp = resp.json().await.map_err(network_error)?;
        let mut out = String::new();
        if let Some(content) = data.candidates.into_iter().next().and_then(|c| c.content) {
            for p in content.parts {
                if let Some(t) = p.text {
                    out.push_str(&t);
                }
            }
        }
        Ok(out)
    }
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String, // e.g. https://api.openai.com
    pub api_key: String,  // Bearer token
    pub model: String,    // e.g. gpt-4o
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiImageUrl {
    url: String,
}

#[derive(Serialize)]
struct OaiFile {
    filename: String,
    file_data: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OaiContentPart {
    Text { text: String },
    ImageUrl { image_url: OaiImageUrl },
    File { file: OaiFile },
}

#[derive(Serialize)]
#[serde(untagged)]
enum OaiContent {
    Plain(String),
    Parts(Vec<OaiContentPart>),
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: &'static str,
    content: OaiContent,
}

#[derive(Serialize)]
struct OaiResponseFormat {
    r#type: &'static str,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OaiResponseFormat>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

fn openai_request(
    model: &str,
    system: &str,
    parts: &[Part],
    options: &GenerateOptions,
) -> OaiChatReq {
    let mut messages = Vec::new();
    if !system.trim().is_empty() {
        messages.push(OaiChatReqMsg {
            role: "system",
            content: OaiContent::Plain(system.to_string()),
        });
    }
    let content = parts
        .iter()
        .enumerate()
        .map(|(i, p)| match p {
            Part::Text(text) => OaiContentPart::Text { text: text.clone() },
            Part::Binary { data, mime_type } => {
                let data_url = format!("data:{};base64,{}", mime_type, encode_base64(data));
                if mime_type.starts_with("image/") {
                    OaiContentPart::ImageUrl {
                        image_url: OaiImageUrl { url: data_url },
                    }
                } else {
                    OaiContentPart::File {
                        file: OaiFile {
                            filename: format!("attachment-{}", i + 1),
                            file_data: data_url,
                        },
                    }
                }
            }
        })
        .collect();
    messages.push(OaiChatReqMsg {
        role: "user",
        content: OaiContent::Parts(content),
    });
    OaiChatReq {
        model: model.to_string(),
        messages,
        temperature: options.temperature,
        response_format: options.json_mode.then_some(OaiResponseFormat {
            r#type: "json_object",
        }),
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    #[instrument(skip(self, system, parts), fields(model = %self.cfg.model, parts = parts.len()))]
    async fn generate(
        &self,
        system: &str,
        parts: &[Part],
        options: &GenerateOptions,
    ) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let body = openai_request(&self.cfg.model, system, parts, options);

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let resp = ensure_success("openai_compat", resp).await?;

        let data: OaiChatResp = resp.json().await.map_err(network_error)?;
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct AnthSource {
    r#type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthMessageContent {
    Text { text: String },
    Image { source: AnthSource },
    Document { source: AnthSource },
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: Vec<AnthMessageContent>,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
}

fn anthropic_request(
    model: &str,
    system: &str,
    parts: &[Part],
    options: &GenerateOptions,
) -> AnthMessageReq {
    let content = parts
        .iter()
        .map(|p| match p {
            Part::Text(text) => AnthMessageContent::Text { text: text.clone() },
            Part::Binary { data, mime_type } => {
                let source = AnthSource {
                    r#type: "base64",
                    media_type: mime_type.clone(),
                    data: encode_base64(data),
                };
                if mime_type.starts_with("image/") {
                    AnthMessageContent::Image { source }
                } else {
                    AnthMessageContent::Document { source }
                }
            }
        })
        .collect();
    // Claude 没有 JSON 模式，只能靠提示词约束
    let system = if options.json_mode {
        Some(format!("{}\nRespond with a single JSON object and nothing else.", system).trim().to_string())
    } else if system.trim().is_empty() {
        None
    } else {
        Some(system.to_string())
    };
    AnthMessageReq {
        model: model.to_string(),
        system,
        messages: vec![AnthMessageReqMsg {
            role: "user",
            content,
        }],
        max_tokens: 4096,
        temperature: options.temperature,
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    #[instrument(skip(self, system, parts), fields(model = %self.cfg.model, parts = parts.len()))]
    async fn generate(
        &self,
        system: &str,
        parts: &[Part],
        options: &GenerateOptions,
    ) -> Result<String> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let body = anthropic_request(&self.cfg.model, system, parts, options);

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let resp = ensure_success("anthropic", resp).await?;

        let data: AnthMessageResp = resp.json().await.map_err(network_error)?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        Ok(out)
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ModelProviderConfig {
    #[serde(rename = "gemini")]
    Gemini {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
}

pub fn make_model(cfg: ModelProviderConfig) -> Result<Box<dyn ModelClient>> {
    let model: Box<dyn ModelClient> = match cfg {
        ModelProviderConfig::Gemini {
            api_url,
            api_key,
            model,
        } => Box::new(GeminiClient::new(GeminiConfig {
            api_url: api_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            api_key,
            model,
        })),
        ModelProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            model,
        })),
        ModelProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
        } => Box::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
        })),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parts() -> Vec<Part> {
        vec![
            Part::text("REFERENCE DOCUMENT: A.pdf"),
            Part::binary(vec![0x25, 0x50, 0x44, 0x46], "application/pdf"),
            Part::text("User Query: meal penalty?"),
        ]
    }

    #[test]
    fn test_gemini_request_shape() {
        let options = GenerateOptions {
            temperature: Some(0.15),
            json_mode: false,
        };
        let body = serde_json::to_value(gemini_request("be precise", &sample_parts(), &options))
            .unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be precise");
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "REFERENCE DOCUMENT: A.pdf");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(parts[1]["inlineData"]["data"], "JVBERg==");
        assert!(body["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn test_gemini_json_mode_without_system() {
        let options = GenerateOptions {
            temperature: Some(0.1),
            json_mode: true,
        };
        let body = serde_json::to_value(gemini_request("", &sample_parts(), &options)).unwrap();
        assert!(body.get("systemInstruction").is_none());
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn test_openai_request_shape() {
        let options = GenerateOptions {
            temperature: Some(0.1),
            json_mode: true,
        };
        let body = serde_json::to_value(openai_request(
            "gpt-4o",
            "system text",
            &sample_parts(),
            &options,
        ))
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "system text");
        let content = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "file");
        assert!(content[1]["file"]["file_data"]
            .as_str()
            .unwrap()
            .starts_with("data:application/pdf;base64,"));
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_anthropic_request_shape() {
        let options = GenerateOptions {
            temperature: Some(0.15),
            json_mode: false,
        };
        let body = serde_json::to_value(anthropic_request(
            "claude",
            "system text",
            &sample_parts(),
            &options,
        ))
        .unwrap();
        assert_eq!(body["system"], "system text");
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[1]["type"], "document");
        assert_eq!(content[1]["source"]["media_type"], "application/pdf");
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("gemini", 413, "too big"),
            BtbError::ContextTooLarge { .. }
        ));
        assert!(matches!(
            classify_failure("gemini", 400, "input token count exceeds limit"),
            BtbError::ContextTooLarge { .. }
        ));
        assert!(matches!(
            classify_failure("gemini", 500, "boom"),
            BtbError::LlmService { .. }
        ));
    }

    #[test]
    fn test_provider_config_from_tagged_json() {
        let cfg: ModelProviderConfig = serde_json::from_str(
            r#"{"kind":"gemini","api_key":"k","model":"gemini-2.5-pro","api_url":null}"#,
        )
        .unwrap();
        assert!(matches!(cfg, ModelProviderConfig::Gemini { .. }));
        assert!(make_model(cfg).is_ok());
    }
}
