use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum BtbError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("验证失败: {message}")]
    Validation { message: String },

    /// 同一会话已有请求在处理中
    #[error("资源冲突: {details}")]
    Conflict { details: String },

    // === 技术错误 ===
    #[error("模型服务错误 ({provider}): {message}")]
    LlmService { provider: String, message: String },

    /// 请求上下文超出模型容量（文档过多或过大）
    #[error("上下文超出模型容量 ({provider}): {message}")]
    ContextTooLarge { provider: String, message: String },

    #[error("文本抽取失败: {file}")]
    Extraction { file: String, message: String },

    #[error("存储错误: {operation}")]
    Storage { operation: String, message: String },

    #[error("外部服务不可用: {service}")]
    ServiceUnavailable { service: String },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub project: Option<String>,
    pub document: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl BtbError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BtbError::NotFound { .. } | BtbError::InvalidRequest { .. } => ErrorSeverity::Low,
            BtbError::Validation { .. } | BtbError::Conflict { .. } => ErrorSeverity::Medium,
            BtbError::Extraction { .. } => ErrorSeverity::Low,
            BtbError::LlmService { .. } | BtbError::ContextTooLarge { .. } => ErrorSeverity::Medium,
            BtbError::ServiceUnavailable { .. }
            | BtbError::Network { .. }
            | BtbError::Timeout { .. } => ErrorSeverity::Medium,
            BtbError::Storage { .. } | BtbError::Serialization { .. } => ErrorSeverity::High,
            BtbError::Internal { .. } | BtbError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为上下文超限类错误。
    ///
    /// 提供方并不总是返回 413，很多时候只在消息里提到 token 限制，
    /// 因此同时检查消息内容。
    pub fn is_context_overflow(&self) -> bool {
        match self {
            BtbError::ContextTooLarge { .. } => true,
            BtbError::LlmService { message, .. } | BtbError::InvalidRequest { reason: message } => {
                mentions_token_limit(message)
            }
            _ => false,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    project = ?metadata.project,
                    document = ?metadata.document,
                    error = %self,
                    "业务错误"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    project = ?metadata.project,
                    document = ?metadata.document,
                    error = %self,
                    context = ?metadata.context,
                    "技术错误"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    project = ?metadata.project,
                    document = ?metadata.document,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "严重错误"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            BtbError::NotFound { .. } => 404,
            BtbError::InvalidRequest { .. } => 400,
            BtbError::Validation { .. } => 400,
            BtbError::Conflict { .. } => 409,
            BtbError::ContextTooLarge { .. } => 413,
            BtbError::Extraction { .. } => 422,
            BtbError::LlmService { .. } => 502,
            BtbError::ServiceUnavailable { .. } => 503,
            BtbError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            BtbError::NotFound { .. } => "请求的资源不存在".to_string(),
            BtbError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            BtbError::Validation { .. } => "输入数据验证失败，请检查格式".to_string(),
            BtbError::Conflict { .. } => "上一个请求仍在处理中，请稍候".to_string(),
            BtbError::ContextTooLarge { .. } => "文档总量超出模型容量，请移除部分文档".to_string(),
            BtbError::Extraction { .. } => "无法从该文件中抽取文本".to_string(),
            BtbError::LlmService { .. } => "模型服务出错，请重新提交".to_string(),
            BtbError::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试".to_string(),
            BtbError::Timeout { .. } => "请求超时，请重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

fn mentions_token_limit(message: &str) -> bool {
    message.to_ascii_lowercase().contains("token")
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                project: None,
                document: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn project(mut self, project: &str) -> Self {
        self.metadata.project = Some(project.to_string());
        self
    }

    pub fn document(mut self, document: &str) -> Self {
        self.metadata.document = Some(document.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &BtbError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, BtbError>;

// === 转换实现 ===

impl From<serde_json::Error> for BtbError {
    fn from(err: serde_json::Error) -> Self {
        BtbError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BtbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BtbError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            BtbError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            BtbError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<sled::Error> for BtbError {
    fn from(err: sled::Error) -> Self {
        BtbError::Storage {
            operation: "sled".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for BtbError {
    fn from(err: tokio::task::JoinError) -> Self {
        BtbError::Internal {
            message: "task_join".to_string(),
            details: Some(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for BtbError {
    fn from(err: anyhow::Error) -> Self {
        BtbError::Internal {
            message: "anyhow".to_string(),
            details: Some(err.to_string()),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for BtbError {
    fn into_response(self) -> axum::response::Response {
        let status_code =
            StatusCode::from_u16(self.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}
