use thiserror::Error;

/// 发布操作的Result类型别名
pub type PublishResult<T> = Result<T, PublishError>;

/// PUBLISH 相关错误类型
#[derive(Error, Debug)]
pub enum PublishError {
    /// SIP协议栈错误
    #[error("SIP stack error: {0}")]
    Sip(#[from] rsipstack::Error),

    /// URI解析错误
    #[error("URI parse error: {0}")]
    UriParse(#[from] rsip::Error),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SIP protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out after {duration}ms")]
    Timeout { duration: u64 },

    /// 认证失败 (401/403/407)
    #[error("Authentication failed: {code} {reason}")]
    AuthenticationFailed { code: u16, reason: String },

    #[error("Publication rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("System error: {0}")]
    System(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl PublishError {
    /// 判断错误是否可恢复（控制器据此决定重试还是终止）
    pub fn is_recoverable(&self) -> bool {
        match self {
            PublishError::AuthenticationFailed { .. } => false,
            PublishError::InvalidUri(_) => false,
            PublishError::UriParse(_) => false,
            PublishError::Sip(_) => true,
            PublishError::Transport(_) => true,
            PublishError::Protocol(_) => true,
            PublishError::Timeout { .. } => true,
            PublishError::Rejected { .. } => true,
            PublishError::System(_) => true,
            PublishError::Other(_) => true,
        }
    }

    /// 获取标准错误代码，用于日志分析
    pub fn error_code(&self) -> &'static str {
        match self {
            PublishError::Sip(_) => "SIP_STACK_ERROR",
            PublishError::UriParse(_) => "URI_PARSE_ERROR",
            PublishError::InvalidUri(_) => "INVALID_URI",
            PublishError::Transport(_) => "TRANSPORT_ERROR",
            PublishError::Protocol(_) => "SIP_PROTOCOL_ERROR",
            PublishError::Timeout { .. } => "NETWORK_TIMEOUT",
            PublishError::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            PublishError::Rejected { .. } => "PUBLICATION_REJECTED",
            PublishError::System(_) => "SYSTEM_ERROR",
            PublishError::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// 获取SIP状态码（如果有）
    pub fn sip_status_code(&self) -> Option<u16> {
        match self {
            PublishError::AuthenticationFailed { code, .. } => Some(*code),
            PublishError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 根据最终响应码创建错误
    pub fn from_status(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if is_auth_failure(code) {
            PublishError::AuthenticationFailed { code, reason }
        } else {
            PublishError::Rejected { code, reason }
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        PublishError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        PublishError::Protocol(msg.into())
    }
}

impl From<tokio::time::error::Elapsed> for PublishError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PublishError::Timeout { duration: 32000 } // Timer F
    }
}

/// 401/403/407 不再重试
pub fn is_auth_failure(code: u16) -> bool {
    matches!(code, 401 | 403 | 407)
}

/// DNS 解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS lookup timed out")]
    Timeout,

    #[error("Domain not found: {0}")]
    NxDomain(String),

    #[error("No usable transport for {0}")]
    NoUsableTransport(String),

    #[error("DNS lookup failed: {0}")]
    Lookup(String),
}

impl From<trust_dns_resolver::error::ResolveError> for DnsError {
    fn from(err: trust_dns_resolver::error::ResolveError) -> Self {
        use trust_dns_resolver::error::ResolveErrorKind;
        match err.kind() {
            ResolveErrorKind::Timeout => DnsError::Timeout,
            ResolveErrorKind::NoRecordsFound { query, .. } => {
                DnsError::NxDomain(query.name().to_string())
            }
            _ => DnsError::Lookup(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("unknown account {name}. Available accounts: {available}")]
    UnknownAccount { name: String, available: String },

    #[error("account {0} is not enabled")]
    AccountDisabled(String),
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        ConfigError::Parse(s.to_string())
    }
}

/// 出席文档序列化错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("presence entity must not be empty")]
    EmptyEntity,

    #[error("duplicate {element} value: {value}")]
    DuplicateValue { element: &'static str, value: String },

    #[error("sphere window ends before it starts")]
    InvertedSphereWindow,

    #[error("{element} contains characters not allowed in XML")]
    InvalidCharacters { element: &'static str },
}
