/// Publication traits 定义
///
/// 使用 trait 抽象 SIP PUBLISH 的发送方
use async_trait::async_trait;

use crate::error::PublishResult;
use crate::presence::PIDF_CONTENT_TYPE;
use crate::routing::Route;

pub const PRESENCE_EVENT: &str = "presence";

/// 认证凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// 用户名
    pub username: String,

    /// 密码
    pub password: String,

    /// 认证域 (realm)，None 时从 401/407 响应中提取
    pub realm: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }
}

/// 一次 PUBLISH 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// 账户地址 `user@domain`
    pub aor: String,
    pub credentials: Credentials,
    pub route: Route,
    pub event: &'static str,
    pub content_type: &'static str,
    /// None 表示刷新或删除
    pub body: Option<Vec<u8>>,
    pub expires: u32,
    /// SIP-If-Match 实体标签
    pub if_match: Option<String>,
}

impl PublishRequest {
    /// 携带出席文档的发布请求
    pub fn presence(
        aor: impl Into<String>,
        credentials: Credentials,
        route: Route,
        body: Vec<u8>,
        expires: u32,
    ) -> Self {
        Self {
            aor: aor.into(),
            credentials,
            route,
            event: PRESENCE_EVENT,
            content_type: PIDF_CONTENT_TYPE,
            body: Some(body),
            expires,
            if_match: None,
        }
    }

    pub fn with_if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }

    /// 删除已有发布：Expires 0，无消息体
    pub fn removal(&self, etag: Option<String>) -> Self {
        Self {
            body: None,
            expires: 0,
            if_match: etag,
            ..self.clone()
        }
    }

    pub fn is_removal(&self) -> bool {
        self.expires == 0 && self.body.is_none()
    }
}

/// 最终响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResponse {
    pub code: u16,
    pub reason: String,
    /// SIP-ETag
    pub etag: Option<String>,
    /// 服务器接受的过期时间
    pub expires: Option<u32>,
}

impl PublishResponse {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            etag: None,
            expires: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// 发布器 trait
///
/// 每次调用恰好发出一个 PUBLISH 事务（含一次认证重发），不做重试。
#[async_trait]
pub trait Publisher: Send + Sync {
    /// 发送 PUBLISH 并返回最终响应
    ///
    /// # 返回
    /// - `Ok(PublishResponse)`: 收到最终响应（包括非 2xx）
    /// - `Err`: 传输错误或超时
    async fn publish(&self, request: &PublishRequest) -> PublishResult<PublishResponse>;

    /// 删除发布
    ///
    /// 默认实现发送 Expires 0 的 PUBLISH
    async fn unpublish(&self, request: &PublishRequest) -> PublishResult<PublishResponse> {
        self.publish(request).await
    }
}
