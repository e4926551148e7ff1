/// 启动配置
///
/// 在控制循环启动前完成全部校验，任何错误都让进程以状态 1 退出
use std::time::Duration;

use crate::controller::{ControllerConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::publication::Credentials;
use crate::routing::{ResolveTarget, Transport};

/// 一个 SIP 账户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub username: String,
    pub domain: String,
    pub password: String,
    pub enabled: bool,
}

impl AccountConfig {
    /// 解析 `user@domain`
    pub fn parse(id: &str, password: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.trim().trim_start_matches("sip:");
        let (username, domain) = id
            .split_once('@')
            .filter(|(u, d)| !u.is_empty() && !d.is_empty() && !d.contains('@'))
            .ok_or_else(|| ConfigError::Parse(format!("account must be user@domain: {}", id)))?;
        Ok(Self {
            username: username.to_string(),
            domain: domain.to_string(),
            password: password.into(),
            enabled: true,
        })
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `user@domain`
    pub fn id(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

/// 解析逗号分隔的传输列表，保持顺序并去重
pub fn parse_transports(value: &str) -> Result<Vec<Transport>, ConfigError> {
    let mut transports = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let transport: Transport = item.parse()?;
        if !transports.contains(&transport) {
            transports.push(transport);
        }
    }
    if transports.is_empty() {
        return Err(ConfigError::Missing("transports".to_string()));
    }
    Ok(transports)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub outbound_proxy: Option<ResolveTarget>,
    pub transports: Vec<Transport>,
    /// 发布周期
    pub interval: Duration,
    /// PUBLISH Expires
    pub expires: u32,
    pub user_agent: String,
    pub trace_sip: bool,
    pub trace_notifications: bool,
}

impl Config {
    pub fn new(accounts: Vec<AccountConfig>) -> Self {
        Self {
            accounts,
            outbound_proxy: None,
            transports: vec![Transport::Udp, Transport::Tcp],
            interval: Duration::from_secs(60),
            expires: 600,
            user_agent: crate::default_user_agent(),
            trace_sip: false,
            trace_notifications: false,
        }
    }

    pub fn with_outbound_proxy(mut self, proxy: Option<&str>) -> Result<Self, ConfigError> {
        self.outbound_proxy = match proxy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => Some(ResolveTarget::parse_proxy(p)?),
            None => None,
        };
        Ok(self)
    }

    pub fn with_transports(mut self, value: &str) -> Result<Self, ConfigError> {
        self.transports = parse_transports(value)?;
        Ok(self)
    }

    pub fn with_interval(mut self, seconds: u64) -> Result<Self, ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::Invalid("interval must be positive".to_string()));
        }
        self.interval = Duration::from_secs(seconds);
        Ok(self)
    }

    pub fn with_expires(mut self, expires: u32) -> Result<Self, ConfigError> {
        if expires == 0 {
            return Err(ConfigError::Invalid("expires must be positive".to_string()));
        }
        self.expires = expires;
        Ok(self)
    }

    /// 选择账户；`name` 为 None 时取第一个账户
    pub fn select_account(&self, name: Option<&str>) -> Result<&AccountConfig, ConfigError> {
        let account = match name {
            Some(name) => {
                let name = name.trim().trim_start_matches("sip:");
                self.accounts.iter().find(|a| a.id() == name)
            }
            None => self.accounts.first(),
        };

        let account = account.ok_or_else(|| ConfigError::UnknownAccount {
            name: name.unwrap_or_default().to_string(),
            available: self
                .accounts
                .iter()
                .map(|a| a.id())
                .collect::<Vec<_>>()
                .join(", "),
        })?;

        if !account.enabled {
            return Err(ConfigError::AccountDisabled(account.id()));
        }
        Ok(account)
    }

    /// 出站代理优先，否则为账户域
    pub fn resolve_target(&self, account: &AccountConfig) -> ResolveTarget {
        self.outbound_proxy
            .clone()
            .unwrap_or_else(|| ResolveTarget::domain(account.domain.clone()))
    }

    /// 生成控制器配置
    ///
    /// 代理上的 `;transport=` 只在解析时从已启用的传输中挑选，未启用时解析失败
    pub fn controller_config(&self, account: &AccountConfig) -> ControllerConfig {
        let target = self.resolve_target(account);
        ControllerConfig::new(account.id(), account.credentials(), target)
            .with_transports(self.transports.clone())
            .with_expires(self.expires)
            .with_policy(RetryPolicy::default().with_interval(self.interval))
    }
}
