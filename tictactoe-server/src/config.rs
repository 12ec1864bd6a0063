//! 服务端配置
//!
//! 先读取 `TTT_CONFIG` 指向的 JSON 文件（可选），再用环境变量覆盖。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use protocol::{
    WireFormat, HEARTBEAT_TIMEOUT_SECS, IDENTITY_CACHE_TTL_SECS, MAX_CONNECTIONS,
    TURN_TIMEOUT_SECS,
};

use crate::report::RetryPolicy;

/// 配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "TTT_CONFIG";

/// 回合限时上限（秒）
pub const MAX_TURN_TIMEOUT_SECS: u64 = 3600;

/// 身份缓存有效期上限（秒）
pub const MAX_IDENTITY_CACHE_TTL_SECS: u64 = 86400;

/// 部署模式
///
/// 同一个状态机，两种策略：对局模式走平台凭证且不可重开，
/// 休闲模式用房间码匿名加入、允许重开。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    /// 平台比赛（凭证校验 + 结果上报）
    Match,
    /// 休闲房间
    #[default]
    Casual,
}

impl GameMode {
    /// 是否允许重开
    pub fn restart_enabled(self) -> bool {
        matches!(self, GameMode::Casual)
    }

    /// 空出的座位能否被其他玩家占用
    pub fn reclaims_vacated_seats(self) -> bool {
        matches!(self, GameMode::Casual)
    }

    /// 是否向平台上报结果
    pub fn reports_results(self) -> bool {
        matches!(self, GameMode::Match)
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Match => write!(f, "match"),
            GameMode::Casual => write!(f, "casual"),
        }
    }
}

impl FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "match" => Ok(GameMode::Match),
            "casual" => Ok(GameMode::Casual),
            other => Err(format!("unknown game mode: {}", other)),
        }
    }
}

/// 外部平台配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub environment: String,
}

impl PlatformConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && self.api_key.is_some()
    }
}

/// 服务端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub mode: GameMode,
    pub wire_format: WireFormat,
    pub turn_timeout_secs: u64,
    pub identity_cache_ttl_secs: u64,
    pub report_retries: u32,
    pub report_backoff_ms: u64,
    pub max_connections: usize,
    /// 0 表示不检测空闲
    pub idle_timeout_secs: u64,
    pub platform: PlatformConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9527".to_string(),
            mode: GameMode::default(),
            wire_format: WireFormat::default(),
            turn_timeout_secs: TURN_TIMEOUT_SECS,
            identity_cache_ttl_secs: IDENTITY_CACHE_TTL_SECS,
            report_retries: 3,
            report_backoff_ms: 500,
            max_connections: MAX_CONNECTIONS,
            idle_timeout_secs: HEARTBEAT_TIMEOUT_SECS,
            platform: PlatformConfig {
                environment: "production".to_string(),
                ..PlatformConfig::default()
            },
        }
    }
}

impl ServerConfig {
    /// 从配置文件和环境变量加载
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 JSON 配置文件，缺失字段取默认值
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path))?;
        Self::from_json(&text).with_context(|| format!("配置文件格式错误 {}", path))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// 用环境变量覆盖配置
    ///
    /// `lookup` 抽象出来是为了测试时不依赖进程环境。
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("TTT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(mode) = lookup("TTT_MODE") {
            self.mode = mode.parse().map_err(anyhow::Error::msg).context("TTT_MODE")?;
        }
        if let Some(format) = lookup("TTT_WIRE_FORMAT") {
            self.wire_format = format
                .parse()
                .map_err(anyhow::Error::msg)
                .context("TTT_WIRE_FORMAT")?;
        }
        if let Some(secs) = lookup("TTT_TURN_TIMEOUT_SECS") {
            self.turn_timeout_secs = secs.trim().parse().context("TTT_TURN_TIMEOUT_SECS")?;
        }
        if let Some(max) = lookup("TTT_MAX_CONNECTIONS") {
            self.max_connections = max.trim().parse().context("TTT_MAX_CONNECTIONS")?;
        }
        if let Some(url) = lookup("PLATFORM_BASE_URL") {
            self.platform.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = lookup("PLATFORM_API_KEY") {
            self.platform.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(env) = lookup("PLATFORM_ENVIRONMENT") {
            self.platform.environment = env;
        }
        Ok(())
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.turn_timeout_secs == 0 || self.turn_timeout_secs > MAX_TURN_TIMEOUT_SECS {
            bail!("turn_timeout_secs 必须在 1-{} 之间", MAX_TURN_TIMEOUT_SECS);
        }
        if self.identity_cache_ttl_secs > MAX_IDENTITY_CACHE_TTL_SECS {
            bail!("identity_cache_ttl_secs 不能超过 {}", MAX_IDENTITY_CACHE_TTL_SECS);
        }
        if self.max_connections == 0 {
            bail!("max_connections 必须大于 0");
        }
        Ok(())
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }

    /// 空闲超时（未启用时为 None）
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.report_retries.max(1),
            backoff: Duration::from_millis(self.report_backoff_ms),
        }
    }
}
