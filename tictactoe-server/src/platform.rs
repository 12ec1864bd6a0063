//! 外部比赛平台 REST 客户端
//!
//! 同时实现身份校验和结果上报，需要开启 `platform` feature。

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use protocol::Identity;

use crate::config::PlatformConfig;
use crate::identity::{IdentityValidator, ValidationError};
use crate::report::{MatchResult, ReportError, ResultReporter};

/// 请求超时（秒）
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    id: String,
    username: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerJoinedRequest<'a> {
    player_id: &'a str,
}

#[derive(Serialize)]
struct ErrorRequest<'a> {
    reason: &'a str,
}

/// 平台客户端
pub struct HttpPlatformClient {
    config: PlatformConfig,
    api_key: String,
    client: reqwest::Client,
}

impl HttpPlatformClient {
    /// 创建客户端（必须配置地址和 API key）
    pub fn new(config: PlatformConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            anyhow::bail!("PLATFORM_BASE_URL 未设置");
        }
        let api_key = config
            .api_key
            .clone()
            .context("PLATFORM_API_KEY 未设置")?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.config.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("X-Environment", &self.config.environment)
    }

    async fn send_report<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ReportError> {
        let resp = self
            .post(path)
            .json(body)
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(path, "平台上报成功");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl IdentityValidator for HttpPlatformClient {
    async fn validate(&self, credential: &str) -> Result<Identity, ValidationError> {
        let resp = self
            .post("/players/validate")
            .json(&ValidateRequest { token: credential })
            .send()
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            debug!(%status, "凭证被平台拒绝");
            return Err(ValidationError::Invalid);
        }
        if !status.is_success() {
            warn!(%status, "身份校验服务异常");
            return Err(ValidationError::Unavailable(format!("HTTP {}", status)));
        }

        let player: ValidateResponse = resp
            .json()
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;
        Ok(Identity::new(player.id, player.username))
    }
}

#[async_trait]
impl ResultReporter for HttpPlatformClient {
    async fn report_start(&self, match_id: &str) -> Result<(), ReportError> {
        self.send_report(&format!("/matches/{}/start", match_id), &serde_json::json!({}))
            .await
    }

    async fn report_player_joined(&self, match_id: &str, player_id: &str) -> Result<(), ReportError> {
        self.send_report(
            &format!("/matches/{}/players", match_id),
            &PlayerJoinedRequest { player_id },
        )
        .await
    }

    async fn report_result(&self, match_id: &str, result: &MatchResult) -> Result<(), ReportError> {
        self.send_report(&format!("/matches/{}/result", match_id), result)
            .await
    }

    async fn report_error(&self, match_id: &str, reason: &str) -> Result<(), ReportError> {
        self.send_report(&format!("/matches/{}/error", match_id), &ErrorRequest { reason })
            .await
    }
}
