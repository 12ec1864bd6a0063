use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protocol::{Listener, TcpListener};
use tictactoe_server::{
    serve, CachedValidator, GameMode, IdentityValidator, LogReporter, ResultReporter,
    ServerConfig, ServerState, TrustedValidator,
};

type Collaborators = (Arc<dyn IdentityValidator>, Arc<dyn ResultReporter>);

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tictactoe_server=debug".parse()?))
        .init();

    info!("井字棋服务端启动中...");

    let config = ServerConfig::load().context("加载配置失败")?;
    info!(
        mode = %config.mode,
        addr = %config.listen_addr,
        wire_format = ?config.wire_format,
        "配置已加载"
    );

    let (validator, reporter) = collaborators(&config)?;
    let listener = TcpListener::bind(&config.listen_addr, config.wire_format)
        .await
        .with_context(|| format!("无法监听 {}", config.listen_addr))?;
    let state = ServerState::start(config, validator, reporter);

    tokio::select! {
        result = serve(listener, state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号，服务端关闭");
            Ok(())
        }
    }
}

/// 选择身份校验和结果上报的实现
fn collaborators(config: &ServerConfig) -> Result<Collaborators> {
    if let Some(platform) = platform_collaborators(config)? {
        return Ok(platform);
    }
    if config.mode == GameMode::Match {
        warn!("未接入比赛平台：凭证按 <玩家ID>:<昵称> 直接信任，结果只写日志（仅限开发环境）");
    }
    let validator: Arc<dyn IdentityValidator> = Arc::new(CachedValidator::new(
        TrustedValidator,
        config.identity_cache_ttl(),
    ));
    let reporter: Arc<dyn ResultReporter> = Arc::new(LogReporter);
    Ok((validator, reporter))
}

#[cfg(feature = "platform")]
fn platform_collaborators(config: &ServerConfig) -> Result<Option<Collaborators>> {
    use tictactoe_server::HttpPlatformClient;

    if config.mode != GameMode::Match || !config.platform.is_configured() {
        return Ok(None);
    }
    let client = Arc::new(HttpPlatformClient::new(config.platform.clone())?);
    info!(
        base_url = %config.platform.base_url,
        environment = %config.platform.environment,
        "已接入比赛平台"
    );
    let validator: Arc<dyn IdentityValidator> = Arc::new(CachedValidator::new(
        client.clone(),
        config.identity_cache_ttl(),
    ));
    let reporter: Arc<dyn ResultReporter> = client;
    Ok(Some((validator, reporter)))
}

#[cfg(not(feature = "platform"))]
fn platform_collaborators(_config: &ServerConfig) -> Result<Option<Collaborators>> {
    Ok(None)
}
