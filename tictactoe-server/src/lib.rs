//! 井字棋服务端
//!
//! 包含:
//! - 房间注册表与房间状态机
//! - 回合计时
//! - 连接会话与消息路由
//! - 身份校验（对局模式）
//! - 比赛结果上报（对局模式）

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
#[cfg(feature = "platform")]
pub mod platform;
pub mod player;
pub mod registry;
pub mod report;
pub mod room;
pub mod server;
pub mod session;

pub use clock::{TurnClock, TurnExpired};
pub use config::{GameMode, PlatformConfig, ServerConfig};
pub use error::JoinError;
pub use identity::{CachedValidator, IdentityValidator, TrustedValidator, ValidationError};
pub use listener::serve;
#[cfg(feature = "platform")]
pub use platform::HttpPlatformClient;
pub use player::{Seat, Seats};
pub use registry::{LockedRoom, RoomRegistry, SharedRoom};
pub use report::{LogReporter, MatchResult, ReportError, ResultReporter};
pub use room::Room;
pub use server::{MessageHandler, ServerState};
pub use session::{Session, SessionTracker};
