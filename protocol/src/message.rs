//! 消息类型定义
//!
//! 入站、出站各是一个封闭的枚举，新增或删除消息种类都需要
//! 在服务端的 `match` 中显式处理。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::role::{Role, Winner};

/// 玩家 ID（由外部平台签发）
pub type PlayerId = String;

/// 房间 ID（对局模式下即比赛 ID）
pub type RoomId = String;

/// 连接 ID
pub type ConnectionId = u64;

/// 玩家身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: PlayerId,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<PlayerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// 对局状态
///
/// 只会 Waiting → Playing → Finished 单向推进，休闲模式的重开除外。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    /// 等待玩家加入
    Waiting,
    /// 游戏进行中
    Playing,
    /// 游戏结束
    Finished,
}

/// 非棋局原因导致的结束
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisruptionReason {
    /// 回合超时
    Timeout,
    /// 对手断线
    Disconnect,
}

/// 两个座位上的玩家昵称（断线或空位为 None）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatNames {
    pub x: Option<String>,
    pub o: Option<String>,
}

impl SeatNames {
    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::X => self.x.as_deref(),
            Role::O => self.o.as_deref(),
        }
    }
}

/// 房间快照（每次状态变化后广播给房间内所有连接）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    /// 每次状态变化递增，客户端可据此丢弃乱序快照
    pub version: u64,
    pub board: Board,
    pub current_turn: Role,
    pub players: SeatNames,
    pub winner: Option<Winner>,
    pub winning_line: Option<[u8; 3]>,
    /// 当前回合开始时间（用于客户端倒计时）
    pub turn_started_at: Option<DateTime<Utc>>,
    /// 当前回合截止时间
    pub turn_deadline: Option<DateTime<Utc>>,
    pub disruption: Option<DisruptionReason>,
    pub status: GameStatus,
}

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    // === 对局模式（需要平台凭证） ===
    /// 加入比赛
    Join { room_id: RoomId, credential: String },

    // === 休闲模式（房间码） ===
    /// 创建房间（不指定房间码时由服务端生成）
    CreateRoom { room_id: Option<RoomId> },
    /// 加入房间
    JoinRoom { room_id: RoomId },
    /// 重新加入房间
    RejoinRoom { room_id: RoomId },
    /// 重开一局
    Restart,

    // === 游戏操作 ===
    /// 落子
    Move { index: u8 },

    // === 心跳 ===
    /// 心跳请求
    Ping,
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// 分配到角色
    Assigned { role: Role, identity: Identity },
    /// 房间状态
    RoomState(RoomSnapshot),
    /// 错误消息
    Error { code: ErrorCode, message: String },
    /// 心跳响应
    Pong,
}

/// 错误码定义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // === 房间相关 (1xx) ===
    /// 房间不存在
    RoomNotFound = 100,
    /// 房间已满
    RoomFull = 101,
    /// 房间已存在
    RoomExists = 102,
    /// 已在房间中
    AlreadyInRoom = 104,
    /// 房间号不合法
    InvalidRoomId = 105,

    // === 游戏相关 (2xx) ===
    /// 当前模式不允许重开
    RestartDisabled = 204,

    // === 玩家相关 (3xx) ===
    /// 凭证无效
    InvalidCredential = 300,

    // === 系统相关 (5xx) ===
    /// 当前部署模式不支持该消息
    WrongMode = 502,
    /// 服务器繁忙
    ServerBusy = 503,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
