//! 错误类型定义

use thiserror::Error;

/// 走棋规则错误
///
/// 对局中的非法操作都归到这里。服务端收到后只记录日志并丢弃，
/// 因为它们常常只是网络竞争的结果（比如对手刚刚获胜时到达的走法）。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameError {
    /// 格子编号越界
    #[error("Cell index {index} is out of range (0-8)")]
    OutOfRange { index: u8 },

    /// 格子已被占用
    #[error("Cell {index} is already occupied")]
    Occupied { index: u8 },

    /// 不是你的回合
    #[error("Not your turn")]
    NotYourTurn,

    /// 对局未在进行中
    #[error("Game is not in progress")]
    NotPlaying,

    /// 对局已结束
    #[error("Game is already over")]
    GameOver,
}

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误（bincode）
    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON 序列化错误
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 协议版本不匹配
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// 未知的编码格式
    #[error("Unknown wire format tag: {0}")]
    UnknownFormat(u8),

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
