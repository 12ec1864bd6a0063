//! 服务端错误类型

use thiserror::Error;

use protocol::{ErrorCode, RoomId, ServerMessage};

use crate::config::GameMode;

/// 加入房间及房间级请求的失败原因
///
/// 只发给发起请求的连接，不影响房间状态。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("凭证无效")]
    InvalidCredential,

    #[error("房间已满")]
    RoomFull,

    #[error("房间不存在: {0}")]
    RoomNotFound(RoomId),

    #[error("房间已存在: {0}")]
    RoomExists(RoomId),

    #[error("房间号不合法")]
    InvalidRoomId,

    #[error("已在房间中: {0}")]
    AlreadyInRoom(RoomId),

    #[error("{0} 模式不支持该操作")]
    WrongMode(GameMode),

    #[error("当前模式不允许重开")]
    RestartDisabled,
}

impl JoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JoinError::InvalidCredential => ErrorCode::InvalidCredential,
            JoinError::RoomFull => ErrorCode::RoomFull,
            JoinError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            JoinError::RoomExists(_) => ErrorCode::RoomExists,
            JoinError::InvalidRoomId => ErrorCode::InvalidRoomId,
            JoinError::AlreadyInRoom(_) => ErrorCode::AlreadyInRoom,
            JoinError::WrongMode(_) => ErrorCode::WrongMode,
            JoinError::RestartDisabled => ErrorCode::RestartDisabled,
        }
    }

    /// 转换为发给客户端的错误消息
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        let err = JoinError::RoomNotFound("ABC123".to_string());
        assert_eq!(
            err.to_message(),
            ServerMessage::Error {
                code: ErrorCode::RoomNotFound,
                message: "房间不存在: ABC123".to_string(),
            }
        );
        assert_eq!(JoinError::WrongMode(GameMode::Match).code(), ErrorCode::WrongMode);
    }
}
