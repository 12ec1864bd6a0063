//! 井字棋共享协议库
//!
//! 包含:
//! - 棋盘、角色等核心数据结构
//! - 落子规则与胜负判定
//! - 消息类型定义 (ClientMessage, ServerMessage)
//! - 传输层抽象 (Connector, Connection, Listener traits)
//! - 帧编解码 (bincode / JSON)

mod board;
mod constants;
mod error;
mod message;
mod role;
mod transport;

pub use board::Board;
pub use constants::*;
pub use error::{GameError, ProtocolError, Result};
pub use message::{
    ClientMessage, ConnectionId, DisruptionReason, ErrorCode, GameStatus, Identity, PlayerId,
    RoomId, RoomSnapshot, SeatNames, ServerMessage,
};
pub use role::{Role, Winner};
pub use transport::{
    Connection, Connector, FrameReader, FrameWriter, Listener, TcpConnection, TcpConnector,
    TcpListener, WireFormat,
};
