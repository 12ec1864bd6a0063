//! 协议常量定义

use std::time::Duration;

/// 协议版本号
pub const PROTOCOL_VERSION: u8 = 1;

/// 棋盘边长
pub const BOARD_SIZE: usize = 3;

/// 棋盘格子数
pub const BOARD_CELLS: usize = BOARD_SIZE * BOARD_SIZE;

/// 所有获胜连线，按固定优先级排列：三行、三列、两条对角线
pub const WINNING_LINES: [[u8; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// 房间号最大长度
pub const MAX_ROOM_ID_LEN: usize = 64;

/// 自动生成的房间码长度
pub const ROOM_CODE_LEN: usize = 6;

/// 消息帧最大大小
pub const MAX_FRAME_SIZE: usize = 65536;

/// 服务端最大连接数
pub const MAX_CONNECTIONS: usize = 100;

/// 服务端心跳超时（秒）- 超过此时间无消息则断开
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 每回合限时（秒）
pub const TURN_TIMEOUT_SECS: u64 = 30;

/// 身份校验缓存有效期（秒）
pub const IDENTITY_CACHE_TTL_SECS: u64 = 60;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
