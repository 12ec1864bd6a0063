//! 房间注册表
//!
//! 房间号到房间的映射。映射本身用同步锁保护，临界区内不做任何等待；
//! 每个房间再各自持有一把异步锁，作为该房间所有状态转换的串行点。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use protocol::{RoomId, MAX_ROOM_ID_LEN, ROOM_CODE_LEN};

use crate::clock::{ExpirySender, TurnClock};
use crate::config::GameMode;
use crate::error::JoinError;
use crate::room::Room;

/// 共享房间句柄
pub type SharedRoom = Arc<tokio::sync::Mutex<Room>>;

/// 刚创建、已由创建者加锁的房间
pub type LockedRoom = (SharedRoom, tokio::sync::OwnedMutexGuard<Room>);

/// 房间注册表
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, SharedRoom>>,
    next_instance: AtomicU64,
    mode: GameMode,
    turn_timeout: Duration,
    expiry_tx: ExpirySender,
}

impl RoomRegistry {
    pub fn new(mode: GameMode, turn_timeout: Duration, expiry_tx: ExpirySender) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
            mode,
            turn_timeout,
            expiry_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, SharedRoom>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, room_id: &str) -> SharedRoom {
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let clock = TurnClock::new(
            room_id.to_string(),
            instance,
            self.turn_timeout,
            self.expiry_tx.clone(),
        );
        info!(room_id, instance, "房间已创建");
        Arc::new(tokio::sync::Mutex::new(Room::new(
            room_id.to_string(),
            instance,
            self.mode,
            clock,
        )))
    }

    /// 获取或创建房间，返回 (房间, 是否新建)
    ///
    /// 同一个房间号并发调用只会得到同一个实例。
    pub fn get_or_create(&self, room_id: &str) -> (SharedRoom, bool) {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get(room_id) {
            return (room.clone(), false);
        }
        let room = self.build(room_id);
        rooms.insert(room_id.to_string(), room.clone());
        (room, true)
    }

    /// 创建房间，已存在时返回 None
    ///
    /// 房间放进映射之前就已加锁，并发的加入请求只能排在创建者之后。
    pub fn create(&self, room_id: &str) -> Option<LockedRoom> {
        let mut rooms = self.lock();
        if rooms.contains_key(room_id) {
            return None;
        }
        let room = self.build(room_id);
        let guard = room.clone().try_lock_owned().ok()?;
        rooms.insert(room_id.to_string(), room.clone());
        Some((room, guard))
    }

    /// 获取房间
    pub fn get(&self, room_id: &str) -> Option<SharedRoom> {
        self.lock().get(room_id).cloned()
    }

    /// 移除房间（不存在时什么也不做）
    pub fn remove(&self, room_id: &str) -> bool {
        self.lock().remove(room_id).is_some()
    }

    /// 仅当映射中仍是 `room` 这个实例时才移除
    pub fn remove_room(&self, room_id: &str, room: &SharedRoom) -> bool {
        let mut rooms = self.lock();
        match rooms.get(room_id) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room_id);
                info!(room_id, "房间已销毁");
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.lock().contains_key(room_id)
    }

    /// 获取房间数量
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }
}

/// 检查房间号：1-64 个字符，只允许字母、数字、`-`、`_`
pub fn validate_room_id(room_id: &str) -> Result<&str, JoinError> {
    let room_id = room_id.trim();
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(room_id)
    } else {
        Err(JoinError::InvalidRoomId)
    }
}

/// 规范化休闲房间码（统一大写）
pub fn normalize_room_code(code: &str) -> Result<RoomId, JoinError> {
    validate_room_id(code).map(|code| code.to_ascii_uppercase())
}

/// 随机生成 6 位大写房间码
pub fn generate_room_code() -> RoomId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_CODE_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}
