//! 会话跟踪
//!
//! 连接 → (房间, 角色) 的临时绑定，只在连接存活期间存在。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::{ConnectionId, Role, RoomId};

/// 会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_id: RoomId,
    pub role: Role,
}

/// 会话跟踪器
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<ConnectionId, Session>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 绑定连接（覆盖旧绑定）
    pub fn bind(&self, connection: ConnectionId, session: Session) {
        self.lock().insert(connection, session);
    }

    pub fn get(&self, connection: ConnectionId) -> Option<Session> {
        self.lock().get(&connection).cloned()
    }

    /// 解除绑定，返回原来的会话
    pub fn unbind(&self, connection: ConnectionId) -> Option<Session> {
        self.lock().remove(&connection)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}
