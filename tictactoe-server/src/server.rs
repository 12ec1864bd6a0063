//! 服务器主逻辑
//!
//! 把连接事件（消息、断线、回合到期）路由到房间状态机。
//! 所有状态转换和对应的广播都在同一把房间锁内完成，
//! 只有身份校验和结果上报在锁外等待。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use protocol::{ClientMessage, ConnectionId, Identity, Role, RoomId, ServerMessage};

use crate::clock::{ExpiryReceiver, TurnExpired};
use crate::config::{GameMode, ServerConfig};
use crate::error::JoinError;
use crate::identity::{guest_identity, IdentityValidator, ValidationError};
use crate::registry::{
    generate_room_code, normalize_room_code, validate_room_id, LockedRoom, RoomRegistry, SharedRoom,
};
use crate::report::{ReportDispatcher, ResultReporter};
use crate::room::{DisconnectOutcome, Room};
use crate::session::{Session, SessionTracker};

/// 每个连接的发送队列长度
pub const OUTBOUND_CAPACITY: usize = 256;

/// 生成房间码的最大尝试次数
const ROOM_CODE_ATTEMPTS: usize = 8;

/// 连接表
///
/// 发送一律用 `try_send`，慢客户端只会丢自己的消息，不会拖住房间锁。
pub struct ConnectionHub {
    /// 连接 ID -> 消息发送通道
    senders: Mutex<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册新连接，返回连接 ID 和发送队列的接收端
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, conn_id: ConnectionId) -> bool {
        self.lock().remove(&conn_id).is_some()
    }

    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.lock().contains_key(&conn_id)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// 发送消息给连接
    pub fn send(&self, conn_id: ConnectionId, msg: ServerMessage) -> bool {
        let Some(tx) = self.lock().get(&conn_id).cloned() else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id, "发送队列已满，丢弃消息");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id, "连接已关闭，丢弃消息");
                false
            }
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 待发送的消息
struct Outbox {
    messages: Vec<(ConnectionId, ServerMessage)>,
}

impl Outbox {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    fn send(&mut self, conn_id: ConnectionId, msg: ServerMessage) {
        self.messages.push((conn_id, msg));
    }

    /// 向房间内所有连接广播快照
    fn broadcast_state(&mut self, room: &Room) {
        let snapshot = room.snapshot();
        for conn_id in room.connections() {
            self.messages
                .push((conn_id, ServerMessage::RoomState(snapshot.clone())));
        }
    }

    fn flush(self, hub: &ConnectionHub) {
        for (conn_id, msg) in self.messages {
            hub.send(conn_id, msg);
        }
    }
}

/// 服务器状态
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<RoomRegistry>,
    pub sessions: SessionTracker,
    pub hub: ConnectionHub,
    validator: Arc<dyn IdentityValidator>,
    reports: ReportDispatcher,
}

impl ServerState {
    /// 创建服务器状态，并启动回合到期处理和结果上报两个后台任务
    pub fn start(
        config: ServerConfig,
        validator: Arc<dyn IdentityValidator>,
        reporter: Arc<dyn ResultReporter>,
    ) -> Arc<Self> {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RoomRegistry::new(
            config.mode,
            config.turn_timeout(),
            expiry_tx,
        ));
        let reports = ReportDispatcher::new(reporter, registry.clone(), config.retry_policy());

        let state = Arc::new(Self {
            config,
            registry,
            sessions: SessionTracker::new(),
            hub: ConnectionHub::new(),
            validator,
            reports,
        });
        tokio::spawn(run_expiry_loop(Arc::downgrade(&state), expiry_rx));
        state
    }

    pub fn mode(&self) -> GameMode {
        self.config.mode
    }

    /// 注册新连接
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        self.hub.register()
    }
}

/// 回合到期处理循环（服务器状态释放后退出）
async fn run_expiry_loop(state: Weak<ServerState>, mut rx: ExpiryReceiver) {
    while let Some(expired) = rx.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        MessageHandler::handle_turn_expired(&state, expired).await;
    }
}

/// 消息处理器
pub struct MessageHandler;

impl MessageHandler {
    /// 处理客户端消息
    ///
    /// 请求类错误只回给发起的连接；对局中的非法操作直接丢弃。
    pub async fn handle(state: &ServerState, conn_id: ConnectionId, msg: ClientMessage) {
        let result = match msg {
            ClientMessage::Join {
                room_id,
                credential,
            } => Self::handle_join(state, conn_id, room_id, credential).await,
            ClientMessage::CreateRoom { room_id } => {
                Self::handle_create_room(state, conn_id, room_id).await
            }
            ClientMessage::JoinRoom { room_id } | ClientMessage::RejoinRoom { room_id } => {
                Self::handle_join_room(state, conn_id, room_id).await
            }
            ClientMessage::Restart => Self::handle_restart(state, conn_id).await,
            ClientMessage::Move { index } => {
                Self::handle_move(state, conn_id, index).await;
                Ok(())
            }
            ClientMessage::Ping => {
                state.hub.send(conn_id, ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(conn_id, error = %e, "请求被拒绝");
            state.hub.send(conn_id, e.to_message());
        }
    }

    fn require_mode(state: &ServerState, mode: GameMode) -> Result<(), JoinError> {
        if state.mode() == mode {
            Ok(())
        } else {
            Err(JoinError::WrongMode(state.mode()))
        }
    }

    /// 检查连接是否已在房间中
    fn ensure_unbound(state: &ServerState, conn_id: ConnectionId) -> Result<(), JoinError> {
        match state.sessions.get(conn_id) {
            Some(session) => Err(JoinError::AlreadyInRoom(session.room_id)),
            None => Ok(()),
        }
    }

    /// 连接所在的房间和角色
    fn session_room(state: &ServerState, conn_id: ConnectionId) -> Option<(SharedRoom, Role)> {
        let session = state.sessions.get(conn_id)?;
        let room = state.registry.get(&session.room_id)?;
        Some((room, session.role))
    }

    /// 广播房间状态并提交新认领的上报任务
    fn publish(state: &ServerState, room: &mut Room, outbox: &mut Outbox) {
        outbox.broadcast_state(room);
        state.reports.submit(room.take_report_jobs());
    }

    /// 处理加入比赛（对局模式）
    async fn handle_join(
        state: &ServerState,
        conn_id: ConnectionId,
        room_id: RoomId,
        credential: String,
    ) -> Result<(), JoinError> {
        Self::require_mode(state, GameMode::Match)?;
        Self::ensure_unbound(state, conn_id)?;
        let room_id = validate_room_id(&room_id)?.to_string();

        // 校验身份时不持有任何锁
        let identity = match state.validator.validate(&credential).await {
            Ok(identity) => identity,
            Err(ValidationError::Invalid) => return Err(JoinError::InvalidCredential),
            Err(e) => {
                error!(conn_id, room_id = %room_id, error = %e, "身份校验失败");
                return Err(JoinError::InvalidCredential);
            }
        };

        loop {
            let (room, _) = state.registry.get_or_create(&room_id);
            let mut guard = room.lock().await;
            // 等锁期间房间被销毁，重新获取
            if guard.is_closed() {
                continue;
            }
            return Self::seat_player(state, conn_id, &room, &mut guard, identity);
        }
    }

    /// 处理创建房间（休闲模式）
    async fn handle_create_room(
        state: &ServerState,
        conn_id: ConnectionId,
        room_id: Option<RoomId>,
    ) -> Result<(), JoinError> {
        Self::require_mode(state, GameMode::Casual)?;
        Self::ensure_unbound(state, conn_id)?;

        let (room, mut guard) = match room_id {
            Some(code) => {
                let code = normalize_room_code(&code)?;
                state
                    .registry
                    .create(&code)
                    .ok_or(JoinError::RoomExists(code))?
            }
            None => Self::create_with_generated_code(state)?,
        };
        Self::seat_player(state, conn_id, &room, &mut guard, guest_identity(conn_id))
    }

    fn create_with_generated_code(state: &ServerState) -> Result<LockedRoom, JoinError> {
        let mut code = generate_room_code();
        for _ in 1..ROOM_CODE_ATTEMPTS {
            if let Some(created) = state.registry.create(&code) {
                return Ok(created);
            }
            debug!(room_id = %code, "房间码冲突，重新生成");
            code = generate_room_code();
        }
        state
            .registry
            .create(&code)
            .ok_or(JoinError::RoomExists(code))
    }

    /// 处理加入或重新加入房间（休闲模式）
    async fn handle_join_room(
        state: &ServerState,
        conn_id: ConnectionId,
        room_id: RoomId,
    ) -> Result<(), JoinError> {
        Self::require_mode(state, GameMode::Casual)?;
        Self::ensure_unbound(state, conn_id)?;
        let code = normalize_room_code(&room_id)?;

        let room = state
            .registry
            .get(&code)
            .ok_or_else(|| JoinError::RoomNotFound(code.clone()))?;
        let mut guard = room.lock().await;
        if guard.is_closed() {
            return Err(JoinError::RoomNotFound(code));
        }
        Self::seat_player(state, conn_id, &room, &mut guard, guest_identity(conn_id))
    }

    /// 把玩家安排进房间（调用方持有房间锁）
    fn seat_player(
        state: &ServerState,
        conn_id: ConnectionId,
        room: &SharedRoom,
        guard: &mut Room,
        identity: Identity,
    ) -> Result<(), JoinError> {
        let assignment = guard.assign_role(identity, conn_id)?;
        let role = assignment.role;
        state.sessions.bind(
            conn_id,
            Session {
                room_id: guard.id().clone(),
                role,
            },
        );
        if let Some(old_conn) = assignment.replaced {
            state.sessions.unbind(old_conn);
            info!(room_id = %guard.id(), conn_id, old_conn, %role, "玩家重连，替换旧连接");
        }

        let mut outbox = Outbox::new();

        // 先绑定会话再检查连接：与断线处理交错时，总有一方能看到对方的结果
        if !state.hub.is_connected(conn_id) {
            state.sessions.unbind(conn_id);
            Self::apply_disconnect(state, room, guard, role, conn_id, &mut outbox);
            outbox.flush(&state.hub);
            return Ok(());
        }

        info!(
            room_id = %guard.id(),
            conn_id,
            player_id = %assignment.identity.id,
            %role,
            "玩家入座"
        );
        outbox.send(
            conn_id,
            ServerMessage::Assigned {
                role,
                identity: assignment.identity,
            },
        );
        Self::publish(state, guard, &mut outbox);
        outbox.flush(&state.hub);
        Ok(())
    }

    /// 处理落子
    async fn handle_move(state: &ServerState, conn_id: ConnectionId, index: u8) {
        let Some((room, role)) = Self::session_room(state, conn_id) else {
            debug!(conn_id, index, "未入座的连接落子，忽略");
            return;
        };

        let mut guard = room.lock().await;
        if !guard.is_bound(role, conn_id) {
            debug!(conn_id, index, "连接已不在座，忽略落子");
            return;
        }
        if let Err(e) = guard.apply_move(role, index) {
            debug!(room_id = %guard.id(), conn_id, %role, index, error = %e, "忽略非法落子");
            return;
        }

        let mut outbox = Outbox::new();
        Self::publish(state, &mut guard, &mut outbox);
        outbox.flush(&state.hub);
    }

    /// 处理重开（休闲模式）
    async fn handle_restart(state: &ServerState, conn_id: ConnectionId) -> Result<(), JoinError> {
        if !state.mode().restart_enabled() {
            return Err(JoinError::RestartDisabled);
        }
        let Some((room, role)) = Self::session_room(state, conn_id) else {
            debug!(conn_id, "未入座的连接请求重开，忽略");
            return Ok(());
        };

        let mut guard = room.lock().await;
        if !guard.is_bound(role, conn_id) {
            return Ok(());
        }
        guard.restart()?;

        let mut outbox = Outbox::new();
        Self::publish(state, &mut guard, &mut outbox);
        outbox.flush(&state.hub);
        Ok(())
    }

    /// 处理连接断开
    pub async fn handle_disconnect(state: &ServerState, conn_id: ConnectionId) {
        state.hub.unregister(conn_id);

        let Some(session) = state.sessions.unbind(conn_id) else {
            debug!(conn_id, "未入座的连接断开");
            return;
        };
        let Some(room) = state.registry.get(&session.room_id) else {
            return;
        };

        let mut guard = room.lock().await;
        let mut outbox = Outbox::new();
        Self::apply_disconnect(state, &room, &mut guard, session.role, conn_id, &mut outbox);
        outbox.flush(&state.hub);
    }

    fn apply_disconnect(
        state: &ServerState,
        room: &SharedRoom,
        guard: &mut Room,
        role: Role,
        conn_id: ConnectionId,
        outbox: &mut Outbox,
    ) {
        match guard.handle_disconnect(role, conn_id) {
            DisconnectOutcome::Stale => {
                debug!(room_id = %guard.id(), conn_id, %role, "旧连接断开，忽略");
            }
            DisconnectOutcome::Destroyed => {
                state.registry.remove_room(guard.id(), room);
                state.reports.submit(guard.take_report_jobs());
            }
            DisconnectOutcome::Updated { forfeited } => {
                info!(room_id = %guard.id(), conn_id, %role, forfeited, "玩家断线");
                Self::publish(state, guard, outbox);
            }
        }
    }

    /// 处理回合到期
    pub async fn handle_turn_expired(state: &ServerState, expired: TurnExpired) {
        let Some(room) = state.registry.get(&expired.room_id) else {
            debug!(room_id = %expired.room_id, turn = expired.turn, "房间已销毁，忽略到期");
            return;
        };

        let mut guard = room.lock().await;
        if guard.instance() != expired.instance {
            debug!(room_id = %expired.room_id, turn = expired.turn, "房间已重建，忽略到期");
            return;
        }
        if !guard.handle_turn_timeout(expired.turn) {
            return;
        }

        let mut outbox = Outbox::new();
        Self::publish(state, &mut guard, &mut outbox);
        outbox.flush(&state.hub);
    }
}
