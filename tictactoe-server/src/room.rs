//! 房间系统
//!
//! 房间是唯一持有权威对局状态的地方。所有状态转换都在房间锁内同步完成，
//! 每次转换后 `version` 加一，网关在同一把锁内广播快照。
//!
//! 不变量：回合截止时间存在 ⇔ 对局进行中、未分胜负、两个座位都在座。

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use protocol::{
    Board, ConnectionId, DisruptionReason, GameError, GameStatus, Identity, Role, RoomId,
    RoomSnapshot, Winner,
};

use crate::clock::TurnClock;
use crate::config::GameMode;
use crate::error::JoinError;
use crate::player::{Seat, Seats};
use crate::report::{LedgerView, MatchLedger, ReportEvent, ReportJob};

/// 分配角色的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub role: Role,
    pub identity: Identity,
    /// 重连时被替换的旧连接
    pub replaced: Option<ConnectionId>,
    /// 本次加入使对局开始
    pub started: bool,
}

/// 断线处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// 连接已不在座（被重连替换），忽略
    Stale,
    /// 两个座位都已空出，房间应销毁
    Destroyed,
    /// 房间状态已更新，需要广播
    Updated {
        /// 对局因断线结束
        forfeited: bool,
    },
}

/// 房间
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    /// 实例号（同名房间销毁后重建会得到新的实例号）
    instance: u64,
    mode: GameMode,
    board: Board,
    current_turn: Role,
    status: GameStatus,
    winner: Option<Winner>,
    winning_line: Option<[u8; 3]>,
    disruption: Option<DisruptionReason>,
    seats: Seats,
    clock: TurnClock,
    ledger: MatchLedger,
    version: u64,
    /// 已从注册表移除
    closed: bool,
}

impl Room {
    /// 创建新房间
    pub fn new(id: RoomId, instance: u64, mode: GameMode, clock: TurnClock) -> Self {
        Self {
            id,
            instance,
            mode,
            board: Board::empty(),
            current_turn: Role::X,
            status: GameStatus::Waiting,
            winner: None,
            winning_line: None,
            disruption: None,
            seats: Seats::new(),
            clock,
            ledger: MatchLedger::new(),
            version: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn current_turn(&self) -> Role {
        self.current_turn
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn winner(&self) -> Option<Winner> {
        self.winner
    }

    pub fn winning_line(&self) -> Option<[u8; 3]> {
        self.winning_line
    }

    pub fn disruption(&self) -> Option<DisruptionReason> {
        self.disruption
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn seat(&self, role: Role) -> &Seat {
        self.seats.get(role)
    }

    /// 玩家所在座位
    pub fn seat_role(&self, player_id: &str) -> Option<Role> {
        self.seats.find_player(player_id)
    }

    /// `connection` 是否在 `role` 的座位上
    pub fn is_bound(&self, role: Role, connection: ConnectionId) -> bool {
        self.seats.is_bound(role, connection)
    }

    /// 当前回合截止时间
    pub fn turn_deadline(&self) -> Option<DateTime<Utc>> {
        self.clock.deadline()
    }

    /// 当前计时回合序号
    pub fn armed_turn(&self) -> Option<u64> {
        self.clock.current_turn()
    }

    /// 房间内所有存活连接（广播对象）
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.seats.connections()
    }

    pub fn ledger(&self) -> &MatchLedger {
        &self.ledger
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// 为当前走子方开始计时
    fn arm_turn(&mut self) {
        self.clock.arm(self.current_turn);
    }

    /// 分配角色
    ///
    /// 顺序：玩家原来的座位（重连）→ 第一个空位（X 优先）→ 休闲模式下的断线座位。
    /// 两个座位都在座后对局开始。
    pub fn assign_role(
        &mut self,
        identity: Identity,
        connection: ConnectionId,
    ) -> Result<Assignment, JoinError> {
        let role = match self.seats.find_player(&identity.id) {
            Some(role) => role,
            None => self
                .seats
                .first_empty()
                .or_else(|| {
                    if self.mode.reclaims_vacated_seats() {
                        self.seats.first_vacated()
                    } else {
                        None
                    }
                })
                .ok_or(JoinError::RoomFull)?,
        };

        let replaced = self
            .seats
            .bind(role, identity.clone(), connection)
            .filter(|&old| old != connection);

        let started = self.status == GameStatus::Waiting && self.seats.both_occupied();
        if started {
            self.status = GameStatus::Playing;
            self.arm_turn();
            info!(room_id = %self.id, "对局开始");
        }
        self.touch();

        Ok(Assignment {
            role,
            identity,
            replaced,
            started,
        })
    }

    /// 落子
    ///
    /// 任何不合法的落子都不会改变房间状态。
    pub fn apply_move(&mut self, role: Role, index: u8) -> Result<(), GameError> {
        if self.winner.is_some() {
            return Err(GameError::GameOver);
        }
        if self.status != GameStatus::Playing {
            return Err(GameError::NotPlaying);
        }
        if role != self.current_turn {
            return Err(GameError::NotYourTurn);
        }

        self.board = self.board.apply_move(role, index)?;
        self.winner = self.board.evaluate();
        self.winning_line = match self.winner {
            Some(Winner::Draw) | None => None,
            Some(_) => self.board.winning_line(),
        };
        self.current_turn = role.opponent();
        self.disruption = None;

        match self.winner {
            Some(winner) => {
                self.clock.cancel();
                self.status = GameStatus::Finished;
                info!(room_id = %self.id, %winner, "对局结束");
            }
            None => self.arm_turn(),
        }
        self.touch();
        Ok(())
    }

    /// 回合超时
    ///
    /// 只有 `turn` 仍是当前计时的回合才生效，返回是否改变了状态。
    pub fn handle_turn_timeout(&mut self, turn: u64) -> bool {
        if !self.clock.is_armed_for(turn) {
            debug!(room_id = %self.id, turn, "过期的计时器，忽略");
            return false;
        }
        let Some(role) = self.clock.armed_role() else {
            return false;
        };

        self.clock.cancel();
        self.finish_by_disruption(role.opponent(), DisruptionReason::Timeout);
        info!(room_id = %self.id, loser = %role, "回合超时");
        self.touch();
        true
    }

    /// 连接断开
    ///
    /// 只有当前绑定在座位上的连接才会触发状态变化。
    pub fn handle_disconnect(&mut self, role: Role, connection: ConnectionId) -> DisconnectOutcome {
        if !self.seats.vacate(role, connection) {
            return DisconnectOutcome::Stale;
        }
        self.clock.cancel();

        if self.seats.all_unbound() {
            self.closed = true;
            self.touch();
            return DisconnectOutcome::Destroyed;
        }

        let forfeited = self.status == GameStatus::Playing && self.winner.is_none();
        if forfeited {
            self.finish_by_disruption(role.opponent(), DisruptionReason::Disconnect);
            info!(room_id = %self.id, loser = %role, "玩家断线判负");
        }
        self.touch();
        DisconnectOutcome::Updated { forfeited }
    }

    fn finish_by_disruption(&mut self, winner: Role, reason: DisruptionReason) {
        self.winner = Some(Winner::from_role(winner));
        self.winning_line = None;
        self.disruption = Some(reason);
        self.status = GameStatus::Finished;
    }

    /// 重开一局（仅休闲模式）
    pub fn restart(&mut self) -> Result<(), JoinError> {
        if !self.mode.restart_enabled() {
            return Err(JoinError::RestartDisabled);
        }

        self.clock.cancel();
        self.board = Board::empty();
        self.winner = None;
        self.winning_line = None;
        self.disruption = None;
        self.current_turn = Role::X;

        if self.seats.both_occupied() {
            self.status = GameStatus::Playing;
            self.arm_turn();
        } else {
            self.status = GameStatus::Waiting;
        }
        info!(room_id = %self.id, status = ?self.status, "重开一局");
        self.touch();
        Ok(())
    }

    /// 生成快照
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            version: self.version,
            board: self.board,
            current_turn: self.current_turn,
            players: self.seats.names(),
            winner: self.winner,
            winning_line: self.winning_line,
            turn_started_at: self.clock.started_at(),
            turn_deadline: self.clock.deadline(),
            disruption: self.disruption,
            status: self.status,
        }
    }

    /// 认领新的上报任务（仅对局模式）
    pub fn take_report_jobs(&mut self) -> Vec<ReportJob> {
        if !self.mode.reports_results() {
            return Vec::new();
        }

        let view = LedgerView {
            status: self.status,
            winner: self.winner,
            x: self.seats.get(Role::X).player(),
            o: self.seats.get(Role::O).player(),
            closed: self.closed,
        };
        self.ledger
            .claim(view)
            .into_iter()
            .map(|event| ReportJob {
                match_id: self.id.clone(),
                instance: self.instance,
                event,
            })
            .collect()
    }

    /// 记录上报结果
    pub fn record_report(&mut self, event: &ReportEvent, delivered: bool) {
        self.ledger.record(event, delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::clock::ExpiryReceiver;

    fn new_room(mode: GameMode) -> (Room, ExpiryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = TurnClock::new("R1".to_string(), 7, Duration::from_secs(30), tx);
        (Room::new("R1".to_string(), 7, mode, clock), rx)
    }

    fn alice() -> Identity {
        Identity::new("p-alice", "Alice")
    }

    fn bob() -> Identity {
        Identity::new("p-bob", "Bob")
    }

    /// 两人入座，对局开始
    fn playing_room(mode: GameMode) -> (Room, ExpiryReceiver) {
        let (mut room, rx) = new_room(mode);
        room.assign_role(alice(), 1).unwrap();
        room.assign_role(bob(), 2).unwrap();
        (room, rx)
    }

    fn play(room: &mut Room, moves: &[u8]) {
        for &index in moves {
            let role = room.current_turn();
            room.apply_move(role, index).unwrap();
        }
    }

    /// 截止时间存在 ⇔ 进行中、未分胜负、双方在座
    fn assert_deadline_invariant(room: &Room) {
        let expected = room.status() == GameStatus::Playing
            && room.winner().is_none()
            && room.seat(Role::X).is_occupied()
            && room.seat(Role::O).is_occupied();
        assert_eq!(room.turn_deadline().is_some(), expected);
    }

    #[tokio::test]
    async fn test_assign_roles_x_first() {
        let (mut room, _rx) = new_room(GameMode::Match);

        let first = room.assign_role(alice(), 1).unwrap();
        assert_eq!(first.role, Role::X);
        assert!(!first.started);
        assert_eq!(room.status(), GameStatus::Waiting);
        assert_deadline_invariant(&room);

        let second = room.assign_role(bob(), 2).unwrap();
        assert_eq!(second.role, Role::O);
        assert!(second.started);
        assert_eq!(room.status(), GameStatus::Playing);
        assert_eq!(room.current_turn(), Role::X);
        assert_deadline_invariant(&room);

        let third = room.assign_role(Identity::new("p-carol", "Carol"), 3);
        assert_eq!(third, Err(JoinError::RoomFull));
        assert_eq!(room.connections(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_same_seat() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        let turn = room.armed_turn();

        let again = room.assign_role(bob(), 9).unwrap();
        assert_eq!(again.role, Role::O);
        assert_eq!(again.replaced, Some(2));
        assert!(!again.started);
        // 重连不影响计时
        assert_eq!(room.armed_turn(), turn);
        assert!(room.is_bound(Role::O, 9));
    }

    #[tokio::test]
    async fn test_top_row_win() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        play(&mut room, &[0, 4, 1, 5, 2]);

        assert_eq!(room.winner(), Some(Winner::X));
        assert_eq!(room.winning_line(), Some([0, 1, 2]));
        assert_eq!(room.status(), GameStatus::Finished);
        assert_eq!(room.turn_deadline(), None);
        assert_deadline_invariant(&room);

        // 胜负已分后任何落子都无效
        let before = room.snapshot();
        assert_eq!(room.apply_move(Role::O, 8), Err(GameError::GameOver));
        assert_eq!(room.snapshot(), before);
    }

    #[tokio::test]
    async fn test_draw() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        play(&mut room, &[0, 1, 2, 4, 3, 5, 7, 6, 8]);

        assert_eq!(room.winner(), Some(Winner::Draw));
        assert_eq!(room.winning_line(), None);
        assert_eq!(room.status(), GameStatus::Finished);
        assert_deadline_invariant(&room);
    }

    #[tokio::test]
    async fn test_illegal_moves_change_nothing() {
        let (mut room, _rx) = new_room(GameMode::Match);
        room.assign_role(alice(), 1).unwrap();
        assert_eq!(room.apply_move(Role::X, 0), Err(GameError::NotPlaying));

        room.assign_role(bob(), 2).unwrap();
        play(&mut room, &[4]);
        let before = room.snapshot();

        assert_eq!(room.apply_move(Role::X, 0), Err(GameError::NotYourTurn));
        assert_eq!(room.apply_move(Role::O, 4), Err(GameError::Occupied { index: 4 }));
        assert_eq!(room.apply_move(Role::O, 9), Err(GameError::OutOfRange { index: 9 }));

        assert_eq!(room.snapshot(), before);
        assert_eq!(room.current_turn(), Role::O);
    }

    #[tokio::test]
    async fn test_move_rearms_clock_and_clears_disruption() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        let first = room.armed_turn().unwrap();

        play(&mut room, &[4]);
        let second = room.armed_turn().unwrap();
        assert!(second > first);
        assert_eq!(room.disruption(), None);
        assert_deadline_invariant(&room);

        // 上一回合的计时器到期不起作用
        assert!(!room.handle_turn_timeout(first));
        assert_eq!(room.status(), GameStatus::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout_awards_other_role() {
        let (mut room, mut rx) = playing_room(GameMode::Match);

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.role, Role::X);
        assert_eq!(expired.instance, 7);

        let version = room.version();
        assert!(room.handle_turn_timeout(expired.turn));
        assert_eq!(room.winner(), Some(Winner::O));
        assert_eq!(room.disruption(), Some(DisruptionReason::Timeout));
        assert_eq!(room.status(), GameStatus::Finished);
        assert!(room.version() > version);
        assert_deadline_invariant(&room);

        // 重复到期无效
        assert!(!room.handle_turn_timeout(expired.turn));
        assert_eq!(room.apply_move(Role::X, 0), Err(GameError::GameOver));
    }

    #[tokio::test]
    async fn test_disconnect_mid_game_forfeits() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        play(&mut room, &[0]);

        let outcome = room.handle_disconnect(Role::X, 1);
        assert_eq!(outcome, DisconnectOutcome::Updated { forfeited: true });
        assert_eq!(room.winner(), Some(Winner::O));
        assert_eq!(room.disruption(), Some(DisruptionReason::Disconnect));
        assert_eq!(room.status(), GameStatus::Finished);
        assert!(!room.is_closed());
        assert_eq!(room.snapshot().players.x, None);
        assert_deadline_invariant(&room);
    }

    #[tokio::test]
    async fn test_timeout_after_disconnect_forfeit_is_ignored() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        let turn = room.armed_turn().unwrap();

        room.handle_disconnect(Role::X, 1);
        assert_eq!(room.armed_turn(), None);
        let version = room.version();

        // 断线判负之后才到达的到期通知
        assert!(!room.handle_turn_timeout(turn));
        assert_eq!(room.version(), version);
        assert_eq!(room.winner(), Some(Winner::O));
        assert_eq!(room.disruption(), Some(DisruptionReason::Disconnect));
        assert_eq!(room.status(), GameStatus::Finished);
    }

    #[tokio::test]
    async fn test_timeout_from_before_restart_is_ignored() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        let old = room.armed_turn().unwrap();

        room.restart().unwrap();
        let current = room.armed_turn().unwrap();
        assert_ne!(current, old);
        let version = room.version();

        assert!(!room.handle_turn_timeout(old));
        assert_eq!(room.version(), version);
        assert_eq!(room.winner(), None);
        assert_eq!(room.disruption(), None);
        assert_eq!(room.status(), GameStatus::Playing);
        assert_eq!(room.armed_turn(), Some(current));
    }

    #[tokio::test]
    async fn test_single_occupant_disconnect_awards_nothing() {
        let (mut room, _rx) = new_room(GameMode::Match);
        room.assign_role(alice(), 1).unwrap();
        let version = room.version();

        let outcome = room.handle_disconnect(Role::X, 1);
        assert_eq!(outcome, DisconnectOutcome::Destroyed);
        assert_eq!(room.winner(), None);
        assert_eq!(room.disruption(), None);
        assert_eq!(room.status(), GameStatus::Waiting);
        assert!(room.version() > version);
    }

    #[tokio::test]
    async fn test_disconnect_after_finish_keeps_winner() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        play(&mut room, &[0, 4, 1, 5, 2]);

        let outcome = room.handle_disconnect(Role::X, 1);
        assert_eq!(outcome, DisconnectOutcome::Updated { forfeited: false });
        assert_eq!(room.winner(), Some(Winner::X));
        assert_eq!(room.disruption(), None);
        assert_eq!(room.winning_line(), Some([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_restart_with_vacated_seat_waits_for_guest() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        room.handle_disconnect(Role::O, 2);
        assert_eq!(room.winner(), Some(Winner::X));

        // O 的座位断线保留，重开后回到等待
        room.restart().unwrap();
        assert_eq!(room.status(), GameStatus::Waiting);
        assert_deadline_invariant(&room);

        let guest = room.assign_role(Identity::new("guest-5", "Guest 5"), 5).unwrap();
        assert_eq!(guest.role, Role::O);
        assert!(guest.started);
        assert_eq!(room.status(), GameStatus::Playing);
        assert_deadline_invariant(&room);
    }

    #[tokio::test]
    async fn test_match_seat_reserved_for_original_player() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        room.handle_disconnect(Role::O, 2);

        assert_eq!(
            room.assign_role(Identity::new("p-carol", "Carol"), 3),
            Err(JoinError::RoomFull)
        );
        let back = room.assign_role(bob(), 4).unwrap();
        assert_eq!(back.role, Role::O);
        assert_eq!(back.replaced, None);
        // 对局已结束，重连不会重新开局
        assert_eq!(room.status(), GameStatus::Finished);
        assert_deadline_invariant(&room);
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        room.assign_role(alice(), 11).unwrap();
        let version = room.version();

        assert_eq!(room.handle_disconnect(Role::X, 1), DisconnectOutcome::Stale);
        assert_eq!(room.version(), version);
        assert_eq!(room.status(), GameStatus::Playing);
    }

    #[tokio::test]
    async fn test_both_disconnect_destroys() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        room.handle_disconnect(Role::X, 1);
        let outcome = room.handle_disconnect(Role::O, 2);
        assert_eq!(outcome, DisconnectOutcome::Destroyed);
        assert!(room.is_closed());
        assert_eq!(room.turn_deadline(), None);
    }

    #[tokio::test]
    async fn test_restart() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        play(&mut room, &[0, 4, 1, 5, 2]);

        room.restart().unwrap();
        assert!(room.board().is_empty());
        assert_eq!(room.winner(), None);
        assert_eq!(room.winning_line(), None);
        assert_eq!(room.current_turn(), Role::X);
        assert_eq!(room.status(), GameStatus::Playing);
        assert_deadline_invariant(&room);
    }

    #[tokio::test]
    async fn test_restart_disabled_in_match_mode() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        play(&mut room, &[0, 4, 1, 5, 2]);
        let before = room.snapshot();

        assert_eq!(room.restart(), Err(JoinError::RestartDisabled));
        assert_eq!(room.snapshot(), before);
    }

    #[tokio::test]
    async fn test_casual_guest_reclaims_vacated_seat() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        room.handle_disconnect(Role::X, 1);

        let guest = room.assign_role(Identity::new("guest-3", "Guest 3"), 3).unwrap();
        assert_eq!(guest.role, Role::X);
        assert_eq!(room.snapshot().players.x.as_deref(), Some("Guest 3"));
    }

    #[tokio::test]
    async fn test_version_increases_with_every_transition() {
        let (mut room, _rx) = new_room(GameMode::Casual);
        let mut last = room.version();
        let mut check = |room: &Room| {
            assert!(room.version() > last);
            last = room.version();
        };

        room.assign_role(alice(), 1).unwrap();
        check(&room);
        room.assign_role(bob(), 2).unwrap();
        check(&room);
        room.apply_move(Role::X, 0).unwrap();
        check(&room);
        room.restart().unwrap();
        check(&room);
        room.handle_disconnect(Role::O, 2);
        check(&room);
    }

    #[tokio::test]
    async fn test_report_jobs_follow_lifecycle() {
        let (mut room, _rx) = new_room(GameMode::Match);
        room.assign_role(alice(), 1).unwrap();
        assert!(room.take_report_jobs().is_empty());

        room.assign_role(bob(), 2).unwrap();
        let jobs = room.take_report_jobs();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|job| job.match_id == "R1" && job.instance == 7));
        assert_eq!(jobs[0].event, ReportEvent::Start);

        play(&mut room, &[0, 4, 1, 5, 2]);
        let jobs = room.take_report_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(&jobs[0].event, ReportEvent::Result(r) if r.winner == Winner::X));
        assert!(room.take_report_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_forfeit_reports_result_once() {
        let (mut room, _rx) = playing_room(GameMode::Match);
        room.take_report_jobs();

        // 断线判负时认领结果，之后销毁不再上报
        room.handle_disconnect(Role::X, 1);
        let jobs = room.take_report_jobs();
        assert!(matches!(&jobs[..], [ReportJob { event: ReportEvent::Result(_), .. }]));

        room.handle_disconnect(Role::O, 2);
        assert!(room.take_report_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_casual_mode_never_reports() {
        let (mut room, _rx) = playing_room(GameMode::Casual);
        play(&mut room, &[0, 4, 1, 5, 2]);
        assert!(room.take_report_jobs().is_empty());
    }
}
