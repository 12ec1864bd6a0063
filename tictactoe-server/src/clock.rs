//! 回合计时
//!
//! 每个房间持有一个 `TurnClock`，同一时刻最多只有一个回合在计时。
//! 到期后向网关的到期通道发送 `TurnExpired`，由网关加锁后交给房间判定。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use protocol::{Role, RoomId};

/// 回合到期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnExpired {
    pub room_id: RoomId,
    /// 房间实例号（同名房间销毁重建后不同）
    pub instance: u64,
    /// 回合序号
    pub turn: u64,
    /// 超时的一方
    pub role: Role,
}

pub type ExpirySender = mpsc::UnboundedSender<TurnExpired>;
pub type ExpiryReceiver = mpsc::UnboundedReceiver<TurnExpired>;

/// 正在计时的回合
#[derive(Debug)]
struct ArmedTurn {
    turn: u64,
    role: Role,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    task: JoinHandle<()>,
}

/// 可取消的回合截止时间
#[derive(Debug)]
pub struct TurnClock {
    room_id: RoomId,
    instance: u64,
    timeout: Duration,
    expiry_tx: ExpirySender,
    armed: Option<ArmedTurn>,
    /// 已开始的回合数
    turns: u64,
}

impl TurnClock {
    pub fn new(room_id: RoomId, instance: u64, timeout: Duration, expiry_tx: ExpirySender) -> Self {
        Self {
            room_id,
            instance,
            timeout,
            expiry_tx,
            armed: None,
            turns: 0,
        }
    }

    /// 为 `role` 开始新回合，返回回合序号
    ///
    /// 先取消上一个回合的计时。
    pub fn arm(&mut self, role: Role) -> u64 {
        self.cancel();
        self.turns += 1;
        let turn = self.turns;

        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        // 超出时钟范围视为永不到期
        let expires = Instant::now().checked_add(self.timeout);

        let tx = self.expiry_tx.clone();
        let expired = TurnExpired {
            room_id: self.room_id.clone(),
            instance: self.instance,
            turn,
            role,
        };
        let task = tokio::spawn(async move {
            match expires {
                Some(expires) => tokio::time::sleep_until(expires).await,
                None => std::future::pending::<()>().await,
            }
            // 网关已退出时无需处理
            let _ = tx.send(expired);
        });

        tracing::trace!(room_id = %self.room_id, turn, %role, "回合开始计时");
        self.armed = Some(ArmedTurn {
            turn,
            role,
            started_at,
            deadline,
            task,
        });
        turn
    }

    /// 取消当前计时，返回被取消的回合序号
    pub fn cancel(&mut self) -> Option<u64> {
        self.armed.take().map(|armed| {
            armed.task.abort();
            armed.turn
        })
    }

    /// `turn` 是否仍是正在计时的回合
    pub fn is_armed_for(&self, turn: u64) -> bool {
        self.armed.as_ref().is_some_and(|armed| armed.turn == turn)
    }

    /// 正在计时的回合序号
    pub fn current_turn(&self) -> Option<u64> {
        self.armed.as_ref().map(|armed| armed.turn)
    }

    /// 正在计时的一方
    pub fn armed_role(&self) -> Option<Role> {
        self.armed.as_ref().map(|armed| armed.role)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.armed.as_ref().map(|armed| armed.started_at)
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.armed.as_ref().map(|armed| armed.deadline)
    }
}

impl Drop for TurnClock {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(timeout_secs: u64) -> (TurnClock, ExpiryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = TurnClock::new("ROOM".to_string(), 1, Duration::from_secs(timeout_secs), tx);
        (clock, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_timeout() {
        let (mut clock, mut rx) = clock(30);
        let start = Instant::now();

        let turn = clock.arm(Role::X);
        assert!(clock.is_armed_for(turn));
        assert_eq!(clock.armed_role(), Some(Role::X));
        let deadline = clock.deadline().unwrap();
        let started = clock.started_at().unwrap();
        assert_eq!((deadline - started).num_seconds(), 30);

        let expired = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(
            expired,
            TurnExpired {
                room_id: "ROOM".to_string(),
                instance: 1,
                turn,
                role: Role::X,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous_turn() {
        let (mut clock, mut rx) = clock(30);
        let start = Instant::now();

        let first = clock.arm(Role::X);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let second = clock.arm(Role::O);
        assert_ne!(first, second);
        assert!(!clock.is_armed_for(first));

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.turn, second);
        assert_eq!(expired.role, Role::O);
        assert_eq!(start.elapsed(), Duration::from_secs(40));

        // 第一个回合不会再触发
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (mut clock, mut rx) = clock(30);

        let turn = clock.arm(Role::X);
        assert_eq!(clock.cancel(), Some(turn));
        assert_eq!(clock.cancel(), None);
        assert!(clock.deadline().is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_never_expires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = TurnClock::new("ROOM".to_string(), 1, Duration::MAX, tx);

        let turn = clock.arm(Role::X);
        assert!(clock.is_armed_for(turn));
        assert_eq!(clock.deadline(), Some(DateTime::<Utc>::MAX_UTC));

        tokio::time::sleep(Duration::from_secs(86400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (mut clock, mut rx) = clock(30);
        clock.arm(Role::O);
        drop(clock);

        // 所有发送端都已释放，通道直接关闭
        assert!(rx.recv().await.is_none());
    }
}
