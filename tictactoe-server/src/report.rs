//! 比赛结果上报
//!
//! 房间在加锁状态下通过 `MatchLedger` 认领要上报的事件，保证每个事件最多上报一次；
//! 认领后的任务交给 `ReportDispatcher` 按比赛分队列异步执行，不持有房间锁。
//! 上报失败只记录日志，不影响对局结果。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use protocol::{GameStatus, Identity, PlayerId, RoomId, Winner};

use crate::registry::RoomRegistry;

/// 上报失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    /// 平台拒绝
    #[error("platform rejected report: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// 网络错误
    #[error("transport error: {0}")]
    Transport(String),
}

/// 单个玩家的比赛得分
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerScore {
    pub id: PlayerId,
    pub score: u32,
    pub is_winner: bool,
}

/// 比赛结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub winner: Winner,
    /// 胜者在前；和棋时按 X、O 排列
    pub players: Vec<PlayerScore>,
}

impl MatchResult {
    /// 胜者 1 分、负者 0 分，和棋双方 0 分
    pub fn new(x: &Identity, o: &Identity, winner: Winner) -> Self {
        let score = |player: &Identity, won: bool| PlayerScore {
            id: player.id.clone(),
            score: u32::from(won),
            is_winner: won,
        };

        let players = match winner {
            Winner::X => vec![score(x, true), score(o, false)],
            Winner::O => vec![score(o, true), score(x, false)],
            Winner::Draw => vec![score(x, false), score(o, false)],
        };
        Self { winner, players }
    }
}

/// 结果上报接口（外部平台）
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report_start(&self, match_id: &str) -> Result<(), ReportError>;

    async fn report_player_joined(&self, match_id: &str, player_id: &str) -> Result<(), ReportError>;

    async fn report_result(&self, match_id: &str, result: &MatchResult) -> Result<(), ReportError>;

    async fn report_error(&self, match_id: &str, reason: &str) -> Result<(), ReportError>;
}

/// 只写日志的上报器（未接入平台时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl ResultReporter for LogReporter {
    async fn report_start(&self, match_id: &str) -> Result<(), ReportError> {
        info!(match_id, "比赛开始");
        Ok(())
    }

    async fn report_player_joined(&self, match_id: &str, player_id: &str) -> Result<(), ReportError> {
        info!(match_id, player_id, "玩家加入比赛");
        Ok(())
    }

    async fn report_result(&self, match_id: &str, result: &MatchResult) -> Result<(), ReportError> {
        info!(match_id, winner = %result.winner, players = ?result.players, "比赛结果");
        Ok(())
    }

    async fn report_error(&self, match_id: &str, reason: &str) -> Result<(), ReportError> {
        warn!(match_id, reason, "比赛异常结束");
        Ok(())
    }
}

/// 上报事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Start,
    PlayerJoined(PlayerId),
    Result(MatchResult),
    Error(String),
}

impl ReportEvent {
    fn name(&self) -> &'static str {
        match self {
            ReportEvent::Start => "start",
            ReportEvent::PlayerJoined(_) => "player_joined",
            ReportEvent::Result(_) => "result",
            ReportEvent::Error(_) => "error",
        }
    }
}

/// 已认领、待执行的上报任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportJob {
    pub match_id: RoomId,
    /// 认领时的房间实例号
    pub instance: u64,
    pub event: ReportEvent,
}

/// 认领状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    InFlight,
    Done,
    Failed,
}

impl ClaimState {
    pub fn is_claimed(self) -> bool {
        self != ClaimState::Unclaimed
    }

    fn settle(&mut self, delivered: bool) {
        *self = if delivered {
            ClaimState::Done
        } else {
            ClaimState::Failed
        };
    }
}

/// 认领时房间状态的只读视图
#[derive(Debug, Clone, Copy)]
pub struct LedgerView<'a> {
    pub status: GameStatus,
    pub winner: Option<Winner>,
    pub x: Option<&'a Identity>,
    pub o: Option<&'a Identity>,
    /// 房间已销毁
    pub closed: bool,
}

/// 比赛上报台账
#[derive(Debug, Clone, Default)]
pub struct MatchLedger {
    start: ClaimState,
    players: HashMap<PlayerId, ClaimState>,
    close: ClaimState,
}

impl MatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据当前房间状态认领新事件，返回按发生顺序排列的事件
    pub fn claim(&mut self, view: LedgerView<'_>) -> Vec<ReportEvent> {
        let mut events = Vec::new();

        if !self.start.is_claimed()
            && view.status != GameStatus::Waiting
            && view.x.is_some()
            && view.o.is_some()
        {
            self.start = ClaimState::InFlight;
            events.push(ReportEvent::Start);
        }

        // 未开始的比赛不上报玩家和结果
        if !self.start.is_claimed() {
            return events;
        }

        for player in [view.x, view.o].into_iter().flatten() {
            if !self.players.contains_key(&player.id) {
                self.players.insert(player.id.clone(), ClaimState::InFlight);
                events.push(ReportEvent::PlayerJoined(player.id.clone()));
            }
        }

        if !self.close.is_claimed() {
            match (view.winner, view.x, view.o) {
                (Some(winner), Some(x), Some(o)) => {
                    self.close = ClaimState::InFlight;
                    events.push(ReportEvent::Result(MatchResult::new(x, o, winner)));
                }
                _ if view.closed => {
                    self.close = ClaimState::InFlight;
                    events.push(ReportEvent::Error("abandoned".to_string()));
                }
                _ => {}
            }
        }

        events
    }

    /// 记录上报结果
    pub fn record(&mut self, event: &ReportEvent, delivered: bool) {
        match event {
            ReportEvent::Start => self.start.settle(delivered),
            ReportEvent::PlayerJoined(player_id) => {
                if let Some(state) = self.players.get_mut(player_id) {
                    state.settle(delivered);
                }
            }
            ReportEvent::Result(_) | ReportEvent::Error(_) => self.close.settle(delivered),
        }
    }

    pub fn start_state(&self) -> ClaimState {
        self.start
    }

    pub fn player_state(&self, player_id: &str) -> ClaimState {
        self.players.get(player_id).copied().unwrap_or_default()
    }

    pub fn close_state(&self) -> ClaimState {
        self.close
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（至少 1）
    pub attempts: u32,
    /// 首次重试前的等待时间，之后每次翻倍
    pub backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// 同一场比赛的上报队列键：比赛 ID 加房间实例号
type QueueKey = (RoomId, u64);

/// 上报调度器
///
/// 每场比赛一个队列、一个后台任务：同一场比赛的事件按提交顺序执行，
/// 不同比赛之间互不等待。队列排空后任务退出。
#[derive(Clone)]
pub struct ReportDispatcher {
    inner: Arc<DispatchContext>,
}

struct DispatchContext {
    reporter: Arc<dyn ResultReporter>,
    registry: Arc<RoomRegistry>,
    policy: RetryPolicy,
    queues: Mutex<HashMap<QueueKey, mpsc::UnboundedSender<ReportJob>>>,
}

impl ReportDispatcher {
    pub fn new(
        reporter: Arc<dyn ResultReporter>,
        registry: Arc<RoomRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchContext {
                reporter,
                registry,
                policy,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 提交任务（调用方可能持有房间锁，这里不能等待）
    pub fn submit(&self, jobs: Vec<ReportJob>) {
        let mut queues = self.inner.lock_queues();
        for job in jobs {
            let key = (job.match_id.clone(), job.instance);
            let tx = queues.entry(key.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_match_queue(self.inner.clone(), key.clone(), rx));
                tx
            });
            if tx.send(job).is_err() {
                error!(match_id = %key.0, "上报队列已关闭，任务丢弃");
                queues.remove(&key);
            }
        }
    }

    /// 仍有任务在执行的比赛数
    pub fn active_queues(&self) -> usize {
        self.inner.lock_queues().len()
    }
}

impl DispatchContext {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<QueueKey, mpsc::UnboundedSender<ReportJob>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn process(&self, job: ReportJob) {
        let delivered = deliver(self.reporter.as_ref(), &job, self.policy).await;

        // 短暂重新加锁记录结果；房间已销毁或重建则不再记录
        let Some(room) = self.registry.get(&job.match_id) else {
            return;
        };
        let mut room = room.lock().await;
        if room.instance() == job.instance {
            room.record_report(&job.event, delivered);
        }
    }
}

/// 逐个执行一场比赛的上报任务
async fn run_match_queue(
    ctx: Arc<DispatchContext>,
    key: QueueKey,
    mut rx: mpsc::UnboundedReceiver<ReportJob>,
) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // 提交方在同一把锁下发送，持锁确认队列为空后才能注销
                let mut queues = ctx.lock_queues();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        queues.remove(&key);
                        break;
                    }
                }
            }
        };
        ctx.process(job).await;
    }
    debug!(match_id = %key.0, instance = key.1, "上报队列排空");
}

async fn deliver(reporter: &dyn ResultReporter, job: &ReportJob, policy: RetryPolicy) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        let result = match &job.event {
            ReportEvent::Start => reporter.report_start(&job.match_id).await,
            ReportEvent::PlayerJoined(player_id) => {
                reporter.report_player_joined(&job.match_id, player_id).await
            }
            ReportEvent::Result(result) => reporter.report_result(&job.match_id, result).await,
            ReportEvent::Error(reason) => reporter.report_error(&job.match_id, reason).await,
        };

        match result {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    match_id = %job.match_id,
                    event = job.event.name(),
                    attempt,
                    error = %e,
                    "上报失败，{}ms 后重试",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    match_id = %job.match_id,
                    event = job.event.name(),
                    attempts,
                    error = %e,
                    "上报最终失败"
                );
            }
        }
    }
    false
}

/// 记录所有调用的上报器（测试用）
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    pub calls: std::sync::Mutex<Vec<(String, ReportEvent)>>,
    /// 剩余需要失败的次数
    pub failures: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn failing(times: u32) -> Self {
        Self {
            failures: std::sync::atomic::AtomicU32::new(times),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<(String, ReportEvent)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, match_id: &str, event: ReportEvent) -> Result<(), ReportError> {
        use std::sync::atomic::Ordering;

        self.calls.lock().unwrap().push((match_id.to_string(), event));
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(ReportError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ResultReporter for RecordingReporter {
    async fn report_start(&self, match_id: &str) -> Result<(), ReportError> {
        self.record(match_id, ReportEvent::Start)
    }

    async fn report_player_joined(&self, match_id: &str, player_id: &str) -> Result<(), ReportError> {
        self.record(match_id, ReportEvent::PlayerJoined(player_id.to_string()))
    }

    async fn report_result(&self, match_id: &str, result: &MatchResult) -> Result<(), ReportError> {
        self.record(match_id, ReportEvent::Result(result.clone()))
    }

    async fn report_error(&self, match_id: &str, reason: &str) -> Result<(), ReportError> {
        self.record(match_id, ReportEvent::Error(reason.to_string()))
    }
}
