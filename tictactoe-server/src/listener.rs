//! 连接接入
//!
//! 每个 TCP 连接拆成读、写两半：写任务只负责把发送队列里的消息写出去，
//! 读循环把解码后的消息交给 `MessageHandler`。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use protocol::{
    ClientMessage, Connection, ErrorCode, Listener, ProtocolError, ServerMessage, TcpConnection,
    TcpListener,
};

use crate::server::{MessageHandler, ServerState};

/// accept 失败后的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 接受连接（不会主动退出）
pub async fn serve(mut listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    let limit = Arc::new(Semaphore::new(state.config.max_connections));
    info!(
        addr = listener.local_addr().as_deref().unwrap_or("?"),
        mode = %state.mode(),
        max_connections = state.config.max_connections,
        "开始接受连接"
    );

    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "接受连接失败");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        match limit.clone().try_acquire_owned() {
            Ok(permit) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(conn, state).await;
                    drop(permit);
                });
            }
            Err(_) => {
                tokio::spawn(reject_busy(conn));
            }
        }
    }
}

/// 连接数已满：回一条错误后关闭
async fn reject_busy(mut conn: TcpConnection) {
    warn!(peer = ?conn.peer_addr(), "连接数已满，拒绝连接");
    let msg = ServerMessage::Error {
        code: ErrorCode::ServerBusy,
        message: "服务器繁忙，请稍后再试".to_string(),
    };
    let _ = conn.send(&msg).await;
    let _ = conn.close().await;
}

async fn handle_connection(conn: TcpConnection, state: Arc<ServerState>) {
    let peer = conn.peer_addr();
    let (conn_id, mut outbound) = state.connect();
    info!(conn_id, peer = ?peer, "新连接");

    let (mut reader, mut writer) = conn.split();

    // 发送端全部释放（连接注销）后队列关闭，写任务随之退出
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = writer.write_frame(&msg).await {
                debug!(conn_id, error = %e, "写入失败");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let idle_timeout = state.config.idle_timeout();
    loop {
        let frame = match idle_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, reader.read_frame::<ClientMessage>()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        info!(conn_id, "连接空闲超时");
                        break;
                    }
                }
            }
            None => reader.read_frame::<ClientMessage>().await,
        };

        match frame {
            Ok(msg) => MessageHandler::handle(&state, conn_id, msg).await,
            // 整帧已读完，跳过这一条即可
            Err(ProtocolError::Json(e)) => {
                warn!(conn_id, error = %e, "消息解码失败，忽略");
            }
            Err(ProtocolError::Bincode(e)) => {
                warn!(conn_id, error = %e, "消息解码失败，忽略");
            }
            Err(ProtocolError::ConnectionClosed) => {
                debug!(conn_id, "对端关闭连接");
                break;
            }
            Err(e) => {
                warn!(conn_id, error = %e, "读取失败，关闭连接");
                break;
            }
        }
    }

    MessageHandler::handle_disconnect(&state, conn_id).await;
    info!(conn_id, "连接结束");
}

#[cfg(test)]
mod tests {
    use super::*;

    use protocol::{Connector, GameStatus, Role, RoomSnapshot, TcpConnector, WireFormat, Winner};

    use crate::config::ServerConfig;
    use crate::identity::TrustedValidator;
    use crate::report::LogReporter;

    async fn start_server(config: ServerConfig) -> String {
        let listener = TcpListener::bind("127.0.0.1:0", config.wire_format)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let state = ServerState::start(config, Arc::new(TrustedValidator), Arc::new(LogReporter));
        tokio::spawn(serve(listener, state));
        addr
    }

    async fn connect(addr: &str, format: WireFormat) -> TcpConnection {
        TcpConnector::new(format).connect(addr).await.unwrap()
    }

    /// 读到满足条件的房间快照为止
    async fn recv_state<F>(conn: &mut TcpConnection, pred: F) -> RoomSnapshot
    where
        F: Fn(&RoomSnapshot) -> bool,
    {
        loop {
            let msg: ServerMessage = tokio::time::timeout(Duration::from_secs(5), conn.recv())
                .await
                .expect("timed out waiting for state")
                .unwrap();
            if let ServerMessage::RoomState(snapshot) = msg {
                if pred(&snapshot) {
                    return snapshot;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_casual_game_over_tcp() {
        let config = ServerConfig {
            wire_format: WireFormat::Json,
            ..ServerConfig::default()
        };
        let addr = start_server(config).await;

        let mut alice = connect(&addr, WireFormat::Json).await;
        let mut bob = connect(&addr, WireFormat::Json).await;

        alice
            .send(&ClientMessage::CreateRoom {
                room_id: Some("e2e".to_string()),
            })
            .await
            .unwrap();
        let msg: ServerMessage = alice.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Assigned { role: Role::X, .. }));

        bob.send(&ClientMessage::JoinRoom {
            room_id: "E2E".to_string(),
        })
        .await
        .unwrap();
        recv_state(&mut alice, |s| s.status == GameStatus::Playing).await;

        let moves = [(0, 1), (4, 2), (1, 3), (5, 4), (2, 5)];
        for (turn, (index, marks)) in moves.into_iter().enumerate() {
            let mover = if turn % 2 == 0 { &mut alice } else { &mut bob };
            mover.send(&ClientMessage::Move { index }).await.unwrap();
            // 等到这一步落子出现在快照里再走下一步
            recv_state(&mut alice, |s| s.board.mark_count() == marks).await;
        }

        let snapshot = recv_state(&mut bob, |s| s.winner.is_some()).await;
        assert_eq!(snapshot.winner, Some(Winner::X));
        assert_eq!(snapshot.winning_line, Some([0, 1, 2]));
        assert_eq!(snapshot.status, GameStatus::Finished);
    }

    #[tokio::test]
    async fn test_ping_over_bincode() {
        let addr = start_server(ServerConfig::default()).await;
        let mut client = connect(&addr, WireFormat::Bincode).await;

        client.send(&ClientMessage::Ping).await.unwrap();
        let msg: ServerMessage = client.recv().await.unwrap();
        assert_eq!(msg, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let addr = start_server(config).await;

        let mut first = connect(&addr, WireFormat::Bincode).await;
        first.send(&ClientMessage::Ping).await.unwrap();
        let _: ServerMessage = first.recv().await.unwrap();

        let mut second = connect(&addr, WireFormat::Bincode).await;
        let msg: ServerMessage = second.recv().await.unwrap();
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: ErrorCode::ServerBusy,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let config = ServerConfig {
            idle_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let addr = start_server(config).await;
        let mut client = connect(&addr, WireFormat::Bincode).await;

        let result = tokio::time::timeout(Duration::from_secs(5), client.recv::<ServerMessage>())
            .await
            .expect("server did not close idle connection");
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
