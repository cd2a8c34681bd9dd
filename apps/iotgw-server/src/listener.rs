//! TCP 接入：每条连接一个任务，字节流按 DNY 长度字段切帧后交给连接钩子。

use crate::outbox::Outbox;
use bytes::BytesMut;
use iotgw_bridge::{ConnectionHooks, DnyStreamCodec};
use iotgw_session::ConnectionInfo;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

pub struct GatewayListener {
    listener: TcpListener,
    hooks: Arc<dyn ConnectionHooks>,
    outbox: Arc<Outbox>,
    max_frame_len: usize,
    next_conn_id: AtomicU64,
}

impl GatewayListener {
    pub fn new(
        listener: TcpListener,
        hooks: Arc<dyn ConnectionHooks>,
        outbox: Arc<Outbox>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            listener,
            hooks,
            outbox,
            max_frame_len,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// 接入循环；取消后等待全部连接任务退出。
    pub async fn run(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();
        info!(
            target: "iotgw.listener",
            addr = ?self.listener.local_addr().ok(),
            "listener_started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(target: "iotgw.listener", error = %err, "accept_failed");
                            continue;
                        }
                    };
                    let conn = ConnectionInfo::new(
                        self.next_conn_id.fetch_add(1, Ordering::Relaxed),
                        peer.to_string(),
                    );
                    connections.spawn(serve_connection(
                        stream,
                        conn,
                        self.hooks.clone(),
                        self.outbox.clone(),
                        DnyStreamCodec::new(self.max_frame_len),
                        shutdown.clone(),
                    ));
                    // 回收已结束的连接任务
                    while connections.try_join_next().is_some() {}
                }
            }
        }
        while connections.join_next().await.is_some() {}
        info!(
            target: "iotgw.listener",
            open = self.outbox.connection_count(),
            "listener_stopped"
        );
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    conn: ConnectionInfo,
    hooks: Arc<dyn ConnectionHooks>,
    outbox: Arc<Outbox>,
    mut codec: DnyStreamCodec,
    shutdown: CancellationToken,
) {
    if let Err(err) = hooks.on_connection_established(&conn).await {
        warn!(
            target: "iotgw.listener",
            conn_id = conn.conn_id,
            error = %err,
            "connection_rejected"
        );
        return;
    }
    let mut downlink = outbox.attach(conn.conn_id);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = stream.read_buf(&mut buffer) => {
                let eof = match read {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(err) => {
                        debug!(
                            target: "iotgw.listener",
                            conn_id = conn.conn_id,
                            error = %err,
                            "read_failed"
                        );
                        break;
                    }
                };
                drain_frames(&mut codec, &mut buffer, eof, &conn, hooks.as_ref()).await;
                if eof {
                    break;
                }
            }
            Some(frame) = downlink.recv() => {
                if let Err(err) = stream.write_all(&frame).await {
                    debug!(
                        target: "iotgw.listener",
                        conn_id = conn.conn_id,
                        error = %err,
                        "write_failed"
                    );
                    break;
                }
                if let Err(err) = hooks.on_data_sent(&conn, &frame).await {
                    warn!(
                        target: "iotgw.listener",
                        conn_id = conn.conn_id,
                        error = %err,
                        "outbound_record_failed"
                    );
                }
            }
        }
    }
    outbox.detach(conn.conn_id);
    if let Err(err) = hooks.on_connection_closed(&conn).await {
        warn!(
            target: "iotgw.listener",
            conn_id = conn.conn_id,
            error = %err,
            "connection_close_failed"
        );
    }
}

/// 把缓冲区里已完整的帧逐个交给钩子；连接关闭时连同残留字节一起交出。
async fn drain_frames(
    codec: &mut DnyStreamCodec,
    buffer: &mut BytesMut,
    eof: bool,
    conn: &ConnectionInfo,
    hooks: &dyn ConnectionHooks,
) {
    loop {
        let next = if eof {
            codec.decode_eof(buffer)
        } else {
            codec.decode(buffer)
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(err) => {
                debug!(
                    target: "iotgw.listener",
                    conn_id = conn.conn_id,
                    error = %err,
                    "frame_split_failed"
                );
                buffer.clear();
                return;
            }
        };
        if let Err(err) = hooks.on_data_received(conn, &chunk).await {
            warn!(
                target: "iotgw.listener",
                conn_id = conn.conn_id,
                error = %err,
                "inbound_data_rejected"
            );
        }
    }
}
