//! IoT 网关 TCP 服务：设备接入、会话管理与协议桥接。

mod gateway;
mod handlers;
mod integrator;
mod listener;
mod outbox;

use gateway::Gateway;
use iotgw_config::GatewayConfig;
use iotgw_telemetry::init_tracing;
use listener::GatewayListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = GatewayConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let gateway = Gateway::build(&config).await?;
    gateway.start().await?;

    let tcp = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let listener = GatewayListener::new(
        tcp,
        gateway.integrator.clone(),
        gateway.outbox.clone(),
        config.max_payload_size,
    );
    let shutdown = CancellationToken::new();
    let accept_loop = tokio::spawn(listener.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!(target: "iotgw.server", "shutdown_requested");
    shutdown.cancel();
    if let Err(err) = accept_loop.await {
        warn!(target: "iotgw.server", error = %err, "listener_join_failed");
    }
    gateway.stop().await?;

    let metrics = iotgw_telemetry::metrics().snapshot();
    info!(
        target: "iotgw.server",
        frames_received = metrics.frames_received,
        frames_sent = metrics.frames_sent,
        sessions_created = metrics.sessions_created,
        "server_exited"
    );
    Ok(())
}
