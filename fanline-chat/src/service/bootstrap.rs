//! 应用启动器 - 负责依赖注入和服务启动
use std::sync::Arc;

use anyhow::{Context, Result};
use fanline_core::FanlineAppConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ChatServerConfig, StoreKind};
use crate::domain::repository::{AuthReplySink, RoomEventPublisher, RoomEventSink};
use crate::infrastructure::messaging::{
    AuthReplyConsumer, InProcessRoomBus, KafkaAuthRequestPublisher, RedisRoomChannel,
};
use crate::infrastructure::store::KeySpace;
use crate::interface::http::router;
use crate::service::tasks::spawn_background_tasks;
use crate::service::wire::{self, ChatContext};

/// 房间事件通道：Redis 发布订阅或进程内总线
enum RoomChannel {
    Redis(Arc<RedisRoomChannel>),
    InProcess(Arc<InProcessRoomBus>),
}

impl RoomChannel {
    fn publisher(&self) -> Arc<dyn RoomEventPublisher> {
        match self {
            RoomChannel::Redis(channel) => channel.clone() as Arc<dyn RoomEventPublisher>,
            RoomChannel::InProcess(bus) => bus.clone() as Arc<dyn RoomEventPublisher>,
        }
    }
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(app_config: &FanlineAppConfig) -> Result<()> {
        let config = Arc::new(ChatServerConfig::from_app_config(app_config)?);
        info!(
            instance_id = %config.instance_id,
            listen_addr = %config.listen_addr,
            store = ?config.store_kind,
            "starting chat service"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (context, mut handles) = Self::create_context(config, shutdown_rx.clone()).await?;

        if let Err(err) = context.registry.announce_instance().await {
            warn!(error = %err, "initial instance beat failed");
        }
        handles.extend(spawn_background_tasks(&context, shutdown_rx));

        let result = Self::start_server(&context).await;

        let _ = shutdown_tx.send(true);
        Self::graceful_shutdown(&context, handles).await;
        info!("chat service stopped");
        result
    }

    /// 创建应用上下文，并启动随上下文存在的消息循环
    async fn create_context(
        config: Arc<ChatServerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(ChatContext, Vec<JoinHandle<()>>)> {
        let store = wire::build_store(&config).await?;
        let channel = match config.store_kind {
            StoreKind::Redis => {
                let keys = KeySpace::new(config.key_prefix.clone());
                let channel = RedisRoomChannel::connect(&config.redis_url, keys)
                    .await
                    .context("failed to open room event channel")?;
                RoomChannel::Redis(Arc::new(channel))
            }
            StoreKind::Memory => RoomChannel::InProcess(Arc::new(InProcessRoomBus::new())),
        };

        let auth_requests = Arc::new(KafkaAuthRequestPublisher::new(config.clone())?);
        let credentials = wire::default_credentials(&config);
        let context = wire::assemble(
            config.clone(),
            store,
            channel.publisher(),
            auth_requests,
            credentials,
        )?;

        let mut handles = Vec::new();
        let sink: Arc<dyn RoomEventSink> = context.registry.clone();
        match channel {
            RoomChannel::Redis(channel) => {
                handles.push(tokio::spawn(channel.run_subscriber(sink, shutdown.clone())));
            }
            RoomChannel::InProcess(bus) => bus.attach(&sink),
        }

        let reply_sink: Arc<dyn AuthReplySink> = context.correlator.clone();
        let consumer = AuthReplyConsumer::new(&config, reply_sink)?;
        handles.push(tokio::spawn(consumer.run(shutdown)));

        Ok((context, handles))
    }

    /// 启动 HTTP / WebSocket 服务器，直到收到停止信号
    async fn start_server(context: &ChatContext) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&context.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", context.config.listen_addr))?;
        info!(addr = %context.config.listen_addr, "chat service listening");

        axum::serve(listener, router(context.app_state()))
            .with_graceful_shutdown(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
            })
            .await
            .context("chat server failed")
    }

    /// 优雅停机：关闭本实例的连接、撤销注册，等待后台任务退出
    async fn graceful_shutdown(context: &ChatContext, handles: Vec<JoinHandle<()>>) {
        match context.registry.retire_instance().await {
            Ok(closed) => info!(sessions = closed, "instance retired"),
            Err(err) => warn!(error = %err, "failed to retire instance"),
        }
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}
