//! 后台周期任务
//!
//! 每项职责一个 tokio 任务：会话清理、流量窗口检查、房间到期、实例存活宣告。
//! 所有任务监听同一个关闭信号。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fanline_core::metrics::CHAT_METRICS;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::service::wire::ChatContext;

fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "background task stopped");
    })
}

/// 启动全部周期任务
pub fn spawn_background_tasks(
    context: &ChatContext,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let config = &context.config;
    let mut handles = Vec::with_capacity(4);

    let registry = context.registry.clone();
    handles.push(spawn_periodic(
        "session-sweep",
        Duration::from_secs(config.sweep_interval_seconds),
        shutdown.clone(),
        move || {
            let registry = registry.clone();
            async move {
                match registry.sweep_at(Utc::now()).await {
                    Ok(report) => {
                        if !report.removed_sessions.is_empty() || !report.reaped_instances.is_empty() {
                            info!(
                                sessions = report.removed_sessions.len(),
                                instances = report.reaped_instances.len(),
                                "sweep finished"
                            );
                        }
                    }
                    Err(err) => {
                        CHAT_METRICS.record_store_error("sweep");
                        warn!(error = %err, "session sweep failed");
                    }
                }
            }
        },
    ));

    let traffic = context.traffic.clone();
    handles.push(spawn_periodic(
        "traffic-check",
        Duration::from_secs(config.traffic_check_interval_seconds),
        shutdown.clone(),
        move || {
            let traffic = Arc::clone(&traffic);
            async move {
                let spiking = traffic.check_local_rooms().await;
                if spiking > 0 {
                    debug!(rooms = spiking, "rooms above traffic threshold");
                }
            }
        },
    ));

    let rooms = context.rooms.clone();
    handles.push(spawn_periodic(
        "room-expiry",
        Duration::from_secs(config.sweep_interval_seconds),
        shutdown.clone(),
        move || {
            let rooms = rooms.clone();
            async move {
                if let Err(err) = rooms.expire_due_rooms(Utc::now()).await {
                    CHAT_METRICS.record_store_error("room_expiry");
                    warn!(error = %err, "room expiry pass failed");
                }
            }
        },
    ));

    let registry = context.registry.clone();
    handles.push(spawn_periodic(
        "instance-beat",
        Duration::from_secs(config.heartbeat_interval_seconds),
        shutdown,
        move || {
            let registry = registry.clone();
            async move {
                if let Err(err) = registry.announce_instance().await {
                    CHAT_METRICS.record_store_error("instance_beat");
                    warn!(error = %err, "instance beat failed");
                }
            }
        },
    ));

    handles
}
