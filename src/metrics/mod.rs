//! # Prometheus 指标收集模块
//!
//! 聊天服务的授权、握手、广播与流量指标。

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 聊天服务全局指标实例
pub static CHAT_METRICS: Lazy<ChatMetrics> = Lazy::new(ChatMetrics::new);

/// 聊天服务指标
pub struct ChatMetrics {
    /// 授权请求结果（action, outcome）
    pub auth_requests_total: IntCounterVec,
    /// 授权往返耗时（秒）
    pub auth_round_trip_seconds: Histogram,
    /// 超时后到达、被丢弃的回复数
    pub late_replies_total: IntCounter,
    /// 握手拒绝次数（reason）
    pub handshake_rejections_total: IntCounterVec,
    /// 本实例持有的连接数
    pub local_sessions: IntGauge,
    /// 单连接投递失败次数
    pub broadcast_failures_total: IntCounter,
    /// 流量激增提示次数
    pub spike_notices_total: IntCounter,
    /// 存储调用失败次数（operation）
    pub store_errors_total: IntCounterVec,
    /// 清理任务移除的会话数
    pub swept_sessions_total: IntCounter,
}

impl ChatMetrics {
    pub fn new() -> Self {
        let auth_requests_total = IntCounterVec::new(
            Opts::new(
                "chat_auth_requests_total",
                "Total number of chat authorization requests by outcome",
            ),
            &["action", "outcome"],
        )
        .expect("Failed to create chat_auth_requests_total metric");

        let auth_round_trip_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chat_auth_round_trip_seconds",
                "Authorization request/reply round trip in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .expect("Failed to create chat_auth_round_trip_seconds metric");

        let late_replies_total = IntCounter::new(
            "chat_auth_late_replies_total",
            "Total number of authorization replies dropped after their caller timed out",
        )
        .expect("Failed to create chat_auth_late_replies_total metric");

        let handshake_rejections_total = IntCounterVec::new(
            Opts::new(
                "chat_handshake_rejections_total",
                "Total number of rejected realtime handshakes",
            ),
            &["reason"],
        )
        .expect("Failed to create chat_handshake_rejections_total metric");

        let local_sessions = IntGauge::new(
            "chat_local_sessions",
            "Number of connections owned by this instance",
        )
        .expect("Failed to create chat_local_sessions metric");

        let broadcast_failures_total = IntCounter::new(
            "chat_broadcast_failures_total",
            "Total number of failed deliveries to individual connections",
        )
        .expect("Failed to create chat_broadcast_failures_total metric");

        let spike_notices_total = IntCounter::new(
            "chat_spike_notices_total",
            "Total number of high-traffic notices broadcast to rooms",
        )
        .expect("Failed to create chat_spike_notices_total metric");

        let store_errors_total = IntCounterVec::new(
            Opts::new(
                "chat_store_errors_total",
                "Total number of shared store failures by operation",
            ),
            &["operation"],
        )
        .expect("Failed to create chat_store_errors_total metric");

        let swept_sessions_total = IntCounter::new(
            "chat_swept_sessions_total",
            "Total number of sessions removed by the inactivity sweep",
        )
        .expect("Failed to create chat_swept_sessions_total metric");

        // 注册指标，忽略重复注册错误
        let _ = REGISTRY.register(Box::new(auth_requests_total.clone()));
        let _ = REGISTRY.register(Box::new(auth_round_trip_seconds.clone()));
        let _ = REGISTRY.register(Box::new(late_replies_total.clone()));
        let _ = REGISTRY.register(Box::new(handshake_rejections_total.clone()));
        let _ = REGISTRY.register(Box::new(local_sessions.clone()));
        let _ = REGISTRY.register(Box::new(broadcast_failures_total.clone()));
        let _ = REGISTRY.register(Box::new(spike_notices_total.clone()));
        let _ = REGISTRY.register(Box::new(store_errors_total.clone()));
        let _ = REGISTRY.register(Box::new(swept_sessions_total.clone()));

        Self {
            auth_requests_total,
            auth_round_trip_seconds,
            late_replies_total,
            handshake_rejections_total,
            local_sessions,
            broadcast_failures_total,
            spike_notices_total,
            store_errors_total,
            swept_sessions_total,
        }
    }

    /// 记录存储失败
    pub fn record_store_error(&self, operation: &str) {
        self.store_errors_total
            .with_label_values(&[operation])
            .inc();
    }
}

impl Default for ChatMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_contains_chat_metrics() {
        CHAT_METRICS.spike_notices_total.inc();
        CHAT_METRICS.record_store_error("sadd");
        let text = gather_metrics();
        assert!(text.contains("chat_spike_notices_total"));
        assert!(text.contains("chat_store_errors_total"));
    }
}
