//! 可观测性：tracing 订阅器初始化，引擎事件转日志

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::engine::{EngineEvent, EventBus};

/// 默认 info，可用 RUST_LOG 覆盖；日志写到 stderr，stdout 留给报告
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// 订阅事件总线，每个事件写一行 JSON 日志；总线关闭时退出
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(missed = n, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &EngineEvent) {
    let line = serde_json::to_string(event).unwrap_or_default();
    match event {
        EngineEvent::StepTransition { error: Some(_), .. } => tracing::warn!(event = %line, "engine"),
        _ => tracing::debug!(event = %line, "engine"),
    }
}
