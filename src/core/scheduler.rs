//! 会话调度：Semaphore 限制同时执行的会话数，超出的运行排队等待

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::EngineError;

pub struct SessionScheduler {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SessionScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// 获取执行许可；关闭后返回 Shutdown
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// 当前可立即开始的会话数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 不再发放新许可；已持有的许可不受影响
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for SessionScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}
