//! 确认通道：AWAITING_CONFIRMATION 时由 UI 决定批准或拒绝
//!
//! 确认是一个被 await 的 future，只挂起当前会话。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::tools::RiskClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

/// 发给 UI 的确认请求
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    pub session_id: String,
    pub step_index: usize,
    pub tool_name: String,
    pub message: String,
    pub risk_class: RiskClass,
    pub affected_items: usize,
    pub bulk_exceeded: bool,
    pub arguments: Value,
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> Decision;
}

/// 一律批准（无人值守、测试）
pub struct AutoApprove;

#[async_trait]
impl ConfirmationChannel for AutoApprove {
    async fn confirm(&self, _request: ConfirmationRequest) -> Decision {
        Decision::Approve
    }
}

/// 一律拒绝
pub struct AutoDeny;

#[async_trait]
impl ConfirmationChannel for AutoDeny {
    async fn confirm(&self, _request: ConfirmationRequest) -> Decision {
        Decision::Deny
    }
}

/// 等待 UI 回复的确认请求
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    reply: oneshot::Sender<Decision>,
}

impl PendingConfirmation {
    pub fn respond(self, decision: Decision) {
        let _ = self.reply.send(decision);
    }

    pub fn approve(self) {
        self.respond(Decision::Approve)
    }

    pub fn deny(self) {
        self.respond(Decision::Deny)
    }
}

/// 通过 mpsc 把请求转发给 UI，oneshot 回复；接收端关闭或回复被丢弃都视为拒绝
#[derive(Clone)]
pub struct ChannelConfirmation {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmation {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationChannel for ChannelConfirmation {
    async fn confirm(&self, request: ConfirmationRequest) -> Decision {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PendingConfirmation { request, reply }).await.is_err() {
            return Decision::Deny;
        }
        rx.await.unwrap_or(Decision::Deny)
    }
}
