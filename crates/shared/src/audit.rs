use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CommonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Denied,
    NotFound,
    Partial,
    Error,
}

/// One audit record per authorization decision and per lifecycle action
/// (creation, rotation, deletion). Events carry enough context to investigate
/// an incident without the sink ever holding plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    pub tenant_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub result: AuditResult,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            actor: actor.into(),
            tenant_id: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            result,
            timestamp: Utc::now(),
            error: None,
            detail: None,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn error_message(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Destination for audit events. The storage/streaming backend behind it is
/// external to this subsystem; the core only guarantees that every attempt is
/// emitted exactly once.
#[async_trait::async_trait]
pub trait AuditSinkLike: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), CommonError>;
}

pub type AuditEventSender = tokio::sync::broadcast::Sender<AuditEvent>;
pub type AuditEventReceiver = tokio::sync::broadcast::Receiver<AuditEvent>;

/// Fans events out to broadcast subscribers and mirrors them onto the tracing
/// pipeline. A subscriber-less channel is not an error: the tracing mirror is
/// the floor, downstream shipping is best-effort fan-out.
pub struct BroadcastAuditSink {
    tx: AuditEventSender,
}

impl BroadcastAuditSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> AuditEventReceiver {
        self.tx.subscribe()
    }
}

impl Default for BroadcastAuditSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl AuditSinkLike for BroadcastAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), CommonError> {
        tracing::info!(
            actor = %event.actor,
            tenant_id = event.tenant_id.as_deref().unwrap_or("-"),
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = event.resource_id.as_deref().unwrap_or("-"),
            result = ?event.result,
            error = event.error.as_deref().unwrap_or(""),
            "audit"
        );
        // send only fails when there are no subscribers, which is fine
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Test double that records every emitted event for assertions.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock poisoned").clone()
    }

    pub fn events_with_result(&self, result: AuditResult) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.result == result)
            .collect()
    }
}

#[async_trait::async_trait]
impl AuditSinkLike for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), CommonError> {
        self.events
            .lock()
            .expect("audit sink lock poisoned")
            .push(event);
        Ok(())
    }
}
