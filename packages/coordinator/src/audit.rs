//! Audit and settlement sinks
//!
//! Sinks are observers: they receive every status transition and every refund obligation,
//! but a sink failing or lagging never affects a transaction. The coordinator calls them
//! after the store has accepted the change.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::models::{RefundObligation, TransitionEvent};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_transition(&self, event: &TransitionEvent);
}

/// Collaborator that settles compensating refunds for reverted transfers
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn refund_required(&self, obligation: &RefundObligation);
}

/// Writes transitions to the structured log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_transition(&self, event: &TransitionEvent) {
        info!(
            tx_id = event.transaction_id,
            bridge_id = event.bridge_id,
            from = %event.from,
            to = %event.to,
            reason = event.reason.as_deref().unwrap_or(""),
            "Transaction transition"
        );
    }
}

/// Logs refund obligations for an operator to settle
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSettlementSink;

#[async_trait]
impl SettlementSink for TracingSettlementSink {
    async fn refund_required(&self, obligation: &RefundObligation) {
        warn!(
            tx_id = obligation.transaction_id,
            bridge_id = obligation.bridge_id,
            refund_address = %obligation.refund_address,
            amount = %obligation.amount,
            token = %obligation.token_symbol,
            reason = %obligation.reason,
            "Refund obligation raised"
        );
    }
}

/// Keeps everything in memory, for tests and the admin debug view
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<TransitionEvent>>,
    refunds: Mutex<Vec<RefundObligation>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, transaction_id: i64) -> Vec<TransitionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.transaction_id == transaction_id)
            .collect()
    }

    pub fn refunds(&self) -> Vec<RefundObligation> {
        self.refunds
            .lock()
            .map(|refunds| refunds.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_transition(&self, event: &TransitionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[async_trait]
impl SettlementSink for MemoryAuditSink {
    async fn refund_required(&self, obligation: &RefundObligation) {
        if let Ok(mut refunds) = self.refunds.lock() {
            refunds.push(obligation.clone());
        }
    }
}

/// Fans one event out to several sinks
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<std::sync::Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn record_transition(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.record_transition(event).await;
        }
    }
}
