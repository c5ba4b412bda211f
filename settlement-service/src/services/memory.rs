//! In-memory store backends.
//!
//! Each store keeps its documents in an `Arc<RwLock<HashMap>>` and performs
//! every conditional write under a single write lock, which gives the same
//! check-and-set guarantees as the MongoDB backend.

use crate::models::{
    Invoice, Notification, Payment, PaymentMethod, PaymentSelector, PaymentStatus, ProcessorRefs,
    StatusTransition, TransitionOutcome, MAX_LATE_CALLBACKS,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mongodb::bson::DateTime;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::invoices::InvoiceStore;
use super::notifications::NotificationSink;
use super::repository::PaymentStore;

#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<String, Payment>>>,
    counters: Arc<RwLock<HashMap<i32, u64>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Payment> {
        self.payments.read().await.values().cloned().collect()
    }
}

fn selects(payment: &Payment, selector: &PaymentSelector) -> bool {
    match selector {
        PaymentSelector::Id(id) => &payment.id == id,
        PaymentSelector::Correlation {
            method,
            correlation_id,
        } => payment.processor_refs.correlation_id(*method) == Some(correlation_id.as_str()),
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn next_sequence(&self, year: i32) -> Result<u64> {
        let mut counters = self.counters.write().await;
        let seq = counters.entry(year).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn insert(&self, payment: &Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments
            .values()
            .any(|p| p.payment_number == payment.payment_number)
        {
            return Err(anyhow!(
                "duplicate payment number {}",
                payment.payment_number
            ));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Payment>> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(id).filter(|p| p.org_id == org_id).cloned())
    }

    async fn find_by_correlation(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
    ) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|p| p.processor_refs.correlation_id(method) == Some(correlation_id))
            .cloned())
    }

    async fn set_processor_refs(&self, id: &str, refs: &ProcessorRefs) -> Result<()> {
        let mut payments = self.payments.write().await;
        if let Some(payment) = payments.get_mut(id) {
            payment.processor_refs = refs.clone();
            payment.updated_at = DateTime::now();
        }
        Ok(())
    }

    async fn transition(
        &self,
        selector: &PaymentSelector,
        transition: &StatusTransition,
    ) -> Result<TransitionOutcome> {
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.values_mut().find(|p| selects(p, selector)) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(TransitionOutcome::AlreadyTerminal(payment.clone()));
        }

        let now = DateTime::now();
        payment.status = transition.status;
        payment.updated_at = now;
        if transition.status == PaymentStatus::Completed {
            payment.settled_at = Some(now);
            payment.invoice_credited = false;
        }
        if let Some(transaction_id) = &transition.transaction_id {
            payment.transaction_id = Some(transaction_id.clone());
        }
        if let Some(reason) = &transition.failure_reason {
            payment.failure_reason = Some(reason.clone());
        }
        if let Some(raw) = &transition.raw_payload {
            payment.raw_payload = Some(raw.clone());
        }
        Ok(TransitionOutcome::Applied(payment.clone()))
    }

    async fn record_late_callback(&self, id: &str, payload: serde_json::Value) -> Result<bool> {
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.get_mut(id) else {
            return Ok(false);
        };
        if payment.late_callbacks.contains(&payload) {
            return Ok(false);
        }
        payment.late_callbacks.push(payload);
        let excess = payment
            .late_callbacks
            .len()
            .saturating_sub(MAX_LATE_CALLBACKS);
        payment.late_callbacks.drain(..excess);
        payment.updated_at = DateTime::now();
        Ok(true)
    }

    async fn mark_invoice_credited(&self, id: &str) -> Result<bool> {
        let mut payments = self.payments.write().await;
        match payments.get_mut(id) {
            Some(payment) if payment.awaits_invoice_credit() => {
                payment.invoice_credited = true;
                payment.updated_at = DateTime::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime,
        limit: i64,
    ) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut stale: Vec<Payment> = payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn list_uncredited(&self, settled_before: DateTime, limit: i64) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut uncredited: Vec<Payment> = payments
            .values()
            .filter(|p| p.awaits_invoice_credit() && p.settled_at.is_some_and(|t| t < settled_before))
            .cloned()
            .collect();
        uncredited.sort_by_key(|p| p.settled_at);
        uncredited.truncate(limit.max(0) as usize);
        Ok(uncredited)
    }

    async fn delete_unless_completed(&self, id: &str) -> Result<bool> {
        let mut payments = self.payments.write().await;
        match payments.get(id) {
            Some(p) if p.status != PaymentStatus::Completed => {
                payments.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default, Clone)]
pub struct InMemoryInvoiceStore {
    invoices: Arc<RwLock<HashMap<String, Invoice>>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn get(&self, id: &str) -> Result<Option<Invoice>> {
        Ok(self.invoices.read().await.get(id).cloned())
    }

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Invoice>> {
        let invoices = self.invoices.read().await;
        Ok(invoices.get(id).filter(|i| i.org_id == org_id).cloned())
    }

    async fn insert(&self, invoice: &Invoice) -> Result<()> {
        let mut invoices = self.invoices.write().await;
        invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn replace_if_version(&self, invoice: &Invoice, expected_version: i64) -> Result<bool> {
        let mut invoices = self.invoices.write().await;
        match invoices.get_mut(&invoice.id) {
            Some(current) if current.version == expected_version => {
                *current = invoice.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default, Clone)]
pub struct InMemoryNotificationStore {
    notifications: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_recipient(&self, recipient_id: &str) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationStore {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notifications.write().await.push(notification);
        Ok(())
    }
}
