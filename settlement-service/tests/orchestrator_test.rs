//! Orchestrator behaviour against in-memory stores and a scripted processor.

use async_trait::async_trait;
use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use settlement_service::models::{
    ActionKind, Invoice, InvoiceStatus, MobileMoneyRef, NotificationKind, PaymentEvent,
    PaymentMethod, PaymentStatus, ProcessorRefs,
};
use settlement_service::services::processors::{
    CallbackOutcome, ChargeRequest, ChargeResponse, PaymentProcessor, ProcessorError,
    ProcessorOutcome, RemoteState, StatusReport,
};
use settlement_service::services::{
    ApplyResult, BroadcastEvents, InMemoryInvoiceStore, InMemoryNotificationStore,
    InMemoryPaymentStore, InitiatePayment, InvoiceStore, NotificationSink, PaymentOrchestrator,
    ProcessorRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const ORG: &str = "org-1";

/// Accepts every charge and reports whatever state it was built with.
struct ScriptedProcessor {
    charges: AtomicUsize,
    remote_state: RemoteState,
}

impl ScriptedProcessor {
    fn new(remote_state: RemoteState) -> Self {
        Self {
            charges: AtomicUsize::new(0),
            remote_state,
        }
    }
}

#[async_trait]
impl PaymentProcessor for ScriptedProcessor {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ProcessorError> {
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        let checkout_request_id = format!("checkout-{}", n);
        Ok(ChargeResponse {
            refs: ProcessorRefs {
                mobile_money: Some(MobileMoneyRef {
                    merchant_request_id: format!("merchant-{}", request.payment_id),
                    checkout_request_id: checkout_request_id.clone(),
                }),
                card_gateway: None,
            },
            correlation_id: checkout_request_id,
            redirect_url: None,
            raw: json!({}),
        })
    }

    fn parse_callback(&self, body: &[u8]) -> CallbackOutcome {
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(value) => match value["id"].as_str() {
                Some(id) => CallbackOutcome::Resolved(outcome(id, value["ok"] == true)),
                None => CallbackOutcome::Invalid("no id".to_string()),
            },
            Err(e) => CallbackOutcome::Invalid(e.to_string()),
        }
    }

    async fn query_status(&self, _correlation_id: &str) -> Result<StatusReport, ProcessorError> {
        Ok(StatusReport {
            state: self.remote_state,
            result_code: "scripted".to_string(),
            result_desc: "scripted result".to_string(),
            transaction_id: Some("TX-POLL".to_string()),
            amount: None,
            raw: json!({"source": "poll"}),
        })
    }
}

struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn notify(
        &self,
        _notification: settlement_service::models::Notification,
    ) -> anyhow::Result<()> {
        anyhow::bail!("notification backend down")
    }
}

/// Fails the first `failures` invoice writes, then behaves like the store it wraps.
struct FlakyInvoiceStore {
    inner: InMemoryInvoiceStore,
    failures: AtomicUsize,
}

#[async_trait]
impl InvoiceStore for FlakyInvoiceStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Invoice>> {
        self.inner.get(id).await
    }

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> anyhow::Result<Option<Invoice>> {
        self.inner.get_in_tenant(org_id, id).await
    }

    async fn insert(&self, invoice: &Invoice) -> anyhow::Result<()> {
        self.inner.insert(invoice).await
    }

    async fn replace_if_version(
        &self,
        invoice: &Invoice,
        expected_version: i64,
    ) -> anyhow::Result<bool> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("invoice store unavailable");
        }
        self.inner.replace_if_version(invoice, expected_version).await
    }
}

fn outcome(correlation_id: &str, success: bool) -> ProcessorOutcome {
    ProcessorOutcome {
        correlation_id: correlation_id.to_string(),
        success,
        amount: None,
        payer_identifier: None,
        transaction_id: success.then(|| format!("TX-{}", correlation_id)),
        description: (!success).then(|| "Request cancelled by user".to_string()),
        raw: json!({"id": correlation_id, "ok": success}),
    }
}

struct Harness {
    orchestrator: PaymentOrchestrator,
    payments: InMemoryPaymentStore,
    invoices: InMemoryInvoiceStore,
    notifications: InMemoryNotificationStore,
    events: BroadcastEvents,
}

fn harness_with(remote_state: RemoteState, sink: Option<Arc<dyn NotificationSink>>) -> Harness {
    build_harness(remote_state, sink, 0)
}

/// A harness whose first `invoice_write_failures` invoice writes fail.
fn harness_with_flaky_invoices(remote_state: RemoteState, invoice_write_failures: usize) -> Harness {
    build_harness(remote_state, None, invoice_write_failures)
}

fn build_harness(
    remote_state: RemoteState,
    sink: Option<Arc<dyn NotificationSink>>,
    invoice_write_failures: usize,
) -> Harness {
    let payments = InMemoryPaymentStore::new();
    let invoices = InMemoryInvoiceStore::new();
    let invoice_store: Arc<dyn InvoiceStore> = Arc::new(FlakyInvoiceStore {
        inner: invoices.clone(),
        failures: AtomicUsize::new(invoice_write_failures),
    });
    let notifications = InMemoryNotificationStore::new();
    let events = BroadcastEvents::new();
    let sink: Arc<dyn NotificationSink> = match sink {
        Some(sink) => sink,
        None => Arc::new(notifications.clone()),
    };

    let orchestrator = PaymentOrchestrator::new(
        Arc::new(payments.clone()),
        invoice_store,
        sink,
        Arc::new(events.clone()),
        ProcessorRegistry::new().with(Arc::new(ScriptedProcessor::new(remote_state))),
        "https://api.example.com",
        "https://app.example.com",
    );

    Harness {
        orchestrator,
        payments,
        invoices,
        notifications,
        events,
    }
}

fn harness() -> Harness {
    harness_with(RemoteState::Processing, None)
}

impl Harness {
    async fn seed_invoice(&self, total: Decimal) -> Invoice {
        let now = DateTime::now();
        let invoice = Invoice {
            id: format!("inv-{}", total),
            org_id: ORG.to_string(),
            invoice_number: "INV-2026-0007".to_string(),
            client_id: "client-9".to_string(),
            client_email: None,
            client_phone: Some("0712345678".to_string()),
            currency: "KES".to_string(),
            total_amount: total,
            paid_amount: Decimal::ZERO,
            status: InvoiceStatus::Sent,
            credited_payments: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.invoices.insert(&invoice).await.unwrap();
        invoice
    }

    async fn initiate(&self, invoice: &Invoice, amount: Decimal) -> String {
        self.orchestrator
            .initiate(
                ORG,
                Some("user-1".to_string()),
                InitiatePayment {
                    invoice_id: invoice.id.clone(),
                    method: PaymentMethod::MobileMoney,
                    amount,
                    payer_phone: None,
                    payer_email: None,
                    notes: Some("first instalment".to_string()),
                },
            )
            .await
            .unwrap()
            .correlation_id
    }
}

#[tokio::test]
async fn racing_outcomes_apply_exactly_once() {
    let h = harness();
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(40)).await;

    let (first, second) = tokio::join!(
        h.orchestrator
            .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true)),
        h.orchestrator
            .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true)),
    );

    let results = [first.unwrap(), second.unwrap()];
    let applied = results
        .iter()
        .filter(|r| matches!(r, ApplyResult::Applied(_)))
        .count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, ApplyResult::Duplicate(_)))
        .count();
    assert_eq!((applied, duplicates), (1, 1));

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, dec!(40));
    assert_eq!(stored.status, InvoiceStatus::PartiallyPaid);

    let notifications = h.notifications.for_recipient("client-9").await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::PaymentReceived);
    assert!(notifications[0].has_action(ActionKind::DownloadReceipt));
    assert!(notifications[0].has_action(ActionKind::ViewInvoice));
}

#[tokio::test]
async fn webhook_and_poll_race_credits_once() {
    let h = harness_with(RemoteState::Succeeded, None);
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(100)).await;
    let body = json!({"id": correlation_id, "ok": true}).to_string();

    let (webhook, poll) = tokio::join!(
        h.orchestrator
            .handle_callback(PaymentMethod::MobileMoney, body.as_bytes()),
        h.orchestrator
            .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG)),
    );
    webhook.unwrap();
    let poll = poll.unwrap();
    assert_eq!(poll.payment.status, PaymentStatus::Completed);

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, dec!(100));
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(h.notifications.for_recipient("client-9").await.len(), 1);
}

#[tokio::test]
async fn failure_notifies_with_retry_link_and_leaves_invoice() {
    let h = harness();
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(25)).await;

    let result = h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, false))
        .await
        .unwrap();
    let ApplyResult::Applied(payment) = result else {
        panic!("expected the failure to apply");
    };
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.failure_reason.as_deref(),
        Some("Request cancelled by user")
    );

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, dec!(0));
    assert_eq!(stored.status, InvoiceStatus::Sent);

    let notifications = h.notifications.for_recipient("client-9").await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::PaymentFailed);
    let retry = notifications[0]
        .actions
        .iter()
        .find(|a| a.action == ActionKind::RetryPayment)
        .expect("retry action");
    assert_eq!(
        retry.url,
        format!("https://app.example.com/invoices/{}/pay", invoice.id)
    );
}

#[tokio::test]
async fn notification_failure_does_not_undo_settlement() {
    let h = harness_with(RemoteState::Processing, Some(Arc::new(FailingSink)));
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(100)).await;

    let result = h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await
        .unwrap();
    assert!(matches!(result, ApplyResult::Applied(_)));

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn settlement_publishes_payment_and_invoice_events() {
    let h = harness();
    let invoice = h.seed_invoice(dec!(100)).await;
    let mut events = h.events.subscribe();
    let correlation_id = h.initiate(&invoice, dec!(60)).await;

    h.orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await
        .unwrap();

    let mut received = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => received.push(event),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {:?}", e),
        }
    }

    let names: Vec<_> = received.iter().map(PaymentEvent::name).collect();
    assert_eq!(
        names,
        vec!["payment.updated", "payment.updated", "invoice.updated"]
    );
    assert!(received.iter().all(|e| e.org_id() == ORG));
    match &received[2] {
        PaymentEvent::InvoiceUpdated {
            paid_amount,
            balance,
            ..
        } => {
            assert_eq!(*paid_amount, dec!(60));
            assert_eq!(*balance, dec!(40));
        }
        other => panic!("expected invoice event, got {:?}", other),
    }
}

#[tokio::test]
async fn processing_poll_changes_nothing() {
    let h = harness();
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(10)).await;

    let reconciliation = h
        .orchestrator
        .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG))
        .await
        .unwrap();

    assert_eq!(reconciliation.remote_state, RemoteState::Processing);
    assert!(!reconciliation.changed);
    assert_eq!(reconciliation.payment.status, PaymentStatus::Pending);
    assert!(h.notifications.for_recipient("client-9").await.is_empty());
}

#[tokio::test]
async fn payments_record_payer_and_initiator() {
    let h = harness();
    let invoice = h.seed_invoice(dec!(100)).await;
    h.initiate(&invoice, dec!(10)).await;

    let stored = h.payments.all().await;
    assert_eq!(stored.len(), 1);
    let payment = &stored[0];
    assert_eq!(payment.payer_phone.as_deref(), Some("254712345678"));
    assert_eq!(payment.initiated_by.as_deref(), Some("user-1"));
    assert_eq!(payment.client_id, "client-9");
    assert_eq!(payment.currency, "KES");
    assert_eq!(payment.notes.as_deref(), Some("first instalment"));
    assert_eq!(payment.correlation_id(), Some("checkout-1"));
}

#[tokio::test]
async fn interrupted_invoice_credit_is_finished_by_redelivery() {
    let h = harness_with_flaky_invoices(RemoteState::Processing, 1);
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(40)).await;

    let first = h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await;
    assert!(first.is_err());

    let stored = h.payments.all().await;
    assert_eq!(stored[0].status, PaymentStatus::Completed);
    assert!(stored[0].awaits_invoice_credit());
    let untouched = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(untouched.paid_amount, dec!(0));
    assert!(h.notifications.for_recipient("client-9").await.is_empty());

    let redelivered = h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await
        .unwrap();
    let ApplyResult::Applied(payment) = redelivered else {
        panic!("expected the redelivery to finish the credit");
    };
    assert!(payment.invoice_credited);

    let again = h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await
        .unwrap();
    assert!(matches!(again, ApplyResult::Duplicate(_)));

    let credited = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(credited.paid_amount, dec!(40));
    assert_eq!(credited.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(credited.credited_payments, vec![payment.id.clone()]);
    assert_eq!(h.notifications.for_recipient("client-9").await.len(), 1);
}

#[tokio::test]
async fn poll_finishes_an_interrupted_invoice_credit() {
    let h = harness_with_flaky_invoices(RemoteState::Succeeded, 1);
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(100)).await;

    let first = h
        .orchestrator
        .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG))
        .await;
    assert!(first.is_err());

    let second = h
        .orchestrator
        .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG))
        .await
        .unwrap();
    assert!(second.changed);
    assert!(second.payment.invoice_credited);

    let third = h
        .orchestrator
        .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG))
        .await
        .unwrap();
    assert!(!third.changed);

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, dec!(100));
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(h.notifications.for_recipient("client-9").await.len(), 1);
}

#[tokio::test]
async fn sweep_credits_invoices_left_uncredited() {
    let h = harness_with_flaky_invoices(RemoteState::Processing, 1);
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(100)).await;

    assert!(h
        .orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, true))
        .await
        .is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = h
        .orchestrator
        .sweep_pending(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.credited, 1);
    assert_eq!(summary.errors, 0);

    let stored = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, dec!(100));
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert!(!h.payments.all().await[0].awaits_invoice_credit());

    let idle = h
        .orchestrator
        .sweep_pending(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(idle.examined, 0);
    assert_eq!(h.notifications.for_recipient("client-9").await.len(), 1);
}

#[tokio::test]
async fn repeated_polls_of_a_failed_payment_keep_one_late_outcome() {
    let h = harness_with(RemoteState::Succeeded, None);
    let invoice = h.seed_invoice(dec!(100)).await;
    let correlation_id = h.initiate(&invoice, dec!(30)).await;

    h.orchestrator
        .apply_outcome(PaymentMethod::MobileMoney, outcome(&correlation_id, false))
        .await
        .unwrap();

    for _ in 0..2 {
        let reconciliation = h
            .orchestrator
            .query_and_reconcile(PaymentMethod::MobileMoney, &correlation_id, Some(ORG))
            .await
            .unwrap();
        assert!(!reconciliation.changed);
        assert_eq!(reconciliation.payment.status, PaymentStatus::Failed);
    }

    let stored = h.payments.all().await;
    assert_eq!(stored[0].late_callbacks, vec![json!({"source": "poll"})]);
    let untouched = h.invoices.get(&invoice.id).await.unwrap().unwrap();
    assert_eq!(untouched.paid_amount, dec!(0));
}
