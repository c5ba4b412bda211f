//! In-app notifications sent to the payer when a payment settles.

use crate::models::{
    ActionKind, Notification, NotificationAction, NotificationKind, Payment,
};
use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

#[derive(Clone)]
pub struct MongoNotificationStore {
    notifications: Collection<Notification>,
}

impl MongoNotificationStore {
    pub fn new(db: &Database) -> Self {
        Self {
            notifications: db.collection("notifications"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        let recipient_index = IndexModel::builder()
            .keys(doc! { "org_id": 1, "recipient_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_recipient_notification_idx".to_string())
                    .build(),
            )
            .build();

        self.notifications
            .create_indexes([recipient_index], None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for MongoNotificationStore {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notifications.insert_one(notification, None).await?;
        Ok(())
    }
}

/// Builds payer notifications with links into the customer-facing app.
#[derive(Clone, Debug)]
pub struct NotificationComposer {
    app_base_url: String,
}

impl NotificationComposer {
    pub fn new(app_base_url: impl Into<String>) -> Self {
        Self {
            app_base_url: app_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn invoice_url(&self, invoice_id: &str) -> String {
        format!("{}/invoices/{}", self.app_base_url, invoice_id)
    }

    pub fn payment_received(&self, payment: &Payment) -> Notification {
        let actions = vec![
            NotificationAction {
                action: ActionKind::ViewInvoice,
                label: "View invoice".to_string(),
                url: self.invoice_url(&payment.invoice_id),
            },
            NotificationAction {
                action: ActionKind::DownloadReceipt,
                label: "Download receipt".to_string(),
                url: format!("{}/payments/{}/receipt", self.app_base_url, payment.id),
            },
        ];

        Notification::new(
            payment.org_id.clone(),
            payment.client_id.clone(),
            NotificationKind::PaymentReceived,
            "Payment received".to_string(),
            format!(
                "Your payment {} of {} {} was received.",
                payment.payment_number, payment.currency, payment.amount
            ),
            actions,
            payment.id.clone(),
            payment.invoice_id.clone(),
        )
    }

    pub fn payment_failed(&self, payment: &Payment) -> Notification {
        let reason = payment
            .failure_reason
            .as_deref()
            .unwrap_or("the payment could not be completed");
        let actions = vec![
            NotificationAction {
                action: ActionKind::RetryPayment,
                label: "Try again".to_string(),
                url: format!("{}/pay", self.invoice_url(&payment.invoice_id)),
            },
            NotificationAction {
                action: ActionKind::ViewInvoice,
                label: "View invoice".to_string(),
                url: self.invoice_url(&payment.invoice_id),
            },
        ];

        Notification::new(
            payment.org_id.clone(),
            payment.client_id.clone(),
            NotificationKind::PaymentFailed,
            "Payment failed".to_string(),
            format!(
                "Your payment {} of {} {} failed: {}.",
                payment.payment_number, payment.currency, payment.amount, reason
            ),
            actions,
            payment.id.clone(),
            payment.invoice_id.clone(),
        )
    }
}
