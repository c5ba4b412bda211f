use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentReceived,
    PaymentFailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ViewInvoice,
    DownloadReceipt,
    RetryPayment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationAction {
    pub action: ActionKind,
    pub label: String,
    pub url: String,
}

/// In-app notification addressed to the payer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub actions: Vec<NotificationAction>,
    pub payment_id: String,
    pub invoice_id: String,
    pub read: bool,
    pub created_at: DateTime,
}

impl Notification {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org_id: String,
        recipient_id: String,
        kind: NotificationKind,
        title: String,
        message: String,
        actions: Vec<NotificationAction>,
        payment_id: String,
        invoice_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id,
            recipient_id,
            kind,
            title,
            message,
            actions,
            payment_id,
            invoice_id,
            read: false,
            created_at: DateTime::now(),
        }
    }

    pub fn has_action(&self, action: ActionKind) -> bool {
        self.actions.iter().any(|a| a.action == action)
    }
}
