pub mod error;
pub mod events;
pub mod invoices;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod notifications;
pub mod orchestrator;
pub mod processors;
pub mod repository;
pub mod token_cache;

pub use error::PaymentError;
pub use events::{BroadcastEvents, EventBroadcaster};
pub use invoices::{InvoiceStore, MongoInvoiceStore};
pub use memory::{InMemoryInvoiceStore, InMemoryNotificationStore, InMemoryPaymentStore};
pub use metrics::{get_metrics, init_metrics};
pub use notifications::{MongoNotificationStore, NotificationComposer, NotificationSink};
pub use orchestrator::{
    ApplyResult, CallbackDisposition, InitiatePayment, InitiatedPayment, PaymentOrchestrator,
    Reconciliation, SweepSummary,
};
pub use processors::{MpesaClient, PaystackClient, ProcessorRegistry};
pub use repository::{MongoPaymentStore, PaymentStore};
pub use token_cache::{InMemoryTokenCache, RedisTokenCache, TokenCache};
