pub mod event;
pub mod invoice;
pub mod notification;
pub mod payment;

pub use event::PaymentEvent;
pub use invoice::{Invoice, InvoiceStatus};
pub use notification::{ActionKind, Notification, NotificationAction, NotificationKind};
pub use payment::{
    format_payment_number, CardGatewayRef, MobileMoneyRef, Payment, PaymentMethod,
    PaymentSelector, PaymentStatus, ProcessorRefs, StatusTransition, TransitionOutcome,
    MAX_LATE_CALLBACKS,
};
