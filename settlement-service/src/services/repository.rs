use crate::models::{
    Payment, PaymentMethod, PaymentSelector, PaymentStatus, ProcessorRefs, StatusTransition,
    TransitionOutcome, MAX_LATE_CALLBACKS,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, DateTime, Document};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Collection, Database, IndexModel};

/// Persistence for [`Payment`] records.
///
/// `transition` is the only way a payment leaves `pending`, and it must be a
/// single conditional write so that racing webhook and poll paths cannot both
/// apply.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Atomically allocate the next payment sequence number for `year`.
    async fn next_sequence(&self, year: i32) -> Result<u64>;

    async fn insert(&self, payment: &Payment) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Payment>>;

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Payment>>;

    async fn find_by_correlation(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
    ) -> Result<Option<Payment>>;

    async fn set_processor_refs(&self, id: &str, refs: &ProcessorRefs) -> Result<()>;

    async fn transition(
        &self,
        selector: &PaymentSelector,
        transition: &StatusTransition,
    ) -> Result<TransitionOutcome>;

    /// Keep an outcome that arrived after the payment was already terminal.
    ///
    /// A payload already on record is not stored again, and only the newest
    /// [`MAX_LATE_CALLBACKS`] are kept. Returns whether the payload was added.
    async fn record_late_callback(&self, id: &str, payload: serde_json::Value) -> Result<bool>;

    /// Flip `invoice_credited` on a completed payment. Returns `true` only for
    /// the caller that flipped it.
    async fn mark_invoice_credited(&self, id: &str) -> Result<bool>;

    /// Oldest-first pending payments created before `created_before`.
    async fn list_stale_pending(&self, created_before: DateTime, limit: i64)
        -> Result<Vec<Payment>>;

    /// Oldest-first completed payments settled before `settled_before` whose
    /// invoice credit was never recorded.
    async fn list_uncredited(&self, settled_before: DateTime, limit: i64) -> Result<Vec<Payment>>;

    /// Delete unless completed. Returns whether a document was removed.
    async fn delete_unless_completed(&self, id: &str) -> Result<bool>;
}

fn selector_filter(selector: &PaymentSelector) -> Document {
    match selector {
        PaymentSelector::Id(id) => doc! { "_id": id },
        PaymentSelector::Correlation {
            method,
            correlation_id,
        } => {
            let mut filter = Document::new();
            filter.insert(method.correlation_field(), correlation_id.as_str());
            filter
        }
    }
}

fn ascending(field: &str) -> Document {
    let mut keys = Document::new();
    keys.insert(field, 1);
    keys
}

#[derive(Clone)]
pub struct MongoPaymentStore {
    payments: Collection<Payment>,
    counters: Collection<Document>,
}

impl MongoPaymentStore {
    pub fn new(db: &Database) -> Self {
        Self {
            payments: db.collection("payments"),
            counters: db.collection("counters"),
        }
    }

    /// Initialize database indexes for number, tenant, status and webhook lookups.
    pub async fn init_indexes(&self) -> Result<()> {
        let number_index = IndexModel::builder()
            .keys(doc! { "payment_number": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_number_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let invoice_index = IndexModel::builder()
            .keys(doc! { "invoice_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_invoice_idx".to_string())
                    .build(),
            )
            .build();

        let client_index = IndexModel::builder()
            .keys(doc! { "client_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_client_idx".to_string())
                    .build(),
            )
            .build();

        let status_index = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_status_idx".to_string())
                    .build(),
            )
            .build();

        let uncredited_index = IndexModel::builder()
            .keys(doc! { "status": 1, "invoice_credited": 1, "settled_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_uncredited_idx".to_string())
                    .build(),
            )
            .build();

        let tenant_index = IndexModel::builder()
            .keys(doc! { "org_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_payment_idx".to_string())
                    .build(),
            )
            .build();

        // Webhooks carry nothing but the processor's id, so each method's
        // correlation field needs its own index.
        let mobile_money_index = IndexModel::builder()
            .keys(ascending(PaymentMethod::MobileMoney.correlation_field()))
            .options(
                IndexOptions::builder()
                    .name("mobile_money_correlation_idx".to_string())
                    .sparse(true)
                    .build(),
            )
            .build();

        let card_gateway_index = IndexModel::builder()
            .keys(ascending(PaymentMethod::CardGateway.correlation_field()))
            .options(
                IndexOptions::builder()
                    .name("card_gateway_correlation_idx".to_string())
                    .sparse(true)
                    .build(),
            )
            .build();

        self.payments
            .create_indexes(
                [
                    number_index,
                    invoice_index,
                    client_index,
                    status_index,
                    uncredited_index,
                    tenant_index,
                    mobile_money_index,
                    card_gateway_index,
                ],
                None,
            )
            .await?;

        tracing::info!("Settlement payment indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MongoPaymentStore {
    async fn next_sequence(&self, year: i32) -> Result<u64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "_id": format!("payments-{}", year) },
                doc! { "$inc": { "seq": 1_i64 } },
                options,
            )
            .await?
            .context("counter upsert returned no document")?;

        let seq = counter.get_i64("seq")?;
        Ok(seq as u64)
    }

    async fn insert(&self, payment: &Payment) -> Result<()> {
        self.payments.insert_one(payment, None).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Payment>> {
        let payment = self.payments.find_one(doc! { "_id": id }, None).await?;
        Ok(payment)
    }

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Payment>> {
        let filter = doc! {
            "_id": id,
            "org_id": org_id
        };
        let payment = self.payments.find_one(filter, None).await?;
        Ok(payment)
    }

    async fn find_by_correlation(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
    ) -> Result<Option<Payment>> {
        let selector = PaymentSelector::Correlation {
            method,
            correlation_id: correlation_id.to_string(),
        };
        let payment = self
            .payments
            .find_one(selector_filter(&selector), None)
            .await?;
        Ok(payment)
    }

    async fn set_processor_refs(&self, id: &str, refs: &ProcessorRefs) -> Result<()> {
        let update = doc! {
            "$set": {
                "processor_refs": bson::to_bson(refs)?,
                "updated_at": DateTime::now()
            }
        };
        self.payments
            .update_one(doc! { "_id": id }, update, None)
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        selector: &PaymentSelector,
        transition: &StatusTransition,
    ) -> Result<TransitionOutcome> {
        let mut filter = selector_filter(selector);
        filter.insert("status", PaymentStatus::Pending.as_str());

        let now = DateTime::now();
        let mut set = doc! {
            "status": transition.status.as_str(),
            "updated_at": now,
        };
        if transition.status == PaymentStatus::Completed {
            set.insert("settled_at", now);
            set.insert("invoice_credited", false);
        }
        if let Some(transaction_id) = &transition.transaction_id {
            set.insert("transaction_id", transaction_id.as_str());
        }
        if let Some(reason) = &transition.failure_reason {
            set.insert("failure_reason", reason.as_str());
        }
        if let Some(raw) = &transition.raw_payload {
            set.insert("raw_payload", bson::to_bson(raw)?);
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .payments
            .find_one_and_update(filter, doc! { "$set": set }, options)
            .await?;

        if let Some(payment) = updated {
            return Ok(TransitionOutcome::Applied(payment));
        }

        let current = self
            .payments
            .find_one(selector_filter(selector), None)
            .await?;
        Ok(match current {
            Some(payment) => TransitionOutcome::AlreadyTerminal(payment),
            None => TransitionOutcome::NotFound,
        })
    }

    async fn record_late_callback(&self, id: &str, payload: serde_json::Value) -> Result<bool> {
        let payload = bson::to_bson(&payload)?;
        let keep = -(MAX_LATE_CALLBACKS as i64);
        let filter = doc! {
            "_id": id,
            "late_callbacks": { "$ne": payload.clone() }
        };
        let update = doc! {
            "$push": {
                "late_callbacks": {
                    "$each": [payload],
                    "$slice": keep
                }
            },
            "$set": { "updated_at": DateTime::now() }
        };
        let result = self.payments.update_one(filter, update, None).await?;
        Ok(result.modified_count > 0)
    }

    async fn mark_invoice_credited(&self, id: &str) -> Result<bool> {
        let filter = doc! {
            "_id": id,
            "status": PaymentStatus::Completed.as_str(),
            "invoice_credited": false
        };
        let update = doc! {
            "$set": {
                "invoice_credited": true,
                "updated_at": DateTime::now()
            }
        };
        let result = self.payments.update_one(filter, update, None).await?;
        Ok(result.modified_count == 1)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime,
        limit: i64,
    ) -> Result<Vec<Payment>> {
        let filter = doc! {
            "status": PaymentStatus::Pending.as_str(),
            "created_at": { "$lt": created_before }
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .limit(limit)
            .build();

        let cursor = self.payments.find(filter, Some(options)).await?;
        let payments: Vec<Payment> = cursor.try_collect().await?;
        Ok(payments)
    }

    async fn list_uncredited(&self, settled_before: DateTime, limit: i64) -> Result<Vec<Payment>> {
        let filter = doc! {
            "status": PaymentStatus::Completed.as_str(),
            "invoice_credited": false,
            "settled_at": { "$lt": settled_before }
        };
        let options = FindOptions::builder()
            .sort(doc! { "settled_at": 1 })
            .limit(limit)
            .build();

        let cursor = self.payments.find(filter, Some(options)).await?;
        let payments: Vec<Payment> = cursor.try_collect().await?;
        Ok(payments)
    }

    async fn delete_unless_completed(&self, id: &str) -> Result<bool> {
        let filter = doc! {
            "_id": id,
            "status": { "$ne": PaymentStatus::Completed.as_str() }
        };
        let result = self.payments.delete_one(filter, None).await?;
        Ok(result.deleted_count > 0)
    }
}
