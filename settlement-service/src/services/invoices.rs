//! Invoice lookup and versioned writes.

use crate::models::Invoice;
use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Invoice>>;

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Invoice>>;

    async fn insert(&self, invoice: &Invoice) -> Result<()>;

    /// Replace the stored invoice only if it is still at `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn replace_if_version(&self, invoice: &Invoice, expected_version: i64) -> Result<bool>;
}

#[derive(Clone)]
pub struct MongoInvoiceStore {
    invoices: Collection<Invoice>,
}

impl MongoInvoiceStore {
    pub fn new(db: &Database) -> Self {
        Self {
            invoices: db.collection("invoices"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        let tenant_index = IndexModel::builder()
            .keys(doc! { "org_id": 1, "_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_invoice_idx".to_string())
                    .build(),
            )
            .build();

        self.invoices.create_indexes([tenant_index], None).await?;
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MongoInvoiceStore {
    async fn get(&self, id: &str) -> Result<Option<Invoice>> {
        let invoice = self.invoices.find_one(doc! { "_id": id }, None).await?;
        Ok(invoice)
    }

    async fn get_in_tenant(&self, org_id: &str, id: &str) -> Result<Option<Invoice>> {
        let filter = doc! {
            "_id": id,
            "org_id": org_id
        };
        let invoice = self.invoices.find_one(filter, None).await?;
        Ok(invoice)
    }

    async fn insert(&self, invoice: &Invoice) -> Result<()> {
        self.invoices.insert_one(invoice, None).await?;
        Ok(())
    }

    async fn replace_if_version(&self, invoice: &Invoice, expected_version: i64) -> Result<bool> {
        // Invoices written before versioning have no field; treat that as 0.
        let filter = if expected_version == 0 {
            doc! {
                "_id": &invoice.id,
                "$or": [{ "version": 0_i64 }, { "version": { "$exists": false } }]
            }
        } else {
            doc! {
                "_id": &invoice.id,
                "version": expected_version
            }
        };
        let result = self.invoices.replace_one(filter, invoice, None).await?;
        Ok(result.matched_count == 1)
    }
}
