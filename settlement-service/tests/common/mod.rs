#![allow(dead_code)]

use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::utils::signature::hmac_sha512_hex;
use settlement_service::config::{
    Config, LinkConfig, MpesaConfig, MpesaEnvironment, PaystackConfig, ReconciliationConfig,
    ResilienceConfig, ServerConfig, StorageBackend, StorageConfig,
};
use settlement_service::models::{Invoice, InvoiceStatus};
use settlement_service::{AppState, Application};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_ORG_ID: &str = "test-org";
pub const TEST_USER_ID: &str = "test-user";
pub const TEST_CLIENT_ID: &str = "client-1";
pub const TEST_PHONE: &str = "0712345678";
pub const TEST_MSISDN: &str = "254712345678";
pub const PAYSTACK_SECRET: &str = "sk_test_settlement";
pub const APP_BASE_URL: &str = "http://app.test";
pub const CALLBACK_BASE_URL: &str = "http://callbacks.test";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub state: AppState,
    pub mpesa: MockServer,
    pub paystack: MockServer,
    pub client: reqwest::Client,
}

/// Configuration for a test instance: in-memory storage, random port,
/// both processors pointed at local mock servers, fast retries.
pub fn test_config(mpesa_uri: &str, paystack_uri: &str) -> Config {
    Config {
        common: service_core::config::Config::default(),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            database: None,
        },
        redis: None,
        links: LinkConfig {
            callback_base_url: CALLBACK_BASE_URL.to_string(),
            app_base_url: APP_BASE_URL.to_string(),
        },
        mpesa: MpesaConfig {
            environment: MpesaEnvironment::Sandbox,
            base_url: mpesa_uri.to_string(),
            consumer_key: "consumer-key".to_string(),
            consumer_secret: Secret::new("consumer-secret".to_string()),
            shortcode: "174379".to_string(),
            passkey: Secret::new("passkey".to_string()),
            callback_token: None,
        },
        paystack: PaystackConfig {
            base_url: paystack_uri.to_string(),
            secret_key: Secret::new(PAYSTACK_SECRET.to_string()),
            currency: "KES".to_string(),
            verify_webhooks: true,
        },
        resilience: ResilienceConfig {
            timeout_secs: 5,
            max_retries: 2,
            retry_base_ms: 10,
        },
        reconciliation: ReconciliationConfig {
            interval_secs: 0,
            pending_after_secs: 300,
        },
        service_name: "settlement-service-test".to_string(),
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut Config)) -> Self {
        let mpesa = MockServer::start().await;
        let paystack = MockServer::start().await;

        let mut config = test_config(&mpesa.uri(), &paystack.uri());
        customize(&mut config);

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);
        let state = app.state();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        let app = TestApp {
            address,
            port,
            state,
            mpesa,
            paystack,
            client,
        };
        app.mock_mpesa_token().await;
        app
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Store an open invoice for the test tenant.
    pub async fn seed_invoice(&self, total: Decimal) -> Invoice {
        self.seed_invoice_with(total, Decimal::ZERO, InvoiceStatus::Sent)
            .await
    }

    pub async fn seed_invoice_with(
        &self,
        total: Decimal,
        paid: Decimal,
        status: InvoiceStatus,
    ) -> Invoice {
        let now = DateTime::now();
        let id = Uuid::new_v4().to_string();
        let invoice = Invoice {
            invoice_number: format!("INV-{}", &id[..8]),
            id,
            org_id: TEST_ORG_ID.to_string(),
            client_id: TEST_CLIENT_ID.to_string(),
            client_email: Some("client@example.com".to_string()),
            client_phone: Some(TEST_PHONE.to_string()),
            currency: "KES".to_string(),
            total_amount: total,
            paid_amount: paid,
            status,
            credited_payments: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.state
            .invoices
            .insert(&invoice)
            .await
            .expect("Failed to seed invoice");
        invoice
    }

    pub async fn invoice(&self, id: &str) -> Invoice {
        self.state
            .invoices
            .get(id)
            .await
            .expect("Failed to load invoice")
            .expect("Invoice missing")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-Org-ID", TEST_ORG_ID)
            .header("X-User-ID", TEST_USER_ID)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("X-Org-ID", TEST_ORG_ID)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Post a raw webhook body the way a processor would: no tenant headers.
    pub async fn post_webhook(
        &self,
        path: &str,
        body: &Value,
        headers: &[(&str, String)],
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        request.send().await.expect("Failed to execute request")
    }

    pub async fn mock_mpesa_token(&self) {
        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "mpesa-test-token",
                "expires_in": "3599"
            })))
            .mount(&self.mpesa)
            .await;
    }

    pub async fn mock_stk_push(&self, checkout_request_id: &str) {
        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "MerchantRequestID": format!("merchant-{}", checkout_request_id),
                "CheckoutRequestID": checkout_request_id,
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "CustomerMessage": "Success. Request accepted for processing"
            })))
            .up_to_n_times(1)
            .mount(&self.mpesa)
            .await;
    }

    pub async fn mock_paystack_initialize(&self, reference: &str) {
        Mock::given(method("POST"))
            .and(path("/transaction/initialize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": true,
                "message": "Authorization URL created",
                "data": {
                    "authorization_url": format!("https://checkout.paystack.com/{}", reference),
                    "access_code": format!("access-{}", reference),
                    "reference": reference
                }
            })))
            .up_to_n_times(1)
            .mount(&self.paystack)
            .await;
    }

    /// Initiate a mobile-money payment that the mock processor accepts.
    pub async fn initiate_mobile_money(
        &self,
        invoice_id: &str,
        amount: u64,
        checkout_request_id: &str,
    ) -> Value {
        self.mock_stk_push(checkout_request_id).await;
        let response = self
            .post_json(
                "/payments/initiate",
                &json!({
                    "invoiceId": invoice_id,
                    "method": "mobile-money",
                    "amount": amount,
                    "payerPhone": TEST_PHONE
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 202, "initiate should be accepted");
        response.json().await.expect("Failed to parse JSON")
    }

    pub fn paystack_signature(body: &Value) -> String {
        hmac_sha512_hex(PAYSTACK_SECRET, body.to_string().as_bytes())
            .expect("Failed to sign webhook")
    }
}

pub fn stk_callback(checkout_request_id: &str, result_code: i64, amount: u64) -> Value {
    if result_code == 0 {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": format!("merchant-{}", checkout_request_id),
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": amount},
                            {"Name": "MpesaReceiptNumber", "Value": format!("RCPT{}", amount)},
                            {"Name": "TransactionDate", "Value": 20260101120000u64},
                            {"Name": "PhoneNumber", "Value": 254712345678u64}
                        ]
                    }
                }
            }
        })
    } else {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": format!("merchant-{}", checkout_request_id),
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": result_code,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        })
    }
}

pub fn paystack_event(event: &str, reference: &str, amount_minor: u64) -> Value {
    let status = if event == "charge.success" { "success" } else { "failed" };
    json!({
        "event": event,
        "data": {
            "id": 4099260516u64,
            "status": status,
            "reference": reference,
            "amount": amount_minor,
            "gateway_response": if status == "success" { "Approved" } else { "Declined" },
            "customer": {"email": "client@example.com"}
        }
    })
}
