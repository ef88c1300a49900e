//! Shared test harness: spawns the service on a random port against the
//! in-memory ledger store and drives it over HTTP.

#![allow(dead_code)]

use async_trait::async_trait;
use fees_service::config::{
    CardConfig, Config, MpesaConfig, ReconciliationConfig, ServerConfig, StoreBackend,
    StoreConfig,
};
use fees_service::gateways::{
    CallbackEvent, CardGateway, GatewayRegistry, GatewayStatus, InitiateRequest, MpesaGateway,
    PaymentGateway,
};
use fees_service::models::{FeeInvoice, FeeStructure, PaymentMethod};
use fees_service::services::applicator::PaymentApplicator;
use fees_service::services::init_metrics;
use fees_service::services::invoices::InvoiceManager;
use fees_service::services::ledger::{LedgerStore, MemoryLedgerStore};
use fees_service::services::notifier::{LogNotifier, Notifier};
use fees_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::json;
use service_core::error::{AppError, GatewayErrorKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const MPESA_CALLBACK_SECRET: &str = "test-mpesa-callback-secret";
pub const CARD_WEBHOOK_SECRET: &str = "test-card-webhook-secret";
pub const ACADEMIC_YEAR: &str = "2025-2026";

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub state: AppState,
}

/// Scriptable gateway standing in for the mobile money provider in
/// initiate/reconciliation tests.
pub struct MockGateway {
    counter: AtomicUsize,
    initiate_calls: AtomicUsize,
    transient_failures_left: AtomicUsize,
    statuses: Mutex<HashMap<String, GatewayStatus>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            initiate_calls: AtomicUsize::new(0),
            transient_failures_left: AtomicUsize::new(0),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_status(&self, external_ref: &str, status: GatewayStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(external_ref.to_string(), status);
    }

    pub fn fail_next_initiates(&self, count: usize) {
        self.transient_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    async fn initiate(&self, _req: &InitiateRequest) -> Result<String, AppError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::gateway(
                GatewayErrorKind::Transient,
                "simulated provider outage",
            ));
        }
        let id = format!("mock-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.set_status(&id, GatewayStatus::Pending);
        Ok(id)
    }

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus, AppError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(external_ref)
            .cloned()
            .unwrap_or(GatewayStatus::Pending))
    }

    fn verify_callback(&self, _body: &str, _signature: &str) -> Result<CallbackEvent, AppError> {
        Err(AppError::BadRequest(anyhow::anyhow!(
            "Mock gateway has no callback wire format"
        )))
    }
}

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        store: StoreConfig {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 2,
            min_connections: 1,
        },
        mpesa: MpesaConfig {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            short_code: "174379".to_string(),
            passkey: Secret::new("test-passkey".to_string()),
            consumer_key: "test-consumer".to_string(),
            consumer_secret: Secret::new("test-consumer-secret".to_string()),
            callback_url: "http://127.0.0.1/webhooks/mpesa".to_string(),
            callback_secret: Secret::new(MPESA_CALLBACK_SECRET.to_string()),
        },
        card: CardConfig {
            base_url: "https://api.processor.test".to_string(),
            secret_key: Secret::new("sk_test_123".to_string()),
            webhook_secret: Secret::new(CARD_WEBHOOK_SECRET.to_string()),
            currency: "KES".to_string(),
        },
        reconciliation: ReconciliationConfig {
            interval_secs: 60,
            stale_after_secs: 0,
            give_up_after_secs: 3600,
        },
        log_level: "warn".to_string(),
        service_name: "fees-service".to_string(),
    }
}

impl TestApp {
    /// Spawn with the real gateway adapters (webhook verification works
    /// against the test secrets).
    pub async fn spawn() -> Self {
        Self::spawn_inner(None).await
    }

    /// Spawn with a scriptable mobile money gateway for initiate and
    /// reconciliation flows.
    pub async fn spawn_with_mock_gateway() -> (Self, Arc<MockGateway>) {
        let mock = Arc::new(MockGateway::new());
        let app = Self::spawn_inner(Some(mock.clone())).await;
        (app, mock)
    }

    async fn spawn_inner(mock: Option<Arc<MockGateway>>) -> Self {
        init_metrics();
        let config = test_config();

        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let invoices = Arc::new(InvoiceManager::new(store.clone(), notifier.clone()));
        let applicator = Arc::new(PaymentApplicator::new(store.clone(), notifier.clone()));

        let mobile_money: Arc<dyn PaymentGateway> = match mock {
            Some(mock) => mock,
            None => Arc::new(MpesaGateway::new(config.mpesa.clone()).unwrap()),
        };
        let card: Arc<dyn PaymentGateway> =
            Arc::new(CardGateway::new(config.card.clone()).unwrap());
        let gateways = Arc::new(GatewayRegistry::new(vec![mobile_money, card]));

        let state = AppState {
            config,
            store,
            invoices,
            applicator,
            gateways,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            address: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            state,
        }
    }

    pub async fn create_fee_structure(&self, school_id: Uuid, amount: &str) -> FeeStructure {
        let today = chrono::Utc::now().date_naive();
        let response = self
            .client
            .post(format!("{}/fee-structures", self.address))
            .json(&json!({
                "school_id": school_id,
                "name": format!("Tuition {}", Uuid::new_v4().simple()),
                "fee_type": "tuition",
                "frequency": "term",
                "amount": amount,
                "academic_year": ACADEMIC_YEAR,
                "valid_from": today,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201, "fee structure create failed");
        response.json().await.unwrap()
    }

    pub async fn create_invoice(
        &self,
        school_id: Uuid,
        enrollment_id: Uuid,
        fee_structure_id: Uuid,
    ) -> FeeInvoice {
        let response = self
            .client
            .post(format!("{}/invoices", self.address))
            .json(&json!({
                "school_id": school_id,
                "enrollment_id": enrollment_id,
                "fee_structure_id": fee_structure_id,
                "academic_year": ACADEMIC_YEAR,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201, "invoice create failed");
        response.json().await.unwrap()
    }

    /// Issue an invoice worth `amount` for a fresh enrollment; returns it
    /// together with the school id used.
    pub async fn invoice_for(&self, amount: &str) -> (FeeInvoice, Uuid) {
        let school_id = Uuid::new_v4();
        let structure = self.create_fee_structure(school_id, amount).await;
        let invoice = self
            .create_invoice(school_id, Uuid::new_v4(), structure.fee_structure_id)
            .await;
        (invoice, school_id)
    }

    pub async fn get_invoice(&self, school_id: Uuid, invoice_id: Uuid) -> FeeInvoice {
        let response = self
            .client
            .get(format!("{}/invoices/{}", self.address, invoice_id))
            .query(&[("school_id", school_id.to_string())])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200, "invoice fetch failed");
        response.json().await.unwrap()
    }

    pub async fn record_manual_payment(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        amount: &str,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}/payments", self.address))
            .json(&json!({
                "school_id": school_id,
                "invoice_id": invoice_id,
                "amount": amount,
                "method": "cash",
            }))
            .send()
            .await
            .unwrap()
    }
}

/// Invariant check: `paid + balance == total` after every operation.
pub fn assert_balance_invariant(invoice: &FeeInvoice) {
    assert_eq!(
        invoice.paid + invoice.balance,
        invoice.total,
        "invariant violated on invoice {}",
        invoice.invoice_number
    );
    assert!(invoice.paid >= Decimal::ZERO);
    assert!(invoice.balance >= Decimal::ZERO);
}
