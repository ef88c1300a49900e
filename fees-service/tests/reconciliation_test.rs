//! Reconciliation tests: recovering lost callbacks, failing declined
//! pushes, timing out ancient pending payments, and the overdue sweep.

mod common;

use common::{assert_balance_invariant, TestApp};
use fees_service::config::ReconciliationConfig;
use fees_service::gateways::GatewayStatus;
use fees_service::models::Payment;
use fees_service::services::reconciliation::ReconciliationScheduler;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn scheduler_for(app: &TestApp, give_up_after_secs: i64) -> ReconciliationScheduler {
    ReconciliationScheduler::new(
        app.state.store.clone(),
        app.state.applicator.clone(),
        app.state.invoices.clone(),
        app.state.gateways.clone(),
        ReconciliationConfig {
            interval_secs: 60,
            stale_after_secs: 0,
            give_up_after_secs,
        },
        CancellationToken::new(),
    )
}

async fn initiate(app: &TestApp, school_id: Uuid, invoice_id: Uuid, amount: &str) -> Payment {
    let response = app
        .client
        .post(format!("{}/payments/initiate", app.address))
        .json(&json!({
            "school_id": school_id,
            "invoice_id": invoice_id,
            "method": "mobile_money",
            "amount": amount,
            "payer_ref": "254700000001",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    response.json().await.unwrap()
}

#[tokio::test]
async fn lost_success_callback_is_recovered_by_polling() {
    let (app, mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    let payment = initiate(&app, school_id, invoice.invoice_id, "3000").await;
    assert_eq!(payment.status, "pending");
    let external_ref = payment.external_ref.clone().unwrap();

    // The provider settled but the callback never arrived.
    mock.set_status(
        &external_ref,
        GatewayStatus::Success {
            amount: Some(dec!(3000)),
            receipt: Some("QK99".to_string()),
        },
    );

    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.recovered, 1);

    let settled = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(settled.paid, dec!(3000));
    assert_eq!(settled.status, "paid");
    assert_balance_invariant(&settled);

    // A second cycle finds nothing to do.
    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.recovered, 0);
    let unchanged = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(unchanged.paid, dec!(3000));
}

#[tokio::test]
async fn declined_push_is_marked_failed_without_touching_invoice() {
    let (app, mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    let payment = initiate(&app, school_id, invoice.invoice_id, "3000").await;
    let external_ref = payment.external_ref.clone().unwrap();

    mock.set_status(
        &external_ref,
        GatewayStatus::Failed {
            reason: "Insufficient funds".to_string(),
        },
    );

    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.failed, 1);

    let failed = app
        .state
        .store
        .find_payment_by_external_ref(&external_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.failure_reason.as_deref(), Some("Insufficient funds"));

    let untouched = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(untouched.paid, dec!(0));
    assert_eq!(untouched.status, "pending");
}

#[tokio::test]
async fn young_pending_payment_is_left_for_the_next_cycle() {
    let (app, _mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    let payment = initiate(&app, school_id, invoice.invoice_id, "3000").await;

    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.still_pending, 1);
    assert_eq!(summary.timed_out, 0);

    let pending = app
        .state
        .store
        .find_payment_by_external_ref(payment.external_ref.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, "pending");
}

#[tokio::test]
async fn pending_payment_past_maximum_age_times_out() {
    let (app, _mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    let payment = initiate(&app, school_id, invoice.invoice_id, "3000").await;
    let external_ref = payment.external_ref.clone().unwrap();

    // A zero maximum age makes every pending payment ancient.
    let summary = scheduler_for(&app, 0).run_cycle().await;
    assert_eq!(summary.timed_out, 1);

    let timed_out = app
        .state
        .store
        .find_payment_by_external_ref(&external_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timed_out.status, "failed");
    assert_eq!(timed_out.failure_reason.as_deref(), Some("TIMEOUT"));

    let untouched = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(untouched.paid, dec!(0));
}

#[tokio::test]
async fn overdue_sweep_flips_status_without_touching_money() {
    let (app, _mock) = TestApp::spawn_with_mock_gateway().await;
    let school_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "1200").await;

    let yesterday = chrono::Utc::now().date_naive() - chrono::Duration::days(1);
    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .json(&json!({
            "school_id": school_id,
            "enrollment_id": Uuid::new_v4(),
            "fee_structure_id": structure.fee_structure_id,
            "academic_year": common::ACADEMIC_YEAR,
            "due_date": yesterday,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let invoice: fees_service::models::FeeInvoice = response.json().await.unwrap();
    assert_eq!(invoice.status, "pending");

    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.overdue_flipped, 1);

    let overdue = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(overdue.status, "overdue");
    assert_eq!(overdue.paid, dec!(0));
    assert_eq!(overdue.balance, dec!(1200));
    assert_balance_invariant(&overdue);

    // The sweep is idempotent.
    let summary = scheduler_for(&app, 3600).run_cycle().await;
    assert_eq!(summary.overdue_flipped, 0);
}

#[tokio::test]
async fn transient_initiate_failures_are_retried_with_backoff() {
    let (app, mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    mock.fail_next_initiates(2);

    let payment = initiate(&app, school_id, invoice.invoice_id, "3000").await;
    assert_eq!(payment.status, "pending");
    assert_eq!(mock.initiate_calls(), 3);
}

#[tokio::test]
async fn initiate_rejects_amount_above_balance() {
    let (app, _mock) = TestApp::spawn_with_mock_gateway().await;
    let (invoice, school_id) = app.invoice_for("3000").await;

    let response = app
        .client
        .post(format!("{}/payments/initiate", app.address))
        .json(&json!({
            "school_id": school_id,
            "invoice_id": invoice.invoice_id,
            "method": "mobile_money",
            "amount": "4000",
            "payer_ref": "254700000001",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
}
