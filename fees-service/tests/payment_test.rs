//! Payment application tests: manual entry, overpayment handling,
//! gateway clamp-and-flag, and idempotent replays.

mod common;

use common::{assert_balance_invariant, TestApp};
use fees_service::models::Payment;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn manual_payment_moves_invoice_to_partial_then_paid() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    let response = app
        .record_manual_payment(school_id, invoice.invoice_id, "2000")
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let payment: Payment = response.json().await.unwrap();
    assert_eq!(payment.status, "completed");
    assert_eq!(payment.applied_amount, dec!(2000));
    assert!(payment.reference.starts_with("PAY-"));

    let after_first = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(after_first.paid, dec!(2000));
    assert_eq!(after_first.balance, dec!(3000));
    assert_eq!(after_first.status, "partial");
    assert_balance_invariant(&after_first);

    let response = app
        .record_manual_payment(school_id, invoice.invoice_id, "3000")
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let settled = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(settled.paid, dec!(5000));
    assert_eq!(settled.balance, dec!(0));
    assert_eq!(settled.status, "paid");
    assert_balance_invariant(&settled);
}

#[tokio::test]
async fn manual_overpayment_is_rejected_and_leaves_invoice_unchanged() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    let response = app
        .record_manual_payment(school_id, invoice.invoice_id, "6000")
        .await;
    assert_eq!(response.status().as_u16(), 422);

    let unchanged = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(unchanged.paid, dec!(0));
    assert_eq!(unchanged.balance, dec!(5000));
    assert_eq!(unchanged.status, "pending");
}

#[tokio::test]
async fn non_positive_amounts_are_rejected() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    for amount in ["0", "-100"] {
        let response = app
            .record_manual_payment(school_id, invoice.invoice_id, amount)
            .await;
        assert_eq!(response.status().as_u16(), 422, "amount {}", amount);
    }

    let unchanged = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(unchanged.paid, dec!(0));
}

#[tokio::test]
async fn payment_against_unknown_invoice_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .record_manual_payment(Uuid::new_v4(), Uuid::new_v4(), "100")
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn gateway_entry_without_external_ref_is_rejected() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    let response = app
        .client
        .post(format!("{}/payments", app.address))
        .json(&json!({
            "school_id": school_id,
            "invoice_id": invoice.invoice_id,
            "amount": "2000",
            "method": "mobile_money",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn gateway_over_confirmation_is_clamped_and_flagged() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("1000").await;

    let response = app
        .client
        .post(format!("{}/payments", app.address))
        .json(&json!({
            "school_id": school_id,
            "invoice_id": invoice.invoice_id,
            "amount": "1500",
            "method": "mobile_money",
            "external_ref": "ws_CO_over_1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    let payment: Payment = response.json().await.unwrap();
    assert_eq!(payment.amount, dec!(1500));
    assert_eq!(payment.applied_amount, dec!(1000));
    assert_eq!(payment.review_flag.as_deref(), Some("OVER_CONFIRMATION"));

    let settled = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(settled.paid, dec!(1000));
    assert_eq!(settled.balance, dec!(0));
    assert_eq!(settled.status, "paid");
    assert_balance_invariant(&settled);
}

#[tokio::test]
async fn replayed_external_ref_returns_existing_payment_without_double_count() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    let body = json!({
        "school_id": school_id,
        "invoice_id": invoice.invoice_id,
        "amount": "2000",
        "method": "card",
        "external_ref": "pi_replay_1",
    });

    let first: Payment = app
        .client
        .post(format!("{}/payments", app.address))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let second: Payment = app
        .client
        .post(format!("{}/payments", app.address))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(first.payment_id, second.payment_id);

    let settled = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(settled.paid, dec!(2000));

    let payments: Vec<Payment> = app
        .client
        .get(format!("{}/payments", app.address))
        .query(&[
            ("school_id", school_id.to_string()),
            ("invoice_id", invoice.invoice_id.to_string()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
}

#[tokio::test]
async fn payments_are_listed_by_enrollment() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let enrollment_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;
    let invoice = app
        .create_invoice(school_id, enrollment_id, structure.fee_structure_id)
        .await;

    app.record_manual_payment(school_id, invoice.invoice_id, "1000")
        .await;
    app.record_manual_payment(school_id, invoice.invoice_id, "500")
        .await;

    let payments: Vec<Payment> = app
        .client
        .get(format!("{}/payments", app.address))
        .query(&[
            ("school_id", school_id.to_string()),
            ("enrollment_id", enrollment_id.to_string()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(payments.len(), 2);
    assert!(payments.iter().all(|p| p.status == "completed"));
}
