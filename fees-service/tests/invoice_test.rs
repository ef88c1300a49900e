//! Invoice lifecycle tests: creation from fee structures, duplicate
//! protection, cancellation rules and school scoping.

mod common;

use common::{assert_balance_invariant, TestApp, ACADEMIC_YEAR};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn create_invoice_issues_pending_invoice_with_full_balance() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;

    let invoice = app
        .create_invoice(school_id, Uuid::new_v4(), structure.fee_structure_id)
        .await;

    assert_eq!(invoice.total, dec!(5000));
    assert_eq!(invoice.paid, dec!(0));
    assert_eq!(invoice.balance, dec!(5000));
    assert_eq!(invoice.status, "pending");
    assert!(invoice.invoice_number.starts_with("INV-"));
    assert_balance_invariant(&invoice);
}

#[tokio::test]
async fn invoice_numbers_are_unique_per_school() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "1000").await;

    let first = app
        .create_invoice(school_id, Uuid::new_v4(), structure.fee_structure_id)
        .await;
    let second = app
        .create_invoice(school_id, Uuid::new_v4(), structure.fee_structure_id)
        .await;

    assert_ne!(first.invoice_number, second.invoice_number);
}

#[tokio::test]
async fn duplicate_open_invoice_for_same_period_is_rejected() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let enrollment_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;

    app.create_invoice(school_id, enrollment_id, structure.fee_structure_id)
        .await;

    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .json(&json!({
            "school_id": school_id,
            "enrollment_id": enrollment_id,
            "fee_structure_id": structure.fee_structure_id,
            "academic_year": ACADEMIC_YEAR,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn unknown_fee_structure_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .json(&json!({
            "school_id": Uuid::new_v4(),
            "enrollment_id": Uuid::new_v4(),
            "fee_structure_id": Uuid::new_v4(),
            "academic_year": ACADEMIC_YEAR,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn wrong_academic_year_is_rejected() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;

    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .json(&json!({
            "school_id": school_id,
            "enrollment_id": Uuid::new_v4(),
            "fee_structure_id": structure.fee_structure_id,
            "academic_year": "1999-2000",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn retired_fee_structure_cannot_be_billed() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;

    let response = app
        .client
        .post(format!(
            "{}/fee-structures/{}/retire",
            app.address, structure.fee_structure_id
        ))
        .query(&[("school_id", school_id.to_string())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .json(&json!({
            "school_id": school_id,
            "enrollment_id": Uuid::new_v4(),
            "fee_structure_id": structure.fee_structure_id,
            "academic_year": ACADEMIC_YEAR,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn cancel_unpaid_invoice_succeeds_and_is_idempotent() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    for _ in 0..2 {
        let response = app
            .client
            .post(format!("{}/invoices/{}/cancel", app.address, invoice.invoice_id))
            .json(&json!({ "school_id": school_id, "reason": "enrollment withdrawn" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    let cancelled = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(cancelled.status, "cancelled");
    assert_eq!(cancelled.cancelled_reason.as_deref(), Some("enrollment withdrawn"));
}

#[tokio::test]
async fn cancel_partially_paid_invoice_is_rejected() {
    let app = TestApp::spawn().await;
    let (invoice, school_id) = app.invoice_for("5000").await;

    let response = app
        .record_manual_payment(school_id, invoice.invoice_id, "2000")
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .client
        .post(format!("{}/invoices/{}/cancel", app.address, invoice.invoice_id))
        .json(&json!({ "school_id": school_id, "reason": "mistake" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 409);

    let unchanged = app.get_invoice(school_id, invoice.invoice_id).await;
    assert_eq!(unchanged.status, "partial");
    assert_eq!(unchanged.paid, dec!(2000));
}

#[tokio::test]
async fn invoices_are_scoped_to_their_school() {
    let app = TestApp::spawn().await;
    let (invoice, _school_id) = app.invoice_for("5000").await;

    let response = app
        .client
        .get(format!("{}/invoices/{}", app.address, invoice.invoice_id))
        .query(&[("school_id", Uuid::new_v4().to_string())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn list_invoices_filters_by_enrollment() {
    let app = TestApp::spawn().await;
    let school_id = Uuid::new_v4();
    let enrollment_id = Uuid::new_v4();
    let structure = app.create_fee_structure(school_id, "5000").await;
    let other_structure = app.create_fee_structure(school_id, "800").await;

    app.create_invoice(school_id, enrollment_id, structure.fee_structure_id)
        .await;
    app.create_invoice(school_id, enrollment_id, other_structure.fee_structure_id)
        .await;
    app.create_invoice(school_id, Uuid::new_v4(), structure.fee_structure_id)
        .await;

    let invoices: Vec<fees_service::models::FeeInvoice> = app
        .client
        .get(format!("{}/invoices", app.address))
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

    assert_eq!(invoices.len(), 2);
    assert!(invoices.iter().all(|i| i.enrollment_id == enrollment_id));
}
