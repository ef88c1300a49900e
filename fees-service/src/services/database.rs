//! Postgres ledger store for fees-service.

use crate::models::{
    CreateFeeStructure, FeeInvoice, FeeStructure, InvoiceStatus, ListInvoicesFilter,
    ListPaymentsFilter, Payment, PaymentStatus, Refund, ReviewFlag,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::ledger::LedgerStore;

const FEE_STRUCTURE_COLUMNS: &str = "fee_structure_id, school_id, name, fee_type, frequency, \
     amount, mandatory, class_level, academic_year, valid_from, valid_to, active, issued, created_utc";

const INVOICE_COLUMNS: &str = "invoice_id, school_id, enrollment_id, fee_structure_id, \
     invoice_number, academic_year, issue_date, due_date, total, paid, balance, status, \
     cancelled_reason, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, school_id, invoice_id, reference, amount, \
     applied_amount, method, status, external_ref, payer_ref, review_flag, failure_reason, \
     recorded_by, initiated_utc, completed_utc";

const REFUND_COLUMNS: &str =
    "refund_id, payment_id, school_id, amount, status, reason, processed_by, created_utc";

/// Postgres-backed ledger store.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fees-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn conflict_on_unique(e: sqlx::Error, message: &str) -> AppError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}", message))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("{}: {}", message, e)),
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, input), fields(school_id = %input.school_id))]
    async fn insert_fee_structure(
        &self,
        input: &CreateFeeStructure,
    ) -> Result<FeeStructure, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_fee_structure"])
            .start_timer();

        let query = format!(
            "INSERT INTO fee_structures (fee_structure_id, school_id, name, fee_type, frequency, \
             amount, mandatory, class_level, academic_year, valid_from, valid_to) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {FEE_STRUCTURE_COLUMNS}"
        );
        let fs = sqlx::query_as::<_, FeeStructure>(&query)
            .bind(Uuid::new_v4())
            .bind(input.school_id)
            .bind(&input.name)
            .bind(input.fee_type.as_str())
            .bind(input.frequency.as_str())
            .bind(input.amount)
            .bind(input.mandatory)
            .bind(&input.class_level)
            .bind(&input.academic_year)
            .bind(input.valid_from)
            .bind(input.valid_to)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(
                    e,
                    &format!(
                        "Fee structure '{}' already exists for {}",
                        input.name, input.academic_year
                    ),
                )
            })?;

        timer.observe_duration();
        info!(fee_structure_id = %fs.fee_structure_id, name = %fs.name, "Fee structure created");
        Ok(fs)
    }

    #[instrument(skip(self), fields(school_id = %school_id, fee_structure_id = %id))]
    async fn get_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_fee_structure"])
            .start_timer();

        let query = format!(
            "SELECT {FEE_STRUCTURE_COLUMNS} FROM fee_structures \
             WHERE school_id = $1 AND fee_structure_id = $2"
        );
        let fs = sqlx::query_as::<_, FeeStructure>(&query)
            .bind(school_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to get fee structure: {}", e))
            })?;

        timer.observe_duration();
        Ok(fs)
    }

    #[instrument(skip(self), fields(school_id = %school_id))]
    async fn list_fee_structures(&self, school_id: Uuid) -> Result<Vec<FeeStructure>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_fee_structures"])
            .start_timer();

        let query = format!(
            "SELECT {FEE_STRUCTURE_COLUMNS} FROM fee_structures \
             WHERE school_id = $1 ORDER BY created_utc DESC"
        );
        let items = sqlx::query_as::<_, FeeStructure>(&query)
            .bind(school_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list fee structures: {}", e))
            })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self), fields(fee_structure_id = %id))]
    async fn mark_fee_structure_issued(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE fee_structures SET issued = TRUE WHERE fee_structure_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to mark fee structure issued: {}",
                    e
                ))
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(school_id = %school_id, fee_structure_id = %id))]
    async fn retire_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError> {
        let query = format!(
            "UPDATE fee_structures SET active = FALSE \
             WHERE school_id = $1 AND fee_structure_id = $2 \
             RETURNING {FEE_STRUCTURE_COLUMNS}"
        );
        let fs = sqlx::query_as::<_, FeeStructure>(&query)
            .bind(school_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to retire fee structure: {}", e))
            })?;
        Ok(fs)
    }

    #[instrument(skip(self), fields(school_id = %school_id))]
    async fn next_invoice_number(&self, school_id: Uuid, year: i32) -> Result<String, AppError> {
        let number = sqlx::query_scalar::<_, String>("SELECT next_invoice_number($1, $2)")
            .bind(school_id)
            .bind(year)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to allocate invoice number: {}",
                    e
                ))
            })?;
        Ok(number)
    }

    #[instrument(skip(self, invoice), fields(invoice_number = %invoice.invoice_number))]
    async fn insert_invoice(&self, invoice: FeeInvoice) -> Result<FeeInvoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let query = format!(
            "INSERT INTO fee_invoices (invoice_id, school_id, enrollment_id, fee_structure_id, \
             invoice_number, academic_year, issue_date, due_date, total, paid, balance, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {INVOICE_COLUMNS}"
        );
        let created = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(invoice.invoice_id)
            .bind(invoice.school_id)
            .bind(invoice.enrollment_id)
            .bind(invoice.fee_structure_id)
            .bind(&invoice.invoice_number)
            .bind(&invoice.academic_year)
            .bind(invoice.issue_date)
            .bind(invoice.due_date)
            .bind(invoice.total)
            .bind(invoice.paid)
            .bind(invoice.balance)
            .bind(&invoice.status)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(
                    e,
                    &format!("Invoice number {} already exists", invoice.invoice_number),
                )
            })?;

        timer.observe_duration();
        info!(
            invoice_id = %created.invoice_id,
            invoice_number = %created.invoice_number,
            total = %created.total,
            "Invoice created"
        );
        Ok(created)
    }

    #[instrument(skip(self), fields(school_id = %school_id, invoice_id = %id))]
    async fn get_invoice(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM fee_invoices WHERE school_id = $1 AND invoice_id = $2"
        );
        let invoice = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(school_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %id))]
    async fn get_invoice_by_id(&self, id: Uuid) -> Result<Option<FeeInvoice>, AppError> {
        let query = format!("SELECT {INVOICE_COLUMNS} FROM fee_invoices WHERE invoice_id = $1");
        let invoice = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;
        Ok(invoice)
    }

    #[instrument(skip(self), fields(school_id = %school_id, enrollment_id = %enrollment_id))]
    async fn find_open_invoice(
        &self,
        school_id: Uuid,
        enrollment_id: Uuid,
        fee_structure_id: Uuid,
        academic_year: &str,
    ) -> Result<Option<FeeInvoice>, AppError> {
        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM fee_invoices \
             WHERE school_id = $1 AND enrollment_id = $2 AND fee_structure_id = $3 \
               AND academic_year = $4 AND status IN ('pending', 'partial', 'overdue') \
             LIMIT 1"
        );
        let invoice = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(school_id)
            .bind(enrollment_id)
            .bind(fee_structure_id)
            .bind(academic_year)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to find open invoice: {}", e))
            })?;
        Ok(invoice)
    }

    #[instrument(skip(self, filter), fields(school_id = %school_id))]
    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<FeeInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM fee_invoices \
             WHERE school_id = $1 \
               AND ($2::uuid IS NULL OR enrollment_id = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY created_utc DESC"
        );
        let items = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(school_id)
            .bind(filter.enrollment_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e))
            })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self), fields(invoice_id = %id))]
    async fn update_invoice_amounts(
        &self,
        id: Uuid,
        paid: Decimal,
        balance: Decimal,
        status: InvoiceStatus,
    ) -> Result<FeeInvoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_amounts"])
            .start_timer();

        let query = format!(
            "UPDATE fee_invoices \
             SET paid = $2, balance = $3, status = $4, updated_utc = NOW() \
             WHERE invoice_id = $1 \
             RETURNING {INVOICE_COLUMNS}"
        );
        let invoice = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(id)
            .bind(paid)
            .bind(balance)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %id))]
    async fn mark_invoice_cancelled(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<FeeInvoice, AppError> {
        let query = format!(
            "UPDATE fee_invoices \
             SET status = 'cancelled', cancelled_reason = $2, updated_utc = NOW() \
             WHERE invoice_id = $1 \
             RETURNING {INVOICE_COLUMNS}"
        );
        let invoice = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to cancel invoice: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn list_invoices_due_before(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<FeeInvoice>, AppError> {
        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM fee_invoices \
             WHERE due_date < $1 AND balance > 0 AND status IN ('pending', 'partial')"
        );
        let items = sqlx::query_as::<_, FeeInvoice>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list due invoices: {}", e))
            })?;
        Ok(items)
    }

    #[instrument(skip(self, payment), fields(reference = %payment.reference))]
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let query = format!(
            "INSERT INTO payments (payment_id, school_id, invoice_id, reference, amount, \
             applied_amount, method, status, external_ref, payer_ref, review_flag, \
             failure_reason, recorded_by, initiated_utc, completed_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let created = sqlx::query_as::<_, Payment>(&query)
            .bind(payment.payment_id)
            .bind(payment.school_id)
            .bind(payment.invoice_id)
            .bind(&payment.reference)
            .bind(payment.amount)
            .bind(payment.applied_amount)
            .bind(&payment.method)
            .bind(&payment.status)
            .bind(&payment.external_ref)
            .bind(&payment.payer_ref)
            .bind(&payment.review_flag)
            .bind(&payment.failure_reason)
            .bind(payment.recorded_by)
            .bind(payment.initiated_utc)
            .bind(payment.completed_utc)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(
                    e,
                    &format!("Payment {} already recorded", payment.reference),
                )
            })?;

        timer.observe_duration();
        info!(
            payment_id = %created.payment_id,
            reference = %created.reference,
            amount = %created.amount,
            "Payment recorded"
        );
        Ok(created)
    }

    #[instrument(skip(self), fields(school_id = %school_id, payment_id = %id))]
    async fn get_payment(&self, school_id: Uuid, id: Uuid) -> Result<Option<Payment>, AppError> {
        let query = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE school_id = $1 AND payment_id = $2"
        );
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(school_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?;
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn find_payment_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Payment>, AppError> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_ref = $1");
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to look up payment by external ref: {}",
                    e
                ))
            })?;
        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %id))]
    async fn complete_payment(
        &self,
        id: Uuid,
        amount: Decimal,
        applied_amount: Decimal,
        review_flag: Option<ReviewFlag>,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_payment"])
            .start_timer();

        let query = format!(
            "UPDATE payments \
             SET amount = $2, applied_amount = $3, status = 'completed', review_flag = $4, \
                 completed_utc = NOW() \
             WHERE payment_id = $1 \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(id)
            .bind(amount)
            .bind(applied_amount)
            .bind(review_flag.map(|f| f.as_str()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to complete payment: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %id))]
    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<Payment, AppError> {
        let query = format!(
            "UPDATE payments \
             SET status = $2, failure_reason = COALESCE($3, failure_reason), \
                 completed_utc = COALESCE(completed_utc, NOW()) \
             WHERE payment_id = $1 \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(id)
            .bind(status.as_str())
            .bind(failure_reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update payment status: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
        Ok(payment)
    }

    #[instrument(skip(self, filter), fields(school_id = %school_id))]
    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let query = format!(
            "SELECT p.{} FROM payments p \
             LEFT JOIN fee_invoices i ON i.invoice_id = p.invoice_id \
             WHERE p.school_id = $1 \
               AND ($2::uuid IS NULL OR p.invoice_id = $2) \
               AND ($3::uuid IS NULL OR i.enrollment_id = $3) \
               AND ($4::text IS NULL OR p.status = $4) \
             ORDER BY p.initiated_utc DESC",
            PAYMENT_COLUMNS.replace(", ", ", p.")
        );
        let items = sqlx::query_as::<_, Payment>(&query)
            .bind(school_id)
            .bind(filter.invoice_id)
            .bind(filter.enrollment_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list payments: {}", e))
            })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn list_pending_gateway_payments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError> {
        let query = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status = 'pending' AND external_ref IS NOT NULL AND initiated_utc < $1"
        );
        let items = sqlx::query_as::<_, Payment>(&query)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to list pending gateway payments: {}",
                    e
                ))
            })?;
        Ok(items)
    }

    #[instrument(skip(self, refund), fields(payment_id = %refund.payment_id))]
    async fn insert_refund(&self, refund: Refund) -> Result<Refund, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_refund"])
            .start_timer();

        let query = format!(
            "INSERT INTO refunds (refund_id, payment_id, school_id, amount, status, reason, \
             processed_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {REFUND_COLUMNS}"
        );
        let created = sqlx::query_as::<_, Refund>(&query)
            .bind(refund.refund_id)
            .bind(refund.payment_id)
            .bind(refund.school_id)
            .bind(refund.amount)
            .bind(&refund.status)
            .bind(&refund.reason)
            .bind(refund.processed_by)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert refund: {}", e)))?;

        timer.observe_duration();
        info!(refund_id = %created.refund_id, amount = %created.amount, "Refund recorded");
        Ok(created)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError> {
        let query = format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE payment_id = $1 ORDER BY created_utc"
        );
        let items = sqlx::query_as::<_, Refund>(&query)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list refunds: {}", e)))?;
        Ok(items)
    }
}
