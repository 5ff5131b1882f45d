use crate::db;
use crate::db::credentials::Environment;
use crate::db::invoice_events::EventType;
use crate::db::invoices::Invoice;
use crate::db::invoices::InvoiceStatus;
use crate::db::merchants::Merchant;
use crate::db::paid_transactions::PaidTransaction;
use crate::db::pending_transactions::PendingTransaction;
use crate::upstream::find_matching_credit;
use crate::upstream::Credit;
use crate::AppError;
use anyhow::Context;
use diesel::Connection;
use diesel::SqliteConnection;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// How often a create retries after losing a suffix race before the
/// contention is surfaced to the caller.
const MAX_CREATE_ATTEMPTS: usize = 3;
/// Expiry scan batch size per scheduler tick.
pub const EXPIRY_BATCH_SIZE: i64 = 200;

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub principal: String,
    pub base_amount: i64,
    pub qris_static: String,
    pub reference_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Payload shape shared by all payment.* events and their webhooks.
#[derive(Debug, Serialize)]
pub struct PaymentEventPayload {
    pub event_type: EventType,
    pub invoice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub principal: String,
    pub environment: Environment,
    pub base_amount: i64,
    pub unique_suffix: i32,
    pub final_amount: i64,
    pub status: InvoiceStatus,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Payload shape of the refund.* events.
#[derive(Debug, Serialize)]
pub struct RefundEventPayload {
    pub event_type: EventType,
    pub invoice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn payment_payload(invoice: &Invoice, event_type: EventType) -> anyhow::Result<serde_json::Value> {
    let metadata = invoice
        .metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("Malformed invoice metadata")?;

    let payload = PaymentEventPayload {
        event_type,
        invoice_id: invoice.id.clone(),
        reference_id: invoice.reference_id.clone(),
        principal: invoice.principal.clone(),
        environment: invoice.environment,
        base_amount: invoice.base_amount,
        unique_suffix: invoice.unique_suffix,
        final_amount: invoice.final_amount,
        status: invoice.status,
        expires_at: invoice.expires_at,
        paid_at: invoice.paid_at,
        metadata,
    };

    Ok(serde_json::to_value(payload)?)
}

/// Queue the notification when the merchant has a webhook configured for the
/// invoice's environment. Callers run this inside the same transaction as
/// the state change it announces.
fn enqueue_webhook(
    conn: &mut SqliteConnection,
    merchant: &Merchant,
    invoice: &Invoice,
    event_type: EventType,
    payload: &serde_json::Value,
    now: i64,
) -> anyhow::Result<()> {
    let config = merchant.webhook_config(invoice.environment);
    let enabled = config.enabled
        && config
            .url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false);
    if !enabled {
        return Ok(());
    }

    db::webhook_deliveries::enqueue(
        conn,
        &merchant.id,
        invoice.environment,
        Some(&invoice.id),
        event_type,
        payload,
        now,
    )?;

    Ok(())
}

/// The smallest free suffix, filling holes below 500 before touching the
/// upper range.
fn pick_suffix(claimed: &[i32]) -> Option<i32> {
    let claimed: HashSet<i32> = claimed.iter().copied().collect();

    (1..=500)
        .find(|suffix| !claimed.contains(suffix))
        .or_else(|| (501..=999).find(|suffix| !claimed.contains(suffix)))
}

pub fn create_invoice(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    params: &CreateInvoiceParams,
    invoice_ttl_secs: i64,
    now: i64,
) -> Result<Invoice, AppError> {
    if params.principal.trim().is_empty() {
        return Err(AppError::MissingParams("username must not be empty".to_string()));
    }
    if params.base_amount <= 0 {
        return Err(AppError::InvalidAmount(
            "amount must be a positive integer".to_string(),
        ));
    }
    qris::validate(&params.qris_static).map_err(|e| AppError::InvalidQris(e.to_string()))?;

    let merchant = db::merchants::get(conn, merchant_id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to load merchant: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Merchant not found".to_string()))?;

    db::pending_transactions::delete_expired_for_principal(conn, &params.principal, now).map_err(
        |e| AppError::InternalServerError(format!("Failed to release lapsed suffixes: {e:#}")),
    )?;

    for _attempt in 0..MAX_CREATE_ATTEMPTS {
        let claimed = db::pending_transactions::claimed_suffixes(conn, &params.principal)
            .map_err(|e| {
                AppError::InternalServerError(format!("Failed to read claimed suffixes: {e:#}"))
            })?;
        let suffix = pick_suffix(&claimed).ok_or(AppError::NoSuffixAvailable)?;
        let final_amount = params.base_amount + i64::from(suffix);

        let qris_string = qris::inject_amount(&params.qris_static, final_amount)
            .map_err(|e| AppError::InvalidQris(e.to_string()))?;

        let invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            merchant_id: merchant_id.to_string(),
            environment,
            principal: params.principal.clone(),
            reference_id: params.reference_id.clone(),
            base_amount: params.base_amount,
            unique_suffix: suffix,
            final_amount,
            status: InvoiceStatus::Pending,
            qris_string,
            metadata: params.metadata.as_ref().map(|m| m.to_string()),
            created_at: now,
            expires_at: now + invoice_ttl_secs,
            paid_at: None,
        };

        let created = conn
            .transaction::<Option<Invoice>, anyhow::Error, _>(|conn| {
                let pending = PendingTransaction {
                    principal: invoice.principal.clone(),
                    unique_suffix: suffix,
                    invoice_id: invoice.id.clone(),
                    final_amount,
                    created_at: now,
                    expires_at: invoice.expires_at,
                };
                if !db::pending_transactions::try_claim(conn, &pending)? {
                    // Lost the race for this suffix; roll back and pick again.
                    return Ok(None);
                }

                db::invoices::insert(conn, &invoice)?;

                let payload = payment_payload(&invoice, EventType::PaymentCreated)?;
                db::invoice_events::append(
                    conn,
                    &invoice.id,
                    EventType::PaymentCreated,
                    &payload,
                    now,
                )?;
                enqueue_webhook(
                    conn,
                    &merchant,
                    &invoice,
                    EventType::PaymentCreated,
                    &payload,
                    now,
                )?;

                Ok(Some(invoice.clone()))
            })
            .map_err(|e| {
                AppError::InternalServerError(format!("Failed to create invoice: {e:#}"))
            })?;

        if let Some(invoice) = created {
            return Ok(invoice);
        }
    }

    Err(AppError::Conflict(
        "Could not allocate a unique suffix under contention".to_string(),
    ))
}

#[derive(Debug)]
pub enum CheckOutcome {
    Paid(Invoice),
    Expired(Invoice),
    Pending { invoice: Invoice, expires_in: i64 },
}

/// Result of the synchronous pre-poll phase: either the outcome is already
/// known, or the upstream has to be consulted.
#[derive(Debug)]
pub enum CheckState {
    Done(CheckOutcome),
    Poll {
        invoice: Invoice,
        pending_expires_at: i64,
    },
}

/// Settle an invoice as paid: drop its suffix claim, flip the status, append
/// the event and queue the webhook, all in one transaction. `cache_ttl` is
/// set when a fresh upstream match should populate the success cache.
fn mark_paid(
    conn: &mut SqliteConnection,
    merchant: &Merchant,
    invoice: &Invoice,
    paid_at: i64,
    cache_expires_at: Option<i64>,
    now: i64,
) -> Result<Invoice, AppError> {
    let mut paid = invoice.clone();
    paid.status = InvoiceStatus::Paid;
    paid.paid_at = Some(paid_at);

    let transitioned = conn
        .transaction::<bool, anyhow::Error, _>(|conn| {
            let transitioned = db::invoices::transition(
                conn,
                &invoice.id,
                InvoiceStatus::Pending,
                InvoiceStatus::Paid,
                Some(paid_at),
            )?;
            if !transitioned {
                return Ok(false);
            }

            db::pending_transactions::delete_for_invoice(conn, &invoice.id)?;

            if let Some(expires_at) = cache_expires_at {
                db::paid_transactions::insert(
                    conn,
                    &PaidTransaction {
                        invoice_id: invoice.id.clone(),
                        principal: invoice.principal.clone(),
                        final_amount: invoice.final_amount,
                        paid_at,
                        expires_at,
                    },
                )?;
            }

            let payload = payment_payload(&paid, EventType::PaymentPaid)?;
            db::invoice_events::append(conn, &paid.id, EventType::PaymentPaid, &payload, now)?;
            enqueue_webhook(conn, merchant, &paid, EventType::PaymentPaid, &payload, now)?;

            Ok(true)
        })
        .map_err(|e| AppError::InternalServerError(format!("Failed to mark paid: {e:#}")))?;

    if transitioned {
        return Ok(paid);
    }

    // Another writer settled the race; report whatever it decided.
    let current = db::invoices::get(conn, &invoice.id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to reload invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))?;
    Ok(current)
}

/// Expire an invoice whose TTL elapsed, atomically with its event and
/// webhook.
fn mark_expired(
    conn: &mut SqliteConnection,
    merchant: &Merchant,
    invoice: &Invoice,
    now: i64,
) -> Result<Invoice, AppError> {
    let mut expired = invoice.clone();
    expired.status = InvoiceStatus::Expired;

    let transitioned = conn
        .transaction::<bool, anyhow::Error, _>(|conn| {
            let transitioned = db::invoices::transition(
                conn,
                &invoice.id,
                InvoiceStatus::Pending,
                InvoiceStatus::Expired,
                None,
            )?;
            if !transitioned {
                return Ok(false);
            }

            db::pending_transactions::delete_for_invoice(conn, &invoice.id)?;

            let payload = payment_payload(&expired, EventType::PaymentExpired)?;
            db::invoice_events::append(
                conn,
                &expired.id,
                EventType::PaymentExpired,
                &payload,
                now,
            )?;
            enqueue_webhook(
                conn,
                merchant,
                &expired,
                EventType::PaymentExpired,
                &payload,
                now,
            )?;

            Ok(true)
        })
        .map_err(|e| AppError::InternalServerError(format!("Failed to expire invoice: {e:#}")))?;

    if transitioned {
        return Ok(expired);
    }

    let current = db::invoices::get(conn, &invoice.id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to reload invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))?;
    Ok(current)
}

fn load_merchant(conn: &mut SqliteConnection, merchant_id: &str) -> Result<Merchant, AppError> {
    db::merchants::get(conn, merchant_id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to load merchant: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Merchant not found".to_string()))
}

/// Everything `check` can decide without talking to the upstream.
pub fn begin_check(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    invoice_id: &str,
    now: i64,
) -> Result<CheckState, AppError> {
    let invoice = db::invoices::get_for_merchant(conn, invoice_id, merchant_id, environment)
        .map_err(|e| AppError::InternalServerError(format!("Failed to load invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))?;

    let merchant = load_merchant(conn, merchant_id)?;

    // Success cache first: repeated checks short-circuit without re-polling,
    // and a crash between cache write and transition is healed here.
    let cached = db::paid_transactions::get(conn, &invoice.id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to read paid cache: {e:#}")))?
        .filter(|cached| cached.expires_at > now);
    if let Some(cached) = cached {
        let invoice = if invoice.status == InvoiceStatus::Pending {
            mark_paid(conn, &merchant, &invoice, cached.paid_at, None, now)?
        } else {
            invoice
        };
        return Ok(CheckState::Done(CheckOutcome::Paid(invoice)));
    }

    let pending = db::pending_transactions::get_for_invoice(conn, &invoice.id)
        .map_err(|e| AppError::InternalServerError(format!("Failed to load claim: {e:#}")))?;
    let pending = match pending {
        Some(pending) => pending,
        None if invoice.status == InvoiceStatus::Expired => {
            return Ok(CheckState::Done(CheckOutcome::Expired(invoice)));
        }
        None => return Err(AppError::NotFound("Invoice not found".to_string())),
    };

    if now > pending.expires_at {
        let invoice = mark_expired(conn, &merchant, &invoice, now)?;
        return Ok(CheckState::Done(CheckOutcome::Expired(invoice)));
    }

    Ok(CheckState::Poll {
        invoice,
        pending_expires_at: pending.expires_at,
    })
}

/// Apply the upstream poll result to an invoice the pre-poll phase left in
/// `Poll` state.
pub fn settle_check(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    invoice: &Invoice,
    pending_expires_at: i64,
    credits: &[Credit],
    paid_cache_ttl_secs: i64,
    now: i64,
) -> Result<CheckOutcome, AppError> {
    let merchant = load_merchant(conn, merchant_id)?;

    match find_matching_credit(credits, invoice.final_amount) {
        Some(_) => {
            let invoice = mark_paid(
                conn,
                &merchant,
                invoice,
                now,
                Some(now + paid_cache_ttl_secs),
                now,
            )?;
            // The scheduler may have expired the invoice between the poll
            // phases; report what actually won.
            if invoice.status == InvoiceStatus::Expired {
                return Ok(CheckOutcome::Expired(invoice));
            }
            Ok(CheckOutcome::Paid(invoice))
        }
        None => Ok(CheckOutcome::Pending {
            invoice: invoice.clone(),
            expires_in: pending_expires_at - now,
        }),
    }
}

/// One scheduler batch of TTL expirations. Each invoice expires in its own
/// transaction; one failure does not block the rest of the batch.
pub fn expire_due_invoices(conn: &mut SqliteConnection, now: i64) -> Result<usize, AppError> {
    let due = db::invoices::list_due_expiry(conn, now, EXPIRY_BATCH_SIZE)
        .map_err(|e| AppError::InternalServerError(format!("Failed to scan expiries: {e:#}")))?;

    let mut expired = 0;
    for invoice in due {
        let merchant = match load_merchant(conn, &invoice.merchant_id) {
            Ok(merchant) => merchant,
            Err(e) => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    "Could not load merchant of expiring invoice: {e:?}"
                );
                continue;
            }
        };

        match mark_expired(conn, &merchant, &invoice, now) {
            Ok(_) => expired += 1,
            Err(e) => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    "Could not expire invoice: {e:?}"
                );
            }
        }
    }

    Ok(expired)
}

/// Record and process a refund for a paid invoice. With settlement out of
/// scope there is no external approval step; the request and the processed
/// transition land in one transaction.
pub fn request_refund(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    invoice_id: &str,
    amount: Option<i64>,
    reason: Option<String>,
    now: i64,
) -> Result<Invoice, AppError> {
    let invoice = db::invoices::get_for_merchant(conn, invoice_id, merchant_id, environment)
        .map_err(|e| AppError::InternalServerError(format!("Failed to load invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))?;

    if invoice.status != InvoiceStatus::Paid {
        return Err(AppError::Conflict(
            "Only paid invoices can be refunded".to_string(),
        ));
    }

    let amount = amount.unwrap_or(invoice.final_amount);
    if amount <= 0 || amount > invoice.final_amount {
        return Err(AppError::InvalidAmount(
            "Refund amount must be positive and at most the final amount".to_string(),
        ));
    }

    let merchant = load_merchant(conn, merchant_id)?;

    let mut refunded = invoice.clone();
    refunded.status = InvoiceStatus::Refunded;

    let transitioned = conn
        .transaction::<bool, anyhow::Error, _>(|conn| {
            let transitioned = db::invoices::transition(
                conn,
                &invoice.id,
                InvoiceStatus::Paid,
                InvoiceStatus::Refunded,
                None,
            )?;
            if !transitioned {
                return Ok(false);
            }

            let requested = RefundEventPayload {
                event_type: EventType::RefundRequested,
                invoice_id: invoice.id.clone(),
                reference_id: invoice.reference_id.clone(),
                amount,
                reason: reason.clone(),
            };
            db::invoice_events::append(
                conn,
                &invoice.id,
                EventType::RefundRequested,
                &serde_json::to_value(&requested)?,
                now,
            )?;

            let processed = RefundEventPayload {
                event_type: EventType::RefundProcessed,
                invoice_id: invoice.id.clone(),
                reference_id: invoice.reference_id.clone(),
                amount,
                reason: reason.clone(),
            };
            let processed = serde_json::to_value(&processed)?;
            db::invoice_events::append(
                conn,
                &invoice.id,
                EventType::RefundProcessed,
                &processed,
                now,
            )?;
            enqueue_webhook(
                conn,
                &merchant,
                &refunded,
                EventType::RefundProcessed,
                &processed,
                now,
            )?;

            Ok(true)
        })
        .map_err(|e| AppError::InternalServerError(format!("Failed to process refund: {e:#}")))?;

    if !transitioned {
        return Err(AppError::Conflict(
            "Invoice left the paid state concurrently".to_string(),
        ));
    }

    Ok(refunded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_suffix_starts_at_one_and_fills_holes() {
        assert_eq!(pick_suffix(&[]), Some(1));
        assert_eq!(pick_suffix(&[1, 2, 3]), Some(4));
        assert_eq!(pick_suffix(&[1, 3]), Some(2));
    }

    #[test]
    fn pick_suffix_spills_into_upper_range() {
        let lower: Vec<i32> = (1..=500).collect();
        assert_eq!(pick_suffix(&lower), Some(501));

        let mut holey = lower.clone();
        holey.retain(|s| *s != 250);
        assert_eq!(pick_suffix(&holey), Some(250));
    }

    #[test]
    fn pick_suffix_exhausts_at_999() {
        let all: Vec<i32> = (1..=999).collect();
        assert_eq!(pick_suffix(&all), None);
    }
}
