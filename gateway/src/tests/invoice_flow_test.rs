use crate::db;
use crate::db::credentials::Environment;
use crate::db::invoice_events::EventType;
use crate::db::invoices::InvoiceStatus;
use crate::db::pending_transactions::PendingTransaction;
use crate::invoices;
use crate::invoices::CreateInvoiceParams;
use crate::logger::init_tracing_for_test;
use crate::rate_limit::RateLimiter;
use crate::scheduler;
use crate::settings::Settings;
use crate::tests::body_json;
use crate::tests::provision_merchant;
use crate::tests::setup_db;
use crate::tests::signed_request;
use crate::tests::static_qris;
use crate::tests::test_router;
use crate::tests::FailingUpstream;
use crate::tests::MockUpstream;
use crate::upstream::Credit;
use crate::upstream::CreditDirection;
use crate::webhook::WebhookWorker;
use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tower::ServiceExt;

fn create_body() -> String {
    json!({
        "username": "merchantA",
        "token": "upstream-token",
        "amount": 10000,
        "qris_static": static_qris(),
        "reference_id": "order-77",
    })
    .to_string()
}

fn check_body() -> String {
    json!({
        "username": "merchantA",
        "token": "upstream-token",
    })
    .to_string()
}

#[tokio::test]
async fn happy_path_creates_and_settles_an_invoice() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let merchant = {
        let mut conn = pool.get().unwrap();
        let merchant = provision_merchant(&mut conn, "happy@example.com");
        db::merchants::set_webhook_config(
            &mut conn,
            &merchant.merchant.id,
            Environment::Production,
            Some("http://127.0.0.1:9/hook"),
            true,
        )
        .unwrap();
        merchant
    };
    let upstream = Arc::new(MockUpstream::new());
    let app = test_router(pool.clone(), Settings::default(), upstream.clone());

    let created = app
        .clone()
        .oneshot(signed_request(
            "POST",
            "/invoices",
            &merchant,
            "n-create",
            &create_body(),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    assert_eq!(created["data"]["final_amount"], json!(10001));
    assert_eq!(created["data"]["unique_suffix"], json!(1));
    assert_eq!(created["data"]["status"], json!("pending"));
    let invoice_id = created["data"]["invoice_id"].as_str().unwrap().to_string();

    // The dynamic payload carries the final amount and verifies.
    let qris_string = created["data"]["qris_string"].as_str().unwrap();
    qris::validate(qris_string).unwrap();

    // No matching credit yet: still pending, with a countdown.
    let pending = app
        .clone()
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/check"),
            &merchant,
            "n-check-1",
            &check_body(),
        ))
        .await
        .unwrap();
    assert_eq!(pending.status(), StatusCode::OK);
    let pending = body_json(pending).await;
    assert_eq!(pending["data"]["status"], json!("pending"));
    assert!(pending["data"]["expires_in"].as_i64().unwrap() > 0);

    // The upstream reports the exact final amount as an inbound credit.
    upstream.set_credits(vec![Credit {
        amount: 10001,
        status: CreditDirection::In,
        note: None,
    }]);
    let paid = app
        .clone()
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/check"),
            &merchant,
            "n-check-2",
            &check_body(),
        ))
        .await
        .unwrap();
    assert_eq!(paid.status(), StatusCode::OK);
    let paid = body_json(paid).await;
    assert_eq!(paid["data"]["status"], json!("paid"));
    assert!(paid["data"]["invoice"]["paid_at"].as_i64().is_some());

    // Repeated checks short-circuit on the success cache.
    let cached = app
        .clone()
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/check"),
            &merchant,
            "n-check-3",
            &check_body(),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(cached).await["data"]["status"], json!("paid"));

    let mut conn = pool.get().unwrap();

    let invoice = db::invoices::get(&mut conn, &invoice_id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(invoice.paid_at.is_some());

    // Suffix claim released, success cache populated.
    assert!(db::pending_transactions::get_for_invoice(&mut conn, &invoice_id)
        .unwrap()
        .is_none());
    assert!(db::paid_transactions::get(&mut conn, &invoice_id)
        .unwrap()
        .is_some());

    let events = db::invoice_events::list(&mut conn, &invoice_id, 100).unwrap();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::PaymentCreated, EventType::PaymentPaid]);

    // One delivery per lifecycle event.
    let deliveries = db::webhook_deliveries::list_due(
        &mut conn,
        OffsetDateTime::now_utc().unix_timestamp(),
        20,
    )
    .unwrap();
    assert_eq!(deliveries.len(), 2);
}

#[tokio::test]
async fn unavailable_upstream_leaves_the_invoice_pending() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let merchant = provision_merchant(&mut pool.get().unwrap(), "upstream-down@example.com");
    let app = test_router(pool.clone(), Settings::default(), Arc::new(FailingUpstream));

    let created = app
        .clone()
        .oneshot(signed_request(
            "POST",
            "/invoices",
            &merchant,
            "n-create",
            &create_body(),
        ))
        .await
        .unwrap();
    let invoice_id = body_json(created).await["data"]["invoice_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/check"),
            &merchant,
            "n-check",
            &check_body(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["error"]["code"],
        json!("UpstreamUnavailable")
    );

    let mut conn = pool.get().unwrap();
    let invoice = db::invoices::get(&mut conn, &invoice_id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
}

fn create_params(principal: &str) -> CreateInvoiceParams {
    CreateInvoiceParams {
        principal: principal.to_string(),
        base_amount: 10000,
        qris_static: static_qris(),
        reference_id: None,
        metadata: None,
    }
}

#[tokio::test]
async fn suffixes_are_unique_per_principal_and_fill_holes() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let mut conn = pool.get().unwrap();
    let merchant = provision_merchant(&mut conn, "suffix@example.com");
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let first = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantA"),
        600,
        now,
    )
    .unwrap();
    let second = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantA"),
        600,
        now,
    )
    .unwrap();

    assert_eq!(first.unique_suffix, 1);
    assert_eq!(second.unique_suffix, 2);
    assert_eq!(second.final_amount, 10002);

    // Another principal starts from 1 again.
    let other = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantB"),
        600,
        now,
    )
    .unwrap();
    assert_eq!(other.unique_suffix, 1);

    // Releasing the first claim frees its suffix for reuse.
    db::pending_transactions::delete_for_invoice(&mut conn, &first.id).unwrap();
    let reused = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantA"),
        600,
        now,
    )
    .unwrap();
    assert_eq!(reused.unique_suffix, 1);
}

#[tokio::test]
async fn suffix_allocation_spills_past_500() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let mut conn = pool.get().unwrap();
    let merchant = provision_merchant(&mut conn, "spill@example.com");
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let anchor = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantA"),
        600,
        now,
    )
    .unwrap();

    // Claim the rest of the lower range directly.
    for suffix in 2..=500 {
        db::pending_transactions::try_claim(
            &mut conn,
            &PendingTransaction {
                principal: "merchantA".to_string(),
                unique_suffix: suffix,
                invoice_id: anchor.id.clone(),
                final_amount: 10000 + i64::from(suffix),
                created_at: now,
                expires_at: now + 600,
            },
        )
        .unwrap();
    }

    let spilled = invoices::create_invoice(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &create_params("merchantA"),
        600,
        now,
    )
    .unwrap();
    assert_eq!(spilled.unique_suffix, 501);
}

#[tokio::test]
async fn scheduler_tick_expires_overdue_invoices() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let settings = Settings::default();
    let merchant = provision_merchant(&mut pool.get().unwrap(), "expiry@example.com");
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let invoice = {
        let mut conn = pool.get().unwrap();
        invoices::create_invoice(
            &mut conn,
            &merchant.merchant.id,
            Environment::Production,
            &create_params("merchantA"),
            settings.invoice_ttl_secs,
            now,
        )
        .unwrap()
    };

    let worker = WebhookWorker::new(pool.clone(), settings.clone()).unwrap();
    let rate_limiter = RateLimiter::new(
        settings.rate_limit_per_minute,
        settings.rate_limit_window(),
    );

    // One second past the TTL.
    scheduler::run_tick(
        &pool,
        &worker,
        &rate_limiter,
        now + settings.invoice_ttl_secs + 1,
    )
    .await
    .unwrap();

    let mut conn = pool.get().unwrap();

    let expired = db::invoices::get(&mut conn, &invoice.id).unwrap().unwrap();
    assert_eq!(expired.status, InvoiceStatus::Expired);
    assert!(db::pending_transactions::get_for_invoice(&mut conn, &invoice.id)
        .unwrap()
        .is_none());

    let events = db::invoice_events::list(&mut conn, &invoice.id, 100).unwrap();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![EventType::PaymentCreated, EventType::PaymentExpired]
    );

    // A later check reports expired.
    let state = invoices::begin_check(
        &mut conn,
        &merchant.merchant.id,
        Environment::Production,
        &invoice.id,
        now + settings.invoice_ttl_secs + 2,
    )
    .unwrap();
    assert!(matches!(
        state,
        invoices::CheckState::Done(invoices::CheckOutcome::Expired(_))
    ));
}

#[tokio::test]
async fn refund_transitions_a_paid_invoice() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let merchant = provision_merchant(&mut pool.get().unwrap(), "refund@example.com");
    let upstream = Arc::new(MockUpstream::new());
    upstream.set_credits(vec![Credit {
        amount: 10001,
        status: CreditDirection::In,
        note: None,
    }]);
    let app = test_router(pool.clone(), Settings::default(), upstream);

    let created = app
        .clone()
        .oneshot(signed_request(
            "POST",
            "/invoices",
            &merchant,
            "n-create",
            &create_body(),
        ))
        .await
        .unwrap();
    let invoice_id = body_json(created).await["data"]["invoice_id"]
        .as_str()
        .unwrap()
        .to_string();

    app.clone()
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/check"),
            &merchant,
            "n-check",
            &check_body(),
        ))
        .await
        .unwrap();

    let refund_body = json!({"reason": "customer request"}).to_string();
    let refunded = app
        .clone()
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/refunds"),
            &merchant,
            "n-refund",
            &refund_body,
        ))
        .await
        .unwrap();
    assert_eq!(refunded.status(), StatusCode::OK);
    assert_eq!(
        body_json(refunded).await["data"]["status"],
        json!("refunded")
    );

    // A second refund conflicts.
    let again = app
        .oneshot(signed_request(
            "POST",
            &format!("/invoices/{invoice_id}/refunds"),
            &merchant,
            "n-refund-2",
            &refund_body,
        ))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let mut conn = pool.get().unwrap();
    let events = db::invoice_events::list(&mut conn, &invoice_id, 100).unwrap();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::PaymentCreated,
            EventType::PaymentPaid,
            EventType::RefundRequested,
            EventType::RefundProcessed,
        ]
    );
}

#[tokio::test]
async fn foreign_invoices_are_invisible() {
    init_tracing_for_test();

    let (_dir, pool) = setup_db();
    let (owner, other) = {
        let mut conn = pool.get().unwrap();
        (
            provision_merchant(&mut conn, "owner@example.com"),
            provision_merchant(&mut conn, "other@example.com"),
        )
    };
    let app = test_router(pool, Settings::default(), Arc::new(MockUpstream::new()));

    let created = app
        .clone()
        .oneshot(signed_request(
            "POST",
            "/invoices",
            &owner,
            "n-create",
            &create_body(),
        ))
        .await
        .unwrap();
    let invoice_id = body_json(created).await["data"]["invoice_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(signed_request(
            "GET",
            &format!("/invoices/{invoice_id}"),
            &other,
            "n-get",
            "",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
