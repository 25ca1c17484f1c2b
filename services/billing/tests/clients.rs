//! HTTP client integration tests.
//!
//! The collaborator clients run against a wiremock server standing in for
//! the platform API and the invoicing backend.

use std::sync::Arc;
use std::time::Duration;

use pulse_billing::backend::memory::{MemoryLedger, MemorySkewStore, RecordingControlPlane};
use pulse_billing::backend::{BalanceApi, ControlAction, ControlPlane, ControlRequest, SkewStore};
use pulse_billing::client::{ApiClient, InvoiceClient};
use pulse_billing::notifier::NotifierSet;
use pulse_billing::providers::{BillingProvider, InvoicerProvider};
use pulse_billing::skew::{SkewAction, SkewEngine, SkewOutcome, SkewStatus};
use pulse_events::{AccountData, BillOpts, SkewKind};
use pulse_id::{AccountId, ResourceId};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn account() -> AccountId {
    AccountId::parse("info@example.com").unwrap()
}

fn resource() -> ResourceId {
    ResourceId::parse("ASM001").unwrap()
}

fn opts() -> BillOpts {
    BillOpts {
        account_id: Some(account()),
        assembly_id: Some(resource()),
        assembly_name: "web.example.com".to_string(),
        category: "machine".to_string(),
        soft_limit: Some(0.0),
        hard_limit: Some(-10.0),
        soft_grace_period: Some(Duration::from_secs(72 * 3600)),
        hard_grace_period: Some(Duration::from_secs(168 * 3600)),
        ..BillOpts::default()
    }
}

// =============================================================================
// Platform API
// =============================================================================

#[tokio::test]
async fn test_get_balance_sends_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balances/info@example.com"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credit": 42.5 })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), Some("secret".to_string())).unwrap();
    let balance = client.get_balance(&account()).await.unwrap();
    assert_eq!(balance.credit, 42.5);
}

#[tokio::test]
async fn test_account_key_stays_one_path_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balances/victim@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credit": 999.0 })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/balances/x%252F..%252Fvictim@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credit": -5.0 })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), None).unwrap();
    let account = AccountId::parse("x%2F..%2Fvictim@example.com").unwrap();
    let balance = client.get_balance(&account).await.unwrap();
    assert_eq!(balance.credit, -5.0);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].url.path(),
        "/v1/balances/x%252F..%252Fvictim@example.com"
    );
}

#[tokio::test]
async fn test_post_deduction_sends_new_credit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/balances/info@example.com/deduct"))
        .and(body_partial_json(json!({ "credit": 6.0 })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), None).unwrap();
    client.post_deduction(&account(), 6.0).await.unwrap();
}

#[tokio::test]
async fn test_error_status_carries_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balances/info@example.com"))
        .respond_with(ResponseTemplate::new(503).set_body_string("ledger offline"))
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), None).unwrap();
    let err = client.get_balance(&account()).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("503"), "{message}");
    assert!(message.contains("ledger offline"), "{message}");
}

#[tokio::test]
async fn test_list_active_queries_by_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/skews"))
        .and(query_param("account_id", "info@example.com"))
        .and(query_param("cat_id", "ASM001"))
        .and(query_param("status", "active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), None).unwrap();
    let records = client.list_active(&account(), &resource()).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_push_request_posts_action() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/requests"))
        .and(body_partial_json(json!({
            "account_id": "info@example.com",
            "resource_id": "ASM001",
            "action": "suspend",
            "category": "machine",
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(server.uri(), None).unwrap();
    let request = ControlRequest::new(account(), resource(), ControlAction::Suspend, "machine");
    client.push_request(&request).await.unwrap();
}

#[tokio::test]
async fn test_engine_over_http_destroys_below_hard_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balances/info@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "credit": -20.0 })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/skews"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/skews"))
        .and(body_partial_json(json!({ "status": "active" })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/requests"))
        .and(body_partial_json(json!({ "action": "destroy" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(ApiClient::new(server.uri(), None).unwrap());
    let engine = SkewEngine::new(client.clone(), client.clone(), client, NotifierSet::new());

    let outcome = engine.audit_unpaid(&opts()).await.unwrap();
    assert_eq!(outcome, SkewOutcome::Created(SkewAction::HardAction));
}

// =============================================================================
// Invoicing backend
// =============================================================================

struct QuotaFixture {
    server: MockServer,
    store: Arc<MemorySkewStore>,
    control: Arc<RecordingControlPlane>,
    provider: InvoicerProvider,
}

async fn quota_fixture() -> QuotaFixture {
    let server = MockServer::start().await;
    let store = Arc::new(MemorySkewStore::new());
    let control = Arc::new(RecordingControlPlane::new());
    let engine = Arc::new(SkewEngine::new(
        Arc::new(MemoryLedger::new()),
        store.clone(),
        control.clone(),
        NotifierSet::new(),
    ));
    let api = Arc::new(InvoiceClient::new(server.uri(), None).unwrap());
    QuotaFixture {
        server,
        store,
        control,
        provider: InvoicerProvider::new(Some(api), engine),
    }
}

fn quota_opts() -> BillOpts {
    BillOpts {
        skew_kind: SkewKind::Quota,
        quota_id: "QUO001".to_string(),
        ..opts()
    }
}

#[tokio::test]
async fn test_overdue_invoice_opens_quota_skew() {
    let f = quota_fixture().await;
    Mock::given(method("GET"))
        .and(path("/v1/invoices"))
        .and(query_param("account_id", "info@example.com"))
        .and(query_param("status", "overdue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "INV-1",
            "amount": 12.0,
            "due_date": "2026-01-01T00:00:00Z",
            "status": "overdue",
        }])))
        .expect(1)
        .mount(&f.server)
        .await;

    f.provider.audit_unpaid(&quota_opts()).await.unwrap();

    let records = f.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action().unwrap(), SkewAction::Warning);
    assert_eq!(records[0].event_type, SkewKind::Quota);
    assert!(f.control.requests().is_empty());
}

#[tokio::test]
async fn test_paid_invoices_close_quota_skew() {
    let f = quota_fixture().await;
    Mock::given(method("GET"))
        .and(path("/v1/invoices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&f.server)
        .await;

    // Open a warning first, then let the invoices come back clean.
    let engine = SkewEngine::new(
        Arc::new(MemoryLedger::new()),
        f.store.clone(),
        f.control.clone(),
        NotifierSet::new(),
    );
    engine.skews_quota_unpaid(&quota_opts()).await.unwrap();

    f.provider.audit_unpaid(&quota_opts()).await.unwrap();

    let records = f.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SkewStatus::Deactive);
}

#[tokio::test]
async fn test_ondemand_audit_skips_invoicer() {
    let f = quota_fixture().await;
    f.provider.audit_unpaid(&opts()).await.unwrap();

    assert!(f.server.received_requests().await.unwrap().is_empty());
    assert!(f.store.records().is_empty());
}

#[tokio::test]
async fn test_suspend_posts_to_service() {
    let f = quota_fixture().await;
    Mock::given(method("POST"))
        .and(path("/v1/services/ASM001/suspend"))
        .and(body_partial_json(json!({ "account_id": "info@example.com" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&f.server)
        .await;

    f.provider.suspend(&opts()).await.unwrap();
}

#[tokio::test]
async fn test_nuke_closes_client_by_escaped_email() {
    let f = quota_fixture().await;
    Mock::given(method("POST"))
        .and(path("/v1/clients/x%2F..%2Fvictim@example.com/close"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&f.server)
        .await;

    let account = AccountData {
        email: "x/../victim@example.com".to_string(),
        first_name: String::new(),
        last_name: String::new(),
        phone: None,
        company: None,
    };
    f.provider.nuke(&account).await.unwrap();

    let dotted = AccountData {
        email: "..".to_string(),
        ..account
    };
    assert!(f.provider.nuke(&dotted).await.is_err());
    assert_eq!(f.server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deduct_adds_billable_item() {
    let f = quota_fixture().await;
    Mock::given(method("POST"))
        .and(path("/v1/billable-items"))
        .and(body_partial_json(json!({
            "account_id": "info@example.com",
            "resource_id": "ASM001",
            "description": "web.example.com usage",
            "amount": 3.5,
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&f.server)
        .await;

    let opts = BillOpts {
        consumed: 3.5,
        ..opts()
    };
    f.provider.deduct(&opts).await.unwrap();
}
