//! HTTP clients for the collaborator APIs.
//!
//! [`ApiClient`] speaks the platform API (balances, skew records, control
//! requests); [`InvoiceClient`] speaks the external invoicing backend. Both
//! send JSON with an optional bearer key and turn any non-2xx response into
//! an error carrying the status and body.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pulse_events::AccountData;
use pulse_id::{AccountId, ResourceId};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Serialize;
use tracing::{debug, error};

use crate::backend::{
    Balance, BalanceApi, BillableItem, BilledHistory, ControlPlane, ControlRequest, Invoice,
    InvoiceApi, SkewStore,
};
use crate::skew::SkewRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Passes a 2xx response through; anything else becomes an error.
pub(crate) async fn ensure_success(response: Response, operation: &'static str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, operation, "Request failed");
        anyhow::bail!("{} failed: {} - {}", operation, status, body);
    }
    Ok(response)
}

// =============================================================================
// Platform API
// =============================================================================

/// Client for the platform API.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    base: Url,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url).with_context(|| format!("Invalid base URL {base_url:?}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Base URL {base_url:?} cannot carry a path");
        }
        Ok(Self {
            client: build_http_client()?,
            base_url,
            base,
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            anyhow::bail!("Invalid path segment {bad:?}");
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("Base URL {:?} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let builder = self.client.request(method, self.endpoint(segments)?);
        Ok(match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        })
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
        operation: &'static str,
    ) -> Result<Response> {
        let response = self.request(method, segments)?.json(body).send().await?;
        ensure_success(response, operation).await
    }
}

#[derive(Serialize)]
struct DeductionBody {
    credit: f64,
}

#[async_trait]
impl BalanceApi for ApiClient {
    async fn get_balance(&self, account: &AccountId) -> Result<Balance> {
        debug!(account_id = %account, "Fetching balance");

        let response = self
            .request(Method::GET, &["v1", "balances", account.as_str()])?
            .send()
            .await?;
        let balance = ensure_success(response, "get balance")
            .await?
            .json()
            .await?;
        Ok(balance)
    }

    async fn post_deduction(&self, account: &AccountId, new_credit: f64) -> Result<()> {
        debug!(account_id = %account, new_credit, "Posting deduction");

        let body = DeductionBody { credit: new_credit };
        self.send_json(
            Method::POST,
            &["v1", "balances", account.as_str(), "deduct"],
            &body,
            "post deduction",
        )
        .await?;
        Ok(())
    }

    async fn post_billed_history(&self, record: &BilledHistory) -> Result<()> {
        debug!(
            account_id = %record.account_id,
            assembly_id = %record.assembly_id,
            amount = record.billing_amount,
            "Posting billed history"
        );
        self.send_json(Method::POST, &["v1", "billedhistories"], record, "post billed history")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SkewStore for ApiClient {
    async fn list_active(
        &self,
        account: &AccountId,
        resource: &ResourceId,
    ) -> Result<Vec<SkewRecord>> {
        let response = self
            .request(Method::GET, &["v1", "skews"])?
            .query(&[
                ("account_id", account.as_str()),
                ("cat_id", resource.as_str()),
                ("status", "active"),
            ])
            .send()
            .await?;

        let mut records: Vec<SkewRecord> = ensure_success(response, "list skews")
            .await?
            .json()
            .await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(
            account_id = %account,
            resource_id = %resource,
            count = records.len(),
            "Fetched active skews"
        );
        Ok(records)
    }

    async fn create(&self, record: &SkewRecord) -> Result<()> {
        self.send_json(Method::POST, &["v1", "skews"], record, "create skew")
            .await?;
        Ok(())
    }

    async fn update(&self, record: &SkewRecord) -> Result<()> {
        let id = record.id.to_string();
        self.send_json(Method::PUT, &["v1", "skews", id.as_str()], record, "update skew")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn push_request(&self, request: &ControlRequest) -> Result<()> {
        debug!(
            request_id = %request.request_id,
            resource_id = %request.resource_id,
            action = %request.action,
            "Pushing control request"
        );
        self.send_json(Method::POST, &["v1", "requests"], request, "push control request")
            .await?;
        Ok(())
    }
}

// =============================================================================
// Invoicing backend
// =============================================================================

/// Client for the external invoicing backend.
#[derive(Clone)]
pub struct InvoiceClient {
    api: ApiClient,
}

#[derive(Serialize)]
struct AccountBody<'a> {
    account_id: &'a AccountId,
}

impl InvoiceClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, api_key)?,
        })
    }
}

#[async_trait]
impl InvoiceApi for InvoiceClient {
    async fn create_client(&self, account: &AccountData) -> Result<()> {
        self.api
            .send_json(Method::POST, &["v1", "clients"], account, "create invoicing client")
            .await?;
        Ok(())
    }

    async fn close_client(&self, email: &str) -> Result<()> {
        let response = self
            .api
            .request(Method::POST, &["v1", "clients", email, "close"])?
            .send()
            .await?;
        ensure_success(response, "close invoicing client").await?;
        Ok(())
    }

    async fn suspend_service(&self, account: &AccountId, resource: &ResourceId) -> Result<()> {
        let body = AccountBody {
            account_id: account,
        };
        self.api
            .send_json(
                Method::POST,
                &["v1", "services", resource.as_str(), "suspend"],
                &body,
                "suspend service",
            )
            .await?;
        Ok(())
    }

    async fn add_billable_item(&self, item: &BillableItem) -> Result<()> {
        self.api
            .send_json(Method::POST, &["v1", "billable-items"], item, "add billable item")
            .await?;
        Ok(())
    }

    async fn create_invoice(&self, account: &AccountId) -> Result<Invoice> {
        let body = AccountBody {
            account_id: account,
        };
        let invoice = self
            .api
            .send_json(Method::POST, &["v1", "invoices"], &body, "create invoice")
            .await?
            .json()
            .await?;
        Ok(invoice)
    }

    async fn overdue_invoices(&self, account: &AccountId) -> Result<Vec<Invoice>> {
        let response = self
            .api
            .request(Method::GET, &["v1", "invoices"])?
            .query(&[("account_id", account.as_str()), ("status", "overdue")])
            .send()
            .await?;
        let invoices = ensure_success(response, "list overdue invoices")
            .await?
            .json()
            .await?;
        Ok(invoices)
    }
}
