#![allow(
    clippy::unwrap_used,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]

//! Integration tests for the paginated REST client.
//!
//! These tests use `httpmock` to mock HTTP responses, ensuring deterministic
//! and fast test execution without requiring network access.

mod common;

use std::sync::Arc;

use common::{TOKEN, orders_page};
use futures_util::TryStreamExt as _;
use httpmock::{Method::GET, MockServer};
use orderdesk_sync::auth::{Credential, StaticCredential};
use orderdesk_sync::error::{Kind, Status};
use orderdesk_sync::rest::RestClient;
use orderdesk_sync::types::{EntityId, Filters, Record, ResourceType};
use orderdesk_sync::view::{Page, PageQuery};
use reqwest::StatusCode;
use serde_json::json;

fn client(server: &MockServer) -> RestClient {
    let credentials = Arc::new(StaticCredential::new(Credential::bearer(TOKEN)));
    RestClient::new(&server.base_url(), credentials).unwrap()
}

fn orders() -> ResourceType {
    ResourceType::from("orders")
}

#[tokio::test]
async fn page_sends_paging_filters_and_credential() -> anyhow::Result<()> {
    let server = MockServer::start();
    let client = client(&server);

    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/orders")
            .query_param("page", "1")
            .query_param("perPage", "25")
            .query_param("sort", "-createdAt")
            .query_param("status", "pending")
            .header("authorization", format!("Bearer {TOKEN}"));
        then.status(StatusCode::OK).json_body(orders_page(3));
    });

    let mut filters = Filters::new();
    filters.insert("status".to_owned(), "pending".to_owned());
    let query = PageQuery::new(1, 25)
        .with_sort(Some("-createdAt"))
        .with_filters(filters);

    let page = client.page::<Record>(&orders(), &query).await?;

    assert_eq!(page.items.len(), 3);
    assert_eq!(page.items[0].id, EntityId::from(1_u64));
    assert_eq!(page.total_pages, 1);
    mock.assert();
    Ok(())
}

#[tokio::test]
async fn failed_request_is_status_error() {
    let server = MockServer::start();
    let client = client(&server);

    let mock = server.mock(|when, then| {
        when.method(GET).path("/orders");
        then.status(StatusCode::SERVICE_UNAVAILABLE)
            .body("maintenance");
    });

    let err = client
        .page::<Record>(&orders(), &PageQuery::new(1, 25))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Kind::Status);
    let status = err.downcast_ref::<Status>().unwrap();
    assert_eq!(status.status_code, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(status.message, "maintenance");
    mock.assert();
}

#[tokio::test]
async fn null_body_is_not_found() {
    let server = MockServer::start();
    let client = client(&server);

    server.mock(|when, then| {
        when.method(GET).path("/orders");
        then.status(StatusCode::OK).json_body(json!(null));
    });

    let err = client
        .page::<Record>(&orders(), &PageQuery::new(1, 25))
        .await
        .unwrap_err();

    let status = err.downcast_ref::<Status>().unwrap();
    assert_eq!(status.status_code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_credential_is_not_sent() {
    let server = MockServer::start();
    let client = RestClient::new(&server.base_url(), Arc::new(StaticCredential::none())).unwrap();

    let mock = server.mock(|when, then| {
        when.method(GET).path("/orders");
        then.status(StatusCode::OK).json_body(orders_page(3));
    });

    let err = client
        .page::<Record>(&orders(), &PageQuery::new(1, 25))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Kind::Authentication);
    mock.assert_hits(0);
}

#[tokio::test]
async fn stream_all_walks_every_page() -> anyhow::Result<()> {
    let server = MockServer::start();
    let client = client(&server);

    let first = server.mock(|when, then| {
        when.method(GET).path("/orders").query_param("page", "1");
        then.status(StatusCode::OK).json_body(
            serde_json::to_value(Page::new(
                vec![Record::new(1_u64), Record::new(2_u64)],
                1,
                2,
                3,
            ))
            .unwrap(),
        );
    });
    let second = server.mock(|when, then| {
        when.method(GET).path("/orders").query_param("page", "2");
        then.status(StatusCode::OK).json_body(
            serde_json::to_value(Page::new(vec![Record::new(3_u64)], 2, 2, 3)).unwrap(),
        );
    });

    let resource = orders();
    let records: Vec<Record> = client
        .stream_all(&resource, PageQuery::new(1, 2))
        .try_collect()
        .await?;

    let ids: Vec<_> = records.into_iter().map(|record| record.id).collect();
    assert_eq!(
        ids,
        vec![
            EntityId::from(1_u64),
            EntityId::from(2_u64),
            EntityId::from(3_u64)
        ]
    );
    first.assert();
    second.assert();
    Ok(())
}
