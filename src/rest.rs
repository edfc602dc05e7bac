//! Client for the dashboard's paginated REST collections.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use orderdesk_sync::auth::{Credential, StaticCredential};
//! use orderdesk_sync::rest::RestClient;
//! use orderdesk_sync::types::{Record, ResourceType};
//! use orderdesk_sync::view::PageQuery;
//!
//! # async fn example() -> orderdesk_sync::Result<()> {
//! let credentials = Arc::new(StaticCredential::new(Credential::bearer("token")));
//! let client = RestClient::new("https://api.example.com/", credentials)?;
//!
//! let page = client
//!     .page::<Record>(&ResourceType::from("orders"), &PageQuery::new(1, 25))
//!     .await?;
//! println!("{} of {} orders", page.items.len(), page.total_count);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Method};
use serde::Serialize;
use url::Url;

use crate::auth::CredentialProvider;
use crate::coordinator::PageFetcher;
use crate::error::Error;
use crate::types::{Entity, Filters, ResourceType};
use crate::view::{Page, PageQuery};
use crate::{Result, ToQueryParams as _};

/// Query string of a page request: `page`, `perPage`, optional `sort`, then one pair per filter.
#[derive(Debug, Serialize)]
struct PageRequest<'query> {
    page: u32,
    #[serde(rename = "perPage")]
    per_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<&'query str>,
    #[serde(flatten)]
    filters: &'query Filters,
}

impl<'query> From<&'query PageQuery> for PageRequest<'query> {
    fn from(query: &'query PageQuery) -> Self {
        Self {
            page: query.page,
            per_page: query.per_page,
            sort: query.sort.as_deref(),
            filters: &query.filters,
        }
    }
}

/// HTTP client for paginated collections.
#[derive(Clone)]
pub struct RestClient {
    host: Url,
    client: ReqwestClient,
    credentials: Arc<dyn CredentialProvider>,
}

impl RestClient {
    /// Creates a client against `host`. Resource paths are resolved relative to it, so a host
    /// with a path prefix should end with `/`.
    pub fn new(host: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert("User-Agent", HeaderValue::from_static("orderdesk_sync"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        Ok(Self {
            host: Url::parse(host)?,
            client,
            credentials,
        })
    }

    /// Returns the base URL of the API.
    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    /// `GET {host}{resource}?page&perPage&sort&<filters>` with the current bearer credential.
    pub async fn page<T: Entity>(
        &self,
        resource: &ResourceType,
        query: &PageQuery,
    ) -> Result<Page<T>> {
        let Some(credential) = self.credentials.credential().await? else {
            return Err(Error::authentication("no credential available"));
        };

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, credential.header_value()?);

        let url = self.host.join(resource.as_str())?;
        let params = PageRequest::from(query).query_params();
        let request = self
            .client
            .request(Method::GET, format!("{url}{params}"))
            .build()?;

        crate::request(&self.client, request, Some(headers)).await
    }

    /// Every item of `resource` matching the query's filters and sort, page after page, starting
    /// at the query's page.
    pub fn stream_all<'client, T: Entity>(
        &'client self,
        resource: &'client ResourceType,
        query: PageQuery,
    ) -> impl Stream<Item = Result<T>> + 'client {
        try_stream! {
            let mut query = query;

            loop {
                let page = self.page::<T>(resource, &query).await?;
                let last = page.page >= page.total_pages || page.items.is_empty();

                for item in page.items {
                    yield item;
                }

                if last {
                    break;
                }
                query.page = query.page.saturating_add(1);
            }
        }
    }
}

#[async_trait]
impl<T: Entity> PageFetcher<T> for RestClient {
    async fn fetch(&self, resource: &ResourceType, query: &PageQuery) -> Result<Page<T>> {
        self.page(resource, query).await
    }
}
