use std::collections::VecDeque;

use futures::stream::{self, Stream};
use http::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AccessTokenProvider;
use crate::errors::Result;
use crate::fhir::client::FhirClient;
use crate::observability::metrics::get_metrics;

/// Where a traversal starts.
#[derive(Debug, Clone)]
pub enum PageSource {
    /// An already fetched search result.
    Bundle(Value),
    /// A search URL, absolute or relative to the FHIR base.
    Url(String),
}

#[derive(Debug)]
enum Cursor {
    /// Page to request next.
    Fetch(String),
    /// Fetched, not yet yielded.
    Ready(Value),
    /// A page was yielded; its `next` link waits for the cancellation check.
    Advance(Option<String>),
    Done,
}

/// Lazy, forward-only walk over the `next` links of search Bundles.
///
/// Consumed once. A failed fetch ends the traversal after returning the error.
pub struct BundlePages<P> {
    client: FhirClient<P>,
    cursor: Cursor,
    limit: Option<usize>,
    yielded: usize,
    cancellation: Option<CancellationToken>,
}

impl<P> FhirClient<P>
where
    P: AccessTokenProvider + 'static,
{
    pub fn pages(&self, source: PageSource) -> BundlePages<P> {
        let cursor = match source {
            PageSource::Bundle(bundle) => Cursor::Ready(bundle),
            PageSource::Url(url) => Cursor::Fetch(url),
        };
        BundlePages {
            client: self.clone(),
            cursor,
            limit: None,
            yielded: 0,
            cancellation: None,
        }
    }
}

impl<P> BundlePages<P>
where
    P: AccessTokenProvider + 'static,
{
    /// Stop after `limit` pages whatever links remain.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checked between pages; once cancelled no further page is fetched.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn pages_yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next_page(&mut self) -> Result<Option<Value>> {
        loop {
            if self.limit.is_some_and(|limit| self.yielded >= limit) {
                debug!("page limit {} reached", self.yielded);
                self.cursor = Cursor::Done;
                return Ok(None);
            }

            match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Done => return Ok(None),
                Cursor::Fetch(url) => {
                    debug!("fetching page {}", url);
                    let page = self.client.request(Method::GET, &url, None).await?;
                    get_metrics().pages_fetched.inc();
                    self.cursor = Cursor::Ready(page);
                }
                Cursor::Ready(page) => {
                    let next = next_link(&page);
                    self.cursor = Cursor::Advance(next);
                    if is_bundle(&page) {
                        self.yielded += 1;
                        return Ok(Some(page));
                    }
                    warn!("skipping page that is not a Bundle");
                }
                Cursor::Advance(next) => {
                    // give the consumer a chance to cancel before the next request
                    tokio::task::yield_now().await;
                    if self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        info!("pagination cancelled after {} pages", self.yielded);
                        return Ok(None);
                    }
                    match next {
                        Some(url) => self.cursor = Cursor::Fetch(url),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Entry resources of every page, with the limit counting items.
    pub fn items(mut self) -> BundleItems<P> {
        let limit = self.limit.take();
        BundleItems {
            pages: self,
            buffered: VecDeque::new(),
            limit,
            yielded: 0,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        stream::unfold(self, |mut pages| async move {
            match pages.next_page().await {
                Ok(Some(page)) => Some((Ok(page), pages)),
                Ok(None) => None,
                Err(e) => Some((Err(e), pages)),
            }
        })
    }
}

/// Flattened `entry[].resource` view over `BundlePages`.
pub struct BundleItems<P> {
    pages: BundlePages<P>,
    buffered: VecDeque<Value>,
    limit: Option<usize>,
    yielded: usize,
}

impl<P> BundleItems<P>
where
    P: AccessTokenProvider + 'static,
{
    pub async fn next_item(&mut self) -> Result<Option<Value>> {
        loop {
            if self.limit.is_some_and(|limit| self.yielded >= limit) {
                return Ok(None);
            }
            if let Some(item) = self.buffered.pop_front() {
                self.yielded += 1;
                return Ok(Some(item));
            }
            match self.pages.next_page().await? {
                Some(page) => self.buffered.extend(entry_resources(page)),
                None => return Ok(None),
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        stream::unfold(self, |mut items| async move {
            match items.next_item().await {
                Ok(Some(item)) => Some((Ok(item), items)),
                Ok(None) => None,
                Err(e) => Some((Err(e), items)),
            }
        })
    }
}

fn is_bundle(page: &Value) -> bool {
    page.get("resourceType").and_then(Value::as_str) == Some("Bundle")
}

/// `url` of the `link` with `relation == "next"`.
fn next_link(page: &Value) -> Option<String> {
    page.get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
        .map(str::to_owned)
}

fn entry_resources(page: Value) -> Vec<Value> {
    let Value::Object(mut page) = page else { return Vec::new() };
    match page.remove("entry") {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::Object(mut entry) => entry.remove("resource"),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
