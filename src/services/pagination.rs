//! Offset-based pagination over Bitbucket Server collections.
//!
//! Pages have the shape `{values, isLastPage, nextPageStart}`. A
//! [`Paginator`] walks them lazily, one request per page; a [`Collection`]
//! flattens pages into single items and tracks page numbers.

use std::collections::VecDeque;
use std::marker::PhantomData;

use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DEFAULT_PAGE_LENGTH;
use crate::services::connection::{Connection, ConnectionError};

/// Default number of items requested per page.
pub const PAGE_LENGTH: u32 = DEFAULT_PAGE_LENGTH;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPage {
    #[serde(default)]
    values: Vec<Value>,
    #[serde(default)]
    is_last_page: bool,
    #[serde(default)]
    next_page_start: Option<u64>,
}

/// One page of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    items: Vec<T>,
    is_last_page: bool,
    next_page_start: Option<u64>,
}

impl<T: DeserializeOwned> Page<T> {
    /// Build a page from a response body, deserializing each record of `values`.
    pub fn from_response(body: Value, endpoint: &str) -> Result<Self, ConnectionError> {
        let raw: RawPage = serde_json::from_value(body).map_err(|e| ConnectionError::InvalidPage {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        let items = raw
            .values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| ConnectionError::InvalidPage {
                endpoint: endpoint.to_string(),
                message: format!("Invalid record: {}", e),
            })?;

        Ok(Self {
            items,
            is_last_page: raw.is_last_page,
            // A last page never carries a usable cursor.
            next_page_start: if raw.is_last_page {
                None
            } else {
                raw.next_page_start
            },
        })
    }
}

impl<T> Page<T> {
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn has_next(&self) -> bool {
        !self.is_last_page
    }

    /// Offset of the following page.
    ///
    /// Fails with [`ConnectionError::MissingCursor`] when the page claims more
    /// results without saying where they start.
    pub fn next(&self) -> Result<Option<u64>, ConnectionError> {
        match (self.has_next(), self.next_page_start) {
            (false, _) => Ok(None),
            (true, Some(start)) => Ok(Some(start)),
            (true, None) => Err(ConnectionError::MissingCursor),
        }
    }
}

/// Lazy, single-consumer walk over the pages of one collection.
pub struct Paginator<'c, T> {
    connection: &'c Connection,
    path: String,
    query: Vec<(&'static str, String)>,
    offset: u64,
    limit: u32,
    exhausted: bool,
    _item: PhantomData<fn() -> T>,
}

impl<'c, T: DeserializeOwned> Paginator<'c, T> {
    pub fn new(connection: &'c Connection, path: impl Into<String>) -> Self {
        Self::with_offset(connection, path, 0, PAGE_LENGTH)
    }

    /// Start at `page_offset`, e.g. a cursor persisted by an earlier run.
    pub fn with_offset(
        connection: &'c Connection,
        path: impl Into<String>,
        page_offset: u64,
        limit: u32,
    ) -> Self {
        Self {
            connection,
            path: path.into(),
            query: Vec::new(),
            offset: page_offset,
            limit,
            exhausted: false,
            _item: PhantomData,
        }
    }

    /// Add a fixed query parameter sent with every page request.
    pub fn with_query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    /// Offset the next request will start from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether another request may still yield items.
    pub fn has_next_page(&self) -> bool {
        !self.exhausted
    }

    /// Fetch the next page.
    ///
    /// Returns `Ok(None)` once the last page has been returned, and keeps
    /// returning it on every later call.
    pub async fn items(&mut self) -> Result<Option<Vec<T>>, ConnectionError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut query = self.query.clone();
        query.push(("start", self.offset.to_string()));
        query.push(("limit", self.limit.to_string()));

        let body = self.connection.get(&self.path, &query).await?;
        let page = Page::<T>::from_response(body, &self.path)?;

        match page.next()? {
            Some(next_start) => self.offset = next_start,
            None => self.exhausted = true,
        }

        log::debug!(
            "Fetched {} item(s) from {}, next offset {:?}",
            page.items().len(),
            self.path,
            (!self.exhausted).then_some(self.offset)
        );

        Ok(Some(page.into_items()))
    }
}

/// Item-at-a-time view over a paginator, tracking page numbers.
pub struct Collection<'c, T> {
    paginator: Paginator<'c, T>,
    buffer: VecDeque<T>,
    pages_fetched: u32,
}

impl<'c, T: DeserializeOwned> Collection<'c, T> {
    pub fn new(paginator: Paginator<'c, T>) -> Self {
        Self {
            paginator,
            buffer: VecDeque::new(),
            pages_fetched: 0,
        }
    }

    /// Number of the page the last yielded item came from, starting at 1.
    pub fn current_page(&self) -> u32 {
        self.pages_fetched.max(1)
    }

    /// Absent on the first page.
    pub fn prev_page(&self) -> Option<u32> {
        let current = self.current_page();
        (current > 1).then(|| current - 1)
    }

    /// Present while another page is known to be reachable.
    pub fn next_page(&self) -> Option<u32> {
        (self.pages_fetched > 0 && self.paginator.has_next_page()).then(|| self.current_page() + 1)
    }

    /// Offset the underlying paginator will request next.
    pub fn offset(&self) -> u64 {
        self.paginator.offset()
    }

    /// Next item, fetching pages on demand. `Ok(None)` at the end.
    pub async fn next(&mut self) -> Result<Option<T>, ConnectionError> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }

            match self.paginator.items().await? {
                Some(items) => {
                    self.pages_fetched += 1;
                    self.buffer.extend(items);
                }
                None => return Ok(None),
            }
        }
    }

    /// Drain the whole collection into memory.
    pub async fn collect_all(mut self) -> Result<Vec<T>, ConnectionError> {
        let mut all = Vec::new();
        while let Some(item) = self.next().await? {
            all.push(item);
        }
        Ok(all)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, ConnectionError>> + 'c
    where
        T: 'c,
    {
        stream::try_unfold(self, |mut collection| async move {
            let item = collection.next().await?;
            Ok::<_, ConnectionError>(item.map(|item| (item, collection)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: i64,
    }

    #[test]
    fn test_page_from_response() {
        let page = Page::<Item>::from_response(
            json!({"values": [{"id": 1}, {"id": 2}], "isLastPage": false, "nextPageStart": 2}),
            "/things",
        )
        .unwrap();

        assert_eq!(page.items(), &[Item { id: 1 }, Item { id: 2 }]);
        assert!(page.has_next());
        assert_eq!(page.next().unwrap(), Some(2));
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let page = Page::<Item>::from_response(
            json!({"values": [], "isLastPage": true, "nextPageStart": 99}),
            "/things",
        )
        .unwrap();

        assert!(!page.has_next());
        assert_eq!(page.next().unwrap(), None);
    }

    #[test]
    fn test_missing_cursor_is_an_integrity_error() {
        let page =
            Page::<Item>::from_response(json!({"values": [{"id": 1}], "isLastPage": false}), "/things")
                .unwrap();

        assert!(page.has_next());
        assert!(matches!(page.next(), Err(ConnectionError::MissingCursor)));
    }

    #[test]
    fn test_missing_last_page_flag_means_more_results() {
        let page = Page::<Item>::from_response(json!({"values": [], "nextPageStart": 25}), "/things")
            .unwrap();
        assert_eq!(page.next().unwrap(), Some(25));
    }

    #[test]
    fn test_invalid_record_is_rejected() {
        let err = Page::<Item>::from_response(
            json!({"values": [{"id": "nope"}], "isLastPage": true}),
            "/things",
        )
        .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidPage { .. }));
    }
}
