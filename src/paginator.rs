//! Cursor pagination with a per-resource item quota.
//!
//! Drives a paged remote listing through a [`PageSource`], enforcing an
//! optional cap on the number of items yielded. Continuation references are
//! opaque: the pager follows whatever URL the server supplies, touching only
//! the `$top` page-size parameter when the remaining quota is smaller than
//! the server's default page size (avoids over-fetching past the quota).
//!
//! The pager performs no internal retries. A non-success fetch surfaces the
//! error to the caller, which owns the partial result and the retry policy.

use anyhow::Result;
use async_trait::async_trait;

/// Continuation state of a paged listing. "No more pages" is a variant, not
/// a null URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Next(String),
    Done,
}

/// One page of a remote listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Cursor,
}

/// A paged remote resource. Implementations perform the actual fetch and
/// decode; the pager owns ordering, quota, and termination.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn fetch(&self, url: &str) -> Result<Page<Self::Item>>;
}

/// Pulls pages lazily until the listing is exhausted or the quota is spent.
pub struct QuotaPager<'a, S: PageSource> {
    source: &'a S,
    cursor: Cursor,
    remaining: Option<u64>,
    page_size: u64,
}

/// First-request page size: `min(page_size, quota)` when the quota is
/// bounded. Callers use this to build the initial listing URL.
pub fn initial_page_size(quota: Option<u64>, page_size: u64) -> u64 {
    match quota {
        Some(q) => page_size.min(q),
        None => page_size,
    }
}

impl<'a, S: PageSource> QuotaPager<'a, S> {
    pub fn new(source: &'a S, first_url: String, quota: Option<u64>, page_size: u64) -> Self {
        let cursor = if quota == Some(0) {
            Cursor::Done
        } else {
            Cursor::Next(first_url)
        };
        Self {
            source,
            cursor,
            remaining: quota,
            page_size,
        }
    }

    /// Pager over the full listing with no quota; `page_size` is irrelevant
    /// because no rewrite ever occurs.
    pub fn unbounded(source: &'a S, first_url: String) -> Self {
        Self::new(source, first_url, None, 0)
    }

    /// Fetch the next page of items, truncated to the remaining quota.
    /// Returns `Ok(None)` once the listing is exhausted or the quota spent;
    /// no request is issued past either point.
    pub async fn next_page(&mut self) -> Result<Option<Vec<S::Item>>> {
        let url = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Done => return Ok(None),
            Cursor::Next(url) => url,
        };

        let page = self.source.fetch(&url).await?;
        let mut items = page.items;

        match self.remaining {
            None => self.cursor = page.next,
            Some(remaining) => {
                if items.len() as u64 > remaining {
                    items.truncate(remaining as usize);
                }
                let remaining = remaining - items.len() as u64;
                self.remaining = Some(remaining);
                self.cursor = match page.next {
                    Cursor::Next(next) if remaining > 0 => {
                        if remaining < self.page_size {
                            Cursor::Next(rewrite_page_size(&next, remaining))
                        } else {
                            Cursor::Next(next)
                        }
                    }
                    _ => Cursor::Done,
                };
            }
        }

        Ok(Some(items))
    }
}

/// Rewrite the `$top` query parameter of a continuation URL to `top`,
/// appending it when absent. Everything else in the URL, including the
/// server's skip token, is passed through untouched.
fn rewrite_page_size(url: &str, top: u64) -> String {
    match url.split_once('?') {
        Some((base, query)) => {
            let mut params: Vec<String> = Vec::new();
            let mut replaced = false;
            for param in query.split('&') {
                if param.starts_with("$top=") || param.starts_with("%24top=") {
                    params.push(format!("$top={}", top));
                    replaced = true;
                } else {
                    params.push(param.to_string());
                }
            }
            if !replaced {
                params.push(format!("$top={}", top));
            }
            format!("{}?{}", base, params.join("&"))
        }
        None => format!("{}?$top={}", url, top),
    }
}
