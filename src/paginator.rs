use std::collections::HashSet;
use std::hash::Hash;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::retry::{Attempt, RetryPolicy};

/// Consecutive malformed pages tolerated before a pass gives up early.
const MAX_SKIPPED_PAGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page number.
    pub index: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Explicit continuation signal, when the source provides one.
    pub more: Option<bool>,
}

/// Anything that can serve one page of records per request.
pub trait PageSource {
    type Item;

    fn fetch_page(&self, req: &PageRequest) -> Attempt<Page<Self::Item>>;
}

#[derive(Debug, Clone)]
pub struct Paginator {
    retry: RetryPolicy,
    page_size: usize,
    total_hint: Option<usize>,
    max_pages: usize,
    progress: bool,
}

impl Paginator {
    pub fn new(page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            retry,
            page_size: page_size.max(1),
            total_hint: None,
            max_pages: usize::MAX,
            progress: false,
        }
    }

    pub fn with_total_hint(mut self, total: Option<usize>) -> Self {
        self.total_hint = total;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetches every page and returns records deduplicated by `key`.
    ///
    /// The first occurrence of a key wins; records without a key are always kept.
    /// Malformed pages are skipped. Any other failure, including retry
    /// exhaustion, ends the pass with that error.
    pub fn run<S, K, Q>(&self, source: &S, key: K) -> Result<Vec<S::Item>, FetchError>
    where
        S: PageSource,
        K: Fn(&S::Item) -> Option<Q>,
        Q: Hash + Eq,
    {
        let pb = self.progress_bar();
        let mut out: Vec<S::Item> = Vec::new();
        let mut seen: HashSet<Q> = HashSet::new();
        let mut duplicates = 0usize;
        let mut skipped_in_row = 0usize;
        let mut offset = 0usize;
        let mut index = 0usize;

        loop {
            if index >= self.max_pages {
                warn!(pages = index, "page cap reached, stopping");
                break;
            }
            if self.total_hint.is_some_and(|total| offset >= total) {
                break;
            }

            let req = PageRequest {
                index,
                offset,
                limit: self.page_size,
            };
            let page = match self.retry.run(|| source.fetch_page(&req)) {
                Ok(page) => {
                    skipped_in_row = 0;
                    page
                }
                Err(e) if e.is_parse() => {
                    warn!(page = index, offset, error = %e, "skipping malformed page");
                    skipped_in_row += 1;
                    if skipped_in_row >= MAX_SKIPPED_PAGES {
                        warn!(
                            skipped = skipped_in_row,
                            "too many malformed pages in a row, stopping"
                        );
                        break;
                    }
                    offset += self.page_size;
                    index += 1;
                    continue;
                }
                Err(e) => {
                    if let Some(pb) = &pb {
                        pb.abandon();
                    }
                    return Err(e);
                }
            };

            let received = page.items.len();
            let mut fresh = 0usize;
            for item in page.items {
                let keep = match key(&item) {
                    Some(k) => seen.insert(k),
                    None => true,
                };
                if keep {
                    out.push(item);
                    fresh += 1;
                } else {
                    duplicates += 1;
                }
            }
            debug!(page = index, offset, received, fresh, more = ?page.more, "page");

            offset += received;
            index += 1;
            if let Some(pb) = &pb {
                pb.set_position(out.len() as u64);
                pb.set_message(format!("page {}", index));
            }

            if received == 0 {
                break;
            }
            match page.more {
                Some(true) => {}
                Some(false) => break,
                None if received < self.page_size => break,
                None => {}
            }
        }

        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        info!(records = out.len(), duplicates, pages = index, "pagination finished");
        Ok(out)
    }

    fn progress_bar(&self) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }
        let pb = match self.total_hint {
            Some(total) => {
                let pb = ProgressBar::new(total as u64);
                pb.set_style(
                    ProgressStyle::with_template("{spinner:.green} {pos}/{len} records {msg} {wide_bar}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::with_template("{spinner:.green} {pos} records {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb
            }
        };
        Some(pb)
    }
}
