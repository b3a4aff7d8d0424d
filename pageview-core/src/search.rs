use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::{DocumentBackend, PageNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    #[default]
    Idle,
    Scanning,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDirection {
    Next,
    Prev,
}

/// One occurrence of the query. `offset` is a byte offset into the page's
/// extracted text and `text` is the matched slice in its original case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub page: PageNumber,
    pub text: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("no matches to navigate")]
    NoMatches,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanFailure {
    #[error("search failed: text extraction failed on all {failed} pages")]
    NoUsablePages { failed: usize },
    #[error("search stopped unexpectedly: {reason}")]
    Interrupted { reason: String },
}

/// Issued by [`SearchController::submit_query`]; the caller runs the scan
/// and hands the [`ScanOutcome`] back through [`SearchController::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub generation: u64,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub generation: u64,
    pub result: Result<Vec<SearchMatch>, ScanFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchController {
    query: String,
    matches: Vec<SearchMatch>,
    active: Option<usize>,
    status: SearchStatus,
    generation: u64,
}

impl SearchController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self) -> &[SearchMatch] {
        &self.matches
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_match(&self) -> Option<&SearchMatch> {
        self.active.and_then(|index| self.matches.get(index))
    }

    pub fn status(&self) -> SearchStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new search, replacing whatever the previous one produced.
    ///
    /// Returns `None` for a blank query, which leaves the controller idle.
    pub fn submit_query(&mut self, query: &str) -> Option<ScanRequest> {
        self.generation += 1;
        self.matches.clear();
        self.active = None;

        if query.trim().is_empty() {
            self.query.clear();
            self.status = SearchStatus::Idle;
            return None;
        }

        self.query = query.to_string();
        self.status = SearchStatus::Scanning;
        Some(ScanRequest {
            generation: self.generation,
            query: self.query.clone(),
        })
    }

    /// Drops the current search and invalidates any scan still running.
    pub fn reset(&mut self) {
        self.submit_query("");
    }

    /// Applies a finished scan. Outcomes from superseded queries are
    /// discarded; the return value tells whether this one was applied.
    pub fn complete(&mut self, outcome: ScanOutcome) -> bool {
        if outcome.generation != self.generation || self.status != SearchStatus::Scanning {
            debug!(
                stale = outcome.generation,
                current = self.generation,
                "discarding stale search results"
            );
            return false;
        }

        match outcome.result {
            Ok(matches) => {
                self.active = if matches.is_empty() { None } else { Some(0) };
                self.matches = matches;
                self.status = SearchStatus::Completed;
            }
            Err(err) => {
                warn!(%err, query = %self.query, "search failed");
                self.matches.clear();
                self.active = None;
                self.status = SearchStatus::Failed;
            }
        }
        true
    }

    pub fn navigate(&mut self, direction: MatchDirection) -> Result<SearchMatch, SearchError> {
        let len = self.matches.len();
        if len == 0 {
            return Err(SearchError::NoMatches);
        }
        let next = match (self.active, direction) {
            (None, MatchDirection::Next) => 0,
            (None, MatchDirection::Prev) => len - 1,
            (Some(index), MatchDirection::Next) => (index + 1) % len,
            (Some(index), MatchDirection::Prev) => (index + len - 1) % len,
        };
        self.active = Some(next);
        Ok(self.matches[next].clone())
    }
}

/// Case-insensitive, non-overlapping occurrences of `query` in `text`, in
/// order of appearance.
pub fn find_matches(page: PageNumber, text: &str, query: &str) -> Vec<SearchMatch> {
    let needle: Vec<char> = query.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return Vec::new();
    }

    // Each source char may lower-case to several chars; every folded char
    // remembers the byte offset of the char it came from.
    let mut folded: Vec<(usize, char, bool)> = Vec::with_capacity(text.len());
    for (offset, ch) in text.char_indices() {
        for (n, lower) in ch.to_lowercase().enumerate() {
            folded.push((offset, lower, n == 0));
        }
    }

    let mut matches = Vec::new();
    let mut start = 0;
    while start + needle.len() <= folded.len() {
        let end = start + needle.len();
        let on_boundary = folded[start].2 && folded.get(end).map_or(true, |entry| entry.2);
        let hit = on_boundary
            && folded[start..end]
                .iter()
                .zip(&needle)
                .all(|(entry, ch)| entry.1 == *ch);
        if hit {
            let from = folded[start].0;
            let to = folded.get(end).map_or(text.len(), |entry| entry.0);
            matches.push(SearchMatch {
                page,
                text: text[from..to].to_string(),
                offset: from,
            });
            start = end;
        } else {
            start += 1;
        }
    }
    matches
}

/// Extracts and scans pages `1..=total_pages`, up to `max_concurrent` at a
/// time. Pages whose text cannot be extracted are skipped; the scan only
/// fails when no page could be read at all.
#[instrument(skip(backend, request), fields(generation = request.generation, query = %request.query))]
pub async fn scan_document(
    backend: Arc<dyn DocumentBackend>,
    total_pages: usize,
    request: ScanRequest,
    max_concurrent: usize,
) -> ScanOutcome {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let query: Arc<str> = Arc::from(request.query.as_str());
    let mut tasks = JoinSet::new();

    for index in 0..total_pages {
        let page = PageNumber::from_index(index);
        let backend = Arc::clone(&backend);
        let semaphore = Arc::clone(&semaphore);
        let query = Arc::clone(&query);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let text = backend.page_text(page).await;
            (page, text.map(|text| find_matches(page, &text, &query)))
        });
    }

    let mut pages = Vec::with_capacity(total_pages);
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((page, Ok(found))) => pages.push((page, found)),
            Ok((page, Err(err))) => {
                warn!(%page, %err, "skipping page during search");
                failed += 1;
            }
            Err(err) => {
                warn!(?err, "page scan task did not finish");
                failed += 1;
            }
        }
    }

    if total_pages > 0 && pages.is_empty() {
        return ScanOutcome {
            generation: request.generation,
            result: Err(ScanFailure::NoUsablePages { failed }),
        };
    }

    pages.sort_by_key(|(page, _)| *page);
    let matches: Vec<SearchMatch> = pages.into_iter().flat_map(|(_, found)| found).collect();
    debug!(matches = matches.len(), skipped = failed, "search scan finished");
    ScanOutcome {
        generation: request.generation,
        result: Ok(matches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::{
        DocumentInfo, DocumentMetadata, ExtractionError, RenderImage, RenderRequest,
    };

    fn page(number: usize) -> PageNumber {
        PageNumber::new(number).unwrap()
    }

    struct TextBackend {
        info: DocumentInfo,
        pages: Vec<Option<&'static str>>,
        delays: HashMap<usize, u64>,
    }

    impl TextBackend {
        fn new(pages: Vec<Option<&'static str>>) -> Self {
            Self {
                info: DocumentInfo {
                    id: uuid::Uuid::nil(),
                    path: PathBuf::from("text.pdf"),
                    page_count: pages.len(),
                    metadata: DocumentMetadata::default(),
                },
                pages,
                delays: HashMap::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentBackend for TextBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(&self, _request: RenderRequest) -> anyhow::Result<RenderImage> {
            anyhow::bail!("not rendered in tests")
        }

        async fn page_text(&self, page: PageNumber) -> Result<String, ExtractionError> {
            if let Some(ms) = self.delays.get(&page.get()) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            match self.pages.get(page.index()).copied().flatten() {
                Some(text) => Ok(text.to_string()),
                None => Err(ExtractionError::new(page, "unreadable")),
            }
        }
    }

    fn scan_request(query: &str) -> ScanRequest {
        ScanRequest {
            generation: 1,
            query: query.to_string(),
        }
    }

    #[test]
    fn find_matches_is_case_insensitive_and_non_overlapping() {
        let found = find_matches(page(2), "Cat scattered the CATalogue", "cat");
        let offsets: Vec<usize> = found.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 5, 18]);
        assert_eq!(found[2].text, "CAT");
        assert!(found.iter().all(|m| m.page == page(2)));

        let found = find_matches(page(1), "aaaa", "aa");
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].offset, 2);
    }

    #[test]
    fn find_matches_reports_byte_offsets_for_multibyte_text() {
        let text = "Ärger über ÄRGER";
        let found = find_matches(page(1), text, "ärger");
        assert_eq!(found.len(), 2);
        assert_eq!(&text[found[1].offset..], "ÄRGER");
        assert_eq!(found[1].text, "ÄRGER");
    }

    #[test]
    fn find_matches_ignores_empty_query() {
        assert!(find_matches(page(1), "anything", "").is_empty());
    }

    #[test]
    fn blank_query_returns_to_idle() {
        let mut search = SearchController::new();
        assert!(search.submit_query("cat").is_some());
        assert_eq!(search.status(), SearchStatus::Scanning);

        assert!(search.submit_query("   ").is_none());
        assert_eq!(search.status(), SearchStatus::Idle);
        assert!(search.matches().is_empty());
        assert_eq!(search.query(), "");
    }

    #[test]
    fn stale_outcome_never_overwrites_newer_query() {
        let mut search = SearchController::new();
        let first = search.submit_query("a").unwrap();
        let second = search.submit_query("b").unwrap();

        let applied = search.complete(ScanOutcome {
            generation: second.generation,
            result: Ok(vec![SearchMatch {
                page: page(2),
                text: "b".into(),
                offset: 0,
            }]),
        });
        assert!(applied);

        let applied = search.complete(ScanOutcome {
            generation: first.generation,
            result: Ok(vec![SearchMatch {
                page: page(1),
                text: "a".into(),
                offset: 0,
            }]),
        });
        assert!(!applied);
        assert_eq!(search.matches().len(), 1);
        assert_eq!(search.matches()[0].text, "b");
        assert_eq!(search.active_index(), Some(0));
    }

    #[test]
    fn failed_outcome_empties_matches() {
        let mut search = SearchController::new();
        let request = search.submit_query("x").unwrap();
        search.complete(ScanOutcome {
            generation: request.generation,
            result: Err(ScanFailure::NoUsablePages { failed: 3 }),
        });
        assert_eq!(search.status(), SearchStatus::Failed);
        assert!(search.matches().is_empty());
        assert_eq!(search.active_index(), None);
    }

    #[test]
    fn navigate_wraps_in_both_directions() {
        let mut search = SearchController::new();
        assert_eq!(
            search.navigate(MatchDirection::Next),
            Err(SearchError::NoMatches)
        );

        let request = search.submit_query("x").unwrap();
        let matches = (1..=3)
            .map(|n| SearchMatch {
                page: page(n),
                text: "x".into(),
                offset: 0,
            })
            .collect();
        search.complete(ScanOutcome {
            generation: request.generation,
            result: Ok(matches),
        });

        assert_eq!(search.active_index(), Some(0));
        assert_eq!(search.navigate(MatchDirection::Prev).unwrap().page, page(3));
        assert_eq!(search.active_index(), Some(2));
        assert_eq!(search.navigate(MatchDirection::Next).unwrap().page, page(1));
        assert_eq!(search.active_index(), Some(0));
        search.navigate(MatchDirection::Next).unwrap();
        search.navigate(MatchDirection::Next).unwrap();
        assert_eq!(search.active_index(), Some(2));
        search.navigate(MatchDirection::Next).unwrap();
        assert_eq!(search.active_index(), Some(0));
    }

    #[tokio::test]
    async fn scan_orders_matches_by_page_regardless_of_completion() {
        let mut backend = TextBackend::new(vec![Some("the cat"), Some("dog"), Some("cat nap")]);
        backend.delays.insert(1, 30);
        let backend: Arc<dyn DocumentBackend> = Arc::new(backend);

        let request = ScanRequest {
            generation: 7,
            query: "cat".into(),
        };
        let outcome = scan_document(Arc::clone(&backend), 3, request, 3).await;
        assert_eq!(outcome.generation, 7);

        let matches = outcome.result.unwrap();
        let pages: Vec<usize> = matches.iter().map(|m| m.page.get()).collect();
        assert_eq!(pages, vec![1, 3]);
        assert_eq!(matches[0].offset, 4);
    }

    #[tokio::test]
    async fn scan_skips_unreadable_pages() {
        let backend = TextBackend::new(vec![None, Some("needle"), None]);
        let request = scan_request("needle");
        let outcome = scan_document(Arc::new(backend), 3, request, 2).await;
        let matches = outcome.result.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].page, page(2));
    }

    #[tokio::test]
    async fn scan_fails_when_no_page_is_readable() {
        let backend = TextBackend::new(vec![None, None]);
        let request = scan_request("needle");
        let outcome = scan_document(Arc::new(backend), 2, request, 1).await;
        assert_eq!(
            outcome.result.unwrap_err(),
            ScanFailure::NoUsablePages { failed: 2 }
        );
    }
}
