use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod config;
pub mod navigation;
pub mod search;
pub mod session;
pub mod zoom;

pub use config::ViewerConfig;
pub use navigation::{NavError, NavigationController, PageDirection, PageInput};
pub use search::{
    find_matches, scan_document, MatchDirection, ScanFailure, ScanOutcome, ScanRequest,
    SearchController, SearchError, SearchMatch, SearchStatus,
};
pub use session::{
    Action, ActionError, Outcome, SessionEvent, SidebarState, SidebarTab, ViewSnapshot,
    ViewerSession, ZoomDirection,
};
pub use zoom::{ZoomError, ZoomLevel, ZoomState};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0c4a9e-52d1-5b7e-9a64-1d2e8c7b6f10").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

/// 1-based page number.
///
/// The engine works with 0-based indices; use [`PageNumber::index`] and
/// [`PageNumber::from_index`] at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageNumber(NonZeroUsize);

impl PageNumber {
    pub const FIRST: PageNumber = PageNumber(NonZeroUsize::MIN);

    pub fn new(number: usize) -> Option<Self> {
        NonZeroUsize::new(number).map(Self)
    }

    pub fn from_index(index: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(index))
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    pub fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl Default for PageNumber {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

impl DocumentInfo {
    /// Title from the document metadata, falling back to the file name.
    pub fn display_title(&self) -> String {
        self.metadata
            .title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .map(str::to_owned)
            .or_else(|| {
                self.path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub page: PageNumber,
    pub zoom: ZoomLevel,
}

impl RenderRequest {
    pub fn scale(&self) -> f32 {
        self.zoom.scale()
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineItem {
    pub title: String,
    pub page: PageNumber,
    pub depth: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
    #[error("{} contains no pages", path.display())]
    Empty { path: PathBuf },
}

impl LoadError {
    pub fn open(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to extract text from page {page}: {reason}")]
pub struct ExtractionError {
    pub page: PageNumber,
    pub reason: String,
}

impl ExtractionError {
    pub fn new(page: PageNumber, reason: impl fmt::Display) -> Self {
        Self {
            page,
            reason: reason.to_string(),
        }
    }
}

/// A loaded document as exposed by the rendering engine.
///
/// Implementations memoize whatever they need; the viewer never caches
/// rendered pages or extracted text itself.
#[async_trait::async_trait]
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    async fn page_text(&self, page: PageNumber) -> Result<String, ExtractionError>;

    fn outline(&self) -> Result<Vec<OutlineItem>> {
        Ok(Vec::new())
    }
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>, LoadError>;
}
