//! The viewer session: one owned view state, mutated only through
//! [`ViewerSession::dispatch`] and the completions of the async work it
//! starts.
//!
//! Document loads and search scans run as Tokio tasks. Each one is tagged
//! with the generation it was started under and reports back over a channel;
//! [`ViewerSession::pump`] and [`ViewerSession::settle`] apply those reports
//! only when the generation is still current.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::config::ViewerConfig;
use crate::navigation::{NavError, NavigationController, PageDirection};
use crate::search::{
    scan_document, MatchDirection, ScanFailure, ScanOutcome, SearchController, SearchError,
    SearchStatus,
};
use crate::zoom::{ZoomError, ZoomLevel, ZoomState};
use crate::{
    DocumentBackend, DocumentId, DocumentInfo, DocumentProvider, LoadError, OutlineItem,
    PageNumber, RenderImage, RenderRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidebarTab {
    #[default]
    Contents,
    Thumbnails,
}

impl SidebarTab {
    pub fn toggled(self) -> Self {
        match self {
            SidebarTab::Contents => SidebarTab::Thumbnails,
            SidebarTab::Thumbnails => SidebarTab::Contents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidebarState {
    pub open: bool,
    pub tab: SidebarTab,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenDocument { path: PathBuf },
    ChangePage { target: i64 },
    StepPage { direction: PageDirection },
    EditPageDraft { text: String },
    CommitPageDraft,
    SetZoom { value: i64 },
    StepZoom { direction: ZoomDirection },
    SetSearchQuery { text: String },
    NavigateSearch { direction: MatchDirection },
    ToggleSidebar,
    SelectSidebarTab { tab: SidebarTab },
}

impl Action {
    fn needs_document(&self) -> bool {
        !matches!(
            self,
            Action::OpenDocument { .. }
                | Action::SetZoom { .. }
                | Action::StepZoom { .. }
                | Action::ToggleSidebar
                | Action::SelectSidebarTab { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Nav(#[from] NavError),
    #[error(transparent)]
    Zoom(#[from] ZoomError),
    #[error(transparent)]
    Search(#[from] SearchError),
}

/// What [`ViewerSession::dispatch`] did with an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// No document is loaded, so the action has nothing to act on.
    Ignored,
    /// The action was refused and the previous state kept.
    Rejected(ActionError),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentLoaded(DocumentId),
    DocumentLoadFailed { message: String },
    RedrawNeeded { page: PageNumber, zoom: ZoomLevel },
    SearchUpdated { status: SearchStatus },
}

/// Read-only view of the session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub document_title: Option<String>,
    pub page: PageNumber,
    pub total_pages: usize,
    pub zoom: ZoomLevel,
    pub search_status: SearchStatus,
    pub query: String,
    pub match_count: usize,
    /// 1-based position of the active match.
    pub active_match_ordinal: Option<usize>,
    pub page_input_draft: String,
    pub can_go_back: bool,
    pub can_go_forward: bool,
    pub loading: bool,
    pub error_message: Option<String>,
    pub sidebar_open: bool,
    pub sidebar_tab: SidebarTab,
    pub outline: Vec<OutlineItem>,
}

struct DocumentHandle {
    generation: u64,
    backend: Arc<dyn DocumentBackend>,
}

impl DocumentHandle {
    fn info(&self) -> &DocumentInfo {
        self.backend.info()
    }
}

enum Completion {
    Loaded {
        generation: u64,
        path: PathBuf,
        result: Result<Arc<dyn DocumentBackend>, LoadError>,
    },
    ScanFinished {
        document_generation: u64,
        outcome: ScanOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskTag {
    Load(u64),
    Scan { document: u64, query: u64 },
}

pub struct ViewerSession {
    provider: Arc<dyn DocumentProvider>,
    config: ViewerConfig,
    runtime: Handle,
    document: Option<DocumentHandle>,
    outline: Vec<OutlineItem>,
    navigation: NavigationController,
    zoom: ZoomState,
    search: SearchController,
    sidebar: SidebarState,
    loading: bool,
    error: Option<String>,
    document_generation: u64,
    load_task: Option<JoinHandle<()>>,
    scan_task: Option<JoinHandle<()>>,
    in_flight: HashSet<TaskTag>,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl ViewerSession {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; loads and scans are
    /// spawned onto it.
    pub fn new(provider: Arc<dyn DocumentProvider>, config: ViewerConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let sidebar = SidebarState {
            open: config.sidebar.open,
            tab: config.sidebar.tab,
        };
        Self {
            provider,
            zoom: ZoomState::new(config.initial_zoom()),
            config,
            runtime: Handle::current(),
            document: None,
            outline: Vec::new(),
            navigation: NavigationController::default(),
            search: SearchController::new(),
            sidebar,
            loading: false,
            error: None,
            document_generation: 0,
            load_task: None,
            scan_task: None,
            in_flight: HashSet::new(),
            completions_tx,
            completions_rx,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn document_info(&self) -> Option<&DocumentInfo> {
        self.document.as_ref().map(DocumentHandle::info)
    }

    pub fn navigation(&self) -> &NavigationController {
        &self.navigation
    }

    pub fn search(&self) -> &SearchController {
        &self.search
    }

    pub fn zoom(&self) -> ZoomLevel {
        self.zoom.level()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.in_flight.is_empty()
    }

    #[instrument(skip(self), level = "debug")]
    pub fn dispatch(&mut self, action: Action) -> Outcome {
        if action.needs_document() && self.document.is_none() {
            debug!("no document loaded, ignoring action");
            return Outcome::Ignored;
        }
        match self.apply(action) {
            Ok(()) => Outcome::Applied,
            Err(err) => {
                debug!(%err, "action rejected");
                Outcome::Rejected(err)
            }
        }
    }

    fn apply(&mut self, action: Action) -> Result<(), ActionError> {
        match action {
            Action::OpenDocument { path } => self.open(path),
            Action::ChangePage { target } => {
                let before = self.navigation.current_page();
                self.navigation.go_to_page(target)?;
                self.page_changed(before);
            }
            Action::StepPage { direction } => {
                let before = self.navigation.current_page();
                self.navigation.step(direction)?;
                self.page_changed(before);
            }
            Action::EditPageDraft { text } => self.navigation.on_draft_change(text),
            Action::CommitPageDraft => {
                let before = self.navigation.current_page();
                self.navigation.commit_draft()?;
                self.page_changed(before);
            }
            Action::SetZoom { value } => {
                let before = self.zoom.level();
                if self.zoom.set_exact(value)? != before {
                    self.request_redraw();
                }
            }
            Action::StepZoom { direction } => {
                let changed = match direction {
                    ZoomDirection::In => self.zoom.increment(),
                    ZoomDirection::Out => self.zoom.decrement(),
                };
                if changed {
                    self.request_redraw();
                }
            }
            Action::SetSearchQuery { text } => self.submit_search(&text),
            Action::NavigateSearch { direction } => {
                let found = self.search.navigate(direction)?;
                let before = self.navigation.current_page();
                self.navigation.go_to_page(found.page.get() as i64)?;
                self.page_changed(before);
                self.push_event(SessionEvent::SearchUpdated {
                    status: self.search.status(),
                });
            }
            Action::ToggleSidebar => self.sidebar.open = !self.sidebar.open,
            Action::SelectSidebarTab { tab } => {
                self.sidebar.tab = tab;
                self.sidebar.open = true;
            }
        }
        Ok(())
    }

    /// Starts loading `path`. The current document stays usable until the
    /// load settles; an earlier load still running is abandoned.
    fn open(&mut self, path: PathBuf) {
        self.document_generation += 1;
        let generation = self.document_generation;
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.in_flight.retain(|tag| !matches!(tag, TaskTag::Load(_)));
        self.in_flight.insert(TaskTag::Load(generation));
        self.loading = true;
        info!(path = %path.display(), generation, "loading document");

        let provider = Arc::clone(&self.provider);
        let tx = self.completions_tx.clone();
        self.load_task = Some(self.runtime.spawn(async move {
            let opening = path.clone();
            let result = match supervised(async move { provider.open(&opening).await }).await {
                Ok(result) => result,
                Err(err) => Err(LoadError::open(&path, format!("load task failed: {err}"))),
            };
            let _ = tx.send(Completion::Loaded {
                generation,
                path,
                result,
            });
        }));
    }

    fn submit_search(&mut self, text: &str) {
        self.cancel_scan();
        let Some(request) = self.search.submit_query(text) else {
            self.push_event(SessionEvent::SearchUpdated {
                status: self.search.status(),
            });
            return;
        };
        let Some(doc) = self.document.as_ref() else {
            return;
        };

        let backend = Arc::clone(&doc.backend);
        let document_generation = doc.generation;
        let total_pages = self.navigation.total_pages();
        let max_concurrent = self.config.max_concurrent_pages();
        let tx = self.completions_tx.clone();
        self.in_flight.insert(TaskTag::Scan {
            document: document_generation,
            query: request.generation,
        });
        debug!(query = %request.query, generation = request.generation, "starting search scan");
        self.scan_task = Some(self.runtime.spawn(async move {
            let generation = request.generation;
            let scan = scan_document(backend, total_pages, request, max_concurrent);
            let outcome = supervised(scan).await.unwrap_or_else(|err| ScanOutcome {
                generation,
                result: Err(ScanFailure::Interrupted {
                    reason: err.to_string(),
                }),
            });
            let _ = tx.send(Completion::ScanFinished {
                document_generation,
                outcome,
            });
        }));
        self.push_event(SessionEvent::SearchUpdated {
            status: SearchStatus::Scanning,
        });
    }

    fn cancel_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.in_flight
            .retain(|tag| !matches!(tag, TaskTag::Scan { .. }));
    }

    /// Applies every completion that has already arrived. Returns how many
    /// were processed, stale ones included.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.complete(completion);
            processed += 1;
        }
        processed
    }

    /// Waits until every load and scan still in flight has reported back.
    pub async fn settle(&mut self) {
        while !self.in_flight.is_empty() {
            match self.completions_rx.recv().await {
                Some(completion) => self.complete(completion),
                None => break,
            }
        }
        self.pump();
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded {
                generation,
                path,
                result,
            } => {
                self.in_flight.remove(&TaskTag::Load(generation));
                if generation != self.document_generation {
                    debug!(generation, current = self.document_generation, "discarding stale load");
                    return;
                }
                self.load_task = None;
                self.loading = false;
                let result = result.and_then(|backend| {
                    if backend.info().page_count == 0 {
                        Err(LoadError::Empty { path: path.clone() })
                    } else {
                        Ok(backend)
                    }
                });
                match result {
                    Ok(backend) => self.install(generation, backend),
                    Err(err) => self.fail_load(err),
                }
            }
            Completion::ScanFinished {
                document_generation,
                outcome,
            } => {
                self.in_flight.remove(&TaskTag::Scan {
                    document: document_generation,
                    query: outcome.generation,
                });
                let current = self.document.as_ref().map(|doc| doc.generation);
                if current != Some(document_generation) {
                    debug!(document_generation, "discarding search results for a replaced document");
                    return;
                }
                if self.search.complete(outcome) {
                    self.scan_task = None;
                    self.push_event(SessionEvent::SearchUpdated {
                        status: self.search.status(),
                    });
                }
            }
        }
    }

    fn install(&mut self, generation: u64, backend: Arc<dyn DocumentBackend>) {
        let info = backend.info().clone();
        self.outline = backend.outline().unwrap_or_else(|err| {
            warn!(?err, path = %info.path.display(), "failed to read document outline");
            Vec::new()
        });
        self.outline
            .retain(|item| item.page.get() <= info.page_count);
        self.cancel_scan();
        self.search.reset();
        self.navigation.reset(info.page_count);
        self.error = None;
        self.document = Some(DocumentHandle {
            generation,
            backend,
        });
        info!(path = %info.path.display(), pages = info.page_count, "document loaded");
        self.push_event(SessionEvent::DocumentLoaded(info.id));
        self.request_redraw();
    }

    fn fail_load(&mut self, err: LoadError) {
        warn!(%err, "document load failed");
        self.cancel_scan();
        self.search.reset();
        self.navigation.reset(0);
        self.outline.clear();
        self.document = None;
        let message = err.to_string();
        self.error = Some(message.clone());
        self.push_event(SessionEvent::DocumentLoadFailed { message });
    }

    fn page_changed(&mut self, before: PageNumber) {
        if self.navigation.current_page() != before {
            self.request_redraw();
        }
    }

    fn request_redraw(&self) {
        self.push_event(SessionEvent::RedrawNeeded {
            page: self.navigation.current_page(),
            zoom: self.zoom.level(),
        });
    }

    fn push_event(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            document_title: self.document_info().map(DocumentInfo::display_title),
            page: self.navigation.current_page(),
            total_pages: self.navigation.total_pages(),
            zoom: self.zoom.level(),
            search_status: self.search.status(),
            query: self.search.query().to_string(),
            match_count: self.search.matches().len(),
            active_match_ordinal: self.search.active_index().map(|index| index + 1),
            page_input_draft: self.navigation.draft().to_string(),
            can_go_back: self.document.is_some() && !self.navigation.at_start(),
            can_go_forward: self.document.is_some() && !self.navigation.at_end(),
            loading: self.loading,
            error_message: self.error.clone(),
            sidebar_open: self.sidebar.open,
            sidebar_tab: self.sidebar.tab,
            outline: self.outline.clone(),
        }
    }

    /// Renders the visible page at the current zoom.
    pub fn render_current(&self) -> Result<Option<RenderImage>> {
        let Some(doc) = self.document.as_ref() else {
            return Ok(None);
        };
        let request = RenderRequest {
            page: self.navigation.current_page(),
            zoom: self.zoom.level(),
        };
        doc.backend.render_page(request).map(Some)
    }
}

/// Runs `work` as a child task so a panic surfaces as a `JoinError` rather
/// than a completion that never arrives. Aborting the caller aborts the
/// child too.
async fn supervised<F>(work: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut child = AbortOnDrop(tokio::spawn(work));
    (&mut child.0).await
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}
