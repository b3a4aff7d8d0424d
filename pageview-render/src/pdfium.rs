use std::env;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pageview_core::{
    document_id_for_path, DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider,
    ExtractionError, LoadError, OutlineItem, PageNumber, RenderImage, RenderRequest, ZoomLevel,
};
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

use crate::run_blocking;

/// Environment variable naming an explicit Pdfium shared library.
pub const PDFIUM_LIBRARY_ENV: &str = "PAGEVIEW_PDFIUM_LIBRARY_PATH";

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>, LoadError> {
        let pdfium = Arc::clone(&self.pdfium);
        let requested = path.to_path_buf();
        let document = run_blocking(move || {
            let absolute = requested
                .canonicalize()
                .with_context(|| format!("failed to resolve path for {:?}", requested))?;
            let info = build_document_info(&pdfium, &absolute)?;
            Ok(PdfiumDocument::new(pdfium, absolute, info))
        })
        .await
        .map_err(|err| LoadError::open(path, format!("{err:#}")))?;
        debug!(pages = document.inner.info.page_count, "opened document");
        Ok(Arc::new(document))
    }
}

struct PdfiumDocument {
    inner: Arc<DocumentInner>,
}

type DocumentSlot = Mutex<Option<PdfDocument<'static>>>;

struct DocumentInner {
    cache: Mutex<Option<RenderCacheEntry>>,
    outline_cache: Mutex<Option<Vec<OutlineItem>>>,
    render_document: DocumentSlot,
    /// Search extraction goes through its own handle so page renders never
    /// queue behind a scan.
    text_document: DocumentSlot,
    info: DocumentInfo,
    path: PathBuf,
    pdfium: Arc<Pdfium>,
}

struct RenderCacheEntry {
    page: PageNumber,
    zoom: ZoomLevel,
    image: RenderImage,
}

impl RenderCacheEntry {
    fn matches(&self, request: &RenderRequest) -> bool {
        self.page == request.page && self.zoom == request.zoom
    }
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                cache: Mutex::new(None),
                outline_cache: Mutex::new(None),
                render_document: Mutex::new(None),
                text_document: Mutex::new(None),
                info,
                path,
                pdfium,
            }),
        }
    }
}

impl DocumentInner {
    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It
        // is stored in one of the document slots, which are declared before
        // `pdfium` and therefore dropped first, so the borrow never outlives
        // the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, slot: &DocumentSlot, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(self.open_document()?);
        }
        match guard.as_ref() {
            Some(document) => f(document),
            None => Err(anyhow!("document {:?} is not loaded", self.path)),
        }
    }

    fn render_internal(
        &self,
        document: &PdfDocument<'_>,
        request: &RenderRequest,
    ) -> Result<RenderImage> {
        let page = load_page(document, request.page)?;

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale());
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page))?;
        let image = bitmap.as_image().to_rgba8();

        Ok(RenderImage {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }

    fn extract_text(&self, page: PageNumber) -> Result<String> {
        self.with_document(&self.text_document, |document| {
            let pdf_page = load_page(document, page)?;
            let text = pdf_page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page))?;
            Ok(text.all())
        })
    }
}

#[async_trait]
impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.inner.info
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        let inner = &self.inner;
        {
            let cache = inner.cache.lock();
            if let Some(entry) = cache.as_ref().filter(|entry| entry.matches(&request)) {
                return Ok(entry.image.clone());
            }
        }

        let image = inner.with_document(&inner.render_document, |document| {
            inner.render_internal(document, &request)
        })?;

        *inner.cache.lock() = Some(RenderCacheEntry {
            page: request.page,
            zoom: request.zoom,
            image: image.clone(),
        });

        Ok(image)
    }

    async fn page_text(&self, page: PageNumber) -> Result<String, ExtractionError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.extract_text(page))
            .await
            .map_err(|err| ExtractionError::new(page, format!("{err:#}")))
    }

    fn outline(&self) -> Result<Vec<OutlineItem>> {
        let inner = &self.inner;
        {
            let cache = inner.outline_cache.lock();
            if let Some(cached) = cache.as_ref() {
                return Ok(cached.clone());
            }
        }

        let outline = inner.with_document(&inner.render_document, |document| {
            let mut outline = Vec::new();
            if let Some(root) = document.bookmarks().root() {
                collect_outline(root, 0, &mut outline);
            }
            Ok(outline)
        })?;

        *inner.outline_cache.lock() = Some(outline.clone());

        Ok(outline)
    }
}

fn load_page<'a>(document: &PdfDocument<'a>, page: PageNumber) -> Result<PdfPage<'a>> {
    let index: PdfPageIndex = page
        .index()
        .try_into()
        .map_err(|_| anyhow!("page {} is out of supported range", page))?;
    document
        .pages()
        .get(index)
        .with_context(|| format!("page {} out of range", page))
}

fn collect_outline(mut bookmark: PdfBookmark<'_>, depth: usize, out: &mut Vec<OutlineItem>) {
    loop {
        if let Some(title) = bookmark.title() {
            if let Some(destination) = bookmark.destination() {
                if let Ok(page_index) = destination.page_index() {
                    out.push(OutlineItem {
                        title,
                        page: PageNumber::from_index(page_index as usize),
                        depth,
                    });
                }
            }
        }

        if let Some(child) = bookmark.first_child() {
            collect_outline(child, depth + 1, out);
        }

        match bookmark.next_sibling() {
            Some(next) => bookmark = next,
            None => break,
        }
    }
}

fn build_document_info(pdfium: &Pdfium, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|t| t.value().split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_default();

    Ok(DocumentInfo {
        id: document_id_for_path(path),
        path: path.to_path_buf(),
        page_count,
        metadata: DocumentMetadata {
            title,
            author,
            keywords,
        },
    })
}

pub type PdfRenderFactory = PdfiumRenderFactory;

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match env::var(PDFIUM_LIBRARY_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}={}: {}", PDFIUM_LIBRARY_ENV, path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
