use anyhow::{anyhow, Result};

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::{PdfRenderFactory, PdfiumRenderFactory, PDFIUM_LIBRARY_ENV};

/// Runs synchronous engine work on Tokio's blocking pool. A panic inside
/// `work` comes back as an error.
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| anyhow!("engine task failed: {err}"))?
}
