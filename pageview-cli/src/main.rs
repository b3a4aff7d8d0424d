use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pageview_core::config::project_dirs;
use pageview_core::{
    Action, Outcome, PageNumber, RenderImage, SearchStatus, SessionEvent, SidebarTab,
    ViewSnapshot, ViewerConfig, ViewerSession, ZoomLevel,
};
use pageview_render::PdfRenderFactory;
use pageview_tty::{
    apply_draft_edit, write_status_line, DrawParams, EventMapper, InputMode, KittyRenderer,
    UiEvent,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pageview",
    version,
    about = "kitty-native document viewer with paging, zoom and search"
)]
struct Args {
    /// Page to open the document on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<i64>,

    /// Initial zoom in percent (25-200)
    #[arg(short = 'z', long = "zoom")]
    zoom: Option<i64>,

    /// Search query to run once the document is loaded
    #[arg(short = 's', long = "search")]
    search: Option<String>,

    /// Print the view state as JSON and exit instead of starting the viewer
    #[arg(long = "dump-state")]
    dump_state: bool,

    /// Configuration file to use instead of the platform default
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Path to the document to open
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match args.config.clone().or_else(ViewerConfig::default_path) {
        Some(path) => ViewerConfig::load(&path)?,
        None => ViewerConfig::default(),
    };
    let project_dirs =
        project_dirs().ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs, config.log.filter.as_deref(), args.dump_state)?;

    let provider = Arc::new(PdfRenderFactory::new()?);
    let mut session = ViewerSession::new(provider, config);
    session.dispatch(Action::OpenDocument {
        path: args.file.clone(),
    });
    session.settle().await;

    if !args.dump_state {
        if let Some(message) = session.snapshot().error_message {
            return Err(anyhow!("failed to open {:?}: {}", args.file, message));
        }
    }

    apply_startup_args(&mut session, &args);
    session.settle().await;

    if args.dump_state {
        let snapshot = session.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    run_viewer(&mut session)?;
    info!("viewer closed");
    Ok(())
}

fn apply_startup_args(session: &mut ViewerSession, args: &Args) {
    let mut actions = Vec::new();
    if let Some(value) = args.zoom {
        actions.push(Action::SetZoom { value });
    }
    if let Some(target) = args.page {
        actions.push(Action::ChangePage { target });
    }
    if let Some(text) = args.search.clone() {
        actions.push(Action::SetSearchQuery { text });
    }
    for action in actions {
        if let Outcome::Rejected(err) = session.dispatch(action) {
            warn!(%err, "ignoring command line option");
        }
    }
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn run_viewer(session: &mut ViewerSession) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut mapper = EventMapper::new();
    let mut sidebar = SidebarWindow::default();
    let mut sidebar_view: Option<(bool, SidebarTab)> = None;
    let mut notice: Option<String> = None;
    let mut dirty = true;
    let mut status_dirty = false;

    renderer.clear_all()?;

    loop {
        session.pump();
        for event in session.drain_events() {
            match event {
                SessionEvent::SearchUpdated { .. } => status_dirty = true,
                SessionEvent::DocumentLoaded(_) => {
                    sidebar_view = None;
                    dirty = true;
                }
                SessionEvent::DocumentLoadFailed { .. } | SessionEvent::RedrawNeeded { .. } => {
                    dirty = true
                }
            }
        }

        let snapshot = session.snapshot();
        let view = (snapshot.sidebar_open, snapshot.sidebar_tab);
        if sidebar_view != Some(view) {
            if snapshot.sidebar_open {
                sidebar.follow_page(&sidebar_entries(&snapshot), snapshot.page);
            }
            sidebar_view = Some(view);
            renderer.clear_all()?;
            dirty = true;
        }
        if snapshot.sidebar_open {
            if mapper.mode() == InputMode::Normal {
                mapper.set_mode(InputMode::Sidebar);
            }
        } else if mapper.mode() == InputMode::Sidebar {
            mapper.set_mode(InputMode::Normal);
        }

        if dirty {
            redraw(&mut renderer, session, &snapshot, &mut sidebar)?;
            status_dirty = true;
            dirty = false;
        }
        if status_dirty {
            let status = format_status(
                &snapshot,
                pending_input(&mapper, &snapshot).as_deref(),
                notice.as_deref(),
            );
            draw_status_line(&mut renderer, &status)?;
            status_dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ui_event = mapper.map_event(event::read()?);
            notice = None;
            match handle_event(ui_event, session, &snapshot, &mut sidebar, &mut notice) {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
            status_dirty = true;
        }
    }

    renderer.erase()?;
    renderer.clear_all()?;
    Ok(())
}

fn handle_event(
    event: UiEvent,
    session: &mut ViewerSession,
    snapshot: &ViewSnapshot,
    sidebar: &mut SidebarWindow,
    notice: &mut Option<String>,
) -> LoopAction {
    match event {
        UiEvent::Action(action) => {
            dispatch(session, action, notice);
            LoopAction::Continue
        }
        UiEvent::EditPageDraft(edit) => {
            let text = apply_draft_edit(&snapshot.page_input_draft, edit);
            dispatch(session, Action::EditPageDraft { text }, notice);
            LoopAction::Continue
        }
        UiEvent::LastPage => {
            let target = snapshot.total_pages as i64;
            dispatch(session, Action::ChangePage { target }, notice);
            LoopAction::Continue
        }
        UiEvent::SwitchSidebarTab => {
            let tab = snapshot.sidebar_tab.toggled();
            dispatch(session, Action::SelectSidebarTab { tab }, notice);
            LoopAction::Continue
        }
        UiEvent::SidebarMoveSelection { delta } => {
            let len = sidebar_entries(snapshot).len();
            if sidebar.move_selection(delta, len) {
                LoopAction::ContinueRedraw
            } else {
                LoopAction::Continue
            }
        }
        UiEvent::SidebarActivate => {
            let entries = sidebar_entries(snapshot);
            let Some(entry) = entries.get(sidebar.selected) else {
                return LoopAction::Continue;
            };
            let target = entry.page.get() as i64;
            dispatch(session, Action::ChangePage { target }, notice);
            dispatch(session, Action::ToggleSidebar, notice);
            LoopAction::ContinueRedraw
        }
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn dispatch(session: &mut ViewerSession, action: Action, notice: &mut Option<String>) {
    if let Outcome::Rejected(err) = session.dispatch(action) {
        *notice = Some(err.to_string());
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &ViewerSession,
    snapshot: &ViewSnapshot,
    sidebar: &mut SidebarWindow,
) -> Result<()> {
    let viewport = Viewport::current()?;

    if snapshot.sidebar_open {
        renderer.erase()?;
        let entries = sidebar_entries(snapshot);
        let title = match snapshot.sidebar_tab {
            SidebarTab::Contents => "Contents",
            SidebarTab::Thumbnails => "Pages",
        };
        return draw_sidebar_overlay(renderer, title, &entries, sidebar, &viewport);
    }

    let Some(image) = session.render_current()? else {
        renderer.erase()?;
        return Ok(());
    };
    let (image, params) = layout_page(image, snapshot.zoom, &viewport);
    let start_col = viewport.columns.saturating_sub(params.columns) / 2;
    let start_row = viewport.page_rows().saturating_sub(params.rows) / 2;

    renderer.begin_sync_update()?;
    {
        let writer = renderer.writer();
        crossterm::execute!(
            writer,
            Clear(ClearType::All),
            cursor::MoveTo(start_col as u16, start_row as u16)
        )?;
    }
    renderer.draw(&image, params)?;
    renderer.end_sync_update()?;
    Ok(())
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let status_row = window.rows.max(1).saturating_sub(1);
    let writer = renderer.writer();
    crossterm::execute!(
        writer,
        cursor::MoveTo(0, status_row),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, status)?;
    Ok(())
}

/// Text being typed, for the status line. The page field always shows the
/// session's draft.
fn pending_input(mapper: &EventMapper, snapshot: &ViewSnapshot) -> Option<String> {
    match mapper.mode() {
        InputMode::PageInput => Some(format!(":{}", snapshot.page_input_draft)),
        _ => mapper.pending_query(),
    }
}

fn format_status(
    snapshot: &ViewSnapshot,
    pending_input: Option<&str>,
    notice: Option<&str>,
) -> String {
    let mut parts = Vec::new();

    if let Some(title) = &snapshot.document_title {
        parts.push(title.clone());
    }
    if snapshot.total_pages > 0 {
        parts.push(format!("page {}/{}", snapshot.page, snapshot.total_pages));
    }
    parts.push(snapshot.zoom.to_string());

    if !snapshot.query.is_empty() {
        let state = match snapshot.search_status {
            SearchStatus::Scanning => "searching…".to_string(),
            SearchStatus::Completed if snapshot.match_count == 0 => "no matches".to_string(),
            SearchStatus::Completed => format!(
                "{}/{}",
                snapshot.active_match_ordinal.unwrap_or(0),
                snapshot.match_count
            ),
            SearchStatus::Failed => "search failed".to_string(),
            SearchStatus::Idle => String::new(),
        };
        parts.push(format!("/{} ({})", snapshot.query, state));
    }
    if snapshot.loading {
        parts.push("loading…".to_string());
    }
    if let Some(message) = &snapshot.error_message {
        parts.push(format!("error: {}", message));
    }
    if let Some(pending) = pending_input.filter(|s| !s.is_empty()) {
        parts.push(pending.to_string());
    }
    if let Some(notice) = notice {
        parts.push(notice.to_string());
    }

    parts.join(" | ")
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    columns: u32,
    rows: u32,
    cell_width: f32,
    cell_height: f32,
}

impl Viewport {
    fn current() -> Result<Self> {
        let window = terminal::window_size()?;
        let columns = u32::from(window.columns).max(1);
        let rows = u32::from(window.rows).max(1);
        Ok(Self {
            columns,
            rows,
            cell_width: f32::from(window.width) / columns as f32,
            cell_height: f32::from(window.height) / rows as f32,
        })
    }

    /// Rows above the status line.
    fn page_rows(&self) -> u32 {
        self.rows.saturating_sub(1).max(1)
    }

    /// Cells available to the page after a small margin.
    fn page_area(&self) -> (u32, u32) {
        let rows = self.page_rows();
        (
            self.columns.saturating_sub(self.columns.min(2)).max(1),
            rows.saturating_sub(rows.min(2)).max(1),
        )
    }
}

/// Fits a page rendered at `zoom` into the viewport. Above 100% the image
/// is cropped around its horizontal centre so the visible part grows;
/// below 100% it occupies a proportionally smaller box.
fn layout_page(
    image: RenderImage,
    zoom: ZoomLevel,
    viewport: &Viewport,
) -> (RenderImage, DrawParams) {
    let scale = zoom.scale();
    let (available_cols, available_rows) = viewport.page_area();

    let mut image = image;
    if scale > 1.0 && image.width > 0 && image.height > 0 {
        let crop_width = ((image.width as f32 / scale).round() as u32).clamp(1, image.width);
        let crop_height = ((image.height as f32 / scale).round() as u32).clamp(1, image.height);
        let origin_x = viewport_origin(image.width, crop_width, 0.5);
        image = crop_render_image(&image, origin_x, 0, crop_width, crop_height);
    }

    let box_scale = scale.min(1.0);
    let (cols, rows) = fit_cells(&image, available_cols, available_rows, viewport);
    let cols = ((cols as f32 * box_scale).round() as u32).clamp(1, available_cols);
    let rows = ((rows as f32 * box_scale).round() as u32).clamp(1, available_rows);
    (image, DrawParams::clamped(cols, rows))
}

/// Largest cell box inside the available area that keeps the image's
/// aspect ratio.
fn fit_cells(
    image: &RenderImage,
    available_cols: u32,
    available_rows: u32,
    viewport: &Viewport,
) -> (u32, u32) {
    if image.width == 0 || image.height == 0 {
        return (available_cols, available_rows);
    }
    // Cells are roughly twice as tall as wide when the terminal does not
    // report pixel sizes.
    let cell_ratio = if viewport.cell_width > 0.0 && viewport.cell_height > 0.0 {
        viewport.cell_height / viewport.cell_width
    } else {
        2.0
    };
    let ratio = image.width as f32 / image.height as f32 * cell_ratio;

    let mut cols = available_cols as f32;
    let mut rows = (cols / ratio).round().max(1.0);
    if rows > available_rows as f32 {
        rows = available_rows as f32;
        cols = (rows * ratio).round().max(1.0);
    }
    (
        (cols as u32).clamp(1, available_cols),
        (rows as u32).clamp(1, available_rows),
    )
}

fn viewport_origin(total: u32, visible: u32, fraction: f32) -> u32 {
    if visible >= total {
        return 0;
    }
    let max_offset = total - visible;
    (max_offset as f32 * fraction.clamp(0.0, 1.0)).round().min(max_offset as f32) as u32
}

fn crop_render_image(
    image: &RenderImage,
    origin_x: u32,
    origin_y: u32,
    width: u32,
    height: u32,
) -> RenderImage {
    let width = width.min(image.width).max(1);
    let height = height.min(image.height).max(1);
    let origin_x = origin_x.min(image.width.saturating_sub(width));
    let origin_y = origin_y.min(image.height.saturating_sub(height));

    let stride = image.width as usize * 4;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for row in 0..height {
        let start = (origin_y + row) as usize * stride + origin_x as usize * 4;
        pixels.extend_from_slice(&image.pixels[start..start + width as usize * 4]);
    }

    RenderImage {
        width,
        height,
        pixels,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SidebarEntry {
    label: String,
    page: PageNumber,
    depth: usize,
}

fn sidebar_entries(snapshot: &ViewSnapshot) -> Vec<SidebarEntry> {
    match snapshot.sidebar_tab {
        SidebarTab::Contents => snapshot
            .outline
            .iter()
            .map(|item| SidebarEntry {
                label: item.title.clone(),
                page: item.page,
                depth: item.depth,
            })
            .collect(),
        SidebarTab::Thumbnails => (0..snapshot.total_pages)
            .map(PageNumber::from_index)
            .map(|page| SidebarEntry {
                label: format!("Page {}", page),
                page,
                depth: 0,
            })
            .collect(),
    }
}

#[derive(Debug, Default)]
struct SidebarWindow {
    selected: usize,
    scroll_offset: usize,
}

impl SidebarWindow {
    /// Selects the last entry that starts at or before `page`.
    fn follow_page(&mut self, entries: &[SidebarEntry], page: PageNumber) {
        self.selected = entries
            .iter()
            .take_while(|entry| entry.page <= page)
            .count()
            .saturating_sub(1);
        self.scroll_offset = 0;
    }

    fn move_selection(&mut self, delta: isize, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        let next = (self.selected as isize + delta).clamp(0, len as isize - 1) as usize;
        if next != self.selected {
            self.selected = next;
            true
        } else {
            false
        }
    }

    fn ensure_visible(&mut self, viewport_height: usize, len: usize) {
        if viewport_height == 0 || len == 0 {
            self.scroll_offset = 0;
            return;
        }
        self.scroll_offset = self.scroll_offset.min(len.saturating_sub(viewport_height));
        if self.selected < self.scroll_offset {
            self.scroll_offset = self.selected;
        } else if self.selected >= self.scroll_offset + viewport_height {
            self.scroll_offset = self.selected + 1 - viewport_height;
        }
    }
}

fn draw_sidebar_overlay(
    renderer: &mut KittyRenderer<io::Stdout>,
    title: &str,
    entries: &[SidebarEntry],
    window: &mut SidebarWindow,
    viewport: &Viewport,
) -> Result<()> {
    const EMPTY_MESSAGE: &str = "Nothing to show";

    let rows_available = viewport.page_rows();
    if viewport.columns < 20 || rows_available < 6 {
        return Ok(());
    }

    let max_inner_width = viewport.columns.saturating_sub(6) as usize;
    let widest = entries
        .iter()
        .map(entry_line_length)
        .max()
        .unwrap_or(EMPTY_MESSAGE.len() + 2)
        .max(title.len());
    let inner_width = widest.clamp(20.min(max_inner_width), max_inner_width);

    let max_content_height = rows_available.saturating_sub(6) as usize;
    if max_content_height == 0 {
        return Ok(());
    }
    let content_height = entries.len().clamp(1, max_content_height);
    window.ensure_visible(content_height, entries.len());

    let window_height = (content_height + 4) as u32;
    let start_col = (viewport.columns.saturating_sub(inner_width as u32 + 2) / 2) as u16;
    let mut row = (rows_available.saturating_sub(window_height) / 2) as u16;

    let writer = renderer.writer();
    let border = format!("+{}+", "-".repeat(inner_width));
    print_inverted(writer, start_col, row, &border)?;
    row = row.saturating_add(1);
    let heading = format!("|{: ^inner_width$}|", title, inner_width = inner_width);
    print_inverted(writer, start_col, row, &heading)?;
    row = row.saturating_add(1);
    print_inverted(writer, start_col, row, &format!("|{}|", "-".repeat(inner_width)))?;
    row = row.saturating_add(1);

    if entries.is_empty() {
        let content = truncate_with_ellipsis(format!("  {}", EMPTY_MESSAGE), inner_width);
        print_inverted(writer, start_col, row, &format!("|{}|", content))?;
        row = row.saturating_add(1);
    } else {
        let end = (window.scroll_offset + content_height).min(entries.len());
        for (index, entry) in entries
            .iter()
            .enumerate()
            .take(end)
            .skip(window.scroll_offset)
        {
            let content = format_entry_line(entry, index == window.selected, inner_width);
            print_inverted(writer, start_col, row, &format!("|{}|", content))?;
            row = row.saturating_add(1);
        }
        for _ in (end - window.scroll_offset)..content_height {
            print_inverted(writer, start_col, row, &format!("|{}|", " ".repeat(inner_width)))?;
            row = row.saturating_add(1);
        }
    }

    print_inverted(writer, start_col, row, &border)?;
    writer.flush()?;
    Ok(())
}

fn print_inverted(writer: &mut impl Write, col: u16, row: u16, content: &str) -> Result<()> {
    crossterm::queue!(
        writer,
        cursor::MoveTo(col, row),
        SetAttribute(Attribute::Reverse),
        Print(content),
        SetAttribute(Attribute::Reset)
    )?;
    Ok(())
}

fn entry_line_length(entry: &SidebarEntry) -> usize {
    let suffix = format!(" (p{})", entry.page);
    2 + entry.depth.min(8) * 2 + entry.label.chars().count() + suffix.len()
}

fn format_entry_line(entry: &SidebarEntry, selected: bool, inner_width: usize) -> String {
    let marker = if selected { '>' } else { ' ' };
    let indent = "  ".repeat(entry.depth.min(8));
    let text = format!("{} {}{} (p{})", marker, indent, entry.label, entry.page);
    truncate_with_ellipsis(text, inner_width)
}

fn truncate_with_ellipsis(text: String, width: usize) -> String {
    let len = text.chars().count();
    let mut text = if len > width {
        if width <= 3 {
            text.chars().take(width).collect()
        } else {
            let mut truncated: String = text.chars().take(width - 3).collect();
            truncated.push_str("...");
            truncated
        }
    } else {
        text
    };
    let len = text.chars().count();
    if len < width {
        text.push_str(&" ".repeat(width - len));
    }
    text
}

fn init_logging(
    project_dirs: &ProjectDirs,
    filter: Option<&str>,
    headless: bool,
) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pageview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // The interactive viewer owns the terminal, so console output only goes
    // to stderr in headless mode.
    let console_layer = headless.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
