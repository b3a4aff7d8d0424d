use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use pageview_core::{Action, MatchDirection, PageDirection, RenderImage, ZoomDirection, ZoomLevel};
use png::{BitDepth, ColorType, Encoder};

/// Payload bytes per kitty graphics escape sequence.
const CHUNK_SIZE: usize = 4096;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` and places it over `params` cells at the cursor,
    /// replacing the previous page image.
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let encoded = BASE64.encode(encode_png(image)?);
        let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(CHUNK_SIZE).collect();
        let last = chunks.len().saturating_sub(1);

        for (index, chunk) in chunks.iter().enumerate() {
            let more = u8::from(index < last);
            if index == 0 {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            self.writer.write_all(b";")?;
            self.writer.write_all(chunk)?;
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Deletes every placement of the page image.
    pub fn erase(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=i,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders everything buffered since `begin_sync_update`.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn encode_png(image: &RenderImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&image.pixels)?;
    writer.finish()?;
    Ok(buffer)
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

/// Key presses translated for the viewer loop.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Action(Action),
    /// Change to the page number field. The loop applies it to the draft
    /// held by the session.
    EditPageDraft(DraftEdit),
    /// Jump to the last page; the loop knows the page count.
    LastPage,
    /// Show the other sidebar tab; the loop knows which one is active.
    SwitchSidebarTab,
    SidebarMoveSelection { delta: isize },
    SidebarActivate,
    Quit,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftEdit {
    Replace(String),
    Push(char),
    Pop,
}

pub fn apply_draft_edit(draft: &str, edit: DraftEdit) -> String {
    match edit {
        DraftEdit::Replace(text) => text,
        DraftEdit::Push(c) => {
            let mut text = draft.to_owned();
            text.push(c);
            text
        }
        DraftEdit::Pop => {
            let mut text = draft.to_owned();
            text.pop();
            text
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    /// Typing into the page number field.
    PageInput,
    Search,
    Sidebar,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    mode: InputMode,
    query: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.query.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match self.mode {
            InputMode::Normal => self.map_normal(code, modifiers),
            InputMode::PageInput => self.map_page_input(code, modifiers),
            InputMode::Search => self.map_search(code, modifiers),
            InputMode::Sidebar => self.map_sidebar(code),
        }
    }

    fn map_normal(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                self.set_mode(InputMode::PageInput);
                UiEvent::EditPageDraft(DraftEdit::Replace(c.to_string()))
            }
            (KeyCode::Char(':'), _) | (KeyCode::Char('p'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::PageInput);
                UiEvent::EditPageDraft(DraftEdit::Replace(String::new()))
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE)
            | (KeyCode::Down, _)
            | (KeyCode::Right, _)
            | (KeyCode::PageDown, _) => step_page(PageDirection::Forward),
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, _)
            | (KeyCode::Left, _)
            | (KeyCode::PageUp, _) => step_page(PageDirection::Backward),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                UiEvent::Action(Action::ChangePage { target: 1 })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => UiEvent::LastPage,
            (KeyCode::Char('+'), _) => UiEvent::Action(Action::StepZoom {
                direction: ZoomDirection::In,
            }),
            (KeyCode::Char('-'), _) => UiEvent::Action(Action::StepZoom {
                direction: ZoomDirection::Out,
            }),
            (KeyCode::Char('='), _) => UiEvent::Action(Action::SetZoom {
                value: i64::from(ZoomLevel::DEFAULT.percent()),
            }),
            (KeyCode::Char('/'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Search);
                UiEvent::None
            }
            (KeyCode::Char('n'), KeyModifiers::NONE) => navigate_search(MatchDirection::Next),
            (KeyCode::Char('N'), modifiers)
                if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
            {
                navigate_search(MatchDirection::Prev)
            }
            (KeyCode::Char('s'), KeyModifiers::NONE) => UiEvent::Action(Action::ToggleSidebar),
            (KeyCode::Tab, _) => UiEvent::SwitchSidebarTab,
            (KeyCode::Char('q'), _) => UiEvent::Quit,
            _ => UiEvent::None,
        }
    }

    fn map_page_input(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Enter, _) | (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::Action(Action::CommitPageDraft)
            }
            (KeyCode::Backspace, _) => UiEvent::EditPageDraft(DraftEdit::Pop),
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                UiEvent::EditPageDraft(DraftEdit::Push(c))
            }
            _ => UiEvent::None,
        }
    }

    fn map_search(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::Action(Action::SetSearchQuery {
                    text: String::new(),
                })
            }
            (KeyCode::Enter, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::None
            }
            (KeyCode::Backspace, _) => {
                self.query.pop();
                self.search_query()
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.query.push(c);
                self.search_query()
            }
            _ => UiEvent::None,
        }
    }

    fn map_sidebar(&mut self, code: KeyCode) -> UiEvent {
        match code {
            KeyCode::Esc | KeyCode::Char('s') => {
                UiEvent::Action(Action::ToggleSidebar)
            }
            KeyCode::Enter => UiEvent::SidebarActivate,
            KeyCode::Tab => UiEvent::SwitchSidebarTab,
            KeyCode::Char('j') | KeyCode::Down => UiEvent::SidebarMoveSelection { delta: 1 },
            KeyCode::Char('k') | KeyCode::Up => UiEvent::SidebarMoveSelection { delta: -1 },
            KeyCode::Char('q') => UiEvent::Quit,
            _ => UiEvent::None,
        }
    }

    fn search_query(&self) -> UiEvent {
        UiEvent::Action(Action::SetSearchQuery {
            text: self.query.clone(),
        })
    }

    /// Search text being typed, for the status line. The page field is shown
    /// from the session's draft instead.
    pub fn pending_query(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => Some(format!("/{}", self.query)),
            InputMode::Normal | InputMode::PageInput | InputMode::Sidebar => None,
        }
    }
}

fn step_page(direction: PageDirection) -> UiEvent {
    UiEvent::Action(Action::StepPage { direction })
}

fn navigate_search(direction: MatchDirection) -> UiEvent {
    UiEvent::Action(Action::NavigateSearch { direction })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState};

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };

        renderer.draw(&image, DrawParams::clamped(10, 5)).unwrap();
        let output = String::from_utf8(renderer.writer.clone()).unwrap();
        assert!(output.starts_with("\u{1b}_Ga=T,f=100"));
        assert!(output.contains("c=10,r=5,s=1,v=1"));
        assert!(output.contains(",m=0;"));
        assert!(output.ends_with("\u{1b}\\"));
    }

    #[test]
    fn kitty_draw_splits_large_payloads() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let width = 256;
        let height = 256;
        let pixels = (0..width * height * 4)
            .map(|i| (i * 7919 % 251) as u8)
            .collect();
        let image = RenderImage {
            width,
            height,
            pixels,
        };

        renderer.draw(&image, DrawParams::clamped(0, 0)).unwrap();
        let output = String::from_utf8(renderer.writer.clone()).unwrap();
        assert!(output.contains("c=1,r=1"));
        assert!(output.contains(",m=1;"));
        assert!(output.contains("\u{1b}_Gm=0,q=2;"));
    }

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn event_mapper_maps_paging_keys() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            step_page(PageDirection::Forward)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::PageUp)),
            step_page(PageDirection::Backward)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Action(Action::ChangePage { target: 1 })
        );
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('G'),
                KeyModifiers::SHIFT
            )),
            UiEvent::LastPage
        );
    }

    #[test]
    fn event_mapper_digits_edit_the_page_draft() {
        let mut mapper = EventMapper::new();

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::EditPageDraft(DraftEdit::Replace("1".into()))
        );
        assert_eq!(mapper.mode(), InputMode::PageInput);
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::EditPageDraft(DraftEdit::Push('2'))
        );
        assert!(mapper.pending_query().is_none());
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Backspace)),
            UiEvent::EditPageDraft(DraftEdit::Pop)
        );

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::Action(Action::CommitPageDraft)
        );
        assert_eq!(mapper.mode(), InputMode::Normal);
    }

    #[test]
    fn event_mapper_page_input_keeps_non_numeric_text() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char(':'))),
            UiEvent::EditPageDraft(DraftEdit::Replace(String::new()))
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('x'))),
            UiEvent::EditPageDraft(DraftEdit::Push('x'))
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::Action(Action::CommitPageDraft)
        );
    }

    #[test]
    fn draft_edits_apply_to_the_given_text() {
        assert_eq!(apply_draft_edit("12", DraftEdit::Push('3')), "123");
        assert_eq!(apply_draft_edit("12", DraftEdit::Pop), "1");
        assert_eq!(apply_draft_edit("", DraftEdit::Pop), "");
        assert_eq!(
            apply_draft_edit("12", DraftEdit::Replace("7".into())),
            "7"
        );
    }

    #[test]
    fn event_mapper_maps_zoom_keys() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('+'))),
            UiEvent::Action(Action::StepZoom {
                direction: ZoomDirection::In
            })
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('-'))),
            UiEvent::Action(Action::StepZoom {
                direction: ZoomDirection::Out
            })
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('='))),
            UiEvent::Action(Action::SetZoom { value: 100 })
        );
    }

    #[test]
    fn event_mapper_slash_enters_search_mode_and_collects_input() {
        let mut mapper = EventMapper::new();

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('/'))),
            UiEvent::None
        );
        assert_eq!(mapper.pending_query().as_deref(), Some("/"));

        match mapper.map_event(key_event(KeyCode::Char('f'))) {
            UiEvent::Action(Action::SetSearchQuery { ref text }) => assert_eq!(text, "f"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_query().as_deref(), Some("/f"));

        match mapper.map_event(key_event(KeyCode::Backspace)) {
            UiEvent::Action(Action::SetSearchQuery { ref text }) => assert!(text.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('G'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::Action(Action::SetSearchQuery { ref text }) => assert_eq!(text, "G"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(mapper.map_event(key_event(KeyCode::Enter)), UiEvent::None);
        assert_eq!(mapper.mode(), InputMode::Normal);
        assert!(mapper.pending_query().is_none());
    }

    #[test]
    fn event_mapper_escape_clears_search() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('/')));
        mapper.map_event(key_event(KeyCode::Char('a')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::Action(Action::SetSearchQuery {
                text: String::new()
            })
        );
        assert_eq!(mapper.mode(), InputMode::Normal);
    }

    #[test]
    fn event_mapper_maps_n_and_uppercase_n_to_search_navigation() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('n'))),
            navigate_search(MatchDirection::Next)
        );
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('N'),
                KeyModifiers::SHIFT
            )),
            navigate_search(MatchDirection::Prev)
        );
    }

    #[test]
    fn event_mapper_sidebar_mode_maps_navigation_keys() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('s'))),
            UiEvent::Action(Action::ToggleSidebar)
        );
        mapper.set_mode(InputMode::Sidebar);

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::SidebarMoveSelection { delta: 1 }
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Up)),
            UiEvent::SidebarMoveSelection { delta: -1 }
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::SidebarActivate
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Tab)),
            UiEvent::SwitchSidebarTab
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::Action(Action::ToggleSidebar)
        );
    }

    #[test]
    fn event_mapper_switching_modes_clears_buffer() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('/')));
        mapper.map_event(key_event(KeyCode::Char('x')));
        mapper.set_mode(InputMode::Sidebar);
        assert!(mapper.pending_query().is_none());

        mapper.set_mode(InputMode::Normal);
        mapper.map_event(key_event(KeyCode::Char('/')));
        assert_eq!(mapper.pending_query().as_deref(), Some("/"));
    }

    #[test]
    fn event_mapper_ignores_non_key_events() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(Event::FocusLost), UiEvent::None);
    }
}
