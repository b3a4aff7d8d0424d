use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavError {
    #[error("page {target} is outside 1..={total_pages}")]
    OutOfRange { target: i64, total_pages: usize },
    #[error("already at page {page}, cannot step {direction:?}")]
    AtBoundary {
        page: PageNumber,
        direction: PageDirection,
    },
    #[error("{input:?} is not a page number")]
    InvalidInput { input: String },
}

/// Free-text contents of the page number field.
///
/// Edits are stored verbatim so the user can pass through states like `""`
/// or `"1"` on the way to `"12"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInput {
    draft: String,
}

impl PageInput {
    pub fn new(page: PageNumber) -> Self {
        Self {
            draft: page.to_string(),
        }
    }

    pub fn text(&self) -> &str {
        &self.draft
    }

    pub fn edit(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn sync(&mut self, page: PageNumber) {
        self.draft = page.to_string();
    }

    /// Parses the draft and checks it against `1..=total_pages`.
    pub fn reconcile(&self, total_pages: usize) -> Option<PageNumber> {
        let value: usize = self.draft.trim().parse().ok()?;
        if value > total_pages {
            return None;
        }
        PageNumber::new(value)
    }
}

impl Default for PageInput {
    fn default() -> Self {
        Self::new(PageNumber::FIRST)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavigationController {
    current: PageNumber,
    total_pages: usize,
    input: PageInput,
}

impl NavigationController {
    pub fn new(total_pages: usize) -> Self {
        Self {
            current: PageNumber::FIRST,
            total_pages,
            input: PageInput::default(),
        }
    }

    /// Back to page 1 of a document with `total_pages` pages.
    pub fn reset(&mut self, total_pages: usize) {
        *self = Self::new(total_pages);
    }

    pub fn current_page(&self) -> PageNumber {
        self.current
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn draft(&self) -> &str {
        self.input.text()
    }

    pub fn at_start(&self) -> bool {
        self.current == PageNumber::FIRST
    }

    pub fn at_end(&self) -> bool {
        self.current.get() >= self.total_pages
    }

    pub fn go_to_page(&mut self, target: i64) -> Result<PageNumber, NavError> {
        let page = usize::try_from(target)
            .ok()
            .filter(|&value| value <= self.total_pages)
            .and_then(PageNumber::new)
            .ok_or(NavError::OutOfRange {
                target,
                total_pages: self.total_pages,
            })?;
        self.current = page;
        self.input.sync(page);
        Ok(page)
    }

    pub fn step(&mut self, direction: PageDirection) -> Result<PageNumber, NavError> {
        let blocked = match direction {
            PageDirection::Forward => self.at_end(),
            PageDirection::Backward => self.at_start(),
        };
        if blocked {
            return Err(NavError::AtBoundary {
                page: self.current,
                direction,
            });
        }
        let current = self.current.get() as i64;
        let target = match direction {
            PageDirection::Forward => current + 1,
            PageDirection::Backward => current - 1,
        };
        self.go_to_page(target)
    }

    pub fn on_draft_change(&mut self, text: impl Into<String>) {
        self.input.edit(text);
    }

    /// Applies the draft. Whatever the result, the draft ends up showing the
    /// committed page.
    pub fn commit_draft(&mut self) -> Result<PageNumber, NavError> {
        match self.input.reconcile(self.total_pages) {
            Some(page) => {
                self.current = page;
                self.input.sync(page);
                Ok(page)
            }
            None => {
                let input = self.input.text().to_string();
                self.input.sync(self.current);
                Err(NavError::InvalidInput { input })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: usize) -> PageNumber {
        PageNumber::new(number).unwrap()
    }

    #[test]
    fn go_to_page_rejects_targets_outside_range() {
        let mut nav = NavigationController::new(10);
        nav.go_to_page(4).unwrap();

        for target in [-3, 0, 11, 500, i64::MAX, i64::MIN] {
            assert_eq!(
                nav.go_to_page(target),
                Err(NavError::OutOfRange {
                    target,
                    total_pages: 10
                })
            );
            assert_eq!(nav.current_page(), page(4));
            assert_eq!(nav.draft(), "4");
        }
    }

    #[test]
    fn go_to_page_resyncs_draft() {
        let mut nav = NavigationController::new(10);
        nav.on_draft_change("7x");
        assert_eq!(nav.go_to_page(9), Ok(page(9)));
        assert_eq!(nav.draft(), "9");
    }

    #[test]
    fn step_stops_at_boundaries() {
        let mut nav = NavigationController::new(2);
        assert!(nav.at_start());
        assert!(matches!(
            nav.step(PageDirection::Backward),
            Err(NavError::AtBoundary { .. })
        ));

        assert_eq!(nav.step(PageDirection::Forward), Ok(page(2)));
        assert!(nav.at_end());
        assert_eq!(
            nav.step(PageDirection::Forward),
            Err(NavError::AtBoundary {
                page: page(2),
                direction: PageDirection::Forward
            })
        );
        assert_eq!(nav.current_page(), page(2));
    }

    #[test]
    fn draft_keeps_intermediate_text_until_commit() {
        let mut nav = NavigationController::new(20);
        nav.on_draft_change("");
        assert_eq!(nav.draft(), "");
        nav.on_draft_change("1");
        nav.on_draft_change("12");
        assert_eq!(nav.current_page(), page(1));

        assert_eq!(nav.commit_draft(), Ok(page(12)));
        assert_eq!(nav.draft(), "12");
    }

    #[test]
    fn commit_draft_with_non_numeric_text_restores_current_page() {
        let mut nav = NavigationController::new(20);
        nav.go_to_page(3).unwrap();
        nav.on_draft_change("abc");

        assert_eq!(
            nav.commit_draft(),
            Err(NavError::InvalidInput {
                input: "abc".into()
            })
        );
        assert_eq!(nav.draft(), "3");
        assert_eq!(nav.current_page(), page(3));
    }

    #[test]
    fn commit_draft_rejects_out_of_range_numbers() {
        let mut nav = NavigationController::new(5);
        for text in ["0", "6", "-1", ""] {
            nav.on_draft_change(text);
            assert!(matches!(
                nav.commit_draft(),
                Err(NavError::InvalidInput { .. })
            ));
            assert_eq!(nav.draft(), "1");
        }
    }

    #[test]
    fn commit_draft_accepts_surrounding_whitespace() {
        let mut nav = NavigationController::new(5);
        nav.on_draft_change(" 5 ");
        assert_eq!(nav.commit_draft(), Ok(page(5)));
        assert_eq!(nav.draft(), "5");
    }

    #[test]
    fn reset_returns_to_first_page() {
        let mut nav = NavigationController::new(5);
        nav.go_to_page(5).unwrap();
        nav.reset(3);
        assert_eq!(nav.current_page(), page(1));
        assert_eq!(nav.total_pages(), 3);
        assert_eq!(nav.draft(), "1");
    }
}
