//! Offline sync pagination bounds
//!
//! The HTTP pull API and the WebSocket `sync_offline_messages` frame both normalize
//! through [`PageRequest::normalize`], so the bounds are enforced identically.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;
/// Pages beyond this are clamped; the offset stays well inside `i64`
pub const MAX_PAGE: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl PageRequest {
    /// Clamp raw client values: page < 1 becomes 1, page > [`MAX_PAGE`] becomes
    /// `MAX_PAGE`, a page size outside `[1, MAX_PAGE_SIZE]` becomes [`DEFAULT_PAGE_SIZE`].
    pub fn normalize(page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = page.filter(|p| *p >= 1).unwrap_or(1).min(MAX_PAGE);
        let page_size = page_size
            .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::normalize(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let page = PageRequest::default();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 50);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        assert_eq!(PageRequest::normalize(Some(0), Some(0)), PageRequest { page: 1, page_size: 50 });
        assert_eq!(PageRequest::normalize(Some(-4), Some(101)), PageRequest { page: 1, page_size: 50 });
        assert_eq!(PageRequest::normalize(Some(3), Some(100)), PageRequest { page: 3, page_size: 100 });
        assert_eq!(PageRequest::normalize(Some(2), Some(1)), PageRequest { page: 2, page_size: 1 });
    }

    #[test]
    fn test_offset() {
        let page = PageRequest::normalize(Some(3), Some(20));
        assert_eq!(page.offset(), 40);
        assert_eq!(page.limit(), 20);
    }

    #[test]
    fn test_huge_page_is_clamped() {
        let page = PageRequest::normalize(Some(i64::MAX), Some(50));
        assert_eq!(page.page, MAX_PAGE);
        assert_eq!(page.offset(), (MAX_PAGE - 1) * 50);

        // Hand-built requests bypassing normalize still never overflow
        let raw = PageRequest { page: i64::MAX, page_size: MAX_PAGE_SIZE };
        assert_eq!(raw.offset(), i64::MAX);
        let negative = PageRequest { page: i64::MIN, page_size: MAX_PAGE_SIZE };
        assert_eq!(negative.offset(), 0);
    }
}
