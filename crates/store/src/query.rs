use chrono::{DateTime, Utc};
use common::UserId;
use domain::OrderStatus;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filters and paging for order listings.
///
/// Results are ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderQuery {
    pub user_id: Option<UserId>,
    pub status: Option<OrderStatus>,
    /// Created at or after (inclusive).
    pub from: Option<DateTime<Utc>>,
    /// Created before (exclusive).
    pub to: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl Default for OrderQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            from: None,
            to: None,
            include_deleted: false,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl OrderQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn created_before(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Sets the page, clamping to valid values.
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page.max(1);
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit())
    }

    /// Rows to take.
    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paging_is_clamped() {
        let query = OrderQuery::new().page(0, 1_000);
        assert_eq!(query.page, 1);
        assert_eq!(query.limit(), MAX_PAGE_SIZE);
        assert_eq!(query.offset(), 0);

        let query = OrderQuery::new().page(3, 10);
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn test_total_pages() {
        let page: Page<u8> = Page {
            items: vec![],
            page: 1,
            page_size: 20,
            total: 41,
        };
        assert_eq!(page.total_pages(), 3);
    }
}
