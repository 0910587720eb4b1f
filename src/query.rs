use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{AppError, FieldErrors, Result};
use crate::models::{Application, Status};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_SEARCH_LEN: usize = 100;
pub const MAX_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    AppliedDate,
    #[default]
    CreatedAt,
    Priority,
}

impl std::str::FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appliedDate" => Ok(SortBy::AppliedDate),
            "createdAt" => Ok(SortBy::CreatedAt),
            "priority" => Ok(SortBy::Priority),
            _ => Err("Sort field must be one of: appliedDate, createdAt, priority".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err("Sort order must be asc or desc".to_string()),
        }
    }
}

/// Query-string parameters exactly as they arrived.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub status: Option<Status>,
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            status: None,
            search: None,
        }
    }
}

impl ListQuery {
    pub fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.limit as u64
    }
}

impl TryFrom<RawListQuery> for ListQuery {
    type Error = AppError;

    /// Empty strings count as absent. Every bad parameter is reported at once.
    fn try_from(raw: RawListQuery) -> Result<Self> {
        let mut errors = FieldErrors::new();
        let mut query = ListQuery::default();

        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        if let Some(page) = present(raw.page) {
            match page.trim().parse::<u32>() {
                Ok(p) if p >= 1 => query.page = p,
                _ => push(&mut errors, "page", "Page must be a positive integer"),
            }
        }
        if let Some(limit) = present(raw.limit) {
            match limit.trim().parse::<u32>() {
                Ok(l) if (1..=MAX_LIMIT).contains(&l) => query.limit = l,
                _ => push(
                    &mut errors,
                    "limit",
                    &format!("Limit must be between 1 and {}", MAX_LIMIT),
                ),
            }
        }
        if let Some(sort_by) = present(raw.sort_by) {
            match sort_by.parse() {
                Ok(s) => query.sort_by = s,
                Err(msg) => push(&mut errors, "sortBy", &msg),
            }
        }
        if let Some(order) = present(raw.sort_order) {
            match order.parse() {
                Ok(o) => query.sort_order = o,
                Err(msg) => push(&mut errors, "sortOrder", &msg),
            }
        }
        if let Some(status) = present(raw.status) {
            match status.parse() {
                Ok(s) => query.status = Some(s),
                Err(msg) => push(&mut errors, "status", &msg),
            }
        }
        if let Some(search) = present(raw.search) {
            let search = search.trim();
            if search.chars().count() > MAX_SEARCH_LEN {
                push(
                    &mut errors,
                    "search",
                    &format!("Search must be at most {} characters", MAX_SEARCH_LEN),
                );
            } else {
                query.search = Some(search.to_string());
            }
        }

        if errors.is_empty() {
            Ok(query)
        } else {
            Err(AppError::Validation { details: errors })
        }
    }
}

fn push(errors: &mut FieldErrors, field: &str, message: &str) {
    errors
        .entry(field.to_string())
        .or_default()
        .push(message.to_string());
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl PageMeta {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let total_pages = if limit == 0 { 0 } else { total.div_ceil(limit as u64) };
        Self { page, limit, total, total_pages }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub data: Vec<Application>,
    pub meta: PageMeta,
}

/// Stable re-sort of a page by priority rank. Ascending puts HIGH first.
pub fn sort_page_by_priority(apps: &mut [Application], order: SortOrder) {
    match order {
        SortOrder::Asc => apps.sort_by_key(|a| a.priority.rank()),
        SortOrder::Desc => apps.sort_by_key(|a| std::cmp::Reverse(a.priority.rank())),
    }
}

/// The store already orders by priority before paging; the re-sort keeps
/// each page's order tied to `Priority::rank`.
pub fn list_applications(db: &Database, user_id: &str, query: &ListQuery) -> Result<Page> {
    let (mut data, total) = db.query_applications(user_id, query)?;
    if query.sort_by == SortBy::Priority {
        sort_page_by_priority(&mut data, query.sort_order);
    }
    Ok(Page {
        data,
        meta: PageMeta::new(query.page, query.limit, total),
    })
}
