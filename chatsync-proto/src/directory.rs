//! Query and page types for the REST user directory.

use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// Default page size for directory queries.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Sort direction of a directory query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl OrderDirection {
    /// Query-string value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Account status filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    /// Active accounts.
    #[default]
    Active,
    /// Deactivated accounts.
    Inactive,
}

impl UserStatus {
    /// Query-string value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// Paginated user directory query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryQuery {
    /// Number of records to skip.
    pub skip: u32,
    /// Maximum number of records to return.
    pub limit: u32,
    /// Field to sort by.
    pub order_by: String,
    /// Sort direction.
    pub order_direction: OrderDirection,
    /// Status filter.
    pub status: UserStatus,
    /// Free-text search over names and email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Default for DirectoryQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
            order_by: "id".to_string(),
            order_direction: OrderDirection::Asc,
            status: UserStatus::Active,
            search: None,
        }
    }
}

impl DirectoryQuery {
    /// Returns the query for the page after this one.
    #[must_use]
    pub fn next_page(&self) -> Self {
        Self {
            skip: self.skip.saturating_add(self.limit),
            ..self.clone()
        }
    }

    /// Renders the query as `(key, value)` pairs for a URL query string.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("skip", self.skip.to_string()),
            ("limit", self.limit.to_string()),
            ("order_by", self.order_by.clone()),
            ("order_direction", self.order_direction.as_str().to_string()),
            ("status", self.status.as_str().to_string()),
        ];
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            pairs.push(("search", search.to_string()));
        }
        pairs
    }
}

/// A directory user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: UserId,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
    /// Contact email.
    #[serde(default)]
    pub email: Option<String>,
    /// Account status.
    #[serde(default)]
    pub status: UserStatus,
}

/// One page of directory results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryPage<T> {
    /// Records on this page.
    pub data: Vec<T>,
    /// Total number of matching records across all pages.
    pub total: u64,
}

impl<T> DirectoryPage<T> {
    /// Whether more records exist after `query`'s page.
    #[must_use]
    pub fn has_more(&self, query: &DirectoryQuery) -> bool {
        u64::from(query.skip) + (self.data.len() as u64) < self.total
    }
}
