//! User directory collaborator.
//!
//! The directory is a paginated REST resource owned by the host
//! application. This module defines the [`UserDirectory`] seam and an
//! in-memory [`StaticDirectory`] that applies the same filtering, ordering
//! and paging rules, for tests and offline use.

use std::cmp::Ordering;

use chatsync_proto::directory::{DirectoryPage, DirectoryQuery, OrderDirection, User};

use crate::chat::history::LoadError;

/// Errors from a directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The query cannot be served.
    #[error("invalid directory query: {0}")]
    InvalidQuery(String),

    /// The directory service failed or could not be reached.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<DirectoryError> for LoadError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err.to_string())
    }
}

/// Paginated user lookup.
pub trait UserDirectory: Send + Sync {
    /// Fetch one page of users matching `query`.
    fn fetch(
        &self,
        query: &DirectoryQuery,
    ) -> impl std::future::Future<Output = Result<DirectoryPage<User>, DirectoryError>> + Send;
}

/// Fetch every page of `query`, starting at its `skip`.
///
/// # Errors
///
/// Returns the first [`DirectoryError`] encountered.
pub async fn fetch_all<D: UserDirectory>(
    directory: &D,
    query: DirectoryQuery,
) -> Result<Vec<User>, DirectoryError> {
    if query.limit == 0 {
        return Err(DirectoryError::InvalidQuery("limit must be positive".to_string()));
    }
    let mut users = Vec::new();
    let mut query = query;
    loop {
        let page = directory.fetch(&query).await?;
        let more = page.has_more(&query) && !page.data.is_empty();
        users.extend(page.data);
        if !more {
            return Ok(users);
        }
        query = query.next_page();
    }
}

/// A fixed list of users served with directory semantics.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: Vec<User>,
}

impl StaticDirectory {
    /// Serve `users`.
    #[must_use]
    pub const fn new(users: Vec<User>) -> Self {
        Self { users }
    }

    fn matches(user: &User, query: &DirectoryQuery) -> bool {
        if user.status != query.status {
            return false;
        }
        let Some(needle) = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return true;
        };
        let needle = needle.to_lowercase();
        [
            Some(user.first_name.as_str()),
            Some(user.last_name.as_str()),
            user.email.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&needle))
    }

    fn comparator(order_by: &str) -> Result<fn(&User, &User) -> Ordering, DirectoryError> {
        match order_by {
            "id" => Ok(|a: &User, b: &User| a.id.cmp(&b.id)),
            "first_name" => Ok(|a: &User, b: &User| a.first_name.cmp(&b.first_name)),
            "last_name" => Ok(|a: &User, b: &User| a.last_name.cmp(&b.last_name)),
            "email" => Ok(|a: &User, b: &User| a.email.cmp(&b.email)),
            other => Err(DirectoryError::InvalidQuery(format!(
                "unknown order_by field {other:?}"
            ))),
        }
    }
}

impl UserDirectory for StaticDirectory {
    async fn fetch(&self, query: &DirectoryQuery) -> Result<DirectoryPage<User>, DirectoryError> {
        let compare = Self::comparator(&query.order_by)?;
        let mut matching: Vec<&User> = self
            .users
            .iter()
            .filter(|user| Self::matches(user, query))
            .collect();
        matching.sort_by(|a, b| {
            let ordering = compare(a, b).then_with(|| a.id.cmp(&b.id));
            match query.order_direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            }
        });
        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(query.skip as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(DirectoryPage { data, total })
    }
}
