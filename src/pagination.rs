//! Cursor-based pagination shared by every listing operation.
//!
//! Listings ask the engine for `limit + 1` entries. If the extra entry comes
//! back the page is truncated: the extra is dropped and the cursor becomes
//! the identifying key of the last entry that is returned. The engine's
//! listings resume strictly after a cursor, so walking pages never skips or
//! repeats an entry that was already visible when the walk started.

/// An entry that can serve as a resume point.
pub trait Cursor {
    type Marker: Clone + std::fmt::Debug + PartialEq + Eq;

    /// The value to pass back as the marker to resume after this entry.
    fn marker(&self) -> Self::Marker;
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T: Cursor> {
    pub items: Vec<T>,
    /// Present only when more entries follow.
    pub next_marker: Option<T::Marker>,
}

impl<T: Cursor> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_marker: None,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.next_marker.is_some()
    }

    /// Build a page from an over-fetched batch of up to `limit + 1` entries.
    pub fn from_overfetch(mut items: Vec<T>, limit: usize) -> Self {
        if items.len() <= limit {
            return Self {
                items,
                next_marker: None,
            };
        }
        items.truncate(limit);
        let next_marker = items.last().map(Cursor::marker);
        Self { items, next_marker }
    }
}

/// Fetch one page. `fetch` receives the number of entries to request,
/// which is one more than the page size. A `limit` of zero returns an empty,
/// untruncated page without calling `fetch`.
pub fn fetch_page<T, E, F>(limit: usize, fetch: F) -> Result<Page<T>, E>
where
    T: Cursor,
    F: FnOnce(usize) -> Result<Vec<T>, E>,
{
    if limit == 0 {
        return Ok(Page::empty());
    }
    let items = fetch(limit.saturating_add(1))?;
    Ok(Page::from_overfetch(items, limit))
}

/// Clamp a client-supplied `max-keys`-style value to `[0, max]`, falling
/// back to `default` when absent or unparseable.
pub fn parse_limit(raw: Option<&str>, default: usize, max: usize) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .min(max)
}
