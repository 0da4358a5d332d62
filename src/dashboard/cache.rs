//! Bookmark List Cache
//!
//! The local, newest-first copy of the user's bookmarks. After the initial
//! fetch it only changes through change-feed notifications. Freshly
//! inserted entries carry a "new" highlight until their deadline passes.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::model::Bookmark;

#[derive(Debug, Clone)]
pub struct BookmarkList {
    items: Vec<Bookmark>,
    /// Bookmark id -> moment its highlight ends
    highlights: HashMap<String, DateTime<Utc>>,
    highlight_for: Duration,
}

impl BookmarkList {
    pub fn new(highlight_for: Duration) -> Self {
        Self {
            items: Vec::new(),
            highlights: HashMap::new(),
            highlight_for,
        }
    }

    /// Replace the contents with a full fetch (already newest first)
    pub fn replace_all(&mut self, rows: Vec<Bookmark>) {
        self.items = rows;
        let items = &self.items;
        self.highlights
            .retain(|id, _| items.iter().any(|b| &b.id == id));
    }

    /// Prepend a newly inserted row; false if its id is already listed
    pub fn apply_insert(&mut self, bookmark: Bookmark, now: DateTime<Utc>) -> bool {
        if self.contains(&bookmark.id) {
            return false;
        }
        self.highlights
            .insert(bookmark.id.clone(), now + self.highlight_for);
        self.items.insert(0, bookmark);
        true
    }

    /// Remove the row with `id`; false if it wasn't listed
    pub fn apply_delete(&mut self, id: &str) -> bool {
        self.highlights.remove(id);
        let before = self.items.len();
        self.items.retain(|b| b.id != id);
        self.items.len() != before
    }

    /// Drop highlights whose deadline has passed; returns how many ended
    pub fn expire_highlights(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.highlights.len();
        self.highlights.retain(|_, until| *until > now);
        before - self.highlights.len()
    }

    /// Earliest pending highlight deadline
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.highlights.values().min().copied()
    }

    pub fn is_new(&self, id: &str) -> bool {
        self.highlights.contains_key(id)
    }

    pub fn highlighted(&self) -> usize {
        self.highlights.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|b| b.id == id)
    }

    pub fn get(&self, index: usize) -> Option<&Bookmark> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.highlights.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(id: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            url: format!("https://{}.example", id),
            title: id.to_uppercase(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            user_id: "u1".to_string(),
        }
    }

    fn ids(list: &BookmarkList) -> Vec<&str> {
        list.iter().map(|b| b.id.as_str()).collect()
    }

    fn list() -> BookmarkList {
        BookmarkList::new(Duration::milliseconds(1500))
    }

    #[test]
    fn test_inserts_are_newest_first_and_deduplicated() {
        let mut list = list();
        let now = Utc::now();

        assert!(list.apply_insert(bookmark("a"), now));
        assert!(list.apply_insert(bookmark("b"), now));
        assert!(!list.apply_insert(bookmark("a"), now));
        assert!(list.apply_insert(bookmark("c"), now));
        assert!(!list.apply_insert(bookmark("c"), now));

        assert_eq!(ids(&list), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut list = list();
        list.replace_all(vec![bookmark("b"), bookmark("a")]);

        assert!(!list.apply_delete("zzz"));
        assert_eq!(ids(&list), vec!["b", "a"]);

        assert!(list.apply_delete("b"));
        assert_eq!(ids(&list), vec!["a"]);
    }

    #[test]
    fn test_highlight_window() {
        let mut list = list();
        let start = Utc::now();

        list.apply_insert(bookmark("a"), start);
        assert!(list.is_new("a"));
        assert_eq!(list.next_expiry(), Some(start + Duration::milliseconds(1500)));

        assert_eq!(list.expire_highlights(start + Duration::milliseconds(1499)), 0);
        assert!(list.is_new("a"));

        assert_eq!(list.expire_highlights(start + Duration::milliseconds(1500)), 1);
        assert!(!list.is_new("a"));
        assert_eq!(list.next_expiry(), None);
        assert!(list.contains("a"));
    }

    #[test]
    fn test_staggered_highlights() {
        let mut list = list();
        let start = Utc::now();
        list.apply_insert(bookmark("a"), start);
        list.apply_insert(bookmark("b"), start + Duration::milliseconds(1000));

        list.expire_highlights(start + Duration::milliseconds(1600));

        assert!(!list.is_new("a"));
        assert!(list.is_new("b"));
    }

    #[test]
    fn test_delete_drops_highlight() {
        let mut list = list();
        list.apply_insert(bookmark("a"), Utc::now());
        list.apply_delete("a");
        assert_eq!(list.highlighted(), 0);
    }

    #[test]
    fn test_replace_keeps_highlights_of_surviving_rows() {
        let mut list = list();
        let now = Utc::now();
        list.apply_insert(bookmark("a"), now);
        list.apply_insert(bookmark("b"), now);

        list.replace_all(vec![bookmark("b")]);

        assert!(list.is_new("b"));
        assert!(!list.is_new("a"));
    }
}
