//! LRU cache for metric tree pages.
//!
//! A bounded cache sitting in front of the page file. Pages enter the cache
//! on first access and leave it in least-recently-used order; evicting a
//! dirty page hands it back to the caller for write-back. Eviction order is
//! deterministic under identical operation sequences, which keeps the
//! I/O-access counter reproducible.

use std::collections::HashMap;
use std::collections::VecDeque;

use super::mtree_types::{Node, PageId};

/// A cached page with its data and dirty flag
struct CachedPage {
    node: Node,
    dirty: bool,
}

/// Bounded LRU cache for node pages. Capacity is measured in pages.
pub struct PageCache {
    pages: HashMap<PageId, CachedPage>,
    /// Recency order (front = oldest, back = newest)
    recency: VecDeque<PageId>,
    max_pages: usize,
}

impl PageCache {
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: HashMap::new(),
            recency: VecDeque::new(),
            max_pages,
        }
    }

    /// Returns the cached node and refreshes its recency, or `None` on a miss.
    pub fn lookup(&mut self, page_id: PageId) -> Option<&Node> {
        if !self.pages.contains_key(&page_id) {
            return None;
        }
        self.touch(page_id);
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Installs a page, evicting the least-recently-used one if the cache is
    /// full. A dirty eviction is returned for the caller to write back; clean
    /// evictions are dropped silently. Reinstalling a dirty page keeps it
    /// dirty.
    pub fn install(&mut self, page_id: PageId, node: Node, dirty: bool) -> Option<(PageId, Node)> {
        let mut write_back = None;
        if !self.pages.contains_key(&page_id) && self.pages.len() >= self.max_pages {
            while let Some(victim) = self.recency.pop_front() {
                if let Some(cached) = self.pages.remove(&victim) {
                    if cached.dirty {
                        write_back = Some((victim, cached.node));
                    }
                    break;
                }
            }
        }

        let dirty = dirty || self.pages.get(&page_id).is_some_and(|c| c.dirty);
        if self.pages.insert(page_id, CachedPage { node, dirty }).is_some() {
            self.recency.retain(|&id| id != page_id);
        }
        self.recency.push_back(page_id);
        write_back
    }

    /// Hands out every dirty page in recency order (oldest first) and marks
    /// them clean. Used when flushing.
    pub fn take_dirty(&mut self) -> Vec<(PageId, Node)> {
        let mut dirty_pages = Vec::new();
        for &page_id in self.recency.iter() {
            if let Some(cached) = self.pages.get_mut(&page_id) {
                if cached.dirty {
                    cached.dirty = false;
                    dirty_pages.push((page_id, cached.node.clone()));
                }
            }
        }
        dirty_pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains_key(&page_id)
    }

    /// Drops every cached page. Flush first if dirty pages matter.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.recency.clear();
    }

    fn touch(&mut self, page_id: PageId) {
        self.recency.retain(|&id| id != page_id);
        self.recency.push_back(page_id);
    }
}
