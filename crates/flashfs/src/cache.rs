//! LRU read cache of whole logical pages.
//!
//! Holds clean copies only. Any write or erase that overlaps a cached page
//! evicts it, so a hit always equals the media content.

use std::num::NonZeroUsize;

use flashfs_types::PageIx;
use lru::LruCache;

pub(crate) struct PageCache {
    pages: Option<LruCache<PageIx, Box<[u8]>>>,
}

impl PageCache {
    /// A cache of `capacity` pages; zero disables caching.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pages: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub(crate) const fn is_enabled(&self) -> bool {
        self.pages.is_some()
    }

    pub(crate) fn get(&mut self, pix: PageIx) -> Option<&[u8]> {
        self.pages.as_mut()?.get(&pix).map(|page| &**page)
    }

    pub(crate) fn insert(&mut self, pix: PageIx, page: Box<[u8]>) {
        if let Some(pages) = self.pages.as_mut() {
            pages.put(pix, page);
        }
    }

    /// Evict pages `first..=last`.
    pub(crate) fn invalidate(&mut self, first: PageIx, last: PageIx) {
        let Some(pages) = self.pages.as_mut() else {
            return;
        };
        if pages.is_empty() {
            return;
        }
        if usize::from(last - first) >= pages.len() {
            // Fewer cached pages than the range: sweep the cache instead.
            let doomed: Vec<PageIx> = pages
                .iter()
                .map(|(&pix, _)| pix)
                .filter(|pix| (first..=last).contains(pix))
                .collect();
            for pix in doomed {
                pages.pop(&pix);
            }
        } else {
            for pix in first..=last {
                pages.pop(&pix);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        if let Some(pages) = self.pages.as_mut() {
            pages.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pages.as_ref().map_or(0, LruCache::len)
    }
}

#[cfg(test)]
mod tests {
    use super::PageCache;

    fn page(fill: u8) -> Box<[u8]> {
        vec![fill; 8].into_boxed_slice()
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = PageCache::new(2);
        cache.insert(1, page(1));
        cache.insert(2, page(2));
        assert_eq!(cache.get(1).map(|p| p[0]), Some(1));
        cache.insert(3, page(3));
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn invalidate_drops_overlapping_pages() {
        let mut cache = PageCache::new(8);
        for pix in 0..6 {
            cache.insert(pix, page(pix as u8));
        }
        cache.invalidate(2, 3);
        assert_eq!(cache.len(), 4);
        assert!(cache.get(2).is_none());
        cache.invalidate(0, 1000);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn zero_capacity_disables() {
        let mut cache = PageCache::new(0);
        assert!(!cache.is_enabled());
        cache.insert(1, page(1));
        assert!(cache.get(1).is_none());
    }
}
