use std::collections::BTreeMap;

use crate::PageNo;
use crate::error::EfsError;
use crate::layout::Fragment;

/// In-memory index of the free regions of the filesystem, ordered by
/// ascending page index. Regions are kept maximal: releasing an extent
/// coalesces it with both neighbors. Rebuilt from the on-disk free-space
/// list at mount; lives for the session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeSpaceTable {
    /// region start page -> region length in pages
    regions: BTreeMap<PageNo, u64>,
}

impl FreeSpaceTable {
    pub fn new() -> FreeSpaceTable {
        FreeSpaceTable::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total free pages across all regions.
    pub fn total_free(&self) -> u64 {
        self.regions.values().sum()
    }

    /// The free regions in ascending page order.
    pub fn regions(&self) -> impl Iterator<Item = Fragment> + '_ {
        self.regions.iter().map(|(&location, &length)| Fragment { location, length })
    }

    /// Carve `pages` pages out of free space.
    ///
    /// With `prefer_contiguous` the result is a single extent found by
    /// first-fit over the ordered list; fails when no region is large
    /// enough. Otherwise whole regions are consumed greedily from
    /// largest to smallest (ties broken by the lower page index) until
    /// the request is met, splitting the last region taken.
    pub fn allocate(&mut self, pages: u64, prefer_contiguous: bool) -> Result<Vec<Fragment>, EfsError> {
        if pages == 0 {
            return Ok(Vec::new());
        }

        if prefer_contiguous {
            let found = self
                .regions
                .iter()
                .find(|&(_, &len)| len >= pages)
                .map(|(&page, &len)| (page, len));
            let (page, len) = found.ok_or(EfsError::NoSpace(pages))?;

            self.regions.remove(&page);
            if len > pages {
                self.regions.insert(page + pages, len - pages);
            }
            return Ok(vec![Fragment { location: page, length: pages }]);
        }

        if self.total_free() < pages {
            return Err(EfsError::NoSpace(pages));
        }

        let mut by_size: Vec<(u64, PageNo)> =
            self.regions.iter().map(|(&page, &len)| (len, page)).collect();
        by_size.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut taken = Vec::new();
        let mut remaining = pages;
        for (len, page) in by_size {
            if remaining == 0 {
                break;
            }
            self.regions.remove(&page);
            if len <= remaining {
                taken.push(Fragment { location: page, length: len });
                remaining -= len;
            } else {
                self.regions.insert(page + remaining, len - remaining);
                taken.push(Fragment { location: page, length: remaining });
                remaining = 0;
            }
        }
        Ok(taken)
    }

    /// Take up to `max` pages from the front of the region that starts
    /// exactly at `page`. Returns the extent consumed, or None when no
    /// region starts there. This is the grow-in-place path of append.
    pub fn allocate_at(&mut self, page: PageNo, max: u64) -> Option<Fragment> {
        if max == 0 {
            return None;
        }
        let len = self.regions.remove(&page)?;
        let take = len.min(max);
        if len > take {
            self.regions.insert(page + take, len - take);
        }
        Some(Fragment { location: page, length: take })
    }

    /// Merge an extent back into free space, coalescing with both
    /// neighbors so that no two regions end up adjacent.
    pub fn release(&mut self, extent: Fragment) {
        if extent.length == 0 {
            return;
        }

        let mut location = extent.location;
        let mut length = extent.length;

        if let Some((&prev_page, &prev_len)) = self.regions.range(..location).next_back() {
            debug_assert!(prev_page + prev_len <= location);
            if prev_page + prev_len == location {
                self.regions.remove(&prev_page);
                location = prev_page;
                length += prev_len;
            }
        }

        if let Some(next_len) = self.regions.remove(&extent.end()) {
            length += next_len;
        }

        debug_assert!(
            self.regions.range(location..location + length).next().is_none(),
            "released extent overlaps the free list"
        );
        self.regions.insert(location, length);
    }

    pub fn release_all(&mut self, extents: impl IntoIterator<Item = Fragment>) {
        for extent in extents {
            self.release(extent);
        }
    }
}
