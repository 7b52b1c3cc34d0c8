//! Page map acceleration for breakpoint lookups.
//!
//! The day axis of a calendar is cut into fixed pages of `page_size` days.
//! `offsets[p]` is the number of breakpoints that start before page `p`, so
//! the breakpoints that can bound a day in page `p` all sit in
//! `offsets[p]..offsets[p + 1]`. A lookup binary-searches that window only.

use crate::DayNumber;

/// Page size for calendars denser than one breakpoint per week.
pub const PAGE_SIZE_DENSE: i32 = 16;

/// Page size for weekly and sparser calendars.
pub const PAGE_SIZE_SPARSE: i32 = 32;

/// Pick the page size for a calendar spanning `first..=last` with `count` entries.
pub fn page_size_for(first: DayNumber, last: DayNumber, count: usize) -> i32 {
    let weeks = (i64::from(last.get()) - i64::from(first.get())) as f64 / 7.0;
    if count as f64 > weeks {
        PAGE_SIZE_DENSE
    } else {
        PAGE_SIZE_SPARSE
    }
}

/// Pages of `page_size` days touched by `first..=last`.
pub fn page_count(first: DayNumber, last: DayNumber, page_size: i32) -> usize {
    let first_page = i64::from(first.get().div_euclid(page_size));
    let last_page = i64::from(last.get().div_euclid(page_size));
    (last_page - first_page).max(0) as usize + 1
}

/// Offsets in the page map of a calendar spanning `first..=last` with
/// `count` breakpoints.
pub fn page_map_len(first: DayNumber, last: DayNumber, count: usize) -> usize {
    page_count(first, last, page_size_for(first, last, count)) + 1
}

/// Page map of one calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMap {
    pub page_size: i32,
    /// Page number (relative to day 0) of the first breakpoint.
    pub first_page: i32,
    /// `pages + 1` entries; the last one equals the breakpoint count.
    pub offsets: Vec<u32>,
}

impl PageMap {
    /// Build the page map of an ascending breakpoint sequence.
    ///
    /// Returns `None` for an empty sequence.
    pub fn build(days: &[DayNumber]) -> Option<Self> {
        let first = *days.first()?;
        let last = *days.last()?;
        let page_size = page_size_for(first, last, days.len());
        let first_page = first.get().div_euclid(page_size);
        let pages = page_count(first, last, page_size);

        let mut offsets = Vec::with_capacity(pages + 1);
        let mut index = 0usize;
        for page in 0..=pages {
            let page_start = (i64::from(first_page) + page as i64) * i64::from(page_size);
            while index < days.len() && i64::from(days[index].get()) < page_start {
                index += 1;
            }
            offsets.push(index as u32);
        }

        Some(Self {
            page_size,
            first_page,
            offsets,
        })
    }

    /// Number of pages covered (one less than the offset count).
    pub fn page_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Search window for `day`; see [`page_window`].
    pub fn window(&self, day: DayNumber) -> (usize, usize) {
        page_window(
            self.page_size,
            self.first_page,
            self.page_count(),
            |page| self.offsets[page] as usize,
            day,
        )
    }
}

/// Range `(lo, hi)` that contains the count of breakpoints `<= day`.
///
/// `offset_at(p)` must return the page map entry `p` for `p <= page_count`.
pub fn page_window(
    page_size: i32,
    first_page: i32,
    page_count: usize,
    offset_at: impl Fn(usize) -> usize,
    day: DayNumber,
) -> (usize, usize) {
    let page = i64::from(day.get().div_euclid(page_size)) - i64::from(first_page);
    if page < 0 {
        return (0, 0);
    }
    let page = page as usize;
    if page >= page_count {
        let len = offset_at(page_count);
        return (len, len);
    }
    (offset_at(page), offset_at(page + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn days(values: &[i32]) -> Vec<DayNumber> {
        values.iter().copied().map(DayNumber::new).collect()
    }

    #[test]
    fn test_page_size_by_density() {
        // Daily calendar over 10 days.
        assert_eq!(
            page_size_for(DayNumber::new(0), DayNumber::new(9), 10),
            PAGE_SIZE_DENSE
        );
        // Monthly calendar over a year.
        assert_eq!(
            page_size_for(DayNumber::new(0), DayNumber::new(334), 12),
            PAGE_SIZE_SPARSE
        );
    }

    #[test]
    fn test_build_empty_is_none() {
        assert!(PageMap::build(&[]).is_none());
    }

    #[test]
    fn test_build_offsets() {
        // Sparse: page size 32.
        let map = PageMap::build(&days(&[0, 40, 100])).expect("non-empty");
        assert_eq!(map.page_size, PAGE_SIZE_SPARSE);
        assert_eq!(map.first_page, 0);
        // pages: [0,32) [32,64) [64,96) [96,128)
        assert_eq!(map.offsets, vec![0, 1, 2, 2, 3]);
        assert_eq!(map.page_count(), 4);
    }

    #[test]
    fn test_page_map_len_follows_span_not_count() {
        // Two breakpoints eight thousand years apart.
        let first = DayNumber::new(-719_162);
        let last = DayNumber::new(2_932_896);
        let len = page_map_len(first, last, 2);
        assert_eq!(len, page_count(first, last, PAGE_SIZE_SPARSE) + 1);
        assert!(len > 100_000);
        assert_eq!(page_map_len(DayNumber::new(0), DayNumber::new(0), 1), 2);
    }

    #[test]
    fn test_window_outside_pages() {
        let map = PageMap::build(&days(&[100, 140, 200])).expect("non-empty");
        assert_eq!(map.window(DayNumber::new(-5)), (0, 0));
        assert_eq!(map.window(DayNumber::new(10_000)), (3, 3));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// The page window always contains the exact count of breakpoints <= day.
        #[test]
        fn prop_window_contains_partition_point(
            raw in prop::collection::btree_set(-2000i32..2000, 1..60),
            target in -2500i32..2500,
        ) {
            let sorted: Vec<DayNumber> = raw.into_iter().map(DayNumber::new).collect();
            let map = PageMap::build(&sorted).expect("non-empty");
            let day = DayNumber::new(target);
            let exact = sorted.partition_point(|d| *d <= day);
            let (lo, hi) = map.window(day);
            prop_assert!(lo <= exact && exact <= hi, "window {:?} misses {}", (lo, hi), exact);
            prop_assert_eq!(*map.offsets.last().expect("offsets"), sorted.len() as u32);
        }
    }
}
