use serde::{Deserialize, Serialize};

/// Upper bound on any page size.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Offset pagination request; pages start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
	pub page: u32,
	pub limit: u32,
}

impl PageRequest {
	/// Normalize caller input: page 0 becomes 1, limit is clamped to `1..=MAX_PAGE_LIMIT`.
	pub fn new(page: Option<u32>, limit: Option<u32>, default_limit: u32) -> Self {
		Self {
			page: page.unwrap_or(1).max(1),
			limit: limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_LIMIT),
		}
	}

	pub fn offset(&self) -> u64 {
		u64::from(self.page - 1) * u64::from(self.limit)
	}

	/// Slice an already ordered collection. Out-of-range pages are empty.
	pub fn slice<T: Clone>(&self, all: &[T]) -> Vec<T> {
		let start = usize::try_from(self.offset()).unwrap_or(usize::MAX);
		all.iter().skip(start).take(self.limit as usize).cloned().collect()
	}
}

impl Default for PageRequest {
	fn default() -> Self {
		Self::new(None, None, DEFAULT_PAGE_LIMIT)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
	pub page: u32,
	pub limit: u32,
	pub total: u64,
	pub total_pages: u32,
	pub has_next: bool,
	pub has_prev: bool,
}

impl PageInfo {
	pub fn new(req: PageRequest, total: u64) -> Self {
		let total_pages = total.div_ceil(u64::from(req.limit));
		let total_pages = u32::try_from(total_pages).unwrap_or(u32::MAX);
		Self {
			page: req.page,
			limit: req.limit,
			total,
			total_pages,
			has_next: req.page < total_pages,
			has_prev: req.page > 1,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
	pub items: Vec<T>,
	pub info: PageInfo,
}

impl<T> Page<T> {
	pub fn new(items: Vec<T>, req: PageRequest, total: u64) -> Self {
		Self {
			items,
			info: PageInfo::new(req, total),
		}
	}

	pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
		Page {
			items: self.items.into_iter().map(f).collect(),
			info: self.info,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_is_normalized() {
		let req = PageRequest::new(Some(0), Some(1000), 20);
		assert_eq!(req.page, 1);
		assert_eq!(req.limit, MAX_PAGE_LIMIT);

		let req = PageRequest::new(None, Some(0), 20);
		assert_eq!(req.limit, 1);
		assert_eq!(PageRequest::new(Some(3), Some(10), 20).offset(), 20);
	}

	#[test]
	fn out_of_range_page_is_empty() {
		let all: Vec<u32> = (0..25).collect();
		let req = PageRequest::new(Some(3), Some(10), 20);
		assert_eq!(req.slice(&all), vec![20, 21, 22, 23, 24]);

		let req = PageRequest::new(Some(9), Some(10), 20);
		assert!(req.slice(&all).is_empty());

		let info = PageInfo::new(req, 25);
		assert_eq!(info.total_pages, 3);
		assert!(!info.has_next);
		assert!(info.has_prev);
	}

	#[test]
	fn empty_collection_has_zero_pages() {
		let info = PageInfo::new(PageRequest::default(), 0);
		assert_eq!(info.total_pages, 0);
		assert!(!info.has_next);
		assert!(!info.has_prev);
	}

	proptest::proptest! {
		#[test]
		fn pages_cover_everything_once(len in 0usize..300, limit in proptest::option::of(0u32..150)) {
			let all: Vec<usize> = (0..len).collect();
			let first = PageRequest::new(None, limit, DEFAULT_PAGE_LIMIT);
			proptest::prop_assert!((1..=MAX_PAGE_LIMIT).contains(&first.limit));

			let info = PageInfo::new(first, len as u64);
			let mut seen = Vec::new();
			for page in 1..=info.total_pages {
				let req = PageRequest::new(Some(page), limit, DEFAULT_PAGE_LIMIT);
				let chunk = req.slice(&all);
				proptest::prop_assert!(!chunk.is_empty());
				seen.extend(chunk);
			}
			proptest::prop_assert_eq!(seen, all);
		}
	}
}
