mod page_flags;
pub use page_flags::PageFlags;

mod page_offset;
pub use page_offset::PageOffset;

mod page_range;
pub use page_range::PageRange;
