//! The fixed header written once when a heap file is created. Nothing in it
//! ever changes afterwards.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::constants::{CONTINUATION_PAGE_HEADER_SIZE, FIRST_PAGE_HEADER_SIZE, FORMAT_VERSION};

/// `{format_version, page_size, alignment_padding_size}`. The page area
/// starts right after the encoded header plus its padding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeapFileHeader {
    pub page_size: usize,
    pub alignment_padding_size: usize,
}

impl HeapFileHeader {
    /// Version tag + two i32 fields.
    pub const ENCODED_SIZE: usize = 12;

    pub fn new(page_size: usize, alignment_padding_size: usize) -> Result<Self, HeapHeaderError> {
        if page_size <= FIRST_PAGE_HEADER_SIZE || page_size > i32::MAX as usize {
            return Err(HeapHeaderError::InvalidPageSize(page_size as i64));
        }
        if alignment_padding_size > i32::MAX as usize {
            return Err(HeapHeaderError::InvalidPadding(alignment_padding_size as i64));
        }
        Ok(HeapFileHeader {
            page_size,
            alignment_padding_size,
        })
    }

    pub fn serialize(&self, buffer: &mut impl BufMut) {
        buffer.put_u32(FORMAT_VERSION);
        buffer.put_i32(self.page_size as i32);
        buffer.put_i32(self.alignment_padding_size as i32);
    }

    pub fn parse(buffer: &mut impl Buf) -> Result<HeapFileHeader, HeapHeaderError> {
        if buffer.remaining() < Self::ENCODED_SIZE {
            return Err(HeapHeaderError::BufferTooShort(buffer.remaining()));
        }

        let version = buffer.get_u32();
        if version != FORMAT_VERSION {
            return Err(HeapHeaderError::UnsupportedVersion(version));
        }

        let page_size = buffer.get_i32();
        if page_size <= FIRST_PAGE_HEADER_SIZE as i32 {
            return Err(HeapHeaderError::InvalidPageSize(page_size as i64));
        }
        let padding = buffer.get_i32();
        if padding < 0 {
            return Err(HeapHeaderError::InvalidPadding(padding as i64));
        }

        Ok(HeapFileHeader {
            page_size: page_size as usize,
            alignment_padding_size: padding as usize,
        })
    }

    /// Byte offset where the page array begins.
    pub fn page_area_offset(&self) -> u64 {
        (Self::ENCODED_SIZE + self.alignment_padding_size) as u64
    }

    /// Payload bytes that fit on a record's first page.
    pub fn first_page_capacity(&self) -> usize {
        self.page_size - FIRST_PAGE_HEADER_SIZE
    }

    /// Payload bytes that fit on a continuation page.
    pub fn continuation_page_capacity(&self) -> usize {
        self.page_size - CONTINUATION_PAGE_HEADER_SIZE
    }

    /// How many pages a record of `length` payload bytes occupies.
    pub fn pages_for_record(&self, length: usize) -> usize {
        if length <= self.first_page_capacity() {
            return 1;
        }
        let rest = length - self.first_page_capacity();
        let per_page = self.continuation_page_capacity();
        1 + (rest + per_page - 1) / per_page
    }
}

#[derive(Debug, Error)]
pub enum HeapHeaderError {
    #[error("Buffer of {0} bytes is too short for a header")]
    BufferTooShort(usize),
    #[error("Invalid page size {0}")]
    InvalidPageSize(i64),
    #[error("Invalid alignment padding {0}")]
    InvalidPadding(i64),
    #[error("Unsupported format version {0:#010x}")]
    UnsupportedVersion(u32),
}
