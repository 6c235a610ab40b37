//! Segment iterators
//!
//! Each iterator keeps an explicit cursor (next bucket, next node) and walks
//! successors through parent links, so no stack is held between calls.
//! Calling `keys()`/`values()`/`entries()` again starts over.

use crate::codec::Codec;
use crate::error::Result;
use crate::malloc::{Offset, NIL};

use super::format::KeyFormat;
use super::segment::Segment;

/// Position of an in-order walk across all buckets
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    /// Next bucket to open once `next` runs out
    pub bucket: usize,
    pub next: Offset,
}

impl Cursor {
    fn start() -> Self {
        Self {
            bucket: 0,
            next: NIL,
        }
    }
}

/// Entries of a segment as `(key, value)` pairs
pub struct Entries<'a, F: KeyFormat, VC: Codec> {
    segment: &'a Segment<F, VC>,
    cursor: Cursor,
}

impl<'a, F: KeyFormat, VC: Codec> Entries<'a, F, VC> {
    pub(crate) fn new(segment: &'a Segment<F, VC>) -> Self {
        Self {
            segment,
            cursor: Cursor::start(),
        }
    }
}

impl<F: KeyFormat, VC: Codec> Iterator for Entries<'_, F, VC> {
    type Item = Result<(F::Key, VC::Item)>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.segment.next_node(&mut self.cursor)?;
        let entry = self
            .segment
            .key_at(node)
            .and_then(|key| Ok((key, self.segment.value_at(node)?)));
        Some(entry)
    }
}

/// Keys of a segment; values are never decoded
pub struct Keys<'a, F: KeyFormat, VC: Codec> {
    segment: &'a Segment<F, VC>,
    cursor: Cursor,
}

impl<'a, F: KeyFormat, VC: Codec> Keys<'a, F, VC> {
    pub(crate) fn new(segment: &'a Segment<F, VC>) -> Self {
        Self {
            segment,
            cursor: Cursor::start(),
        }
    }
}

impl<F: KeyFormat, VC: Codec> Iterator for Keys<'_, F, VC> {
    type Item = Result<F::Key>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.segment.next_node(&mut self.cursor)?;
        Some(self.segment.key_at(node))
    }
}

/// Values of a segment
pub struct Values<'a, F: KeyFormat, VC: Codec> {
    segment: &'a Segment<F, VC>,
    cursor: Cursor,
}

impl<'a, F: KeyFormat, VC: Codec> Values<'a, F, VC> {
    pub(crate) fn new(segment: &'a Segment<F, VC>) -> Self {
        Self {
            segment,
            cursor: Cursor::start(),
        }
    }
}

impl<F: KeyFormat, VC: Codec> Iterator for Values<'_, F, VC> {
    type Item = Result<VC::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.segment.next_node(&mut self.cursor)?;
        Some(self.segment.value_at(node))
    }
}
