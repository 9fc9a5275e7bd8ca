use crate::error::*;
use crate::parser::lexer::Lexer;

use std::ops::{Deref, Range, RangeFrom, RangeFull, RangeTo};

/// A seekable, read-only byte source the parser draws from. Blanket-implemented
/// for anything that derefs to a byte slice (`Vec<u8>`, `&[u8]`, ...).
pub trait Backend: Sized {
    fn read<T: IndexRange>(&self, range: T) -> Result<&[u8]>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the offset of the `%PDF-` header. Viewers expect the header
    /// within the first 1 KiB of the file, so that is how far we look.
    fn locate_start_offset(&self) -> Result<usize> {
        const HEADER: &[u8] = b"%PDF-";
        let buf = self.read(..std::cmp::min(1024, self.len()))?;
        buf.windows(HEADER.len())
            .position(|window| window == HEADER)
            .ok_or(PdfError::BadHeader)
    }

    /// Returns the value of `startxref` near the end of the file.
    fn locate_xref_offset(&self) -> Result<usize> {
        let mut lexer = Lexer::new(self.read(..)?);
        lexer.set_pos_from_end(0);
        lexer.seek_substr_back(b"startxref")?;
        lexer.next()?.to::<usize>()
    }
}

impl<T> Backend for T
where
    T: Deref<Target = [u8]>,
{
    fn read<R: IndexRange>(&self, range: R) -> Result<&[u8]> {
        let r = range.to_range(self.len())?;
        Ok(&self[r])
    }
    fn len(&self) -> usize {
        (**self).len()
    }
}

/// `IndexRange` is implemented by Rust's built-in range types, produced
/// by range syntax like `..`, `a..`, `..b` or `c..d`.
pub trait IndexRange {
    /// Start index (inclusive)
    fn start(&self) -> Option<usize>;
    /// End index (exclusive)
    fn end(&self) -> Option<usize>;

    fn to_range(&self, len: usize) -> Result<Range<usize>> {
        match (self.start(), self.end()) {
            (None, None) => Ok(0..len),
            (Some(start), None) if start <= len => Ok(start..len),
            (None, Some(end)) if end <= len => Ok(0..end),
            (Some(start), Some(end)) if start <= end && end <= len => Ok(start..end),
            _ => Err(PdfError::EOF),
        }
    }
}

impl IndexRange for RangeFull {
    fn start(&self) -> Option<usize> {
        None
    }
    fn end(&self) -> Option<usize> {
        None
    }
}
impl IndexRange for RangeFrom<usize> {
    fn start(&self) -> Option<usize> {
        Some(self.start)
    }
    fn end(&self) -> Option<usize> {
        None
    }
}
impl IndexRange for RangeTo<usize> {
    fn start(&self) -> Option<usize> {
        None
    }
    fn end(&self) -> Option<usize> {
        Some(self.end)
    }
}
impl IndexRange for Range<usize> {
    fn start(&self) -> Option<usize> {
        Some(self.start)
    }
    fn end(&self) -> Option<usize> {
        Some(self.end)
    }
}
