#![allow(clippy::len_zero, clippy::should_implement_trait)]

#[macro_use] extern crate snafu;
#[macro_use] extern crate log;

#[macro_use]
pub mod error;
pub mod object;
pub mod backend;
pub mod xref;
pub mod parser;
pub mod crypt;
pub mod reader;
pub mod writer;

pub use crate::error::PdfError;
pub use crate::reader::Reader;
pub use crate::writer::Writer;
