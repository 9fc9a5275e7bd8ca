use std::error::Error;
use std::io;

use crate::object::ObjNr;

#[derive(Debug, Snafu)]
pub enum PdfError {
    // Syntax / lexing
    #[snafu(display("Unexpected end of file"))]
    EOF,

    #[snafu(display("Error parsing from string: {}", source))]
    Parse { source: Box<dyn Error> },

    #[snafu(display("Invalid UTF-8: {}", source))]
    Utf8 { source: Box<dyn Error> },

    #[snafu(display("Unexpected token '{}' at {} - expected '{}'", lexeme, pos, expected))]
    UnexpectedLexeme { pos: usize, lexeme: String, expected: &'static str },

    #[snafu(display("Expecting an object, encountered {} at pos {}", first_lexeme, pos))]
    UnknownType { pos: usize, first_lexeme: String },

    #[snafu(display("Hex decode error. Position {}, bytes {:?}", pos, bytes))]
    HexDecode { pos: usize, bytes: [u8; 2] },

    #[snafu(display("Nesting deeper than the parser supports"))]
    MaxDepth,

    // File structure
    #[snafu(display("PDF header not found"))]
    BadHeader,

    #[snafu(display("Invalid cross-reference table: {}", msg))]
    BadXref { msg: String },

    #[snafu(display("Entry {} in xref table unspecified", id))]
    UnspecifiedXRefEntry { id: ObjNr },

    #[snafu(display("Tried to dereference free object nr {}", obj_nr))]
    FreeObject { obj_nr: ObjNr },

    #[snafu(display("Tried to dereference non-existing object nr {}", obj_nr))]
    NullRef { obj_nr: ObjNr },

    #[snafu(display("Bare reference where a resolved object is required: {}", msg))]
    BadReference { msg: String },

    // Dictionary shape
    #[snafu(display("Field /{} is missing in dictionary for type {}", field, typ))]
    MissingEntry { typ: &'static str, field: String },

    #[snafu(display("Expected to find value {} for key {}. Found {} instead", value, key, found))]
    KeyValueMismatch { key: String, value: String, found: String },

    #[snafu(display("Expected primitive {}, found primitive {} instead", expected, found))]
    UnexpectedPrimitive { expected: &'static str, found: &'static str },

    // Document structure
    #[snafu(display("Document catalog is not a dictionary ({})", found))]
    BadCatalog { found: &'static str },

    #[snafu(display("Page tree node is neither /Page nor /Pages ({})", found))]
    BadPageNode { found: String },

    #[snafu(display("Outline siblings form a cycle"))]
    CircularOutline,

    #[snafu(display("Page out of bounds ({}/{})", page_nr, max))]
    PageOutOfBounds { page_nr: usize, max: usize },

    // Encryption
    #[snafu(display("The document is encrypted and no password has been accepted"))]
    NeedsPassword,

    #[snafu(display("Invalid password"))]
    InvalidPassword,

    #[snafu(display("Unsupported encryption: {}", msg))]
    UnsupportedEncryption { msg: String },

    // Writer
    #[snafu(display("Unresolved reference reached the writer"))]
    UnresolvedReference,

    #[snafu(display("Form field /P points at a page the writer does not contain"))]
    FormPageOutsideWriter,

    #[snafu(display("IO Error"))]
    Io { source: io::Error },

    #[snafu(display("{}", msg))]
    Other { msg: String },
}

pub type Result<T, E = PdfError> = std::result::Result<T, E>;

impl From<io::Error> for PdfError {
    fn from(source: io::Error) -> PdfError {
        PdfError::Io { source }
    }
}
impl From<String> for PdfError {
    fn from(msg: String) -> PdfError {
        PdfError::Other { msg }
    }
}

macro_rules! err_from {
    ($($st:ty),* => $variant:ident) => (
        $(
            impl From<$st> for PdfError {
                fn from(e: $st) -> PdfError {
                    PdfError::$variant { source: e.into() }
                }
            }
        )*
    )
}
err_from!(std::str::Utf8Error, std::string::FromUtf8Error => Utf8);
err_from!(std::num::ParseIntError, std::num::ParseFloatError => Parse);

macro_rules! err {
    ($e: expr) => ({
        return Err($e);
    })
}
macro_rules! bail {
    ($($t:tt)*) => {
        err!($crate::PdfError::Other { msg: format!($($t)*) })
    }
}
