//! Materializing raw objects from bytes, and the `Parser` facade that the
//! reader resolves references through.

pub mod lexer;

use self::lexer::{HexStringLexer, Lexer, StringLexer};
use crate::backend::Backend;
use crate::crypt::Crypter;
use crate::error::*;
use crate::object::{
    Dictionary, GenNr, IndirectObject, ObjNr, PdfStream, PdfString, PlainRef, Primitive,
};
use crate::xref::{parse_xref_table_and_trailer, XRef, XRefTable};

use std::cell::RefCell;
use std::collections::HashMap;

const MAX_DEPTH: usize = 20;
const MAX_ID: usize = 1_000_000;

/// Resolution of references during parsing (needed for a stream whose
/// `/Length` is indirect).
pub trait Resolve {
    fn resolve_ref(&self, r: PlainRef) -> Result<Primitive>;
}

pub struct NoResolve;
impl Resolve for NoResolve {
    fn resolve_ref(&self, r: PlainRef) -> Result<Primitive> {
        Err(PdfError::BadReference {
            msg: format!("no resolver available for {} {} R", r.id, r.gen),
        })
    }
}

pub fn parse(data: &[u8], r: &impl Resolve) -> Result<Primitive> {
    parse_with_lexer(&mut Lexer::new(data), r)
}

/// Parses the object starting at the current position of `lexer`. On failure
/// the lexer position is restored.
pub fn parse_with_lexer(lexer: &mut Lexer, r: &impl Resolve) -> Result<Primitive> {
    let pos = lexer.get_pos();
    match parse_at_depth(lexer, r, MAX_DEPTH) {
        Ok(p) => Ok(p),
        Err(e) => {
            lexer.set_pos(pos);
            Err(e)
        }
    }
}

fn parse_dictionary(lexer: &mut Lexer, r: &impl Resolve, max_depth: usize) -> Result<Dictionary> {
    let mut dict = Dictionary::new();
    loop {
        // Expect a name (then an object), or the '>>' delimiter
        let token = lexer.next()?;
        if token.starts_with(b"/") {
            let key = decode_name(&token.reslice(1..))?;
            let obj = parse_at_depth(lexer, r, max_depth)?;
            dict.insert(key, obj);
        } else if token.equals(b">>") {
            break;
        } else {
            err!(PdfError::UnexpectedLexeme {
                pos: lexer.get_pos(),
                lexeme: token.to_string(),
                expected: "/ or >>",
            });
        }
    }
    Ok(dict)
}

fn parse_stream_body(dict: Dictionary, lexer: &mut Lexer, r: &impl Resolve) -> Result<Primitive> {
    lexer.next_stream()?;

    let length = match dict.get("Length") {
        Some(&Primitive::Integer(n)) if n >= 0 => n as usize,
        Some(&Primitive::Reference(len_ref)) => int_of(&r.resolve_ref(len_ref)?)?,
        Some(other) => err!(PdfError::UnexpectedPrimitive {
            expected: "unsigned Integer or Reference",
            found: other.get_debug_name(),
        }),
        None => err!(PdfError::MissingEntry {
            typ: "<Stream>",
            field: "Length".into(),
        }),
    };

    let data = lexer.read_n(length);
    if data.len() != length {
        err!(PdfError::EOF);
    }
    lexer.next_expect("endstream")?;

    Ok(Primitive::Stream(PdfStream::new(dict, data.to_vec())))
}

fn int_of(p: &Primitive) -> Result<usize> {
    match p {
        Primitive::Indirect(obj) => obj.inner.borrow().as_usize(),
        p => p.as_usize(),
    }
}

fn decode_name(raw: &lexer::Substr) -> Result<String> {
    let bytes = raw.as_slice();
    if !bytes.contains(&b'#') {
        return Ok(std::str::from_utf8(bytes)?.into());
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    while let Some(idx) = rest.iter().position(|&b| b == b'#') {
        out.extend_from_slice(&rest[..idx]);
        let pair = rest.get(idx + 1..idx + 3).ok_or(PdfError::EOF)?;
        let byte = match (decode_nibble(pair[0]), decode_nibble(pair[1])) {
            (Some(hi), Some(lo)) => hi << 4 | lo,
            _ => err!(PdfError::HexDecode {
                pos: idx,
                bytes: [pair[0], pair[1]],
            }),
        };
        out.push(byte);
        rest = &rest[idx + 3..];
    }
    out.extend_from_slice(rest);
    Ok(String::from_utf8(out)?)
}

fn decode_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_at_depth(lexer: &mut Lexer, r: &impl Resolve, max_depth: usize) -> Result<Primitive> {
    let first_lexeme = lexer.next()?;

    let obj = if first_lexeme.equals(b"<<") {
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let dict = parse_dictionary(lexer, r, max_depth - 1)?;
        // It might just be the dictionary in front of a stream.
        if lexer.peek()?.equals(b"stream") {
            parse_stream_body(dict, lexer, r)?
        } else {
            Primitive::Dictionary(dict)
        }
    } else if first_lexeme.is_integer() {
        // May be an integer, or the start of `obj gen R`
        let pos_bk = lexer.get_pos();
        let mut reference = None;
        if let Ok(second_lexeme) = lexer.next() {
            if second_lexeme.is_integer() && matches!(lexer.next(), Ok(third) if third.equals(b"R")) {
                reference = Some(PlainRef {
                    id: first_lexeme.to::<ObjNr>()?,
                    gen: second_lexeme.to::<GenNr>()?,
                });
            }
        }
        match reference {
            Some(r) => Primitive::Reference(r),
            None => {
                // just a number in a sequence of numbers
                lexer.set_pos(pos_bk);
                Primitive::Integer(first_lexeme.to::<i64>()?)
            }
        }
    } else if first_lexeme.is_real_number() {
        Primitive::Real(first_lexeme.to::<f64>()?)
    } else if first_lexeme.starts_with(b"/") {
        Primitive::Name(decode_name(&first_lexeme.reslice(1..))?)
    } else if first_lexeme.equals(b"[") {
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let mut array = Vec::new();
        loop {
            if lexer.peek()?.equals(b"]") {
                break;
            }
            array.push(parse_at_depth(lexer, r, max_depth - 1)?);
        }
        lexer.next()?; // move past the closing delimiter

        Primitive::Array(array)
    } else if first_lexeme.equals(b"(") {
        let (data, consumed) = StringLexer::new(lexer.get_remaining_slice()).decode()?;
        lexer.offset_pos(consumed);
        Primitive::String(PdfString::new(data))
    } else if first_lexeme.equals(b"<") {
        let (data, consumed) = HexStringLexer::new(lexer.get_remaining_slice()).decode()?;
        lexer.offset_pos(consumed);
        Primitive::String(PdfString::new(data))
    } else if first_lexeme.equals(b"true") {
        Primitive::Boolean(true)
    } else if first_lexeme.equals(b"false") {
        Primitive::Boolean(false)
    } else if first_lexeme.equals(b"null") {
        Primitive::Null
    } else {
        err!(PdfError::UnknownType {
            pos: lexer.get_pos(),
            first_lexeme: first_lexeme.to_string(),
        });
    };

    Ok(obj)
}

/// Parses `obj_nr gen_nr obj ... endobj` starting at the current position,
/// decrypting strings and stream payloads when an authenticated crypter is
/// given, and wraps the result into a node with identity.
pub fn parse_indirect_object(
    lexer: &mut Lexer,
    r: &impl Resolve,
    crypter: Option<&Crypter>,
) -> Result<(PlainRef, Primitive)> {
    let obj_nr = lexer.next()?.to::<ObjNr>()?;
    let gen_nr = lexer.next()?.to::<GenNr>()?;
    lexer.next_expect("obj")?;

    let obj = parse_with_lexer(lexer, r)?;
    lexer.next_expect("endobj")?;

    let id = PlainRef { id: obj_nr, gen: gen_nr };
    let crypter = crypter.filter(|c| c.authenticated);
    let obj = match obj {
        Primitive::Stream(stm) => {
            stm.set_id(id);
            if let Some(c) = crypter {
                c.decrypt_stream(id, &mut stm.dict.borrow_mut(), &mut stm.data.borrow_mut());
            }
            Primitive::Stream(stm)
        }
        mut inner => {
            if let Some(c) = crypter {
                c.decrypt_strings(id, &mut inner);
            }
            Primitive::Indirect(IndirectObject::with_id(id, inner))
        }
    };
    Ok((id, obj))
}

/// The facade the reader drives: xref + trailer, reference resolution with a
/// per-object-number cache, and the optional crypter.
pub struct Parser<B: Backend> {
    backend: B,
    start_offset: usize,
    refs: XRefTable,
    pub trailer: Dictionary,
    pub obj_cache: RefCell<HashMap<ObjNr, Primitive>>,
    pub crypter: Option<Crypter>,
}

impl<B: Backend> Parser<B> {
    pub fn new(backend: B) -> Result<Parser<B>> {
        let start_offset = backend.locate_start_offset()?;
        let (refs, trailer) = read_xref_chain(&backend, start_offset)?;
        let mut parser = Parser {
            backend,
            start_offset,
            refs,
            trailer,
            obj_cache: RefCell::new(HashMap::new()),
            crypter: None,
        };
        parser.load_encrypt_dict()?;
        Ok(parser)
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypter.is_some()
    }

    /// Try to authenticate with the given password. A plaintext document
    /// trivially succeeds.
    pub fn decrypt(&mut self, password: &[u8]) -> bool {
        match self.crypter {
            Some(ref mut crypter) => crypter.authenticate(password),
            None => true,
        }
    }

    /// Resolve a reference to the node it addresses, parsing and caching it
    /// on first use.
    pub fn lookup_by_reference(&self, r: PlainRef) -> Result<Primitive> {
        if let Some(p) = self.obj_cache.borrow().get(&r.id) {
            return Ok(p.clone());
        }
        let obj = match self.refs.get(r.id)? {
            XRef::Raw { pos, .. } => {
                let data = self.backend.read(self.start_offset + pos..)?;
                let mut lexer = Lexer::new(data);
                let (parsed_id, obj) =
                    parse_indirect_object(&mut lexer, self, self.crypter.as_ref())?;
                if parsed_id.id != r.id {
                    err!(PdfError::BadXref {
                        msg: format!(
                            "object {} found at the offset recorded for object {}",
                            parsed_id.id, r.id
                        ),
                    });
                }
                obj
            }
            XRef::Free { .. } => err!(PdfError::FreeObject { obj_nr: r.id }),
            XRef::Invalid => err!(PdfError::NullRef { obj_nr: r.id }),
        };
        self.obj_cache.borrow_mut().insert(r.id, obj.clone());
        Ok(obj)
    }

    /// If `p` is a reference, resolve it; otherwise hand it back.
    pub fn trace(&self, p: &Primitive) -> Result<Primitive> {
        match *p {
            Primitive::Reference(r) => self.lookup_by_reference(r),
            ref p => Ok(p.clone()),
        }
    }

    fn load_encrypt_dict(&mut self) -> Result<()> {
        let encrypt = match self.trailer.get("Encrypt") {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let id0 = self
            .trailer
            .require("Trailer", "ID")?
            .as_array()?
            .first()
            .ok_or(PdfError::MissingEntry { typ: "Trailer", field: "ID".into() })?
            .as_string()?
            .as_bytes()
            .to_vec();

        let (enc_ref, dict) = match encrypt {
            Primitive::Reference(r) => {
                let resolved = self.lookup_by_reference(r)?;
                let dict = resolved.as_indirect()?.inner.borrow().as_dict()?.clone();
                (Some(r), dict)
            }
            Primitive::Dictionary(dict) => (None, dict),
            p => err!(PdfError::UnexpectedPrimitive {
                expected: "Dictionary or Reference",
                found: p.get_debug_name(),
            }),
        };
        let mut crypter = Crypter::from_dict(&dict, id0)?;
        crypter.encrypt_ref = enc_ref;
        self.crypter = Some(crypter);
        Ok(())
    }
}

impl<B: Backend> Resolve for Parser<B> {
    fn resolve_ref(&self, r: PlainRef) -> Result<Primitive> {
        self.lookup_by_reference(r)
    }
}

/// Read the xref table at `startxref` and every table on its `/Prev` chain.
/// The trailer of the newest section is the document trailer.
fn read_xref_chain<B: Backend>(backend: &B, start_offset: usize) -> Result<(XRefTable, Dictionary)> {
    let xref_offset = backend.locate_xref_offset()?;
    let pos = start_offset
        .checked_add(xref_offset)
        .filter(|&p| p < backend.len())
        .ok_or_else(|| PdfError::BadXref {
            msg: "startxref offset outside file bounds".into(),
        })?;

    let mut lexer = Lexer::new(backend.read(pos..)?);
    let (sections, trailer) = parse_xref_table_and_trailer(&mut lexer)?;

    let size = trailer.require("Trailer", "Size")?.as_usize()?;
    if size > MAX_ID {
        err!(PdfError::BadXref { msg: format!("too many objects ({})", size) });
    }
    let mut refs = XRefTable::new(size);
    for section in sections {
        refs.add_entries_from(section);
    }

    let mut prev = trailer.get("Prev").map(|p| p.as_usize()).transpose()?;
    let mut seen = vec![];
    while let Some(prev_offset) = prev {
        if seen.contains(&prev_offset) {
            err!(PdfError::BadXref { msg: "xref /Prev offsets loop".into() });
        }
        seen.push(prev_offset);

        let pos = start_offset
            .checked_add(prev_offset)
            .filter(|&p| p < backend.len())
            .ok_or_else(|| PdfError::BadXref {
                msg: "/Prev offset outside file bounds".into(),
            })?;
        let mut lexer = Lexer::new(backend.read(pos..)?);
        let (sections, prev_trailer) = parse_xref_table_and_trailer(&mut lexer)?;
        for section in sections {
            refs.add_entries_from(section);
        }
        prev = prev_trailer.get("Prev").map(|p| p.as_usize()).transpose()?;
    }

    Ok((refs, trailer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars() {
        assert_eq!(parse(b"42", &NoResolve).unwrap().as_integer().unwrap(), 42);
        assert_eq!(parse(b"-0.5", &NoResolve).unwrap().as_real().unwrap(), -0.5);
        assert!(parse(b"true", &NoResolve).unwrap().as_bool().unwrap());
        assert!(matches!(parse(b"null", &NoResolve).unwrap(), Primitive::Null));
    }

    #[test]
    fn reference_lookahead() {
        let arr = parse(b"[1 2 R 3]", &NoResolve).unwrap();
        let arr = arr.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert!(matches!(arr[0], Primitive::Reference(PlainRef { id: 1, gen: 2 })));
        assert_eq!(arr[1].as_integer().unwrap(), 3);
    }

    #[test]
    fn dict_with_escaped_name() {
        let p = parse(b"<< /Type /Page /A#20B 1 >>", &NoResolve).unwrap();
        let dict = p.as_dict().unwrap();
        assert_eq!(dict.get("Type").unwrap().as_name().unwrap(), "Page");
        assert_eq!(dict.get("A B").unwrap().as_integer().unwrap(), 1);
    }

    #[test]
    fn strings() {
        let p = parse(b"(hey (nested) \\)paren)", &NoResolve).unwrap();
        assert_eq!(p.as_string().unwrap().as_bytes(), b"hey (nested) )paren");
        let p = parse(b"<48 65 6c6C6f>", &NoResolve).unwrap();
        assert_eq!(p.as_string().unwrap().as_bytes(), b"Hello");
    }

    #[test]
    fn indirect_object_with_stream() {
        let data = b"7 0 obj << /Length 5 >> stream\nhello\nendstream endobj";
        let mut lexer = Lexer::new(data);
        let (id, obj) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        assert_eq!(id, PlainRef { id: 7, gen: 0 });
        match obj {
            Primitive::Stream(stm) => {
                assert_eq!(stm.id(), id);
                assert_eq!(&*stm.data.borrow(), b"hello");
            }
            p => panic!("expected stream, got {}", p.get_debug_name()),
        }
    }

    #[test]
    fn indirect_object_wraps_inner() {
        let data = b"3 0 obj << /Kind /Demo >> endobj";
        let mut lexer = Lexer::new(data);
        let (_, obj) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        let obj = obj.as_indirect().unwrap().clone();
        assert_eq!(obj.id().id, 3);
        assert_eq!(
            obj.inner.borrow().as_dict().unwrap().get("Kind").unwrap().as_name().unwrap(),
            "Demo"
        );
    }
}
