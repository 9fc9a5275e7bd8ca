//! The dynamic PDF object model.
//!
//! A document is a graph of [`Primitive`] nodes. Container slots hold their
//! children by value, except for indirect objects and streams, which are
//! shared `Rc` handles so that the same node can be reached from several
//! places in the graph. Identity (used by every visited-set in this crate)
//! is the address of that allocation, never structural equality.

use crate::error::*;

use indexmap::IndexMap;
use itertools::Itertools;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::{fmt, io};

pub type ObjNr = u64;
pub type GenNr = u16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PlainRef {
    pub id: ObjNr,
    pub gen: GenNr,
}

/// Identity of a heap-allocated graph node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(usize);

pub type ObjRc = Rc<IndirectObject>;
pub type StreamRc = Rc<PdfStream>;

#[derive(Clone, Debug)]
pub enum Primitive {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Name(String),
    String(PdfString),
    Array(Vec<Primitive>),
    Dictionary(Dictionary),
    Reference(PlainRef),
    Indirect(ObjRc),
    Stream(StreamRc),
}

/// An object with identity: wraps exactly one inner primitive.
pub struct IndirectObject {
    id: Cell<PlainRef>,
    pub inner: RefCell<Primitive>,
}

impl IndirectObject {
    pub fn new(inner: Primitive) -> ObjRc {
        IndirectObject::with_id(PlainRef { id: 0, gen: 0 }, inner)
    }
    pub fn with_id(id: PlainRef, inner: Primitive) -> ObjRc {
        Rc::new(IndirectObject {
            id: Cell::new(id),
            inner: RefCell::new(inner),
        })
    }
    pub fn id(&self) -> PlainRef {
        self.id.get()
    }
    pub fn set_id(&self, id: PlainRef) {
        self.id.set(id);
    }
    /// Stable for the node's lifetime: the address of the shared allocation.
    pub fn node_id(&self) -> NodeId {
        NodeId(self as *const IndirectObject as usize)
    }
    pub fn serialize_body(&self, out: &mut impl io::Write) -> Result<()> {
        self.inner.borrow().serialize(out)
    }
}

// The graph is cyclic; printing the inner object would not terminate.
impl fmt::Debug for IndirectObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let r = self.id.get();
        write!(f, "Indirect({} {})", r.id, r.gen)
    }
}

/// A stream: an object with identity carrying a dictionary and a raw payload.
/// The payload is opaque to traversal.
pub struct PdfStream {
    id: Cell<PlainRef>,
    pub dict: RefCell<Dictionary>,
    pub data: RefCell<Vec<u8>>,
}

impl PdfStream {
    pub fn new(dict: Dictionary, data: Vec<u8>) -> StreamRc {
        PdfStream::with_id(PlainRef { id: 0, gen: 0 }, dict, data)
    }
    pub fn with_id(id: PlainRef, dict: Dictionary, data: Vec<u8>) -> StreamRc {
        Rc::new(PdfStream {
            id: Cell::new(id),
            dict: RefCell::new(dict),
            data: RefCell::new(data),
        })
    }
    pub fn id(&self) -> PlainRef {
        self.id.get()
    }
    pub fn set_id(&self, id: PlainRef) {
        self.id.set(id);
    }
    pub fn node_id(&self) -> NodeId {
        NodeId(self as *const PdfStream as usize)
    }
    pub fn serialize_body(&self, out: &mut impl io::Write) -> Result<()> {
        self.dict.borrow().serialize(out)?;
        out.write_all(b"\nstream\n")?;
        out.write_all(&self.data.borrow())?;
        out.write_all(b"\nendstream")?;
        Ok(())
    }
}

impl fmt::Debug for PdfStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let r = self.id.get();
        write!(f, "Stream({} {}, {} bytes)", r.id, r.gen, self.data.borrow().len())
    }
}

/// Primitive Dictionary type. Keys are unique name bytes; insertion order is
/// preserved and is the order entries are written out in.
#[derive(Default, Clone, Debug)]
pub struct Dictionary {
    dict: IndexMap<String, Primitive>,
}

impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary { dict: IndexMap::new() }
    }
    pub fn len(&self) -> usize {
        self.dict.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.dict.get(key)
    }
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Primitive> {
        self.dict.get_mut(key)
    }
    pub fn contains_key(&self, key: &str) -> bool {
        self.dict.contains_key(key)
    }
    pub fn insert(&mut self, key: impl Into<String>, val: Primitive) -> Option<Primitive> {
        self.dict.insert(key.into(), val)
    }
    pub fn set_name(&mut self, key: impl Into<String>, name: impl Into<String>) {
        self.insert(key, Primitive::Name(name.into()));
    }
    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.insert(key, Primitive::Integer(value));
    }
    pub fn set_str(&mut self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.insert(key, Primitive::String(PdfString::new(data.into())));
    }
    pub fn remove(&mut self, key: &str) -> Option<Primitive> {
        self.dict.shift_remove(key)
    }
    pub fn iter(&self) -> indexmap::map::Iter<String, Primitive> {
        self.dict.iter()
    }
    pub fn iter_mut(&mut self) -> indexmap::map::IterMut<String, Primitive> {
        self.dict.iter_mut()
    }
    pub fn values(&self) -> indexmap::map::Values<String, Primitive> {
        self.dict.values()
    }
    /// like get, but returns `PdfError::MissingEntry` naming the calling type
    /// if the entry is not found
    pub fn require(&self, typ: &'static str, key: &str) -> Result<&Primitive> {
        self.get(key).ok_or(PdfError::MissingEntry {
            typ,
            field: key.into(),
        })
    }
    /// assert that the given key/value pair is in the dictionary (`required=true`),
    /// or the key is not present at all (`required=false`)
    pub fn expect(&self, typ: &'static str, key: &str, value: &str, required: bool) -> Result<()> {
        match self.dict.get(key) {
            Some(ty) => {
                let ty = ty.as_name()?;
                if ty != value {
                    Err(PdfError::KeyValueMismatch {
                        key: key.into(),
                        value: value.into(),
                        found: ty.into(),
                    })
                } else {
                    Ok(())
                }
            }
            None if required => Err(PdfError::MissingEntry { typ, field: key.into() }),
            None => Ok(()),
        }
    }

    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        write!(out, "<<")?;
        for (key, val) in self.iter() {
            write!(out, " ")?;
            serialize_name(key, out)?;
            write!(out, " ")?;
            val.serialize(out)?;
        }
        write!(out, " >>")?;
        Ok(())
    }
}

impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}>",
            self.iter()
                .format_with(", ", |(k, v), f| f(&format_args!("{}={}", k, v)))
        )
    }
}

impl IntoIterator for Dictionary {
    type Item = (String, Primitive);
    type IntoIter = indexmap::map::IntoIter<String, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.dict.into_iter()
    }
}

/// Primitive String type: raw bytes, literal or hex on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct PdfString {
    pub data: Vec<u8>,
}

impl PdfString {
    pub fn new(data: Vec<u8>) -> PdfString {
        PdfString { data }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        if self.data.iter().any(|&b| !(b' '..=b'~').contains(&b)) {
            write!(out, "<")?;
            for &b in &self.data {
                write!(out, "{:02x}", b)?;
            }
            write!(out, ">")?;
        } else {
            write!(out, "(")?;
            for &b in &self.data {
                match b {
                    b'\\' | b'(' | b')' => write!(out, r"\")?,
                    _ => (),
                }
                out.write_all(&[b])?;
            }
            write!(out, ")")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PdfString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"")?;
        for &b in &self.data {
            match b {
                b'"' => write!(f, "\\\"")?,
                b' '..=b'~' => write!(f, "{}", b as char)?,
                x => write!(f, "\\x{:02x}", x)?,
            }
        }
        write!(f, "\"")
    }
}

impl AsRef<[u8]> for PdfString {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

pub fn serialize_name(s: &str, out: &mut impl io::Write) -> Result<()> {
    write!(out, "/")?;
    for &b in s.as_bytes() {
        match b {
            b'!'..=b'~' if !b"()<>[]{}/%#".contains(&b) => out.write_all(&[b])?,
            _ => write!(out, "#{:02x}", b)?,
        }
    }
    Ok(())
}

fn serialize_list(arr: &[Primitive], out: &mut impl io::Write) -> Result<()> {
    let mut parts = arr.iter();
    write!(out, "[")?;
    if let Some(first) = parts.next() {
        first.serialize(out)?;
    }
    for p in parts {
        write!(out, " ")?;
        p.serialize(out)?;
    }
    write!(out, "]")?;
    Ok(())
}

macro_rules! unexpected_primitive {
    ($expected:ident, $found:expr) => {
        Err(PdfError::UnexpectedPrimitive {
            expected: stringify!($expected),
            found: $found,
        })
    };
}

impl Primitive {
    /// For debugging / error messages: get the name of the variant
    pub fn get_debug_name(&self) -> &'static str {
        match *self {
            Primitive::Null => "Null",
            Primitive::Boolean(..) => "Boolean",
            Primitive::Integer(..) => "Integer",
            Primitive::Real(..) => "Real",
            Primitive::Name(..) => "Name",
            Primitive::String(..) => "String",
            Primitive::Array(..) => "Array",
            Primitive::Dictionary(..) => "Dictionary",
            Primitive::Reference(..) => "Reference",
            Primitive::Indirect(..) => "Indirect",
            Primitive::Stream(..) => "Stream",
        }
    }

    /// Direct-object serialization. Nodes with identity serialize as a
    /// reference to that identity; only the writer emits their bodies.
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        match self {
            Primitive::Null => write!(out, "null")?,
            Primitive::Boolean(b) => write!(out, "{}", b)?,
            Primitive::Integer(i) => write!(out, "{}", i)?,
            Primitive::Real(r) => write!(out, "{}", r)?,
            Primitive::Name(ref name) => serialize_name(name, out)?,
            Primitive::String(ref s) => s.serialize(out)?,
            Primitive::Array(ref arr) => serialize_list(arr, out)?,
            Primitive::Dictionary(ref dict) => dict.serialize(out)?,
            Primitive::Reference(r) => write!(out, "{} {} R", r.id, r.gen)?,
            Primitive::Indirect(ref obj) => {
                let r = obj.id();
                write!(out, "{} {} R", r.id, r.gen)?;
            }
            Primitive::Stream(ref stm) => {
                let r = stm.id();
                write!(out, "{} {} R", r.id, r.gen)?;
            }
        }
        Ok(())
    }

    pub fn as_integer(&self) -> Result<i64> {
        match *self {
            Primitive::Integer(n) => Ok(n),
            ref p => unexpected_primitive!(Integer, p.get_debug_name()),
        }
    }
    pub fn as_usize(&self) -> Result<usize> {
        match *self {
            Primitive::Integer(n) if n >= 0 => Ok(n as usize),
            Primitive::Integer(_) => bail!("negative integer"),
            ref p => unexpected_primitive!(Integer, p.get_debug_name()),
        }
    }
    pub fn as_real(&self) -> Result<f64> {
        match *self {
            Primitive::Integer(n) => Ok(n as f64),
            Primitive::Real(r) => Ok(r),
            ref p => unexpected_primitive!(Real, p.get_debug_name()),
        }
    }
    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Primitive::Boolean(b) => Ok(b),
            ref p => unexpected_primitive!(Boolean, p.get_debug_name()),
        }
    }
    pub fn as_name(&self) -> Result<&str> {
        match self {
            Primitive::Name(ref name) => Ok(name.as_str()),
            p => unexpected_primitive!(Name, p.get_debug_name()),
        }
    }
    pub fn as_string(&self) -> Result<&PdfString> {
        match self {
            Primitive::String(ref s) => Ok(s),
            p => unexpected_primitive!(String, p.get_debug_name()),
        }
    }
    pub fn as_array(&self) -> Result<&[Primitive]> {
        match self {
            Primitive::Array(ref v) => Ok(v),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Primitive>> {
        match self {
            Primitive::Array(ref mut v) => Ok(v),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    pub fn as_dict(&self) -> Result<&Dictionary> {
        match self {
            Primitive::Dictionary(ref d) => Ok(d),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    pub fn as_dict_mut(&mut self) -> Result<&mut Dictionary> {
        match self {
            Primitive::Dictionary(ref mut d) => Ok(d),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    pub fn as_indirect(&self) -> Result<&ObjRc> {
        match self {
            Primitive::Indirect(ref obj) => Ok(obj),
            p => unexpected_primitive!(Indirect, p.get_debug_name()),
        }
    }
    pub fn into_reference(self) -> Result<PlainRef> {
        match self {
            Primitive::Reference(r) => Ok(r),
            p => unexpected_primitive!(Reference, p.get_debug_name()),
        }
    }

    /// Identity of this node, if it has one.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Primitive::Indirect(obj) => Some(obj.node_id()),
            Primitive::Stream(stm) => Some(stm.node_id()),
            _ => None,
        }
    }
    /// The (object number, generation) pair of this node, if it has one.
    pub fn plain_ref(&self) -> Option<PlainRef> {
        match self {
            Primitive::Indirect(obj) => Some(obj.id()),
            Primitive::Stream(stm) => Some(stm.id()),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Primitive::Null => write!(f, "null"),
            Primitive::Boolean(b) => b.fmt(f),
            Primitive::Integer(i) => i.fmt(f),
            Primitive::Real(r) => r.fmt(f),
            Primitive::Name(ref s) => write!(f, "/{}", s),
            Primitive::String(ref s) => write!(f, "{:?}", s),
            Primitive::Array(ref arr) => write!(f, "[{}]", arr.iter().format(", ")),
            Primitive::Dictionary(ref d) => d.fmt(f),
            Primitive::Reference(r) => write!(f, "@{}", r.id),
            Primitive::Indirect(ref obj) => write!(f, "@{}", obj.id().id),
            Primitive::Stream(_) => write!(f, "stream"),
        }
    }
}

impl From<i64> for Primitive {
    fn from(x: i64) -> Primitive {
        Primitive::Integer(x)
    }
}
impl From<f64> for Primitive {
    fn from(x: f64) -> Primitive {
        Primitive::Real(x)
    }
}
impl From<bool> for Primitive {
    fn from(x: bool) -> Primitive {
        Primitive::Boolean(x)
    }
}
impl From<PdfString> for Primitive {
    fn from(x: PdfString) -> Primitive {
        Primitive::String(x)
    }
}
impl From<Dictionary> for Primitive {
    fn from(x: Dictionary) -> Primitive {
        Primitive::Dictionary(x)
    }
}
impl From<Vec<Primitive>> for Primitive {
    fn from(x: Vec<Primitive>) -> Primitive {
        Primitive::Array(x)
    }
}
impl From<PlainRef> for Primitive {
    fn from(x: PlainRef) -> Primitive {
        Primitive::Reference(x)
    }
}
impl From<ObjRc> for Primitive {
    fn from(x: ObjRc) -> Primitive {
        Primitive::Indirect(x)
    }
}
impl From<StreamRc> for Primitive {
    fn from(x: StreamRc) -> Primitive {
        Primitive::Stream(x)
    }
}
