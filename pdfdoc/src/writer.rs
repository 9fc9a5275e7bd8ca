//! Serializing an object graph back out as a PDF 1.3 byte stream, with
//! optional Standard Security Handler encryption.

use crate::crypt::{generate_file_id, Crypter, EncryptOptions};
use crate::error::*;
use crate::object::{
    Dictionary, IndirectObject, NodeId, ObjRc, PdfString, PlainRef, Primitive,
};

use std::collections::HashSet;
use std::io::{Seek, Write};
use std::rc::Rc;

/// Page attributes a leaf may inherit from its ancestor `Pages` nodes.
const INHERITED_ATTRIBUTES: [&str; 4] = ["Resources", "MediaBox", "CropBox", "Rotate"];

pub struct Writer {
    /// Identity-bearing nodes in emission order; object `i` gets number `i+1`.
    objects: Vec<Primitive>,
    object_set: HashSet<NodeId>,
    info: ObjRc,
    catalog: ObjRc,
    pages: ObjRc,
    outline_items: Vec<ObjRc>,
    crypter: Option<Crypter>,
    enc_obj: Option<ObjRc>,
    file_id: Option<(Vec<u8>, Vec<u8>)>,
}

impl Default for Writer {
    fn default() -> Writer {
        Writer::new()
    }
}

impl Writer {
    /// Seeds the document with an info dictionary, a catalog and an empty
    /// pages root, recorded in that order.
    pub fn new() -> Writer {
        let mut info_dict = Dictionary::new();
        info_dict.set_str("Producer", b"pdfdoc".to_vec());
        info_dict.set_str("Creator", b"pdfdoc".to_vec());
        let stamp = chrono::Local::now().format("D:%Y%m%d%H%M%S").to_string();
        info_dict.set_str("CreationDate", stamp.into_bytes());
        let info = IndirectObject::new(info_dict.into());

        let mut pages_dict = Dictionary::new();
        pages_dict.set_name("Type", "Pages");
        pages_dict.insert("Kids", Primitive::Array(Vec::new()));
        pages_dict.set_int("Count", 0);
        let pages = IndirectObject::new(pages_dict.into());

        let mut catalog_dict = Dictionary::new();
        catalog_dict.set_name("Type", "Catalog");
        catalog_dict.set_name("Version", "1.3");
        catalog_dict.insert("Pages", Primitive::Indirect(pages.clone()));
        let catalog = IndirectObject::new(catalog_dict.into());

        let mut writer = Writer {
            objects: Vec::new(),
            object_set: HashSet::new(),
            info,
            catalog,
            pages,
            outline_items: Vec::new(),
            crypter: None,
            enc_obj: None,
            file_id: None,
        };
        let seeds = [writer.info.clone(), writer.catalog.clone(), writer.pages.clone()];
        for obj in &seeds {
            writer.record(obj);
        }
        writer
    }

    pub fn pages_root(&self) -> &ObjRc {
        &self.pages
    }
    pub fn catalog(&self) -> &ObjRc {
        &self.catalog
    }
    pub fn info(&self) -> &ObjRc {
        &self.info
    }

    pub fn has_object(&self, p: &Primitive) -> bool {
        p.node_id().map(|id| self.object_set.contains(&id)) == Some(true)
    }

    fn record(&mut self, obj: &ObjRc) {
        if self.object_set.insert(obj.node_id()) {
            self.objects.push(Primitive::Indirect(obj.clone()));
        }
    }

    /// Record a node and everything transitively reachable from it.
    pub fn add_object(&mut self, p: Primitive) -> Result<()> {
        self.collect_objects(&p)
    }

    /// The write-side counterpart of graph traversal: append every node with
    /// identity once, in first-visit order, without following `/Parent`
    /// back-edges. A bare reference means the graph was never resolved.
    fn collect_objects(&mut self, p: &Primitive) -> Result<()> {
        match p {
            Primitive::Reference(_) => Err(PdfError::UnresolvedReference),
            Primitive::Indirect(obj) => {
                if !self.object_set.insert(obj.node_id()) {
                    return Ok(());
                }
                self.objects.push(p.clone());
                let inner = obj.inner.borrow();
                self.collect_objects(&inner)
            }
            Primitive::Stream(stm) => {
                if !self.object_set.insert(stm.node_id()) {
                    return Ok(());
                }
                self.objects.push(p.clone());
                let dict = stm.dict.borrow();
                for (key, value) in dict.iter() {
                    if key == "Parent" {
                        continue;
                    }
                    self.collect_objects(value)?;
                }
                Ok(())
            }
            Primitive::Array(items) => {
                for item in items {
                    self.collect_objects(item)?;
                }
                Ok(())
            }
            Primitive::Dictionary(dict) => {
                for (key, value) in dict.iter() {
                    if key == "Parent" {
                        continue;
                    }
                    self.collect_objects(value)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Append a page. Inherited attributes are hoisted from the page's
    /// original ancestor chain before `/Parent` is re-pointed at this
    /// writer's pages root.
    pub fn add_page(&mut self, page: &ObjRc) -> Result<()> {
        {
            let inner = page.inner.borrow();
            let dict = match *inner {
                Primitive::Dictionary(ref dict) => dict,
                ref p => err!(PdfError::BadPageNode { found: p.get_debug_name().into() }),
            };
            if dict.get("Type").and_then(|t| t.as_name().ok()) != Some("Page") {
                err!(PdfError::BadPageNode { found: "object without /Type /Page".into() });
            }
        }

        self.inherit_page_attributes(page)?;

        page.inner
            .borrow_mut()
            .as_dict_mut()?
            .insert("Parent", Primitive::Indirect(self.pages.clone()));

        {
            let mut inner = self.pages.inner.borrow_mut();
            let dict = inner.as_dict_mut()?;
            let count = dict.require("Pages", "Count")?.as_integer()?;
            dict.get_mut("Kids")
                .ok_or(PdfError::MissingEntry { typ: "Pages", field: "Kids".into() })?
                .as_array_mut()?
                .push(Primitive::Indirect(page.clone()));
            dict.set_int("Count", count + 1);
        }

        self.collect_objects(&Primitive::Indirect(page.clone()))
    }

    /// Walk up the page's original `/Parent` chain, copying each inheritable
    /// attribute the page does not define itself, by shared ownership.
    fn inherit_page_attributes(&self, page: &ObjRc) -> Result<()> {
        let mut seen = HashSet::new();
        let mut ancestor = dict_value(page, "Parent");
        while let Some(Primitive::Indirect(node)) = ancestor {
            if Rc::ptr_eq(&node, page) || !seen.insert(node.node_id()) {
                break;
            }
            let inner = node.inner.borrow();
            let dict = match *inner {
                Primitive::Dictionary(ref dict) => dict,
                _ => break,
            };
            for key in INHERITED_ATTRIBUTES {
                let value = match dict.get(key) {
                    Some(value) => value.clone(),
                    None => continue,
                };
                let mut page_inner = page.inner.borrow_mut();
                let page_dict = page_inner.as_dict_mut()?;
                if !page_dict.contains_key(key) {
                    page_dict.insert(key, value);
                }
            }
            let next = dict.get("Parent").cloned();
            drop(inner);
            ancestor = next;
        }
        Ok(())
    }

    /// Stash the top-level outline items; the parent node and the sibling
    /// links are synthesized when the file is written.
    pub fn add_outlines(&mut self, items: Vec<ObjRc>) {
        self.outline_items = items;
    }

    /// Install an interactive-form dictionary. Every field (walking `Fields`
    /// and nested `Kids`) must have all of its `/P` entries pointing at pages
    /// this writer already contains.
    pub fn add_forms(&mut self, forms: &Dictionary) -> Result<()> {
        if let Some(fields) = forms.get("Fields") {
            self.check_form_fields(fields)?;
        }
        let forms_obj = IndirectObject::new(Primitive::Dictionary(forms.clone()));
        self.catalog
            .inner
            .borrow_mut()
            .as_dict_mut()?
            .insert("AcroForm", Primitive::Indirect(forms_obj.clone()));
        self.collect_objects(&Primitive::Indirect(forms_obj))
    }

    fn check_form_fields(&self, fields: &Primitive) -> Result<()> {
        let entries = match fields {
            Primitive::Array(items) => items.clone(),
            Primitive::Indirect(obj) => match *obj.inner.borrow() {
                Primitive::Array(ref items) => items.clone(),
                _ => return Ok(()),
            },
            _ => return Ok(()),
        };
        for field in &entries {
            let dict = match dict_of(field) {
                Some(dict) => dict,
                None => continue,
            };
            if let Some(p) = dict.get("P") {
                if !self.has_object(p) {
                    err!(PdfError::FormPageOutsideWriter);
                }
            }
            if let Some(kids) = dict.get("Kids") {
                self.check_form_fields(kids)?;
            }
        }
        Ok(())
    }

    /// Install the Standard Security Handler (V=2, R=3, 128-bit) and record
    /// its dictionary as an indirect object.
    pub fn encrypt(
        &mut self,
        user_pw: &[u8],
        owner_pw: &[u8],
        options: Option<EncryptOptions>,
    ) -> Result<()> {
        let permissions = options.unwrap_or_default().permissions;
        let p = permissions.get_p();
        let (id0, id1) = generate_file_id(chrono::Local::now());
        let crypter = Crypter::for_writing(user_pw, owner_pw, p, id0.clone());

        let mut dict = Dictionary::new();
        dict.set_name("Filter", "Standard");
        dict.set_int("V", 2);
        dict.set_int("R", 3);
        dict.set_int("Length", 128);
        dict.set_int("P", p as i64);
        dict.set_str("O", crypter.o.clone());
        dict.set_str("U", crypter.u.clone());
        let enc = IndirectObject::new(dict.into());
        self.record(&enc);

        self.enc_obj = Some(enc);
        self.crypter = Some(crypter);
        self.file_id = Some((id0, id1));
        Ok(())
    }

    /// Emit header, object bodies, cross-reference table and trailer. Object
    /// numbers are assigned here, in recording order.
    pub fn write<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        self.finish_outlines()?;

        for (i, obj) in self.objects.iter().enumerate() {
            let id = PlainRef { id: i as u64 + 1, gen: 0 };
            match obj {
                Primitive::Indirect(o) => o.set_id(id),
                Primitive::Stream(s) => s.set_id(id),
                _ => {}
            }
        }

        out.write_all(b"%PDF-1.3\n")?;
        // high bytes so transfer tooling treats the file as binary
        out.write_all(b"%\xE2\xE3\xCF\xD3\n")?;

        let enc_id = self.enc_obj.as_ref().map(|o| o.node_id());
        let mut offsets = Vec::with_capacity(self.objects.len());
        for obj in &self.objects {
            out.flush()?;
            offsets.push(out.stream_position()?);

            if let Some(ref crypter) = self.crypter {
                if obj.node_id() != enc_id {
                    crypter.encrypt_object(obj);
                }
            }
            match obj {
                Primitive::Indirect(o) => {
                    write!(out, "{} 0 obj\n", o.id().id)?;
                    o.serialize_body(out)?;
                    out.write_all(b"\nendobj\n")?;
                }
                Primitive::Stream(s) => {
                    let len = s.data.borrow().len();
                    s.dict.borrow_mut().set_int("Length", len as i64);
                    write!(out, "{} 0 obj\n", s.id().id)?;
                    s.serialize_body(out)?;
                    out.write_all(b"\nendobj\n")?;
                }
                _ => err!(PdfError::UnresolvedReference),
            }
        }

        out.flush()?;
        let xref_offset = out.stream_position()?;
        write!(out, "xref\r\n")?;
        write!(out, "0 {}\r\n", self.objects.len() + 1)?;
        write!(out, "0000000000 65535 f\r\n")?;
        for &pos in &offsets {
            write!(out, "{:010} {:05} n\r\n", pos, 0)?;
        }

        let mut trailer = Dictionary::new();
        trailer.set_int("Size", self.objects.len() as i64 + 1);
        trailer.insert("Root", Primitive::Indirect(self.catalog.clone()));
        trailer.insert("Info", Primitive::Indirect(self.info.clone()));
        if let Some(ref enc) = self.enc_obj {
            trailer.insert("Encrypt", Primitive::Indirect(enc.clone()));
        }
        if let Some((ref id0, ref id1)) = self.file_id {
            trailer.insert(
                "ID",
                Primitive::Array(vec![
                    Primitive::String(PdfString::new(id0.clone())),
                    Primitive::String(PdfString::new(id1.clone())),
                ]),
            );
        }
        out.write_all(b"trailer\n")?;
        trailer.serialize(out)?;
        write!(out, "\nstartxref\n{}\n%%EOF\n", xref_offset)?;
        out.flush()?;
        Ok(())
    }

    /// Turn the stashed outline items into an `/Outlines` node with `/First`
    /// and `/Last`, chaining the items with `/Prev`/`/Next` and pointing
    /// their `/Parent` back at the new node.
    fn finish_outlines(&mut self) -> Result<()> {
        if self.outline_items.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut self.outline_items);

        let mut dict = Dictionary::new();
        dict.set_name("Type", "Outlines");
        dict.set_int("Count", items.len() as i64);
        dict.insert("First", Primitive::Indirect(items[0].clone()));
        dict.insert("Last", Primitive::Indirect(items[items.len() - 1].clone()));
        let root = IndirectObject::new(dict.into());

        for (i, item) in items.iter().enumerate() {
            let mut inner = item.inner.borrow_mut();
            let dict = inner.as_dict_mut()?;
            dict.insert("Parent", Primitive::Indirect(root.clone()));
            match i.checked_sub(1).and_then(|p| items.get(p)) {
                Some(prev) => dict.insert("Prev", Primitive::Indirect(prev.clone())),
                None => dict.remove("Prev"),
            };
            match items.get(i + 1) {
                Some(next) => dict.insert("Next", Primitive::Indirect(next.clone())),
                None => dict.remove("Next"),
            };
        }

        self.catalog
            .inner
            .borrow_mut()
            .as_dict_mut()?
            .insert("Outlines", Primitive::Indirect(root.clone()));
        self.collect_objects(&Primitive::Indirect(root))
    }
}

fn dict_value(obj: &ObjRc, key: &str) -> Option<Primitive> {
    match *obj.inner.borrow() {
        Primitive::Dictionary(ref dict) => dict.get(key).cloned(),
        _ => None,
    }
}

fn dict_of(p: &Primitive) -> Option<Dictionary> {
    match p {
        Primitive::Dictionary(dict) => Some(dict.clone()),
        Primitive::Indirect(obj) => match *obj.inner.borrow() {
            Primitive::Dictionary(ref dict) => Some(dict.clone()),
            _ => None,
        },
        _ => None,
    }
}
