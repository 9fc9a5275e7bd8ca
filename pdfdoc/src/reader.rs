//! Reading a document into a fully resolved object graph: reference
//! substitution, page-tree flattening, outlines and forms.

use crate::backend::Backend;
use crate::error::*;
use crate::object::{Dictionary, NodeId, ObjRc, Primitive};
use crate::parser::Parser;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::rc::Rc;

const MAX_PAGE_TREE_DEPTH: usize = 64;

/// Cycle-safe walk over the object graph. Every `Reference` met in a
/// container slot is replaced with the node it resolves to; keys listed in
/// `nofollow` are not descended into at all. The visited set lives for one
/// traversal context, keyed by node identity.
pub struct Traverser<'a, B: Backend> {
    parser: &'a Parser<B>,
    nofollow: &'a [&'a str],
    visited: HashSet<NodeId>,
}

impl<'a, B: Backend> Traverser<'a, B> {
    pub fn new(parser: &'a Parser<B>, nofollow: &'a [&'a str]) -> Self {
        Traverser {
            parser,
            nofollow,
            visited: HashSet::new(),
        }
    }

    /// Pre-mark a node so this traversal never descends into it.
    fn skip(&mut self, id: NodeId) {
        self.visited.insert(id);
    }

    /// A bare reference is only legal inside a container slot, where it can
    /// be substituted; at the root there is no slot to rewrite.
    pub fn traverse(&mut self, root: &mut Primitive) -> Result<()> {
        if let Primitive::Reference(r) = *root {
            err!(PdfError::BadReference {
                msg: format!("cannot traverse bare reference {} {} R", r.id, r.gen),
            });
        }
        self.walk(root)
    }

    /// Resolve a container slot if it holds a reference, then descend.
    fn follow(&mut self, slot: &mut Primitive) -> Result<()> {
        if let Primitive::Reference(r) = *slot {
            *slot = self.parser.lookup_by_reference(r)?;
        }
        self.walk(slot)
    }

    fn walk(&mut self, p: &mut Primitive) -> Result<()> {
        match p {
            Primitive::Array(items) => {
                for item in items.iter_mut() {
                    self.follow(item)?;
                }
                Ok(())
            }
            Primitive::Dictionary(dict) => {
                for (key, value) in dict.iter_mut() {
                    if self.nofollow.iter().any(|&k| k == key) {
                        continue;
                    }
                    self.follow(value)?;
                }
                Ok(())
            }
            Primitive::Indirect(obj) => {
                let obj = obj.clone();
                if !self.visited.insert(obj.node_id()) {
                    return Ok(());
                }
                let mut inner = obj.inner.borrow_mut();
                self.follow(&mut inner)
            }
            Primitive::Stream(stm) => {
                // the payload is opaque; only the dictionary is walked
                let stm = stm.clone();
                if !self.visited.insert(stm.node_id()) {
                    return Ok(());
                }
                for (key, value) in stm.dict.borrow_mut().iter_mut() {
                    if self.nofollow.iter().any(|&k| k == key) {
                        continue;
                    }
                    self.follow(value)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub struct Reader<B: Backend> {
    parser: Parser<B>,
    catalog: Option<ObjRc>,
    pages_root: Option<ObjRc>,
    page_list: Vec<ObjRc>,
    outline_root: Option<ObjRc>,
    acro_form: Option<Primitive>,
    loaded: bool,
}

impl Reader<Vec<u8>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_data(fs::read(path)?)
    }
}

impl<B: Backend> Reader<B> {
    /// Reads trailer and xref. For an encrypted document, loading the object
    /// graph is deferred until a password has been accepted.
    pub fn from_data(backend: B) -> Result<Self> {
        let parser = Parser::new(backend)?;
        let mut reader = Reader {
            parser,
            catalog: None,
            pages_root: None,
            page_list: Vec::new(),
            outline_root: None,
            acro_form: None,
            loaded: false,
        };
        if !reader.parser.is_encrypted() {
            reader.load_structure()?;
        }
        Ok(reader)
    }

    pub fn is_encrypted(&self) -> bool {
        self.parser.is_encrypted()
    }

    /// Try `password`, then the empty password. On success the document
    /// structure is loaded and `true` is returned.
    pub fn decrypt(&mut self, password: &[u8]) -> Result<bool> {
        if !self.parser.is_encrypted() {
            return Ok(true);
        }
        let ok = self.parser.decrypt(password) || self.parser.decrypt(b"");
        if ok && !self.loaded {
            self.load_structure()?;
        }
        Ok(ok)
    }

    pub fn num_pages(&self) -> usize {
        self.page_list.len()
    }

    /// The n-th leaf page, 1-based, with everything it references resolved
    /// (walking any path except `/Parent`).
    pub fn page(&self, n: usize) -> Result<ObjRc> {
        self.require_loaded()?;
        if n < 1 || n > self.page_list.len() {
            err!(PdfError::PageOutOfBounds {
                page_nr: n,
                max: self.page_list.len(),
            });
        }
        let page = self.page_list[n - 1].clone();
        let mut root = Primitive::Indirect(page.clone());
        Traverser::new(&self.parser, &["Parent"]).traverse(&mut root)?;
        Ok(page)
    }

    pub fn pages_root(&self) -> Option<&ObjRc> {
        self.pages_root.as_ref()
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.parser.trailer
    }

    /// The outermost outline entries, in sibling order.
    pub fn outlines(&self) -> Result<Vec<ObjRc>> {
        self.require_loaded()?;
        let root = match self.outline_root {
            Some(ref root) => root.clone(),
            None => return Ok(Vec::new()),
        };
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = dict_get(&root, "First");
        while let Some(Primitive::Indirect(item)) = cursor {
            if !seen.insert(item.node_id()) {
                err!(PdfError::CircularOutline);
            }
            cursor = dict_get(&item, "Next");
            items.push(item);
        }
        Ok(items)
    }

    /// The subset of `outlines()` whose destination is `page`, compared by
    /// node identity.
    pub fn outlines_for_page(&self, page: &ObjRc) -> Result<Vec<ObjRc>> {
        let mut matched = Vec::new();
        for item in self.outlines()? {
            let dest = match self.outline_destination(&item)? {
                Some(dest) => dest,
                None => continue,
            };
            if let Some(Primitive::Indirect(target)) = first_of_array(&dest) {
                if Rc::ptr_eq(&target, page) {
                    matched.push(item);
                }
            }
        }
        Ok(matched)
    }

    /// The resolved interactive-form dictionary, if the document has one.
    pub fn forms(&self) -> Result<Option<Dictionary>> {
        self.require_loaded()?;
        match self.acro_form {
            None => Ok(None),
            Some(Primitive::Dictionary(ref dict)) => Ok(Some(dict.clone())),
            Some(Primitive::Indirect(ref obj)) => Ok(Some(obj.inner.borrow().as_dict()?.clone())),
            Some(ref p) => Err(PdfError::UnexpectedPrimitive {
                expected: "Dictionary",
                found: p.get_debug_name(),
            }),
        }
    }

    fn require_loaded(&self) -> Result<()> {
        if !self.loaded {
            err!(PdfError::NeedsPassword);
        }
        Ok(())
    }

    /// The destination array of an outline item: `/Dest`, or the `/D` of a
    /// GoTo action under `/A`.
    fn outline_destination(&self, item: &ObjRc) -> Result<Option<Primitive>> {
        if let Some(dest) = dict_get(item, "Dest") {
            return Ok(Some(self.parser.trace(&dest)?));
        }
        if let Some(action) = dict_get(item, "A") {
            let action = self.parser.trace(&action)?;
            if let Some(dict) = prim_dict(&action) {
                let is_goto = dict.get("S").and_then(|s| s.as_name().ok()) == Some("GoTo");
                if is_goto {
                    if let Some(d) = dict.get("D") {
                        return Ok(Some(self.parser.trace(d)?));
                    }
                }
            }
        }
        Ok(None)
    }

    fn load_structure(&mut self) -> Result<()> {
        if let Some(ref crypter) = self.parser.crypter {
            if !crypter.authenticated {
                err!(PdfError::NeedsPassword);
            }
        }

        // catalog
        let root = self.parser.trailer.require("Trailer", "Root")?.clone();
        let catalog = match self.parser.trace(&root)? {
            Primitive::Indirect(obj) => obj,
            p => err!(PdfError::BadCatalog { found: p.get_debug_name() }),
        };
        if catalog.inner.borrow().as_dict().is_err() {
            err!(PdfError::BadCatalog { found: "non-dictionary object" });
        }

        // pages root
        let pages_slot = {
            let inner = catalog.inner.borrow();
            inner.as_dict()?.require("Catalog", "Pages")?.clone()
        };
        let pages = match self.parser.trace(&pages_slot)? {
            Primitive::Indirect(obj) => obj,
            p => err!(PdfError::BadPageNode { found: p.get_debug_name().into() }),
        };
        catalog
            .inner
            .borrow_mut()
            .as_dict_mut()?
            .insert("Pages", Primitive::Indirect(pages.clone()));

        let declared_count = {
            let inner = pages.inner.borrow();
            let dict = inner.as_dict().map_err(|_| PdfError::BadPageNode {
                found: "non-dictionary pages root".into(),
            })?;
            dict.expect("Pages", "Type", "Pages", true).map_err(|_| {
                PdfError::BadPageNode { found: "pages root without /Type /Pages".into() }
            })?;
            dict.require("Pages", "Count")?.as_usize()?
        };

        self.catalog = Some(catalog.clone());
        self.pages_root = Some(pages.clone());
        self.build_page_tree(&pages, None, 0)?;
        if declared_count != self.page_list.len() {
            warn!(
                "pages root declares /Count {} but {} leaves were found",
                declared_count,
                self.page_list.len()
            );
        }

        // outlines and forms, eagerly resolved
        for key in ["Outlines", "AcroForm"] {
            let mut traverser = Traverser::new(&self.parser, &["Parent"]);
            traverser.skip(catalog.node_id());
            let mut inner = catalog.inner.borrow_mut();
            if let Some(slot) = inner.as_dict_mut()?.get_mut(key) {
                traverser.follow(slot)?;
            }
        }
        {
            let inner = catalog.inner.borrow();
            let dict = inner.as_dict()?;
            if let Some(Primitive::Indirect(obj)) = dict.get("Outlines") {
                self.outline_root = Some(obj.clone());
            }
            self.acro_form = dict.get("AcroForm").cloned();
        }

        self.loaded = true;
        Ok(())
    }

    /// Depth-first preorder flattening of the pages tree. Leaf pages land in
    /// `page_list` in visit order; every node's `/Parent` is overwritten with
    /// the node it was actually reached from.
    fn build_page_tree(&mut self, node: &ObjRc, parent: Option<&ObjRc>, depth: usize) -> Result<()> {
        if depth > MAX_PAGE_TREE_DEPTH {
            err!(PdfError::BadPageNode {
                found: "page tree deeper than supported".into(),
            });
        }

        let node_type = {
            let inner = node.inner.borrow();
            let dict = match *inner {
                Primitive::Dictionary(ref dict) => dict,
                ref p => err!(PdfError::BadPageNode { found: p.get_debug_name().into() }),
            };
            match dict.get("Type").map(|t| t.as_name()) {
                Some(Ok(name)) => name.to_string(),
                _ => err!(PdfError::BadPageNode { found: "missing /Type".into() }),
            }
        };

        if let Some(parent) = parent {
            node.inner
                .borrow_mut()
                .as_dict_mut()?
                .insert("Parent", Primitive::Indirect(parent.clone()));
        }

        match node_type.as_str() {
            "Page" => {
                self.page_list.push(node.clone());
                Ok(())
            }
            "Pages" => {
                // Resolve the attributes descendants will inherit, without
                // recursing upward or duplicating the kids walk below.
                let mut root = Primitive::Indirect(node.clone());
                Traverser::new(&self.parser, &["Parent", "Kids"]).traverse(&mut root)?;

                let kids = self.resolve_kids(node)?;
                for kid in &kids {
                    self.build_page_tree(kid, Some(node), depth + 1)?;
                }
                Ok(())
            }
            other => err!(PdfError::BadPageNode { found: other.into() }),
        }
    }

    /// Resolve `/Kids` - a direct array, or an indirect object wrapping one -
    /// substituting every entry with the node it refers to.
    fn resolve_kids(&mut self, node: &ObjRc) -> Result<Vec<ObjRc>> {
        let kids_slot = {
            let inner = node.inner.borrow();
            inner.as_dict()?.require("Pages", "Kids")?.clone()
        };
        let kids_slot = match kids_slot {
            Primitive::Reference(r) => {
                let resolved = self.parser.lookup_by_reference(r)?;
                node.inner
                    .borrow_mut()
                    .as_dict_mut()?
                    .insert("Kids", resolved.clone());
                resolved
            }
            p => p,
        };

        match kids_slot {
            Primitive::Array(_) => {
                let mut inner = node.inner.borrow_mut();
                let slot = inner
                    .as_dict_mut()?
                    .get_mut("Kids")
                    .ok_or(PdfError::MissingEntry { typ: "Pages", field: "Kids".into() })?;
                self.resolve_kid_entries(slot.as_array_mut()?)
            }
            Primitive::Indirect(holder) => {
                let mut inner = holder.inner.borrow_mut();
                self.resolve_kid_entries(inner.as_array_mut()?)
            }
            p => err!(PdfError::BadPageNode { found: p.get_debug_name().into() }),
        }
    }

    fn resolve_kid_entries(&self, entries: &mut [Primitive]) -> Result<Vec<ObjRc>> {
        let mut kids = Vec::with_capacity(entries.len());
        for slot in entries.iter_mut() {
            if let Primitive::Reference(r) = *slot {
                *slot = self.parser.lookup_by_reference(r)?;
            }
            match slot {
                Primitive::Indirect(obj) => kids.push(obj.clone()),
                p => err!(PdfError::BadPageNode { found: p.get_debug_name().into() }),
            }
        }
        Ok(kids)
    }
}

fn dict_get(obj: &ObjRc, key: &str) -> Option<Primitive> {
    match *obj.inner.borrow() {
        Primitive::Dictionary(ref dict) => dict.get(key).cloned(),
        _ => None,
    }
}

fn prim_dict(p: &Primitive) -> Option<Dictionary> {
    match p {
        Primitive::Dictionary(dict) => Some(dict.clone()),
        Primitive::Indirect(obj) => match *obj.inner.borrow() {
            Primitive::Dictionary(ref dict) => Some(dict.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn first_of_array(p: &Primitive) -> Option<Primitive> {
    match p {
        Primitive::Array(items) => items.first().cloned(),
        Primitive::Indirect(obj) => match *obj.inner.borrow() {
            Primitive::Array(ref items) => items.first().cloned(),
            _ => None,
        },
        _ => None,
    }
}
