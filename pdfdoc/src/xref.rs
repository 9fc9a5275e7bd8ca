//! Cross-reference table: the byte-offset index that makes indirect objects
//! randomly accessible.

use crate::error::*;
use crate::object::{Dictionary, GenNr, ObjNr};
use crate::parser::lexer::Lexer;
use crate::parser::{parse_with_lexer, NoResolve};

#[derive(Copy, Clone, Debug)]
pub enum XRef {
    /// Free entry.
    Free { next_obj_nr: ObjNr, gen_nr: GenNr },
    /// In use, at byte offset `pos`.
    Raw { pos: usize, gen_nr: GenNr },
    /// Not specified by any xref section.
    Invalid,
}

impl XRef {
    fn gen_nr(&self) -> GenNr {
        match *self {
            XRef::Free { gen_nr, .. } | XRef::Raw { gen_nr, .. } => gen_nr,
            XRef::Invalid => 0,
        }
    }
}

/// Runtime lookup table of all objects, merged over the `/Prev` chain.
pub struct XRefTable {
    entries: Vec<XRef>,
}

impl XRefTable {
    pub fn new(num_objects: usize) -> XRefTable {
        XRefTable {
            entries: vec![XRef::Invalid; num_objects],
        }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn get(&self, id: ObjNr) -> Result<XRef> {
        match self.entries.get(id as usize) {
            Some(&entry) => Ok(entry),
            None => Err(PdfError::UnspecifiedXRefEntry { id }),
        }
    }

    /// Merge a section into the table. Sections are added newest first, so an
    /// existing entry only gives way to one with a larger generation number.
    pub fn add_entries_from(&mut self, section: XRefSection) {
        for (i, entry) in section.entries.into_iter().enumerate() {
            let index = section.first_id as usize + i;
            if index >= self.entries.len() {
                warn!("xref entry {} outside declared /Size {}", index, self.entries.len());
                self.entries.resize(index + 1, XRef::Invalid);
            }
            let dst = &mut self.entries[index];
            let replace = match *dst {
                XRef::Invalid => true,
                ref old => entry.gen_nr() > old.gen_nr(),
            };
            if replace {
                *dst = entry;
            }
        }
    }
}

/// One contiguous subsection as found in the file.
#[derive(Debug)]
pub struct XRefSection {
    pub first_id: u32,
    pub entries: Vec<XRef>,
}

impl XRefSection {
    pub fn new(first_id: u32) -> XRefSection {
        XRefSection {
            first_id,
            entries: Vec::new(),
        }
    }
    pub fn add_free_entry(&mut self, next_obj_nr: ObjNr, gen_nr: GenNr) {
        self.entries.push(XRef::Free { next_obj_nr, gen_nr });
    }
    pub fn add_inuse_entry(&mut self, pos: usize, gen_nr: GenNr) {
        self.entries.push(XRef::Raw { pos, gen_nr });
    }
}

/// Reads a classic cross-reference table and the trailer dictionary that
/// follows it. The lexer must be positioned at the `xref` keyword.
pub fn parse_xref_table_and_trailer(lexer: &mut Lexer) -> Result<(Vec<XRefSection>, Dictionary)> {
    if lexer.next()? != "xref" {
        err!(PdfError::BadXref {
            msg: "expected 'xref' keyword (cross-reference streams are not supported)".into(),
        });
    }

    let mut sections = Vec::new();
    while lexer.peek()? != "trailer" {
        let start_id = lexer.next_as::<u32>()?;
        let num_ids = lexer.next_as::<u32>()?;

        let mut section = XRefSection::new(start_id);
        for i in 0..num_ids {
            let w1 = lexer.next()?;
            if w1 == "trailer" {
                err!(PdfError::BadXref {
                    msg: format!("section declares {} entries, but only {} follow", num_ids, i),
                });
            }
            let w2 = lexer.next()?;
            let w3 = lexer.next()?;
            if w3 == "f" {
                section.add_free_entry(w1.to::<ObjNr>()?, w2.to::<GenNr>()?);
            } else if w3 == "n" {
                section.add_inuse_entry(w1.to::<usize>()?, w2.to::<GenNr>()?);
            } else {
                err!(PdfError::UnexpectedLexeme {
                    pos: lexer.get_pos(),
                    lexeme: w3.to_string(),
                    expected: "f or n",
                });
            }
        }
        sections.push(section);
    }

    lexer.next_expect("trailer")?;
    let trailer = parse_with_lexer(lexer, &NoResolve)?;
    let trailer = match trailer {
        crate::object::Primitive::Dictionary(dict) => dict,
        p => err!(PdfError::UnexpectedPrimitive {
            expected: "Dictionary",
            found: p.get_debug_name(),
        }),
    };

    Ok((sections, trailer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_table_with_free_and_inuse() {
        let data = b"xref\r\n0 3\r\n0000000000 65535 f\r\n0000000017 00000 n\r\n0000000081 00000 n\r\ntrailer\n<< /Size 3 /Root 1 0 R >>";
        let mut lexer = Lexer::new(data);
        let (sections, trailer) = parse_xref_table_and_trailer(&mut lexer).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].first_id, 0);
        assert_eq!(sections[0].entries.len(), 3);
        assert!(matches!(sections[0].entries[0], XRef::Free { gen_nr: 65535, .. }));
        assert!(matches!(sections[0].entries[1], XRef::Raw { pos: 17, .. }));
        assert_eq!(trailer.get("Size").unwrap().as_integer().unwrap(), 3);

        let mut table = XRefTable::new(3);
        for section in sections {
            table.add_entries_from(section);
        }
        assert!(matches!(table.get(2).unwrap(), XRef::Raw { pos: 81, .. }));
    }

    #[test]
    fn older_sections_do_not_override() {
        let mut table = XRefTable::new(2);
        let mut newest = XRefSection::new(1);
        newest.add_inuse_entry(100, 0);
        table.add_entries_from(newest);

        let mut older = XRefSection::new(1);
        older.add_inuse_entry(50, 0);
        table.add_entries_from(older);

        assert!(matches!(table.get(1).unwrap(), XRef::Raw { pos: 100, .. }));
    }

    #[test]
    fn missing_xref_keyword() {
        let mut lexer = Lexer::new(b"2 0 obj");
        assert!(matches!(
            parse_xref_table_and_trailer(&mut lexer),
            Err(PdfError::BadXref { .. })
        ));
    }
}
