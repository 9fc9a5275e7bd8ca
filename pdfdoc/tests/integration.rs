use std::collections::HashSet;
use std::io::Cursor;
use std::rc::Rc;

use pdfdoc::error::PdfError;
use pdfdoc::object::{Dictionary, IndirectObject, NodeId, ObjRc, PdfStream, Primitive};
use pdfdoc::reader::Reader;
use pdfdoc::writer::Writer;

/// Assemble a PDF byte image. `bodies[i]` becomes object `i + 1`; offsets are
/// computed into a classic xref table, and `trailer_extra` is spliced into
/// the trailer dictionary after /Size and /Root.
fn build_pdf(bodies: &[&str], trailer_extra: &str) -> Vec<u8> {
    let mut data = b"%PDF-1.3\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in bodies.iter().enumerate() {
        offsets.push(data.len());
        data.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_offset = data.len();
    data.extend_from_slice(format!("xref\r\n0 {}\r\n", bodies.len() + 1).as_bytes());
    data.extend_from_slice(b"0000000000 65535 f\r\n");
    for off in offsets {
        data.extend_from_slice(format!("{:010} {:05} n\r\n", off, 0).as_bytes());
    }
    data.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R {} >>\nstartxref\n{}\n%%EOF\n",
            bodies.len() + 1,
            trailer_extra,
            xref_offset
        )
        .as_bytes(),
    );
    data
}

fn page_attr(page: &ObjRc, key: &str) -> Option<Primitive> {
    page.inner.borrow().as_dict().unwrap().get(key).cloned()
}

#[test]
fn single_page_plaintext() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    assert!(!reader.is_encrypted());
    assert_eq!(reader.num_pages(), 1);

    let page = reader.page(1).unwrap();
    assert_eq!(page_attr(&page, "Type").unwrap().as_name().unwrap(), "Page");
    let parent = page_attr(&page, "Parent").unwrap();
    assert!(Rc::ptr_eq(parent.as_indirect().unwrap(), reader.pages_root().unwrap()));

    assert!(matches!(
        reader.page(2),
        Err(PdfError::PageOutOfBounds { page_nr: 2, max: 1 })
    ));
    assert!(matches!(
        reader.page(0),
        Err(PdfError::PageOutOfBounds { page_nr: 0, max: 1 })
    ));
}

#[test]
fn nested_pages_tree_flattens_in_preorder() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 3 >>",
            "<< /Type /Pages /Parent 2 0 R /Kids [5 0 R 6 0 R] /Count 2 >>",
            "<< /Type /Pages /Parent 2 0 R /Kids [7 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 3 0 R /Idx 1 >>",
            "<< /Type /Page /Parent 3 0 R /Idx 2 >>",
            "<< /Type /Page /Parent 4 0 R /Idx 3 >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    assert_eq!(reader.num_pages(), 3);

    for n in 1..=3 {
        let page = reader.page(n).unwrap();
        assert_eq!(page_attr(&page, "Idx").unwrap().as_integer().unwrap(), n as i64);
        let parent = page_attr(&page, "Parent").unwrap();
        let parent = parent.as_indirect().unwrap().clone();
        let expected_parent = if n <= 2 { 3 } else { 4 };
        assert_eq!(parent.id().id, expected_parent);
        assert_eq!(
            parent.inner.borrow().as_dict().unwrap().get("Type").unwrap().as_name().unwrap(),
            "Pages"
        );
    }
}

#[test]
fn kids_wrapped_in_indirect_array() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids 4 0 R /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R >>",
            "[3 0 R]",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    assert_eq!(reader.num_pages(), 1);
}

#[test]
fn missing_parent_is_supplied() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    let page = reader.page(1).unwrap();
    let parent = page_attr(&page, "Parent").unwrap();
    assert!(Rc::ptr_eq(parent.as_indirect().unwrap(), reader.pages_root().unwrap()));
}

#[test]
fn bad_page_node_type_is_rejected() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Font >>",
        ],
        "",
    );
    assert!(matches!(
        Reader::from_data(data),
        Err(PdfError::BadPageNode { .. })
    ));
}

fn assert_no_references(p: &Primitive, seen: &mut HashSet<NodeId>) {
    match p {
        Primitive::Reference(r) => panic!("unresolved reference {} {} R", r.id, r.gen),
        Primitive::Array(items) => {
            for item in items {
                assert_no_references(item, seen);
            }
        }
        Primitive::Dictionary(dict) => {
            for (key, value) in dict.iter() {
                if key != "Parent" {
                    assert_no_references(value, seen);
                }
            }
        }
        Primitive::Indirect(obj) => {
            if seen.insert(obj.node_id()) {
                assert_no_references(&obj.inner.borrow(), seen);
            }
        }
        Primitive::Stream(stm) => {
            if seen.insert(stm.node_id()) {
                for (key, value) in stm.dict.borrow().iter() {
                    if key != "Parent" {
                        assert_no_references(value, seen);
                    }
                }
            }
        }
        _ => {}
    }
}

#[test]
fn page_subgraph_is_fully_resolved() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 /Resources 4 0 R >>",
            "<< /Type /Page /Parent 2 0 R /Contents 5 0 R >>",
            "<< /Font << /F1 6 0 R >> >>",
            "<< /Length 6 >>\nstream\nBT  ET\nendstream",
            "<< /Type /Font /BaseFont /Helvetica >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    let page = reader.page(1).unwrap();
    let mut seen = HashSet::new();
    assert_no_references(&Primitive::Indirect(page.clone()), &mut seen);

    // /Contents resolved to the stream node, payload intact
    let contents = page_attr(&page, "Contents").unwrap();
    match contents {
        Primitive::Stream(stm) => assert_eq!(&*stm.data.borrow(), b"BT  ET"),
        p => panic!("expected stream, found {}", p.get_debug_name()),
    }
}

#[test]
fn outlines_walk_and_page_match() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R /Outlines 4 0 R >>",
            "<< /Type /Pages /Kids [3 0 R 7 0 R] /Count 2 >>",
            "<< /Type /Page /Parent 2 0 R >>",
            "<< /Type /Outlines /First 5 0 R /Last 6 0 R /Count 2 >>",
            "<< /Title (direct dest) /Parent 4 0 R /Dest [3 0 R /Fit] /Next 6 0 R >>",
            "<< /Title (goto action) /Parent 4 0 R /Prev 5 0 R /A << /S /GoTo /D [3 0 R /Fit] >> >>",
            "<< /Type /Page /Parent 2 0 R >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    let outlines = reader.outlines().unwrap();
    assert_eq!(outlines.len(), 2);

    let page1 = reader.page(1).unwrap();
    let page2 = reader.page(2).unwrap();
    let matched = reader.outlines_for_page(&page1).unwrap();
    assert_eq!(matched.len(), 2);
    for item in &matched {
        assert!(outlines.iter().any(|o| Rc::ptr_eq(o, item)));
    }
    assert!(reader.outlines_for_page(&page2).unwrap().is_empty());
}

#[test]
fn cyclic_outlines_are_detected() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R /Outlines 4 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R >>",
            "<< /Type /Outlines /First 5 0 R >>",
            "<< /Title (one) /Parent 4 0 R /Next 6 0 R >>",
            "<< /Title (two) /Parent 4 0 R /Next 5 0 R >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    assert!(matches!(reader.outlines(), Err(PdfError::CircularOutline)));
}

#[test]
fn forms_are_resolved() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R /AcroForm 4 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R >>",
            "<< /Fields [5 0 R] >>",
            "<< /T (name) /P 3 0 R >>",
        ],
        "",
    );
    let reader = Reader::from_data(data).unwrap();
    let forms = reader.forms().unwrap().unwrap();
    let fields = forms.get("Fields").unwrap().as_array().unwrap();
    assert_eq!(fields.len(), 1);
    // the field's /P is the same node the page list holds
    let field = fields[0].as_indirect().unwrap();
    let p = field.inner.borrow().as_dict().unwrap().get("P").unwrap().clone();
    let page = reader.page(1).unwrap();
    assert!(Rc::ptr_eq(p.as_indirect().unwrap(), &page));
}

/// Locate the xref table of an emitted file and return its in-use offsets.
fn parse_xref(data: &[u8]) -> (usize, Vec<usize>) {
    let sx = data
        .windows(b"startxref".len())
        .rposition(|w| w == b"startxref")
        .unwrap();
    let tail = std::str::from_utf8(&data[sx..]).unwrap();
    let xref_offset: usize = tail.lines().nth(1).unwrap().trim().parse().unwrap();

    let table = &data[xref_offset..];
    assert!(table.starts_with(b"xref\r\n"));
    let text = std::str::from_utf8(&data[xref_offset..sx]).unwrap();
    let mut lines = text.lines();
    lines.next(); // "xref"
    let header = lines.next().unwrap();
    let count: usize = header.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut offsets = Vec::new();
    for i in 0..count {
        let line = lines.next().unwrap();
        if i == 0 {
            assert!(line.starts_with("0000000000 65535 f"));
        } else {
            assert!(line.ends_with(" n") || line.ends_with(" n\r"));
            offsets.push(line[..10].parse().unwrap());
        }
    }
    (xref_offset, offsets)
}

fn simple_page(marker: i64) -> ObjRc {
    let mut dict = Dictionary::new();
    dict.insert("Type", Primitive::Name("Page".into()));
    dict.insert(
        "MediaBox",
        Primitive::Array(vec![0i64.into(), 0i64.into(), 612i64.into(), 792i64.into()]),
    );
    dict.insert("Idx", Primitive::Integer(marker));
    IndirectObject::new(dict.into())
}

#[test]
fn writer_emits_deterministic_numbering() {
    let mut writer = Writer::new();

    let font = IndirectObject::new({
        let mut d = Dictionary::new();
        d.insert("BaseFont", Primitive::Name("Helvetica".into()));
        d.into()
    });
    let xobj = IndirectObject::new({
        let mut d = Dictionary::new();
        d.insert("Subtype", Primitive::Name("Form".into()));
        d.into()
    });
    let page = simple_page(1);
    {
        let mut resources = Dictionary::new();
        resources.insert("Font", Primitive::Indirect(font));
        resources.insert("XObject", Primitive::Indirect(xobj));
        page.inner
            .borrow_mut()
            .as_dict_mut()
            .unwrap()
            .insert("Resources", Primitive::Dictionary(resources));
    }
    writer.add_page(&page).unwrap();

    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();
    let data = out.into_inner();

    assert!(data.starts_with(b"%PDF-1.3\n%\xE2\xE3\xCF\xD3\n"));

    let (_, offsets) = parse_xref(&data);
    assert_eq!(offsets.len(), 6);
    for (i, &off) in offsets.iter().enumerate() {
        let header = format!("{} 0 obj\n", i + 1);
        assert_eq!(
            &data[off..off + header.len()],
            header.as_bytes(),
            "object {} is not at its recorded offset",
            i + 1
        );
    }

    let text = String::from_utf8_lossy(&data);
    // recording order: info, catalog, pages root, page, then its sub-objects
    assert!(text.contains("1 0 obj\n<< /Producer"));
    assert!(text.contains("2 0 obj\n<< /Type /Catalog"));
    assert!(text.contains("3 0 obj\n<< /Type /Pages"));
    assert!(text.contains("4 0 obj\n<< /Type /Page"));
    assert!(text.contains("5 0 obj\n<< /BaseFont /Helvetica >>"));
    assert!(text.contains("6 0 obj\n<< /Subtype /Form >>"));
}

#[test]
fn write_then_read_roundtrip() {
    let mut writer = Writer::new();
    let page1 = simple_page(1);
    {
        let contents = PdfStream::new(Dictionary::new(), b"BT /F1 12 Tf ET".to_vec());
        page1
            .inner
            .borrow_mut()
            .as_dict_mut()
            .unwrap()
            .insert("Contents", Primitive::Stream(contents));
    }
    let page2 = simple_page(2);
    writer.add_page(&page1).unwrap();
    writer.add_page(&page2).unwrap();

    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();
    let data = out.into_inner();

    let reader = Reader::from_data(data).unwrap();
    assert_eq!(reader.num_pages(), 2);
    for n in 1..=2 {
        let page = reader.page(n).unwrap();
        assert_eq!(page_attr(&page, "Idx").unwrap().as_integer().unwrap(), n as i64);
        let media = page_attr(&page, "MediaBox").unwrap();
        assert_eq!(media.as_array().unwrap().len(), 4);
    }
    let contents = page_attr(&reader.page(1).unwrap(), "Contents").unwrap();
    match contents {
        Primitive::Stream(stm) => {
            assert_eq!(&*stm.data.borrow(), b"BT /F1 12 Tf ET");
            assert_eq!(
                stm.dict.borrow().get("Length").unwrap().as_integer().unwrap(),
                15
            );
        }
        p => panic!("expected stream, found {}", p.get_debug_name()),
    }
}

#[test]
fn read_write_read_preserves_pages() {
    let data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 /MediaBox [0 0 300 400] >>",
            "<< /Type /Page /Parent 2 0 R /Rotate 90 >>",
            "<< /Type /Page /Parent 2 0 R >>",
        ],
        "",
    );
    let first = Reader::from_data(data).unwrap();

    let mut writer = Writer::new();
    for n in 1..=first.num_pages() {
        let page = first.page(n).unwrap();
        writer.add_page(&page).unwrap();
    }
    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();

    let second = Reader::from_data(out.into_inner()).unwrap();
    assert_eq!(second.num_pages(), first.num_pages());

    let page = second.page(1).unwrap();
    assert_eq!(page_attr(&page, "Rotate").unwrap().as_integer().unwrap(), 90);
    // the ancestor MediaBox was hoisted into the leaf on add
    let media = page_attr(&page, "MediaBox").unwrap();
    let media = media.as_array().unwrap();
    assert_eq!(media[2].as_integer().unwrap(), 300);
}

#[test]
fn encrypt_and_redecrypt() {
    let mut writer = Writer::new();
    let page1 = simple_page(1);
    {
        let contents = PdfStream::new(Dictionary::new(), b"0.5 g".to_vec());
        let mut inner = page1.inner.borrow_mut();
        let dict = inner.as_dict_mut().unwrap();
        dict.insert("Contents", Primitive::Stream(contents));
        dict.insert(
            "Marker",
            Primitive::String(pdfdoc::object::PdfString::new(b"plain text".to_vec())),
        );
    }
    let page2 = simple_page(2);
    writer.add_page(&page1).unwrap();
    writer.add_page(&page2).unwrap();
    writer.encrypt(b"u", b"o", None).unwrap();

    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();
    let data = out.into_inner();

    // strings and stream payloads must not appear in the clear
    assert!(!data.windows(10).any(|w| w == b"plain text"));
    assert!(!data.windows(5).any(|w| w == b"0.5 g"));

    {
        let mut reader = Reader::from_data(data.clone()).unwrap();
        assert!(reader.is_encrypted());
        assert_eq!(reader.num_pages(), 0);
        assert!(matches!(reader.page(1), Err(PdfError::NeedsPassword)));
        assert!(!reader.decrypt(b"nope").unwrap());
        assert!(!reader.decrypt(b"").unwrap());

        assert!(reader.decrypt(b"u").unwrap());
        assert_eq!(reader.num_pages(), 2);
        let page = reader.page(1).unwrap();
        assert_eq!(
            page_attr(&page, "Marker").unwrap().as_string().unwrap().as_bytes(),
            b"plain text"
        );
        match page_attr(&page, "Contents").unwrap() {
            Primitive::Stream(stm) => assert_eq!(&*stm.data.borrow(), b"0.5 g"),
            p => panic!("expected stream, found {}", p.get_debug_name()),
        }
    }

    // the owner password opens the document too
    let mut reader = Reader::from_data(data).unwrap();
    assert!(reader.decrypt(b"o").unwrap());
    assert_eq!(reader.num_pages(), 2);
}

#[test]
fn empty_user_password_opens_without_password() {
    let mut writer = Writer::new();
    writer.add_page(&simple_page(1)).unwrap();
    writer.encrypt(b"", b"owner", None).unwrap();

    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();

    let mut reader = Reader::from_data(out.into_inner()).unwrap();
    assert!(reader.is_encrypted());
    // any wrong password falls back to the empty user password
    assert!(reader.decrypt(b"whatever").unwrap());
    assert_eq!(reader.num_pages(), 1);
}

#[test]
fn incremental_update_chain_is_followed() {
    // base file, then an appended section whose xref points back via /Prev
    let mut data = build_pdf(
        &[
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R /Idx 1 >>",
        ],
        "",
    );
    let base_xref = {
        let (off, _) = parse_xref(&data);
        off
    };
    // replace object 3
    let replacement_offset = data.len();
    data.extend_from_slice(b"3 0 obj\n<< /Type /Page /Parent 2 0 R /Idx 42 >>\nendobj\n");
    let xref_offset = data.len();
    data.extend_from_slice(b"xref\r\n3 1\r\n");
    data.extend_from_slice(format!("{:010} 00001 n\r\n", replacement_offset).as_bytes());
    data.extend_from_slice(
        format!(
            "trailer\n<< /Size 4 /Root 1 0 R /Prev {} >>\nstartxref\n{}\n%%EOF\n",
            base_xref, xref_offset
        )
        .as_bytes(),
    );

    let reader = Reader::from_data(data).unwrap();
    let page = reader.page(1).unwrap();
    assert_eq!(page_attr(&page, "Idx").unwrap().as_integer().unwrap(), 42);
}
