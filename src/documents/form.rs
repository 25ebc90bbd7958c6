//! AcroForm filling for the certificate holder block.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use lopdf::{Document, Object, ObjectId};

use crate::error::DocumentError;

pub const FIELD_COMPLETION_DATE: &str = "Form_CompletionDate_A";
pub const FIELD_HOLDER_NAME: &str = "CertificateHolder_FullName_A";
pub const FIELD_HOLDER_ADDR_1: &str = "CertificateHolder_MailingAddress_LineOne_A";
pub const FIELD_HOLDER_ADDR_2: &str = "CertificateHolder_MailingAddress_LineTwo_A";

/// The certificate holder printed on the certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateHolder {
    pub name: String,
    pub address_line_1: String,
    pub address_line_2: String,
}

impl CertificateHolder {
    /// Field name → value, with the completion date as MM/DD/YYYY.
    fn field_values(&self, today: NaiveDate) -> [(&'static str, String); 4] {
        [
            (FIELD_COMPLETION_DATE, today.format("%m/%d/%Y").to_string()),
            (FIELD_HOLDER_NAME, self.name.clone()),
            (FIELD_HOLDER_ADDR_1, self.address_line_1.clone()),
            (FIELD_HOLDER_ADDR_2, self.address_line_2.clone()),
        ]
    }
}

/// A terminal form field: its fully qualified name and widget kids.
struct FieldNode {
    id: ObjectId,
    name: String,
    widgets: Vec<ObjectId>,
}

/// Set the holder fields and completion date, returning the rewritten PDF.
///
/// Every target field must exist; nothing is modified otherwise. Stale
/// appearance streams on filled fields are dropped and `NeedAppearances`
/// is set so viewers (and the rasterizer) regenerate them.
pub fn fill_holder_fields(
    pdf: &[u8],
    holder: &CertificateHolder,
    today: NaiveDate,
) -> Result<Vec<u8>, DocumentError> {
    let mut doc = Document::load_mem(pdf)?;
    let fields = collect_fields(&doc)?;

    let mut updates = Vec::new();
    for (name, value) in holder.field_values(today) {
        let node = fields
            .iter()
            .find(|f| f.name == name || f.name.rsplit('.').next() == Some(name))
            .ok_or_else(|| DocumentError::MissingField(name.to_string()))?;
        updates.push((node.id, node.widgets.clone(), value));
    }

    for (id, widgets, value) in updates {
        let field = doc.get_dictionary_mut(id)?;
        field.set("V", Object::string_literal(value));
        field.remove(b"AP");
        for widget in widgets {
            doc.get_dictionary_mut(widget)?.remove(b"AP");
        }
    }

    set_need_appearances(&mut doc)?;

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Read every terminal field's value (empty string when unset).
pub fn read_form_fields(pdf: &[u8]) -> Result<BTreeMap<String, String>, DocumentError> {
    let doc = Document::load_mem(pdf)?;
    let mut values = BTreeMap::new();
    for node in collect_fields(&doc)? {
        let value = doc
            .get_dictionary(node.id)?
            .get(b"V")
            .ok()
            .and_then(|v| text_value(&doc, v))
            .unwrap_or_default();
        values.insert(node.name, value);
    }
    Ok(values)
}

fn acroform_fields(doc: &Document) -> Result<Vec<Object>, DocumentError> {
    let catalog = doc.catalog()?;
    let Ok(acroform) = catalog.get(b"AcroForm") else {
        return Ok(Vec::new());
    };
    let acroform = resolve(doc, acroform)?.as_dict()?;
    match acroform.get(b"Fields") {
        Ok(fields) => Ok(resolve(doc, fields)?.as_array()?.clone()),
        Err(_) => Ok(Vec::new()),
    }
}

fn collect_fields(doc: &Document) -> Result<Vec<FieldNode>, DocumentError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<(Object, String)> = acroform_fields(doc)?
        .into_iter()
        .rev()
        .map(|f| (f, String::new()))
        .collect();

    while let Some((obj, parent_name)) = stack.pop() {
        let Ok(id) = obj.as_reference() else {
            continue;
        };
        if !seen.insert(id) {
            continue;
        }
        let dict = doc.get_dictionary(id)?;

        let partial = dict.get(b"T").ok().and_then(|t| text_value(doc, t));
        let name = match (&partial, parent_name.is_empty()) {
            (Some(p), true) => p.clone(),
            (Some(p), false) => format!("{parent_name}.{p}"),
            (None, _) => parent_name.clone(),
        };

        let kids = dict
            .get(b"Kids")
            .ok()
            .and_then(|k| resolve(doc, k).ok())
            .and_then(|k| k.as_array().ok())
            .cloned()
            .unwrap_or_default();

        // Kids with their own /T are child fields; the rest are widgets.
        let (child_fields, widgets): (Vec<Object>, Vec<Object>) =
            kids.into_iter().partition(|kid| {
                kid.as_reference()
                    .ok()
                    .and_then(|kid_id| doc.get_dictionary(kid_id).ok())
                    .is_some_and(|d| d.has(b"T"))
            });

        if child_fields.is_empty() {
            out.push(FieldNode {
                id,
                name,
                widgets: widgets
                    .iter()
                    .filter_map(|w| w.as_reference().ok())
                    .collect(),
            });
        } else {
            for child in child_fields.into_iter().rev() {
                stack.push((child, name.clone()));
            }
        }
    }
    Ok(out)
}

fn set_need_appearances(doc: &mut Document) -> Result<(), DocumentError> {
    let acroform_ref = doc.catalog()?.get(b"AcroForm")?.as_reference().ok();
    match acroform_ref {
        Some(id) => {
            doc.get_dictionary_mut(id)?.set("NeedAppearances", true);
        }
        None => {
            let root = doc.trailer.get(b"Root")?.as_reference()?;
            if let Object::Dictionary(acroform) = doc.get_dictionary_mut(root)?.get_mut(b"AcroForm")? {
                acroform.set("NeedAppearances", true);
            }
        }
    }
    Ok(())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object, DocumentError> {
    match obj {
        Object::Reference(id) => Ok(doc.get_object(*id)?),
        other => Ok(other),
    }
}

/// Decode a PDF text string (PDFDocEncoding approximated as Latin-1, or
/// UTF-16BE with BOM).
fn text_value(doc: &Document, obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = resolve(doc, obj).ok()? else {
        return None;
    };
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return Some(String::from_utf16_lossy(&units));
    }
    Some(match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    })
}
