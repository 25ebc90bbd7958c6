//! Signature overlay on the first page.

use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

use crate::error::DocumentError;

/// Signature box size in points. The image is fitted inside, keeping its
/// aspect ratio, and centered.
pub const SIGNATURE_BOX: (f32, f32) = (100.0, 50.0);
/// Distance of the box from the right page edge, in points.
pub const MARGIN_RIGHT: f32 = 80.0;
/// Distance of the box from the bottom page edge, in points.
pub const MARGIN_BOTTOM: f32 = 45.0;

/// Placement of the drawn image in PDF user space (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignatureRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl SignatureRect {
    /// Anchor the signature box bottom-right on a page whose MediaBox is
    /// `[llx, lly, urx, ury]`.
    ///
    /// The box keeps its fixed margins when the page is large enough; on
    /// smaller pages it shrinks and slides so it always stays on the page.
    pub fn place(media_box: [f32; 4], image_px: (u32, u32)) -> Self {
        let [llx, lly, urx, ury] = media_box;
        let page_w = (urx - llx).max(0.0);
        let page_h = (ury - lly).max(0.0);

        let box_w = SIGNATURE_BOX.0.min(page_w);
        let box_h = SIGNATURE_BOX.1.min(page_h);
        let box_x = (page_w - box_w - MARGIN_RIGHT).max(0.0);
        let box_y = MARGIN_BOTTOM.min(page_h - box_h).max(0.0);

        let (img_w, img_h) = (image_px.0.max(1) as f32, image_px.1.max(1) as f32);
        let scale = (box_w / img_w).min(box_h / img_h);
        let width = img_w * scale;
        let height = img_h * scale;

        Self {
            x: llx + box_x + (box_w - width) / 2.0,
            y: lly + box_y + (box_h - height) / 2.0,
            width,
            height,
        }
    }
}

/// Draw a PNG signature on page 1 and return the rewritten PDF.
pub fn stamp_signature(pdf: &[u8], png: &[u8]) -> Result<Vec<u8>, DocumentError> {
    let rgba = image::load_from_memory(png)?.to_rgba8();
    let (img_w, img_h) = rgba.dimensions();

    let mut doc = Document::load_mem(pdf)?;
    let page_id = *doc
        .get_pages()
        .get(&1)
        .ok_or_else(|| DocumentError::Malformed("document has no pages".into()))?;

    let media_box = page_media_box(&doc, page_id).unwrap_or([0.0, 0.0, 612.0, 792.0]);
    let rect = SignatureRect::place(media_box, (img_w, img_h));

    let mut rgb = Vec::with_capacity((img_w * img_h * 3) as usize);
    let mut alpha = Vec::with_capacity((img_w * img_h) as usize);
    for px in rgba.pixels() {
        rgb.extend_from_slice(&px.0[..3]);
        alpha.push(px.0[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ));

    let xobject_name = register_xobject(&mut doc, page_id, image_id)?;

    let save_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let draw = format!(
        "Q\nq {:.3} 0 0 {:.3} {:.3} {:.3} cm /{xobject_name} Do Q\n",
        rect.width, rect.height, rect.x, rect.y
    );
    let draw_id = doc.add_object(Stream::new(Dictionary::new(), draw.into_bytes()));

    let page = doc.get_dictionary_mut(page_id)?;
    let mut contents = vec![Object::Reference(save_id)];
    match page.get(b"Contents") {
        Ok(Object::Array(existing)) => contents.extend(existing.iter().cloned()),
        Ok(existing) => contents.push(existing.clone()),
        Err(_) => {}
    }
    contents.push(Object::Reference(draw_id));
    page.set("Contents", contents);

    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Look up an inheritable page attribute, walking `/Parent` links.
fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = Some(page_id);
    let mut depth = 0;
    while let Some(id) = current {
        let dict = doc.get_dictionary(id).ok()?;
        if let Ok(value) = dict.get(key) {
            return match value {
                Object::Reference(r) => doc.get_object(*r).ok().cloned(),
                other => Some(other.clone()),
            };
        }
        depth += 1;
        if depth > 32 {
            return None;
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn page_media_box(doc: &Document, page_id: ObjectId) -> Option<[f32; 4]> {
    let media_box = inherited(doc, page_id, b"MediaBox")?;
    let values: Vec<f32> = media_box.as_array().ok()?.iter().filter_map(number).collect();
    match values.as_slice() {
        [a, b, c, d] => Some([a.min(*c), b.min(*d), a.max(*c), b.max(*d)]),
        _ => None,
    }
}

/// Give the page its own Resources carrying the image, and return the
/// XObject name it was registered under.
fn register_xobject(
    doc: &mut Document,
    page_id: ObjectId,
    image_id: ObjectId,
) -> Result<String, DocumentError> {
    let mut resources = match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(dict)) => dict,
        _ => Dictionary::new(),
    };
    let mut xobjects = match resources.get(b"XObject") {
        Ok(Object::Reference(r)) => doc.get_dictionary(*r).cloned().unwrap_or_default(),
        Ok(Object::Dictionary(dict)) => dict.clone(),
        _ => Dictionary::new(),
    };

    let mut name = "SigCoi".to_string();
    let mut n = 1;
    while xobjects.has(name.as_bytes()) {
        name = format!("SigCoi{n}");
        n += 1;
    }
    xobjects.set(name.clone(), image_id);
    resources.set("XObject", xobjects);
    doc.get_dictionary_mut(page_id)?.set("Resources", resources);
    Ok(name)
}
