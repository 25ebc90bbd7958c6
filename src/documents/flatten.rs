//! Flattening by rasterization.
//!
//! Each page is rendered to an image and the document is rebuilt with one
//! full-page image per page, so no form field survives.

use std::path::PathBuf;

use async_trait::async_trait;
use lopdf::{Document, Object, Stream, dictionary};
use tokio::process::Command;

use crate::error::DocumentError;

/// Renders every page of a PDF to PNG, in page order.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// `scale` 1.0 renders at 72 dpi (one pixel per point).
    async fn rasterize(&self, pdf: &[u8], scale: f32) -> Result<Vec<Vec<u8>>, DocumentError>;
}

/// Rasterizer shelling out to poppler's `pdftoppm`.
pub struct PdftoppmRasterizer {
    binary: PathBuf,
}

impl PdftoppmRasterizer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn rasterize(&self, pdf: &[u8], scale: f32) -> Result<Vec<Vec<u8>>, DocumentError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.pdf");
        tokio::fs::write(&input, pdf).await?;

        let dpi = (72.0 * scale).round().max(1.0) as u32;
        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-png")
            .arg(&input)
            .arg(workdir.path().join("page"))
            .output()
            .await
            .map_err(|e| {
                DocumentError::Rasterize(format!("failed to run {}: {e}", self.binary.display()))
            })?;
        if !output.status.success() {
            return Err(DocumentError::Rasterize(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // pdftoppm names pages page-1.png or page-01.png depending on count.
        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(workdir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = name
                .strip_prefix("page-")
                .and_then(|rest| rest.strip_suffix(".png"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                pages.push((number, entry.path()));
            }
        }
        pages.sort_by_key(|(number, _)| *number);

        let mut images = Vec::with_capacity(pages.len());
        for (_, path) in pages {
            images.push(tokio::fs::read(path).await?);
        }
        if images.is_empty() {
            return Err(DocumentError::Rasterize("no pages rendered".into()));
        }
        Ok(images)
    }
}

/// Build a PDF with one image-only page per rendered page.
///
/// Page size is the pixel size divided by `scale`, so a page rendered at
/// scale 2.0 comes back at its original point size.
pub fn rebuild_from_pages(pages: &[Vec<u8>], scale: f32) -> Result<Vec<u8>, DocumentError> {
    if pages.is_empty() {
        return Err(DocumentError::Malformed("no pages to rebuild from".into()));
    }
    let scale = if scale > 0.0 { scale } else { 1.0 };

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for png in pages {
        let rgb = image::load_from_memory(png)?.to_rgb8();
        let (px_w, px_h) = rgb.dimensions();
        let width = px_w as f32 / scale;
        let height = px_h as f32 / scale;

        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => px_w as i64,
                "Height" => px_h as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            rgb.into_raw(),
        ));
        let content = format!("q {width:.3} 0 0 {height:.3} 0 0 cm /Page Do Q\n");
        let content_id = doc.add_object(Stream::new(lopdf::Dictionary::new(), content.into_bytes()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), Object::Real(width.into()), Object::Real(height.into())],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Page" => image_id },
            },
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}
