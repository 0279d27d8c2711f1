//! PDF rasterisation: render a page range to `DynamicImage` via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## Why cap pixels, not DPI?
//!
//! Scanned dictionary volumes vary wildly in physical page size.
//! `max_rendered_pixels` caps the longest edge regardless of size, keeping
//! memory bounded and matching the image-size sweet spot for GPT-class
//! vision models (around 1,024–2,048 px).

use crate::error::MoraqmanError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::debug;

/// Count the pages of a PDF without rendering anything.
///
/// Used by the preparation tool to size the job range.
pub async fn page_count(pdf_path: &Path) -> Result<u32, MoraqmanError> {
    let path = pdf_path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_file(&path, None)
            .map_err(|e| MoraqmanError::CorruptPdf {
                path: path.clone(),
                detail: format!("{e:?}"),
            })?;
        Ok(document.pages().len() as u32)
    })
    .await
    .map_err(|e| MoraqmanError::Internal(format!("Page-count task panicked: {e}")))?
}

/// Rasterise an inclusive 1-indexed page range into images, in order.
///
/// This runs inside `spawn_blocking` since pdfium operations are CPU-bound.
pub async fn render_page_range(
    pdf_path: &Path,
    first_page: u32,
    last_page: u32,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, MoraqmanError> {
    let path = pdf_path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        render_page_range_blocking(&path, first_page, last_page, max_pixels)
    })
    .await
    .map_err(|e| MoraqmanError::Internal(format!("Render task panicked: {e}")))?
}

/// Blocking implementation of page-range rendering.
fn render_page_range_blocking(
    pdf_path: &Path,
    first_page: u32,
    last_page: u32,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, MoraqmanError> {
    let pdfium = Pdfium::default();

    let document =
        pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| MoraqmanError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: format!("{e:?}"),
            })?;

    let pages = document.pages();
    let total = pages.len() as u32;

    if last_page > total {
        return Err(MoraqmanError::PageOutOfRange {
            page: last_page,
            total,
        });
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::with_capacity((last_page - first_page + 1) as usize);

    for page_num in first_page..=last_page {
        let page = pages.get((page_num - 1) as u16).map_err(|e| {
            MoraqmanError::RasterisationFailed {
                page: page_num,
                detail: format!("{e:?}"),
            }
        })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            MoraqmanError::RasterisationFailed {
                page: page_num,
                detail: format!("{e:?}"),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}
