//! Tagging of document lines at interpretation time.

use kardex_core::{ProductCode, ProductId};

use crate::legacy::LegacyDetail;
use crate::rules::TEXT_SENTINEL;

/// What a document line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// A stock line for a known catalog product.
    Product(ProductId),
    /// A free-text line; stored as a note, never as stock.
    Text { description: Option<String>, body: Option<String> },
}

/// Why a line produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkippedLine {
    /// Product code not present in the local catalog.
    UnknownProduct(String),
}

/// Tag `detail`, resolving product codes through `lookup`.
///
/// Blank product codes and the `TEXTO` sentinel (any case) are text lines.
pub fn classify_line<F>(detail: &LegacyDetail, lookup: F) -> Result<LineKind, SkippedLine>
where
    F: FnOnce(&ProductCode) -> Option<ProductId>,
{
    let code = detail
        .product_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case(TEXT_SENTINEL));

    let Some(code) = code else {
        return Ok(LineKind::Text {
            description: detail.description.clone(),
            body: detail.text.clone(),
        });
    };

    let product_code =
        ProductCode::new(code).map_err(|_| SkippedLine::UnknownProduct(code.to_string()))?;
    lookup(&product_code)
        .map(LineKind::Product)
        .ok_or_else(|| SkippedLine::UnknownProduct(code.to_string()))
}
