//! Plain-text item extraction — the fallback strategy.
//!
//! Splits the body on "Confirmation Code" labels and runs the shared item
//! extractor over each block. Used when the HTML body is absent or yields
//! no items.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{ParsedItem, extract_item, normalize};

static RE_BLOCK_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Confirmation Code\s*[:\-]?\s*").unwrap());

pub(crate) fn extract_items(text: &str) -> Vec<ParsedItem> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();

    for block in RE_BLOCK_SPLIT.split(text).skip(1) {
        // Re-attach the label so the shared extractor sees the same shape
        // the HTML strategy produces.
        let fragment = format!("Confirmation Code: {}", normalize(block));
        if let Some(item) = extract_item(&fragment, &mut seen) {
            items.push(item);
        }
    }

    items
}
