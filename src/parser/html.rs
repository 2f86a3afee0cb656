//! HTML item extraction — the primary strategy.
//!
//! Walks every element under `<body>`, normalizes its text, and hands each
//! fragment that mentions a confirmation code to the shared item extractor.
//! Nested containers repeat the same codes; the seen-set keeps the first hit.

use std::collections::HashSet;

use scraper::{Html, Selector};

use super::{ParsedItem, extract_item, normalize};

pub(crate) fn extract_items(html: &str) -> Vec<ParsedItem> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("body *") else {
        return Vec::new();
    };

    let mut items = Vec::new();
    let mut seen = HashSet::new();

    for element in document.select(&selector) {
        let fragment = normalize(&element.text().collect::<Vec<_>>().join(" "));
        if !fragment.to_lowercase().contains("confirmation code") {
            continue;
        }
        if let Some(item) = extract_item(&fragment, &mut seen) {
            items.push(item);
        }
    }

    items
}
