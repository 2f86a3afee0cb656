//! Vendor purchase-confirmation email parser.
//!
//! Turns a raw email (subject + text body + html body) into a `ParsedOrder`
//! with one `ParsedItem` per confirmation code. HTML extraction is primary,
//! line-oriented text extraction is the fallback; both feed the same
//! fragment extractor so they produce identical item shapes.
//!
//! Parsing is deterministic and pure. Emails that are not purchase
//! confirmations (wrong subject, no reference number, no items) yield `None`.

mod html;
mod text;

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

/// A normalized inbound email, as delivered by the mailbox poller.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub sender: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// One order extracted from a purchase-confirmation email.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOrder {
    pub reference_number: String,
    pub purchase_date: Option<DateTime<Utc>>,
    pub reseller_name: Option<String>,
    pub customer_name: String,
    pub customer_email: String,
    pub alternative_email: Option<String>,
    pub mobile_number: Option<String>,
    pub payment_status: Option<String>,
    pub items: Vec<ParsedItem>,
}

/// One order line, keyed by confirmation code.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub confirmation_code: String,
    pub product_name: String,
    pub product_variant: Option<String>,
    pub sku: String,
    pub visit_date: Option<DateTime<Utc>>,
    pub quantity: i64,
    pub unit_price: Option<i64>,
}

/// Emails whose subject does not mention this keyword are not purchase
/// confirmations and are skipped before any body work.
const SUBJECT_KEYWORD: &str = "ticket";

static RE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Reference Number\s*[:\-]?\s*([A-Z0-9]+)").unwrap());
static RE_PURCHASE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Purchase Date\s*[:\-]?\s*(.+)").unwrap());
static RE_RESELLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Reseller Name\s*[:\-]?\s*(.+)").unwrap());
static RE_CUSTOMER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Customer Name\s*[:\-]?\s*(.+)").unwrap());
static RE_CUSTOMER_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Customer Email\s*[:\-]?\s*(.+)").unwrap());
static RE_ALT_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Alternate Email\s*[:\-]?\s*(.+)").unwrap());
static RE_MOBILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Mobile Number\s*[:\-]?\s*(.+)").unwrap());
static RE_PAYMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Payment Collection Status\s*[:\-]?\s*(.+)").unwrap());

static RE_CODE_LABELED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Confirmation Code\s*[:\-]?\s*([A-Z0-9]{6,})").unwrap());
static RE_CODE_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z0-9]{6,}\b").unwrap());
static RE_SKU_PREFIXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bWM-[A-Z0-9\-]+").unwrap());
static RE_SKU_LABELED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SKU\s*[:\-]?\s*([A-Z0-9\-]+)").unwrap());
// The regex crate has no lookahead; the boundary tokens are matched as a
// non-capturing terminator group instead.
static RE_PRODUCT_ESIM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(eSIM.+?)\s*(?:WM-|SKU|Visit|Quantity|IDR)").unwrap());
static RE_PRODUCT_LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Product\s*Name\s*[:\-]?\s*(.+?)\s*(?:SKU|Visit|Quantity|IDR)").unwrap()
});
static RE_VISIT_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Visit Date\s*[:\-]?\s*(.+?)\s*(?:IDR|Quantity|SKU|$)").unwrap()
});
static RE_QUANTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Quantity\s*[:\-]?\s*(\d+)").unwrap());
static RE_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)IDR\s*([\d.,]+)").unwrap());

/// Parse one inbound email. `None` means "not an order for us", never an
/// error: wrong subject, no reference number, or no extractable items.
pub fn parse_order(raw: &RawEmail) -> Option<ParsedOrder> {
    if raw.text.is_empty() && raw.html.is_empty() {
        warn!(sender = %raw.sender, "Empty email body, skipping");
        return None;
    }

    if !raw.subject.to_lowercase().contains(SUBJECT_KEYWORD) {
        debug!(subject = %raw.subject, "Subject keyword missing, skipping");
        return None;
    }

    let reference_number = capture(&RE_REFERENCE, &raw.text)?;

    let mut items = if raw.html.is_empty() {
        Vec::new()
    } else {
        html::extract_items(&raw.html)
    };
    if items.is_empty() && !raw.text.is_empty() {
        items = text::extract_items(&raw.text);
    }
    if items.is_empty() {
        warn!(reference = %reference_number, "No items found in email");
        return None;
    }

    debug!(
        reference = %reference_number,
        item_count = items.len(),
        "Parsed order email"
    );

    Some(ParsedOrder {
        reference_number,
        purchase_date: capture(&RE_PURCHASE_DATE, &raw.text)
            .and_then(|s| parse_loose_date(&s)),
        reseller_name: capture(&RE_RESELLER, &raw.text),
        customer_name: capture(&RE_CUSTOMER_NAME, &raw.text).unwrap_or_default(),
        customer_email: capture(&RE_CUSTOMER_EMAIL, &raw.text)
            .map(|s| s.to_lowercase())
            .unwrap_or_default(),
        alternative_email: capture(&RE_ALT_EMAIL, &raw.text),
        mobile_number: capture(&RE_MOBILE, &raw.text),
        payment_status: capture(&RE_PAYMENT, &raw.text),
        items,
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Collapse runs of whitespace into single spaces.
pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract one item from a normalized text fragment that mentions a
/// confirmation code. Shared by the HTML and text strategies.
///
/// Items with no recognizable SKU are dropped: downstream fulfillment cannot
/// map them to a product, so persisting a sentinel would only defer the
/// failure.
pub(crate) fn extract_item(fragment: &str, seen: &mut HashSet<String>) -> Option<ParsedItem> {
    let confirmation_code = capture(&RE_CODE_LABELED, fragment).or_else(|| {
        RE_CODE_BARE
            .find(fragment)
            .map(|m| m.as_str().to_string())
    })?;
    if seen.contains(&confirmation_code) {
        return None;
    }

    let sku = RE_SKU_PREFIXED
        .find(fragment)
        .map(|m| m.as_str().to_string())
        .or_else(|| capture(&RE_SKU_LABELED, fragment));
    let Some(sku) = sku else {
        warn!(code = %confirmation_code, "Item has no SKU, dropping");
        seen.insert(confirmation_code);
        return None;
    };

    let product_name = capture(&RE_PRODUCT_ESIM, fragment)
        .or_else(|| capture(&RE_PRODUCT_LABELED, fragment))
        .unwrap_or_else(|| "Unknown Product".to_string());

    let quantity = capture(&RE_QUANTITY, fragment)
        .and_then(|q| q.parse::<i64>().ok())
        .filter(|q| *q > 0)
        .unwrap_or(1);

    let item = ParsedItem {
        confirmation_code: confirmation_code.clone(),
        product_name,
        product_variant: Some(sku.clone()),
        sku,
        visit_date: capture(&RE_VISIT_DATE, fragment).and_then(|s| parse_loose_date(&s)),
        quantity,
        unit_price: capture(&RE_PRICE, fragment).and_then(|s| parse_price(&s)),
    };
    seen.insert(confirmation_code);
    Some(item)
}

/// Parse an `IDR 1.234.567` style amount by stripping every non-digit.
fn parse_price(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Best-effort date parsing over the formats the vendor emails use.
/// Unparseable input is `None`, never an error.
fn parse_loose_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_end_matches(',').trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ndt.and_utc());
        }
    }
    for fmt in [
        "%Y-%m-%d",
        "%d %B %Y",
        "%B %d, %Y",
        "%b %d, %Y",
        "%d %b %Y",
        "%d/%m/%Y",
    ] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
        }
    }
    None
}
