//! Content identifier extraction
//!
//! Turns a fetched page into the ordered list of identifiers that get
//! compared across circuits (post IDs on a timeline, for instance).

use crate::config::DEFAULT_IDENTIFIER_ATTRIBUTE;

/// Pulls content identifiers out of a response body
pub trait IdentifierExtractor: Send + Sync {
    /// Identifiers in document order
    fn extract(&self, body: &[u8]) -> Vec<String>;
}

/// Collects the values of one HTML attribute, e.g. `data-tweet-id="123"`
///
/// This is a scanner, not an HTML parser: it matches `name=` preceded by
/// whitespace, with a double-quoted, single-quoted or bare value. Empty
/// values are skipped.
///
/// By default the attribute counts on any element. Timeline pages also put
/// `data-tweet-id` on quoted or embedded posts, so [`with_element_class`]
/// restricts matches to tags carrying a given class (`tweet` on Twitter).
///
/// [`with_element_class`]: DataAttributeExtractor::with_element_class
#[derive(Debug, Clone)]
pub struct DataAttributeExtractor {
    attribute: String,
    element_class: Option<String>,
}

impl DataAttributeExtractor {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into().to_ascii_lowercase(),
            element_class: None,
        }
    }

    /// Only take the attribute from elements whose `class` lists `class`
    pub fn with_element_class(mut self, class: impl Into<String>) -> Self {
        let class = class.into();
        let class = class.trim();
        self.element_class = (!class.is_empty()).then(|| class.to_string());
        self
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn element_class(&self) -> Option<&str> {
        self.element_class.as_deref()
    }
}

impl Default for DataAttributeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFIER_ATTRIBUTE)
    }
}

/// Byte offsets of every whole-name `name=` in `lower`, paired with the
/// offset its value starts at
fn attribute_matches<'a>(lower: &'a str, name: &str) -> impl Iterator<Item = (usize, usize)> + 'a {
    let needle = format!("{}=", name);
    let mut search_from = 0;

    std::iter::from_fn(move || {
        while let Some(offset) = lower[search_from..].find(&needle) {
            let start = search_from + offset;
            let value_start = start + needle.len();
            search_from = value_start;

            // Must be a whole attribute name, not the tail of a longer one
            let preceded_ok = lower[..start]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_whitespace())
                .unwrap_or(false);
            if preceded_ok {
                return Some((start, value_start));
            }
        }
        None
    })
}

/// The attribute value starting at `rest`
fn attribute_value(rest: &str) -> &str {
    let value = match rest.chars().next() {
        Some(quote @ ('"' | '\'')) => rest[1..].split(quote).next().unwrap_or(""),
        Some(_) => rest
            .split(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
            .next()
            .unwrap_or(""),
        None => "",
    };
    value.trim()
}

/// Whether the tag around byte `at` has `class` among its classes
fn enclosing_tag_has_class(lower: &str, at: usize, class: &str) -> bool {
    let open = match lower[..at].rfind('<') {
        Some(open) => open,
        None => return false,
    };
    let close = lower[at..].find('>').map_or(lower.len(), |offset| at + offset);
    let tag = &lower[open..close];

    attribute_matches(tag, "class").any(|(_, value_start)| {
        attribute_value(&tag[value_start..])
            .split_ascii_whitespace()
            .any(|c| c.eq_ignore_ascii_case(class))
    })
}

impl IdentifierExtractor for DataAttributeExtractor {
    fn extract(&self, body: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(body);
        let lower = text.to_ascii_lowercase();

        attribute_matches(&lower, &self.attribute)
            .filter(|(start, _)| match &self.element_class {
                Some(class) => enclosing_tag_has_class(&lower, *start, class),
                None => true,
            })
            .map(|(_, value_start)| attribute_value(&text[value_start..]))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }
}
