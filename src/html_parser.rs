use std::cell::RefCell;
use std::collections::HashMap;

use lol_html::{element, rewrite_str, RewriteStrSettings};

use crate::error::RewriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Stylesheet,
    Script,
    Image,
    Hyperlink,
}

impl ReferenceKind {
    /// Assets are localized with the page; hyperlinks point at other pages.
    pub fn is_asset(self) -> bool {
        !matches!(self, Self::Hyperlink)
    }
}

/// One row of the reference table: which attribute on which tag holds a URL,
/// and what kind of reference it is.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceRule {
    pub tag: &'static str,
    pub attribute: &'static str,
    selector: &'static str,
    pub kind: ReferenceKind,
}

/// Every attribute the rewriter inspects. `link` covers all `rel` values
/// (stylesheets, icons, preloads).
pub const REFERENCE_TABLE: &[ReferenceRule] = &[
    ReferenceRule {
        tag: "link",
        attribute: "href",
        selector: "link[href]",
        kind: ReferenceKind::Stylesheet,
    },
    ReferenceRule {
        tag: "script",
        attribute: "src",
        selector: "script[src]",
        kind: ReferenceKind::Script,
    },
    ReferenceRule {
        tag: "img",
        attribute: "src",
        selector: "img[src]",
        kind: ReferenceKind::Image,
    },
    ReferenceRule {
        tag: "a",
        attribute: "href",
        selector: "a[href]",
        kind: ReferenceKind::Hyperlink,
    },
];

/// An attribute value as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub raw: String,
}

/// Replacement values keyed by reference kind and the raw attribute value
/// they replace.
pub type Replacements = HashMap<(ReferenceKind, String), String>;

/// Collects every table reference in document order.
pub fn extract_references(html_content: &str) -> Result<Vec<Reference>, RewriteError> {
    let found = RefCell::new(Vec::new());

    let handlers = REFERENCE_TABLE
        .iter()
        .map(|rule| {
            let found = &found;
            element!(rule.selector, move |el| {
                if let Some(raw) = el.get_attribute(rule.attribute) {
                    found.borrow_mut().push(Reference {
                        kind: rule.kind,
                        raw,
                    });
                }
                Ok(())
            })
        })
        .collect();

    rewrite_str(
        html_content,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )?;

    Ok(found.into_inner())
}

/// Re-serializes the document with only the replaced attribute values
/// changed. Everything else passes through byte for byte.
pub fn apply_replacements(
    html_content: &str,
    replacements: &Replacements,
) -> Result<String, RewriteError> {
    if replacements.is_empty() {
        return Ok(html_content.to_string());
    }

    let handlers = REFERENCE_TABLE
        .iter()
        .map(|rule| {
            element!(rule.selector, move |el| {
                if let Some(raw) = el.get_attribute(rule.attribute) {
                    if let Some(value) = replacements.get(&(rule.kind, raw)) {
                        el.set_attribute(rule.attribute, value)?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    let rewritten = rewrite_str(
        html_content,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )?;

    Ok(rewritten)
}

/// Attribute text as a URL reference: trimmed, with named and numeric
/// character references decoded. The rewriter hands values back raw.
pub fn decode_reference(raw: &str) -> String {
    html_escape::decode_html_entities(raw.trim()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
    <head>
        <link rel="stylesheet" href="/style.css">
        <link rel="icon" href="favicon.ico">
        <script src="/script.js"></script>
        <script>var inline = "<a href='/not-a-link'>";</script>
    </head>
    <body>
        <img src="/image.jpg" alt="test">
        <a href="/page">Link</a>
        <a name="anchor-without-href">nothing</a>
        <img alt="no source">
    </body>
</html>"#;

    #[test]
    fn test_extracts_table_references_in_document_order() {
        let refs = extract_references(PAGE).unwrap();
        let kinds: Vec<(ReferenceKind, &str)> =
            refs.iter().map(|r| (r.kind, r.raw.as_str())).collect();

        assert_eq!(
            kinds,
            vec![
                (ReferenceKind::Stylesheet, "/style.css"),
                (ReferenceKind::Stylesheet, "favicon.ico"),
                (ReferenceKind::Script, "/script.js"),
                (ReferenceKind::Image, "/image.jpg"),
                (ReferenceKind::Hyperlink, "/page"),
            ]
        );
    }

    #[test]
    fn test_apply_replacements_changes_only_matching_attributes() {
        let mut replacements = Replacements::new();
        replacements.insert(
            (ReferenceKind::Stylesheet, "/style.css".to_string()),
            "style.css".to_string(),
        );
        replacements.insert(
            (ReferenceKind::Hyperlink, "/page".to_string()),
            "page/index.html".to_string(),
        );

        let rewritten = apply_replacements(PAGE, &replacements).unwrap();

        assert!(rewritten.contains(r#"<link rel="stylesheet" href="style.css">"#));
        assert!(rewritten.contains(r#"<a href="page/index.html">Link</a>"#));
        assert!(rewritten.contains(r#"<script src="/script.js"></script>"#));
        assert!(rewritten.contains(r#"var inline = "<a href='/not-a-link'>";"#));
        assert_eq!(
            rewritten.replace("style.css\"", "/style.css\"").replace("page/index.html", "/page"),
            PAGE
        );
    }

    #[test]
    fn test_replacement_is_scoped_by_kind() {
        let html = r#"<link rel="prefetch" href="/b"><a href="/b">b</a>"#;
        let mut replacements = Replacements::new();
        replacements.insert(
            (ReferenceKind::Hyperlink, "/b".to_string()),
            "b/index.html".to_string(),
        );

        let rewritten = apply_replacements(html, &replacements).unwrap();
        assert_eq!(
            rewritten,
            r#"<link rel="prefetch" href="/b"><a href="b/index.html">b</a>"#
        );
    }

    #[test]
    fn test_no_replacements_returns_input_verbatim() {
        let html = "<p>  odd   <b>spacing</p> kept";
        assert_eq!(apply_replacements(html, &Replacements::new()).unwrap(), html);
    }

    #[test]
    fn test_decode_reference() {
        assert_eq!(decode_reference("  /a?x=1&amp;y=2 "), "/a?x=1&y=2");
        assert_eq!(decode_reference("/a?x=1&#38;y=2"), "/a?x=1&y=2");
        assert_eq!(decode_reference("&#x2F;docs&#47;intro"), "/docs/intro");
        assert_eq!(decode_reference("/q?a=&quot;b&quot;&lt;"), "/q?a=\"b\"<");
        assert_eq!(decode_reference("/plain/path.css"), "/plain/path.css");
    }
}
