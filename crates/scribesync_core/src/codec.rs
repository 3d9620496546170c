//! Base64 byte transport codec and HTML-to-CRDT seeding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scraper::Html;

use crate::crdt::replica::Replica;
use crate::error::{Result, SyncCoreError};

/// Encode bytes as RFC4648-standard base64, no line wrapping.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode RFC4648-standard base64 back to bytes.
///
/// Fails with [`SyncCoreError::Decode`] on malformed input.
pub fn from_base64(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| SyncCoreError::decode(format!("invalid base64: {e}")))
}

/// One node of the simplified DOM tree parsed out of seed HTML.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HtmlNode {
    /// A tagged element carrying its attribute set and children.
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<HtmlNode>,
    },
    /// A leaf text run.
    Text(String),
}

/// Parse `html` into a forest of [`HtmlNode`]s, mirroring the DOM's block
/// and inline structure. Comments and other non-element/text nodes are
/// skipped.
fn parse_html(html: &str) -> Vec<HtmlNode> {
    let document = Html::parse_fragment(html);
    let body_selector = scraper::Selector::parse("body").expect("static selector is valid");

    let root = match document.select(&body_selector).next() {
        Some(body) => *body,
        None => *document.root_element(),
    };

    root.children().filter_map(convert_node).collect()
}

fn convert_node(node: ego_tree::NodeRef<'_, scraper::node::Node>) -> Option<HtmlNode> {
    match node.value() {
        scraper::node::Node::Element(element) => {
            let tag = element.name().to_string();
            let attrs = element
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let children = node.children().filter_map(convert_node).collect();
            Some(HtmlNode::Element {
                tag,
                attrs,
                children,
            })
        }
        scraper::node::Node::Text(text) => {
            let s = text.trim();
            if s.is_empty() {
                None
            } else {
                Some(HtmlNode::Text(s.to_string()))
            }
        }
        _ => None,
    }
}

/// Seed `replica`'s root fragment from `html`, under a single atomic
/// transaction tagged with the `populate` origin.
///
/// Only applied when the root fragment is currently empty; re-seeding an
/// already-populated replica is a no-op.
pub fn seed_document_from_html(replica: &Replica, html: &str) -> Result<()> {
    if !replica.is_empty() {
        return Ok(());
    }
    let nodes = parse_html(html);
    replica.populate(&nodes)
}
