//! Loading published documents and small navigation helpers.

use std::path::Path;

use roxmltree::{Document, Node, ParsingOptions};

/// Why a document could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The file could not be read
    #[error("cannot read document: {0}")]
    Io(#[from] std::io::Error),

    /// The text is not well-formed XML
    #[error("document is not well-formed: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// Read a document file into memory.
pub async fn read_document(path: impl AsRef<Path>) -> Result<String, DocumentError> {
    Ok(tokio::fs::read_to_string(path.as_ref()).await?)
}

/// Parse document text. Documents with a DTD are accepted.
pub fn parse_document(text: &str) -> Result<Document<'_>, DocumentError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Ok(Document::parse_with_options(text, options)?)
}

/// First element child called `name`.
pub fn child<'a, 'input: 'a>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Every element child called `name`.
pub fn children<'a, 'input: 'a>(node: Node<'a, 'input>, name: &str) -> Vec<Node<'a, 'input>> {
    node.children()
        .filter(|n| n.is_element() && n.tag_name().name() == name)
        .collect()
}

/// Leading text of the first element child called `name`.
pub fn child_text<'a, 'input: 'a>(node: Node<'a, 'input>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text())
}

/// Attribute of the first element child called `name`.
pub fn child_attribute<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &str,
    attribute: &str,
) -> Option<&'a str> {
    child(node, name).and_then(|n| n.attribute(attribute))
}
