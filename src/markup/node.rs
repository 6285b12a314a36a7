//! Parsed markup tree.

use std::fmt;

use super::{MarkupError, MarkupResult};

/// Kind of a [`MarkupNode`], used by match criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupNode {
    /// Synthetic container above the top-level elements.
    Root(Vec<MarkupNode>),
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    /// Attributes in document order. Names are lowercase. Parsed documents
    /// never repeat a name, but trees built from raw events may.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<MarkupNode>,
}

impl MarkupNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            MarkupNode::Root(_) => NodeKind::Root,
            MarkupNode::Element(_) => NodeKind::Element,
            MarkupNode::Text(_) => NodeKind::Text,
        }
    }

    pub fn children(&self) -> &[MarkupNode] {
        match self {
            MarkupNode::Root(children) => children,
            MarkupNode::Element(el) => &el.children,
            MarkupNode::Text(_) => &[],
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            MarkupNode::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MarkupNode::Text(data) => Some(data),
            _ => None,
        }
    }

    /// The single top-level element of a closed document.
    pub fn top_element(&self) -> MarkupResult<&Element> {
        match self {
            MarkupNode::Root(children) => match children.as_slice() {
                [MarkupNode::Element(el)] => Ok(el),
                _ => Err(MarkupError::UnbalancedTree(format!(
                    "expected exactly 1 top-level element, found {} nodes",
                    children.len()
                ))),
            },
            MarkupNode::Element(el) => Ok(el),
            MarkupNode::Text(_) => Err(MarkupError::UnbalancedTree(
                "a text node has no top-level element".into(),
            )),
        }
    }

    /// Concatenated text of this node and all descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            MarkupNode::Text(data) => out.push_str(data),
            other => {
                for child in other.children() {
                    child.collect_text(out);
                }
            }
        }
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "│   ".repeat(depth.saturating_sub(1)) + if depth > 0 { "├── " } else { "" };
        match self {
            MarkupNode::Root(children) => {
                writeln!(f, "{}#root", indent)?;
                for child in children {
                    child.write_tree(f, depth + 1)?;
                }
            }
            MarkupNode::Text(data) => writeln!(f, "{}text: {:?}", indent, data)?,
            MarkupNode::Element(el) => {
                write!(f, "{}<{}", indent, el.tag)?;
                for (name, value) in &el.attrs {
                    write!(f, " {}={:?}", name, value)?;
                }
                writeln!(f, ">")?;
                for child in &el.children {
                    child.write_tree(f, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for MarkupNode {
    /// Indented tree dump for diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Value of a unique attribute. An attribute given more than once is an
    /// error, since it is impossible to tell which value the page meant.
    pub fn attr(&self, name: &str) -> MarkupResult<Option<&str>> {
        let mut found = self.attrs.iter().filter(|(n, _)| n == name);
        let first = found.next();
        if found.next().is_some() {
            return Err(MarkupError::DuplicateAttribute {
                tag: self.tag.clone(),
                name: name.to_string(),
            });
        }
        Ok(first.map(|(_, v)| v.as_str()))
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|(n, _)| n == name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .iter()
            .filter(|(n, _)| n == "class")
            .flat_map(|(_, v)| v.split_ascii_whitespace())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag == tag
    }

    /// The `index`-th child if it is an element.
    pub fn child_element(&self, index: usize) -> Option<&Element> {
        self.children.get(index).and_then(MarkupNode::as_element)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        MarkupNode::Element(self.clone()).write_tree(f, 0)
    }
}
