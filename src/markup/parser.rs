//! Tree builder with tag-soup recovery.

use tracing::debug;

use super::node::{Element, MarkupNode};
use super::tokenizer::{is_void_element, tokenize, MarkupEvent};
use super::{MarkupError, MarkupResult};

/// Builds a [`MarkupNode`] tree from markup events.
///
/// An open-element stack sits on top of a synthetic root. Closing a tag pops
/// elements until the matching one is found; every element popped on the way
/// was never closed, so it stays in place (empty) and its children move up
/// to its parent. Close tags with no matching open element are dropped.
///
/// A parser is reusable: [`MarkupParser::reset`] keeps the allocated stack.
#[derive(Debug)]
pub struct MarkupParser {
    root: Vec<MarkupNode>,
    stack: Vec<Element>,
    closed: bool,
}

impl Default for MarkupParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkupParser {
    pub fn new() -> Self {
        Self {
            root: Vec::new(),
            stack: Vec::with_capacity(32),
            closed: false,
        }
    }

    /// Tokenize `input` and apply its events.
    pub fn feed(&mut self, input: &str) -> MarkupResult<()> {
        for event in tokenize(input) {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: MarkupEvent) -> MarkupResult<()> {
        if self.closed {
            return Err(MarkupError::AlreadyClosed);
        }
        match event {
            MarkupEvent::Open {
                tag,
                attrs,
                self_closing,
            } => {
                let closes_immediately = self_closing || is_void_element(&tag);
                let element = Element {
                    tag,
                    attrs,
                    children: Vec::new(),
                };
                if closes_immediately {
                    self.append(MarkupNode::Element(element));
                } else {
                    self.stack.push(element);
                }
            }
            MarkupEvent::Close { tag } => self.close_element(&tag),
            MarkupEvent::Text(data) => {
                if !data.is_empty() {
                    self.append(MarkupNode::Text(data));
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, node: MarkupNode) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root.push(node),
        }
    }

    fn close_element(&mut self, tag: &str) {
        if !self.stack.iter().any(|el| el.tag == tag) {
            debug!("Ignoring stray close tag </{}>", tag);
            return;
        }
        while let Some(mut element) = self.stack.pop() {
            if element.tag == tag {
                self.append(MarkupNode::Element(element));
                return;
            }
            // Unclosed: keep the element, hand its children to the parent.
            let children = std::mem::take(&mut element.children);
            self.append(MarkupNode::Element(element));
            for child in children {
                self.append(child);
            }
        }
    }

    /// Finish the document.
    ///
    /// Fails unless every element was closed and exactly one top-level
    /// element remains. Whitespace-only text between top-level nodes is
    /// ignored.
    pub fn close(&mut self) -> MarkupResult<MarkupNode> {
        if self.closed {
            return Err(MarkupError::AlreadyClosed);
        }
        if !self.stack.is_empty() {
            let open: Vec<&str> = self.stack.iter().map(|el| el.tag.as_str()).collect();
            return Err(MarkupError::UnbalancedTree(format!(
                "no end tag for <{}>",
                open.join("> <")
            )));
        }

        self.root.retain(|node| match node {
            MarkupNode::Text(data) => !data.trim().is_empty(),
            _ => true,
        });
        match self.root.as_slice() {
            [MarkupNode::Element(_)] => {}
            nodes => {
                return Err(MarkupError::UnbalancedTree(format!(
                    "expected exactly 1 top-level element, found {} nodes",
                    nodes.len()
                )))
            }
        }

        self.closed = true;
        Ok(MarkupNode::Root(std::mem::take(&mut self.root)))
    }

    /// Return to the initial empty state.
    pub fn reset(&mut self) {
        self.root.clear();
        self.stack.clear();
        self.closed = false;
    }

    /// Parse one complete document, leaving the parser reset.
    pub fn parse(&mut self, input: &str) -> MarkupResult<MarkupNode> {
        self.reset();
        let result = self.feed(input).and_then(|()| self.close());
        self.reset();
        result
    }
}
