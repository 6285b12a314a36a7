//! Structural queries over a parsed tree.

use regex::Regex;

use super::node::{MarkupNode, NodeKind};
use super::{MarkupError, MarkupResult};

/// One link of a query chain.
///
/// Every set field must match. A criterion that does not match a node is
/// retried on that node's children when `at_any_depth` is set; otherwise
/// only direct children of the previous link's match are considered.
#[derive(Debug, Clone)]
pub struct MatchCriterion {
    pub kind: Option<NodeKind>,
    pub tag: Option<String>,
    pub classes: Vec<String>,
    /// Matched against the start of a text node's data.
    pub pattern: Option<Regex>,
    pub at_any_depth: bool,
}

impl Default for MatchCriterion {
    fn default() -> Self {
        Self {
            kind: None,
            tag: None,
            classes: Vec::new(),
            pattern: None,
            at_any_depth: true,
        }
    }
}

impl MatchCriterion {
    pub fn element(tag: &str) -> Self {
        Self {
            kind: Some(NodeKind::Element),
            tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    pub fn text(pattern: Regex) -> Self {
        Self {
            kind: Some(NodeKind::Text),
            pattern: Some(pattern),
            ..Default::default()
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    /// Only match direct children of the previous link's match.
    pub fn direct(mut self) -> Self {
        self.at_any_depth = false;
        self
    }

    pub fn matches(&self, node: &MarkupNode) -> bool {
        if self.kind.is_some_and(|kind| kind != node.kind()) {
            return false;
        }
        if let Some(tag) = &self.tag {
            match node.as_element() {
                Some(el) if &el.tag == tag => {}
                _ => return false,
            }
        }
        if !self.classes.is_empty() {
            match node.as_element() {
                Some(el) if self.classes.iter().all(|c| el.has_class(c)) => {}
                _ => return false,
            }
        }
        if self.pattern.is_some() {
            return self.captures(node).is_some();
        }
        true
    }

    /// Capture groups (excluding the whole match) for a text node matching
    /// the pattern.
    fn captures(&self, node: &MarkupNode) -> Option<Vec<Option<String>>> {
        let pattern = self.pattern.as_ref()?;
        let data = node.as_text()?;
        let caps = pattern.captures(data)?;
        if caps.get(0).map_or(true, |m| m.start() != 0) {
            return None;
        }
        Some(
            caps.iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        )
    }
}

/// All nodes reached by following `criteria` from `node`, in document order.
pub fn find_nodes<'a>(node: &'a MarkupNode, criteria: &[MatchCriterion]) -> Vec<&'a MarkupNode> {
    let mut out = Vec::new();
    if !criteria.is_empty() {
        walk(node, criteria, 0, &mut out);
    }
    out
}

/// Like [`find_nodes`], pairing each match with the capture groups of the
/// last criterion's pattern.
pub fn find_captures<'a>(
    node: &'a MarkupNode,
    criteria: &[MatchCriterion],
) -> Vec<(&'a MarkupNode, Vec<Option<String>>)> {
    let Some(last) = criteria.last() else {
        return Vec::new();
    };
    find_nodes(node, criteria)
        .into_iter()
        .map(|found| (found, last.captures(found).unwrap_or_default()))
        .collect()
}

/// The unique node reached by `criteria`.
pub fn find_element<'a>(
    node: &'a MarkupNode,
    criteria: &[MatchCriterion],
) -> MarkupResult<&'a MarkupNode> {
    let found = find_nodes(node, criteria);
    match found.as_slice() {
        [single] => Ok(single),
        _ => Err(MarkupError::AmbiguousMatch { count: found.len() }),
    }
}

fn walk<'a>(
    node: &'a MarkupNode,
    criteria: &[MatchCriterion],
    depth: usize,
    out: &mut Vec<&'a MarkupNode>,
) {
    let criterion = &criteria[depth];
    if criterion.matches(node) {
        if depth + 1 < criteria.len() {
            for child in node.children() {
                walk(child, criteria, depth + 1, out);
            }
        } else {
            out.push(node);
        }
    } else if criterion.at_any_depth {
        for child in node.children() {
            walk(child, criteria, depth, out);
        }
    }
}
