//! Named-function discovery and change detection for hot reload.

use super::{Expression, Form, Node, strip_positions};
use crate::Name;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// A `(defn name (params...) body...)` form found somewhere in a program.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub name: Name,
    pub params: Vec<Name>,
    /// The whole `defn` form.
    pub node: Node,
    /// Number of enclosing lists; top-level program forms sit at depth 1.
    pub depth: usize,
}

impl Definition {
    fn from_node(node: &Node, depth: usize) -> Option<Self> {
        let [head, name, params, ..] = node.list()? else {
            return None;
        };
        if head.identifier().map(|head| &**head) != Some("defn") {
            return None;
        }
        let params = params
            .list()?
            .iter()
            .map(|param| param.identifier().cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            name: name.identifier()?.clone(),
            params,
            node: node.clone(),
            depth,
        })
    }

    pub fn body(&self) -> &[Node] {
        self.node.list().map(|items| &items[3..]).unwrap_or_default()
    }

    /// Content used to decide whether a definition changed. Nested `defn`
    /// bodies are masked out: they are compared as definitions of their own.
    pub fn signature(&self) -> Form {
        mask_nested_bodies(&self.node, true)
    }
}

pub type Definitions = IndexMap<Name, Definition>;

/// Collect every `defn` form, shallowest first. Two definitions of one name
/// at the same depth are an error, even in different parent forms; a
/// deeper definition reusing an already-seen name is ignored.
pub fn find_named_functions(ast: &Node) -> Result<Definitions> {
    let mut definitions = Definitions::new();
    let mut seen: FxHashMap<usize, FxHashSet<Name>> = FxHashMap::default();
    let mut queue = VecDeque::from([(ast, 0usize)]);
    while let Some((node, depth)) = queue.pop_front() {
        let Some(items) = node.list() else {
            continue;
        };
        for item in items {
            if let Some(definition) = Definition::from_node(item, depth + 1) {
                if !seen
                    .entry(definition.depth)
                    .or_default()
                    .insert(definition.name.clone())
                {
                    return Err(Error::parse(
                        format!(
                            "function `{}` is defined twice at the same nesting level",
                            definition.name
                        ),
                        item.span,
                    ));
                }
                definitions
                    .entry(definition.name.clone())
                    .or_insert(definition);
            }
            queue.push_back((item, depth + 1));
        }
    }
    Ok(definitions)
}

/// Names present in both sets whose parameters or body differ.
pub fn diff_named_functions(old: &Definitions, new: &Definitions) -> Vec<Name> {
    new.iter()
        .filter_map(|(name, definition)| {
            let previous = old.get(name)?;
            (previous.signature() != definition.signature()).then(|| name.clone())
        })
        .collect()
}

fn mask_nested_bodies(node: &Node, outermost: bool) -> Form {
    match &node.node {
        Expression::List(items) if !outermost && node.head() == Some("defn") => {
            Form::List(items.iter().take(3).map(strip_positions).collect())
        }
        Expression::List(items) => Form::List(
            items
                .iter()
                .map(|item| mask_nested_bodies(item, false))
                .collect(),
        ),
        _ => strip_positions(node),
    }
}
