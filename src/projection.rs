/*!
 * @file projection.rs
 * @brief Inclusion/exclusion projection with $slice and array indexing
 */

use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::error::{CommandError, CommandResult};
use crate::filter::bson_truthy;

#[derive(Debug, Clone, Copy)]
struct SliceArgs {
    skip: Option<i32>,
    limit: i32,
}

#[derive(Debug, Clone)]
enum Node {
    Include,
    Exclude,
    Slice(SliceArgs),
    Branch(IndexMap<String, Node>),
}

/// A validated projection, ready to apply to any number of documents.
#[derive(Debug, Clone)]
pub struct Projection {
    tree: IndexMap<String, Node>,
    inclusion: bool,
}

impl Projection {
    /// Parse and validate a projection document. Inclusion and exclusion may
    /// not be mixed except for `_id`.
    pub fn parse(spec: &Document) -> CommandResult<Self> {
        let mut tree: IndexMap<String, Node> = IndexMap::new();
        let mut mode: Option<bool> = None; // true = inclusion
        for (path, value) in spec.iter() {
            if path.is_empty() {
                return Err(CommandError::bad_value("Empty field names are not allowed"));
            }
            if path == "$" || path.contains(".$") || path.starts_with('$') {
                return Err(CommandError::bad_value(
                    "positional projection is not supported",
                ));
            }
            let node = match value {
                Bson::Document(inner) => {
                    if let Some(slice) = inner.get("$slice") {
                        if inner.len() != 1 {
                            return Err(CommandError::bad_value(
                                "$slice cannot be combined with other operators",
                            ));
                        }
                        Node::Slice(parse_slice(slice)?)
                    } else if inner.contains_key("$elemMatch") {
                        return Err(CommandError::bad_value(
                            "$elemMatch projection is not supported",
                        ));
                    } else {
                        return Err(CommandError::bad_value(format!(
                            "Unsupported projection option: {path}: {value}"
                        )));
                    }
                }
                scalar => {
                    let include = bson_truthy(scalar);
                    if path != "_id" {
                        match mode {
                            None => mode = Some(include),
                            Some(current) if current != include => {
                                return Err(CommandError::bad_value(
                                    "Cannot do a mix of inclusion and exclusion in a projection",
                                ))
                            }
                            _ => {}
                        }
                    }
                    if include {
                        Node::Include
                    } else {
                        Node::Exclude
                    }
                }
            };
            insert_path(&mut tree, path, node)?;
        }

        // `{_id: 1}` alone is an inclusion projection; `$slice` alone keeps
        // the exclusion shape (all fields, listed arrays trimmed).
        let inclusion = match mode {
            Some(m) => m,
            None => matches!(tree.get("_id"), Some(Node::Include)),
        };
        if inclusion && !tree.contains_key("_id") {
            tree.insert("_id".to_string(), Node::Include);
        }
        Ok(Self { tree, inclusion })
    }

    pub fn apply(&self, doc: &Document) -> Document {
        if self.inclusion {
            include_walk(doc, &self.tree)
        } else {
            exclude_walk(doc, &self.tree)
        }
    }
}

fn parse_slice(value: &Bson) -> CommandResult<SliceArgs> {
    match value {
        Bson::Int32(n) => Ok(SliceArgs { skip: None, limit: *n }),
        Bson::Int64(n) => Ok(SliceArgs {
            skip: None,
            limit: i32::try_from(*n)
                .map_err(|_| CommandError::bad_value("$slice value out of range"))?,
        }),
        Bson::Array(args) => {
            if args.len() != 2 {
                return Err(CommandError::bad_value(
                    "$slice array argument must have 2 elements",
                ));
            }
            let skip = slice_int(&args[0])?;
            let limit = slice_int(&args[1])?;
            if limit <= 0 {
                return Err(CommandError::bad_value("$slice limit must be positive"));
            }
            Ok(SliceArgs {
                skip: Some(skip),
                limit,
            })
        }
        _ => Err(CommandError::bad_value(
            "$slice needs a number or an array of two numbers",
        )),
    }
}

fn slice_int(value: &Bson) -> CommandResult<i32> {
    match value {
        Bson::Int32(n) => Ok(*n),
        Bson::Int64(n) => i32::try_from(*n)
            .map_err(|_| CommandError::bad_value("$slice value out of range")),
        Bson::Double(f) if f.fract() == 0.0 => Ok(*f as i32),
        _ => Err(CommandError::bad_value("$slice values must be numbers")),
    }
}

fn insert_path(tree: &mut IndexMap<String, Node>, path: &str, node: Node) -> CommandResult<()> {
    let mut segments = path.split('.').peekable();
    let mut current = tree;
    loop {
        let segment = segments.next().expect("split yields at least one segment");
        if segments.peek().is_none() {
            if current.contains_key(segment) {
                return Err(CommandError::bad_value(format!(
                    "Path collision at {path}"
                )));
            }
            current.insert(segment.to_string(), node);
            return Ok(());
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Node::Branch(IndexMap::new()));
        match entry {
            Node::Branch(sub) => current = sub,
            _ => {
                return Err(CommandError::bad_value(format!(
                    "Path collision at {path}"
                )))
            }
        }
    }
}

fn slice_array(items: &[Bson], args: SliceArgs) -> Vec<Bson> {
    let len = items.len() as i64;
    let (start, count) = match args.skip {
        None => {
            if args.limit >= 0 {
                (0i64, i64::from(args.limit))
            } else {
                ((len + i64::from(args.limit)).max(0), i64::from(-args.limit))
            }
        }
        Some(skip) => {
            let start = if skip < 0 {
                (len + i64::from(skip)).max(0)
            } else {
                i64::from(skip)
            };
            (start, i64::from(args.limit))
        }
    };
    items
        .iter()
        .skip(start.max(0) as usize)
        .take(count.max(0) as usize)
        .cloned()
        .collect()
}

fn apply_leaf(value: &Bson, node: &Node) -> Option<Bson> {
    match node {
        Node::Include => Some(value.clone()),
        Node::Exclude => None,
        Node::Slice(args) => match value {
            Bson::Array(items) => Some(Bson::Array(slice_array(items, *args))),
            other => Some(other.clone()),
        },
        Node::Branch(_) => None,
    }
}

fn include_walk(doc: &Document, tree: &IndexMap<String, Node>) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let Some(node) = tree.get(key.as_str()) else {
            continue;
        };
        match node {
            Node::Branch(sub) => match value {
                Bson::Document(inner) => {
                    out.insert(key.clone(), Bson::Document(include_walk(inner, sub)));
                }
                Bson::Array(items) => {
                    out.insert(key.clone(), include_array(items, sub));
                }
                _ => {}
            },
            leaf => {
                if let Some(projected) = apply_leaf(value, leaf) {
                    out.insert(key.clone(), projected);
                }
            }
        }
    }
    out
}

fn include_array(items: &[Bson], sub: &IndexMap<String, Node>) -> Bson {
    let by_index = sub.keys().all(|k| k.parse::<usize>().is_ok());
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if by_index {
            if let Some(node) = sub.get(i.to_string().as_str()) {
                match node {
                    Node::Branch(deeper) => match item {
                        Bson::Document(inner) => {
                            out.push(Bson::Document(include_walk(inner, deeper)))
                        }
                        Bson::Array(inner) => out.push(include_array(inner, deeper)),
                        _ => {}
                    },
                    leaf => {
                        if let Some(projected) = apply_leaf(item, leaf) {
                            out.push(projected);
                        }
                    }
                }
            }
        } else if let Bson::Document(inner) = item {
            out.push(Bson::Document(include_walk(inner, sub)));
        }
        // Non-document elements vanish under a subfield inclusion.
    }
    Bson::Array(out)
}

fn exclude_walk(doc: &Document, tree: &IndexMap<String, Node>) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        match tree.get(key.as_str()) {
            None => {
                out.insert(key.clone(), value.clone());
            }
            Some(Node::Exclude) => {}
            Some(Node::Include) => {
                // Only `_id` can be included inside an exclusion projection.
                out.insert(key.clone(), value.clone());
            }
            Some(Node::Slice(args)) => match value {
                Bson::Array(items) => {
                    out.insert(key.clone(), Bson::Array(slice_array(items, *args)));
                }
                other => {
                    out.insert(key.clone(), other.clone());
                }
            },
            Some(Node::Branch(sub)) => match value {
                Bson::Document(inner) => {
                    out.insert(key.clone(), Bson::Document(exclude_walk(inner, sub)));
                }
                Bson::Array(items) => {
                    out.insert(key.clone(), exclude_array(items, sub));
                }
                other => {
                    out.insert(key.clone(), other.clone());
                }
            },
        }
    }
    out
}

fn exclude_array(items: &[Bson], sub: &IndexMap<String, Node>) -> Bson {
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(node) = sub.get(i.to_string().as_str()) {
            match node {
                Node::Exclude => continue,
                Node::Branch(deeper) => {
                    if let Bson::Document(inner) = item {
                        out.push(Bson::Document(exclude_walk(inner, deeper)));
                        continue;
                    }
                    out.push(item.clone());
                    continue;
                }
                _ => {
                    out.push(item.clone());
                    continue;
                }
            }
        }
        if let Bson::Document(inner) = item {
            out.push(Bson::Document(exclude_walk(inner, sub)));
        } else {
            out.push(item.clone());
        }
    }
    Bson::Array(out)
}

/// Parse and apply in one step; the common path for single documents.
pub fn project(doc: &Document, spec: &Document) -> CommandResult<Document> {
    Ok(Projection::parse(spec)?.apply(doc))
}
