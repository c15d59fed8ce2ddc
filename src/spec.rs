//! Task-group spec expansion.
//!
//! A task group describes many related jobs at once: scalar keys hold
//! shared parameters, `_`-prefixed keys hold parameter lists whose
//! cartesian product fans out into one record per combination, and named
//! sub-groups refine their parent's record. Expansion walks the tree
//! lazily, renders the command template of each flat record, and derives
//! a readable instance name from the keys that actually vary.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, SpecError};
use crate::template::Renderer;

/// Record key holding the command template.
pub const CMD_KEY: &str = "__cmd__";
/// Record key the expansion writes the instance name to.
pub const NAME_KEY: &str = "__name__";
/// Record key holding the repeat index when expanding with repeats.
pub const REPEAT_KEY: &str = "repeat";

/// One node of a task-group tree.
///
/// Trees come from an external parser; [`Node::from_json`] adapts its
/// output. Group children keep their declared order, which fixes the
/// enumeration order of the expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Single-valued leaf.
    Scalar(String),
    /// Leaf holding alternative values; every combination yields a job.
    ParamList(Vec<String>),
    /// Named sub-tree merged over its parent's records.
    Group(Vec<(String, Node)>),
}

impl Node {
    /// Adapt an externally parsed JSON value: strings, numbers, and bools
    /// become scalars, arrays of scalars become parameter lists, objects
    /// become groups. Anything else is rejected with the offending key.
    pub fn from_json(value: &serde_json::Value) -> Result<Node, SpecError> {
        json_node("<root>", value)
    }
}

fn json_node(key: &str, value: &serde_json::Value) -> Result<Node, SpecError> {
    use serde_json::Value;

    match value {
        Value::String(s) => Ok(Node::Scalar(s.clone())),
        Value::Number(n) => Ok(Node::Scalar(n.to_string())),
        Value::Bool(b) => Ok(Node::Scalar(b.to_string())),
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    _ => Err(SpecError::UnsupportedValue {
                        key: key.to_string(),
                        detail: "list entries must be scalars".to_string(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::ParamList(values))
        }
        Value::Object(map) => {
            let entries = map
                .iter()
                .map(|(k, v)| json_node(k, v).map(|node| (k.clone(), node)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::Group(entries))
        }
        Value::Null => Err(SpecError::UnsupportedValue {
            key: key.to_string(),
            detail: "null is not a usable value".to_string(),
        }),
    }
}

/// A declarative description of a group of related jobs.
#[derive(Debug, Clone)]
pub struct TaskGroupSpec {
    entries: Vec<(String, Node)>,
}

impl TaskGroupSpec {
    /// Build a spec from the root group's entries.
    pub fn new(entries: Vec<(String, Node)>) -> Self {
        Self { entries }
    }

    /// Build a spec from an externally parsed JSON tree. The top level
    /// must be an object.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, SpecError> {
        match Node::from_json(value)? {
            Node::Group(entries) => Ok(Self { entries }),
            _ => Err(SpecError::UnsupportedValue {
                key: "<root>".to_string(),
                detail: "top level must be a group".to_string(),
            }),
        }
    }

    /// Lazily expand into task instances. Each call re-walks the tree
    /// from the start; the spec itself is never mutated.
    pub fn expand(&self) -> Expansion<'_> {
        Expansion {
            inner: LevelIter::new(&self.entries),
            repeat: None,
        }
    }

    /// Expand once per repeat index in `start..total`, injecting the
    /// index into each record under [`REPEAT_KEY`]. With more than one
    /// repeat the index also becomes a name fragment.
    pub fn expand_repeats(
        &self,
        start: usize,
        total: usize,
    ) -> crate::error::Result<impl Iterator<Item = Result<TaskInstance, Error>> + '_> {
        if start >= total {
            return Err(SpecError::RepeatRange { start, total }.into());
        }
        Ok((start..total).flat_map(move |repeat| Expansion {
            inner: LevelIter::new(&self.entries),
            repeat: Some((repeat, total)),
        }))
    }
}

/// One fully expanded job description.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInstance {
    /// The flat parameter record, including [`CMD_KEY`] and [`NAME_KEY`].
    pub record: HashMap<String, String>,
    /// Human-readable instance name.
    pub name: String,
    /// The rendered command line. Template-file conversions are still
    /// syntactically intact; materializing them is the job-creation
    /// step's concern.
    pub command: String,
}

/// Iterator over the instances of one [`TaskGroupSpec`] traversal.
pub struct Expansion<'a> {
    inner: LevelIter<'a>,
    repeat: Option<(usize, usize)>,
}

impl Expansion<'_> {
    fn finish(
        &self,
        mut record: HashMap<String, String>,
        mut name: String,
    ) -> Result<TaskInstance, Error> {
        if let Some((repeat, total)) = self.repeat {
            record.insert(REPEAT_KEY.to_string(), repeat.to_string());
            if total > 1 {
                let fragment = format!("repeat={repeat}");
                name = if name.is_empty() {
                    fragment
                } else {
                    format!("{name}, {fragment}")
                };
            }
        }

        let template =
            record
                .get(CMD_KEY)
                .cloned()
                .ok_or_else(|| SpecError::MissingCommand {
                    group: name.clone(),
                })?;
        let command = Renderer::new(&record).deferred(&template)?;
        let name = if name.is_empty() {
            command.clone()
        } else {
            name
        };
        record.insert(CMD_KEY.to_string(), command.clone());
        record.insert(NAME_KEY.to_string(), name.clone());

        Ok(TaskInstance {
            record,
            name,
            command,
        })
    }
}

impl Iterator for Expansion<'_> {
    type Item = Result<TaskInstance, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(match item {
            Ok((record, name)) => self.finish(record, name),
            Err(e) => Err(e.into()),
        })
    }
}

/// Return the record key for a parameter-list spec key, i.e. strip the
/// single leading underscore. Double-underscore keys are reserved and
/// never parameter lists.
fn param_key(key: &str) -> Option<&str> {
    let stripped = key.strip_prefix('_')?;
    if stripped.starts_with('_') {
        None
    } else {
        Some(stripped)
    }
}

fn compose_name(base: &str, group: &str, sub: &str) -> String {
    let mut name = String::new();
    if !base.is_empty() {
        name.push_str(base);
        name.push(' ');
    }
    name.push_str(group);
    if !sub.is_empty() {
        name.push_str(": ");
        name.push_str(sub);
    }
    name
}

/// Lazy expansion of one group level: cartesian product over its
/// parameter lists, then the product of every base record with every
/// recursively expanded sub-group.
struct LevelIter<'a> {
    scalars: Vec<(String, String)>,
    lists: Vec<(String, Vec<String>)>,
    groups: Vec<(String, &'a [(String, Node)])>,
    /// Odometer over `lists`; `None` before the first base record.
    indices: Option<Vec<usize>>,
    current_base: Option<(HashMap<String, String>, String)>,
    group_idx: usize,
    sub: Option<Box<LevelIter<'a>>>,
    error: Option<SpecError>,
    done: bool,
}

impl<'a> LevelIter<'a> {
    fn new(entries: &'a [(String, Node)]) -> Self {
        let mut scalars = Vec::new();
        let mut lists = Vec::new();
        let mut groups = Vec::new();
        let mut error = None;

        for (key, node) in entries {
            match node {
                Node::Group(children) => groups.push((key.clone(), children.as_slice())),
                Node::ParamList(values) => match param_key(key) {
                    Some(record_key) => lists.push((record_key.to_string(), values.clone())),
                    None => {
                        error = Some(SpecError::UnexpectedList { key: key.clone() });
                        break;
                    }
                },
                Node::Scalar(value) => match param_key(key) {
                    // A `_`-prefixed scalar is a one-alternative list.
                    Some(record_key) => {
                        lists.push((record_key.to_string(), vec![value.clone()]))
                    }
                    None => scalars.push((key.clone(), value.clone())),
                },
            }
        }

        Self {
            scalars,
            lists,
            groups,
            indices: None,
            current_base: None,
            group_idx: 0,
            sub: None,
            error,
            done: false,
        }
    }

    /// Step the odometer and build the next base record, or `None` once
    /// the product is exhausted. An empty parameter list empties the
    /// whole product.
    fn advance_base(&mut self) -> Option<(HashMap<String, String>, String)> {
        match &mut self.indices {
            None => {
                if self.lists.iter().any(|(_, values)| values.is_empty()) {
                    return None;
                }
                self.indices = Some(vec![0; self.lists.len()]);
            }
            Some(indices) => {
                // Increment from the last list so it varies fastest.
                let mut pos = indices.len();
                loop {
                    if pos == 0 {
                        return None;
                    }
                    pos -= 1;
                    indices[pos] += 1;
                    if indices[pos] < self.lists[pos].1.len() {
                        break;
                    }
                    indices[pos] = 0;
                }
            }
        }

        let indices = self.indices.as_ref().expect("indices initialized above");
        let mut record: HashMap<String, String> = self.scalars.iter().cloned().collect();
        let mut fragments = Vec::new();
        for (i, (key, values)) in self.lists.iter().enumerate() {
            let value = &values[indices[i]];
            record.insert(key.clone(), value.clone());
            if values.len() > 1 {
                fragments.push(format!("{key}={value}"));
            }
        }
        Some((record, fragments.join(", ")))
    }
}

impl Iterator for LevelIter<'_> {
    type Item = Result<(HashMap<String, String>, String), SpecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(error) = self.error.take() {
            self.done = true;
            return Some(Err(error));
        }

        loop {
            if self.groups.is_empty() {
                return match self.advance_base() {
                    Some(base) => Some(Ok(base)),
                    None => {
                        self.done = true;
                        None
                    }
                };
            }

            if self.current_base.is_none() {
                match self.advance_base() {
                    Some(base) => {
                        self.current_base = Some(base);
                        self.group_idx = 0;
                        self.sub = None;
                    }
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            }

            if self.sub.is_none() {
                if self.group_idx >= self.groups.len() {
                    self.current_base = None;
                    continue;
                }
                self.sub = Some(Box::new(LevelIter::new(self.groups[self.group_idx].1)));
            }

            match self.sub.as_mut().and_then(|sub| sub.next()) {
                Some(Ok((sub_record, sub_name))) => {
                    let (base_record, base_name) = self
                        .current_base
                        .clone()
                        .expect("base record set above");
                    let mut merged = base_record;
                    merged.extend(sub_record);
                    let group_name = &self.groups[self.group_idx].0;
                    let name = compose_name(&base_name, group_name, &sub_name);
                    return Some(Ok((merged, name)));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.sub = None;
                    self.group_idx += 1;
                }
            }
        }
    }
}
