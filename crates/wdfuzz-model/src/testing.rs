//! In-memory dissector for tests.
//!
//! Packets are ASCII `key=value` pairs separated by `;`, for example
//! `rrc.type=setup;info=RRC Setup Request`. Keys sharing the prefix before the
//! first `.` form one layer; a `frame` layer spanning the whole packet always
//! comes first. `info` provides the summary and a `malformed` key marks the
//! packet malformed. Filters are `name==value`, `name` or `!name`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dissect::{
    Direction, Dissector, DissectorFactory, FieldHandle, FieldValue, FilterHandle, PacketTree,
    TreeNode,
};
use crate::error::ModelError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MockFilter {
    Equals(String, String),
    Present(String),
    Absent(String),
}

#[derive(Debug, Default)]
struct Tables {
    filters: RwLock<Vec<MockFilter>>,
    fields: RwLock<Vec<String>>,
    interest_calls: AtomicUsize,
}

/// Factory handing out [`MockDissector`]s that share compiled handles.
#[derive(Debug, Clone, Default)]
pub struct MockDissectorFactory {
    tables: Arc<Tables>,
}

impl MockDissectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `declare_interest` calls made by dissectors from this factory.
    pub fn interest_calls(&self) -> usize {
        self.tables.interest_calls.load(Ordering::Relaxed)
    }
}

fn parse_filter(expr: &str) -> Result<MockFilter, ModelError> {
    let expr = expr.trim();
    let fail = |reason: &str| ModelError::FilterCompile {
        expr: expr.to_string(),
        reason: reason.to_string(),
    };
    if expr.is_empty() {
        return Err(fail("empty expression"));
    }
    if let Some((lhs, rhs)) = expr.split_once("==") {
        let (lhs, rhs) = (lhs.trim(), rhs.trim());
        if lhs.is_empty() || rhs.is_empty() || rhs.contains("==") {
            return Err(fail("expected name==value"));
        }
        return Ok(MockFilter::Equals(lhs.to_string(), rhs.to_string()));
    }
    if expr.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        return Err(fail("unsupported syntax"));
    }
    match expr.strip_prefix('!') {
        Some(name) if !name.is_empty() => Ok(MockFilter::Absent(name.to_string())),
        Some(_) => Err(fail("missing field after !")),
        None => Ok(MockFilter::Present(expr.to_string())),
    }
}

impl DissectorFactory for MockDissectorFactory {
    fn compile_filter(&self, expr: &str) -> Result<FilterHandle, ModelError> {
        let filter = parse_filter(expr)?;
        let mut filters = self.tables.filters.write();
        filters.push(filter);
        Ok(FilterHandle((filters.len() - 1) as u32))
    }

    fn resolve_field(&self, name: &str) -> Result<FieldHandle, ModelError> {
        if name.trim().is_empty() {
            return Err(ModelError::FieldResolve {
                name: name.to_string(),
            });
        }
        let mut fields = self.tables.fields.write();
        if let Some(i) = fields.iter().position(|f| f == name) {
            return Ok(FieldHandle(i as u32));
        }
        fields.push(name.to_string());
        Ok(FieldHandle((fields.len() - 1) as u32))
    }

    fn create(&self) -> Box<dyn Dissector> {
        Box::new(MockDissector {
            tables: Arc::clone(&self.tables),
        })
    }
}

/// Decoder for the `key=value;...` test format.
#[derive(Debug)]
pub struct MockDissector {
    tables: Arc<Tables>,
}

fn parse_value(raw: &str) -> FieldValue {
    match raw.parse::<u64>() {
        Ok(v) => FieldValue::Uint(v),
        Err(_) => FieldValue::Str(raw.to_string()),
    }
}

fn layer_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

/// Build the mock packet `key=value;...` from pairs.
pub fn mock_packet(pairs: &[(&str, &str)]) -> Vec<u8> {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
        .into_bytes()
}

impl Dissector for MockDissector {
    fn declare_interest(&mut self, _filters: &[FilterHandle], _fields: &[FieldHandle]) {
        self.tables.interest_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn dissect(&mut self, packet: &[u8], direction: Direction) -> PacketTree {
        let mut tree = PacketTree::new(direction);
        tree.nodes.push(TreeNode::layer("frame", 0, packet.len()));

        let text = String::from_utf8_lossy(packet);
        let mut cursor = 0usize;
        for segment in text.split(';') {
            let seg_start = cursor;
            cursor += segment.len() + 1;
            let Some((key, value)) = segment.split_once('=') else {
                if !segment.is_empty() {
                    tree.malformed = true;
                }
                continue;
            };
            let value_offset = seg_start + key.len() + 1;
            let field = TreeNode::field(key, value_offset, value.len(), parse_value(value));

            match key {
                "info" => tree.summary = value.to_string(),
                "malformed" => tree.malformed = true,
                _ => {}
            }

            let layer_name = layer_of(key);
            let seg_end = value_offset + value.len();
            match tree.nodes.iter_mut().skip(1).find(|n| n.name == layer_name) {
                Some(layer) => {
                    layer.length = seg_end - layer.offset;
                    layer.children.push(field);
                }
                None => tree.nodes.push(
                    TreeNode::layer(layer_name, seg_start, seg_end - seg_start)
                        .with_children(vec![field]),
                ),
            }
        }
        tree
    }

    fn read_filter(&self, tree: &PacketTree, filter: FilterHandle) -> bool {
        let filters = self.tables.filters.read();
        let Some(filter) = filters.get(filter.0 as usize) else {
            return false;
        };
        match filter {
            MockFilter::Equals(name, expected) => tree
                .find_field(name)
                .and_then(|n| n.value.as_ref())
                .is_some_and(|v| v.to_string() == *expected),
            MockFilter::Present(name) => tree.find_field(name).is_some(),
            MockFilter::Absent(name) => tree.find_field(name).is_none(),
        }
    }

    fn read_field(&self, tree: &PacketTree, field: FieldHandle) -> Option<FieldValue> {
        let fields = self.tables.fields.read();
        let name = fields.get(field.0 as usize)?;
        tree.find_field(name).and_then(|n| n.value.clone())
    }
}
