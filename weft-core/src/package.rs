use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::expr::Expression;
use crate::hash::StrHash;

/// A named, addressable block of compiled instructions: an `(offset,
/// length)` slice into its package's shared instruction stream.
///
/// Offsets are only meaningful relative to the package that produced them;
/// nodes from different packages must never share a program counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: StrHash,
    pub offset: u32,
    pub length: u32,
}

/// One unit of display text, addressed by its line code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub text: String,
    /// The authoring-provided code, kept readable for tooling/localization.
    pub name: Option<String>,
}

/// A compiled module: the set of nodes plus the shared instruction stream,
/// string table, expression table and line table produced from one source
/// file. Immutable once built.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Package {
    name: String,
    root_path: String,
    nodes: HashMap<StrHash, Node>,
    node_names: HashMap<StrHash, String>,
    code: Vec<u8>,
    strings: Vec<String>,
    expressions: Vec<Expression>,
    lines: HashMap<StrHash, LineRecord>,
}

impl Package {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn node(&self, id: StrHash) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_name(&self, id: StrHash) -> Option<&str> {
        self.node_names.get(&id).map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn string(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }

    pub fn expression(&self, idx: u32) -> Option<&Expression> {
        self.expressions.get(idx as usize)
    }

    pub fn expression_run(&self, offset: u32, count: u16) -> Option<&[Expression]> {
        let start = offset as usize;
        let end = start + count as usize;
        self.expressions.get(start..end)
    }

    pub fn line(&self, code: StrHash) -> Option<&LineRecord> {
        self.lines.get(&code)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("serialize package")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("deserialize package")
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let buffer = self.to_bytes()?;
        let mut wtr = File::create(path)?;
        wtr.write_all(&buffer)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut rdr = File::open(path)?;
        let mut buffer = Vec::new();
        rdr.read_to_end(&mut buffer)?;
        Self::from_bytes(&buffer)
    }
}

/// Accumulates package contents during compilation; `finish` freezes the
/// result.
#[derive(Debug, Default)]
pub struct PackageBuilder {
    name: String,
    root_path: String,
    nodes: HashMap<StrHash, Node>,
    node_names: HashMap<StrHash, String>,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    expressions: Vec<Expression>,
    lines: HashMap<StrHash, LineRecord>,
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        PackageBuilder {
            name: name.to_owned(),
            root_path: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Deduplicating string-table insert.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.string_index.insert(s.to_owned(), idx);
        idx
    }

    /// Append a contiguous run of expression records, returning its
    /// `(offset, count)` reference.
    pub fn add_expressions(&mut self, run: Vec<Expression>) -> (u32, u16) {
        let offset = self.expressions.len() as u32;
        let count = run.len() as u16;
        self.expressions.extend(run);
        (offset, count)
    }

    pub fn has_line(&self, code: StrHash) -> bool {
        self.lines.contains_key(&code)
    }

    pub fn add_line(&mut self, code: StrHash, text: String, name: Option<String>) {
        self.lines.insert(code, LineRecord { text, name });
    }

    /// Returns false when the id is already taken.
    pub fn add_node(&mut self, id: StrHash, name: &str, offset: u32, length: u32) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node { id, offset, length });
        self.node_names.insert(id, name.to_owned());
        true
    }

    pub fn finish(self, code: Vec<u8>) -> Package {
        Package {
            name: self.name,
            root_path: self.root_path,
            nodes: self.nodes,
            node_names: self.node_names,
            code,
            strings: self.strings,
            expressions: self.expressions,
            lines: self.lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExprOp, Expression, Operand};
    use crate::variant::Variant;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_interns_and_freezes() {
        let mut b = PackageBuilder::new("intro");
        let a = b.intern_string("x, y");
        let c = b.intern_string("x, y");
        assert_eq!(a, c);
        let (off, count) = b.add_expressions(vec![Expression::unary(
            ExprOp::True,
            Operand::Literal(Variant::Bool(true)),
        )]);
        assert_eq!((off, count), (0, 1));

        let id = StrHash::new("intro.start");
        assert!(b.add_node(id, "intro.start", 0, 4));
        assert!(!b.add_node(id, "intro.start", 4, 4));

        let pkg = b.finish(vec![0, 0, 0, 0]);
        assert_eq!(pkg.node(id).unwrap().length, 4);
        assert_eq!(pkg.string(0), Some("x, y"));
        assert_eq!(pkg.expression_run(0, 1).unwrap().len(), 1);
    }

    #[test]
    fn serialization_round_trip() {
        let mut b = PackageBuilder::new("m");
        b.intern_string("args");
        b.add_line(StrHash::new("l1"), "hello".into(), None);
        b.add_node(StrHash::new("m.a"), "m.a", 0, 1);
        let pkg = b.finish(vec![0x00]);

        let bytes = pkg.to_bytes().unwrap();
        let back = Package::from_bytes(&bytes).unwrap();
        assert_eq!(back.name(), "m");
        assert_eq!(back.line(StrHash::new("l1")).unwrap().text, "hello");
        assert_eq!(back.node(StrHash::new("m.a")), pkg.node(StrHash::new("m.a")));
        assert_eq!(back.code(), pkg.code());
    }
}
