use std::collections::HashMap;

use weft_core::{
    CodeWriter, ExprOp, Opcode, Operand, OptionFlags, Package, PackageBuilder, StrHash, VarKey,
    Variant,
};

use crate::error::{CompileError, CompileErrorKind, CompileWarning};
use crate::expand::{is_reserved, Preprocessor};
use crate::linker::{BlockKind, BlockLinker};
use crate::scan::{self, CompShape, TargetRef};

const MAX_MACRO_DEPTH: usize = 8;
const MAX_LINE_CODE_ATTEMPTS: usize = 64;

/// Per-node compilation state.
#[derive(Debug)]
struct NodeCtx {
    id: StrHash,
    name: String,
    start: u32,
    blocks: Vec<BlockLinker>,
    /// Pending literal content lines, coalesced into one RunLine on flush.
    content: Vec<String>,
    content_line: u32,
    content_code: Option<String>,
    /// Options added since the last `choose`.
    open_choices: u32,
}

/// Single-pass compiler from script lines to a `Package`.
///
/// Contract: `start_module`, then per node `start_node` / `process`* /
/// `finish_node`, then `finish_module`. `compile_source` drives the same
/// contract from a whole source file.
pub struct Compiler {
    file: String,
    started: bool,
    builder: PackageBuilder,
    writer: CodeWriter,
    pre: Preprocessor,
    node: Option<NodeCtx>,
    line_no: u32,
    /// Continuation accumulator (`\`-joined physical lines).
    carry: Option<String>,
    warnings: Vec<CompileWarning>,
    reads: HashMap<VarKey, u32>,
    writes: HashMap<VarKey, u32>,
    var_names: HashMap<VarKey, String>,
}

impl Compiler {
    pub fn new(file: impl Into<String>) -> Self {
        Compiler {
            file: file.into(),
            started: false,
            builder: PackageBuilder::new(""),
            writer: CodeWriter::new(),
            pre: Preprocessor::default(),
            node: None,
            line_no: 0,
            carry: None,
            warnings: Vec::new(),
            reads: HashMap::new(),
            writes: HashMap::new(),
            var_names: HashMap::new(),
        }
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError {
            file: self.file.clone(),
            line: self.line_no,
            kind,
        }
    }

    pub fn start_module(&mut self, name: &str) -> Result<(), CompileError> {
        if self.started {
            return Err(self.err(CompileErrorKind::Other("module already started".into())));
        }
        self.builder = PackageBuilder::new(name);
        self.started = true;
        Ok(())
    }

    pub fn start_node(&mut self, id: &str) -> Result<(), CompileError> {
        if !self.started {
            return Err(self.err(CompileErrorKind::Other(
                "start_node before start_module".into(),
            )));
        }
        if let Some(node) = &self.node {
            return Err(self.err(CompileErrorKind::Other(format!(
                "node '{}' not finished",
                node.name
            ))));
        }
        let id = id.trim();
        let full = if let Some(rel) = id.strip_prefix('.') {
            format!("{}.{}", self.builder.root_path(), rel)
        } else {
            id.to_string()
        };
        if !scan::is_dotted_path(&full) {
            return Err(self.err(CompileErrorKind::BadTarget(id.into())));
        }
        self.node = Some(NodeCtx {
            id: StrHash::new(&full),
            name: full,
            start: self.writer.pos(),
            blocks: Vec::new(),
            content: Vec::new(),
            content_line: 0,
            content_code: None,
            open_choices: 0,
        });
        Ok(())
    }

    /// Consume one physical source line.
    pub fn process(&mut self, raw: &str) -> Result<(), CompileError> {
        self.line_no += 1;
        let logical = match self.carry.take() {
            Some(mut c) => {
                c.push_str(raw);
                c
            }
            None => raw.to_string(),
        };
        let trimmed = logical.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            self.carry = Some(stripped.to_string());
            return Ok(());
        }
        self.process_logical(trimmed, 0)
    }

    /// Advance the line counter without content (node headers etc).
    pub fn skip_line(&mut self) {
        self.line_no += 1;
    }

    pub fn finish_node(&mut self) -> Result<(), CompileError> {
        if let Some(carry) = self.carry.take() {
            self.process_logical(&carry, 0)?;
        }
        self.flush_content()?;
        let node = match self.node.take() {
            Some(n) => n,
            None => {
                return Err(self.err(CompileErrorKind::Other(
                    "finish_node without start_node".into(),
                )))
            }
        };
        if let Some(block) = node.blocks.last() {
            return Err(CompileError {
                file: self.file.clone(),
                line: block.line,
                kind: CompileErrorKind::UnclosedBlock(block.kind_name()),
            });
        }
        // Any unconsumed options behave like an implicit `choose goto`.
        if node.open_choices > 0 {
            self.writer.emit_op(Opcode::ShowChoices);
            self.writer.emit_op(Opcode::GotoNodeIndirect);
        }
        let length = self.writer.pos() - node.start;
        if !self.builder.add_node(node.id, &node.name, node.start, length) {
            return Err(self.err(CompileErrorKind::DuplicateNode(node.name)));
        }
        Ok(())
    }

    pub fn finish_module(mut self) -> Result<(Package, Vec<CompileWarning>), CompileError> {
        if let Some(node) = &self.node {
            return Err(self.err(CompileErrorKind::Other(format!(
                "node '{}' not finished at end of module",
                node.name
            ))));
        }
        let mut warnings = std::mem::take(&mut self.warnings);
        for (key, line) in &self.writes {
            if !self.reads.contains_key(key) {
                warnings.push(CompileWarning {
                    file: self.file.clone(),
                    line: *line,
                    message: format!(
                        "variable '{}' is written but never read",
                        self.display_var(key)
                    ),
                });
            }
        }
        for (key, line) in &self.reads {
            if !self.writes.contains_key(key) {
                warnings.push(CompileWarning {
                    file: self.file.clone(),
                    line: *line,
                    message: format!(
                        "variable '{}' is read but never written",
                        self.display_var(key)
                    ),
                });
            }
        }
        warnings.sort_by(|a, b| (a.line, &a.message).cmp(&(b.line, &b.message)));
        Ok((self.builder.finish(self.writer.into_bytes()), warnings))
    }

    fn display_var(&self, key: &VarKey) -> String {
        self.var_names
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.key.to_string())
    }

    // -------------------------
    // Line handling
    // -------------------------

    fn process_logical(&mut self, line: &str, depth: usize) -> Result<(), CompileError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(());
        }
        let line = self.pre.apply_consts(line);
        if let Some(body) = line.strip_prefix('$') {
            self.process_command(body, depth)
        } else {
            self.push_content(&line)
        }
    }

    fn process_command(&mut self, body: &str, depth: usize) -> Result<(), CompileError> {
        let name_len = body
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .map(char::len_utf8)
            .sum::<usize>();
        if name_len == 0 {
            return Err(self.err(CompileErrorKind::Malformed(format!(
                "bad command line '${body}'"
            ))));
        }
        let name = &body[..name_len];

        // Macro pseudo-command: expand and re-process the replacement text.
        if self.pre.macro_def(name).is_some() {
            if depth >= MAX_MACRO_DEPTH {
                return Err(self.err(CompileErrorKind::MacroDepth(MAX_MACRO_DEPTH)));
            }
            let (inner, after) = scan::parse_paren_group(&body[name_len..])
                .map_err(|m| self.err(CompileErrorKind::Malformed(m)))?;
            if !after.trim().is_empty() {
                return Err(self.err(CompileErrorKind::Malformed(format!(
                    "trailing text after macro call: '{after}'"
                ))));
            }
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                scan::split_top_level(inner, ',')
            };
            let expanded = self
                .pre
                .expand(name, &args)
                .map_err(|m| self.err(CompileErrorKind::Malformed(m)))?;
            return self.process_logical(&expanded, depth + 1);
        }

        let cmd = name.to_ascii_lowercase();
        let rest = body[name_len..].trim_start().to_string();
        let rest = rest.as_str();

        // Preprocessor directives neither need a node nor flush content.
        match cmd.as_str() {
            "const" => return self.cmd_const(rest),
            "macro" => return self.cmd_macro(rest),
            _ => {}
        }

        self.flush_content()?;
        if self.node.is_none() {
            return Err(self.err(CompileErrorKind::OutsideNode(cmd)));
        }

        match cmd.as_str() {
            "stop" => self.cmd_simple(rest, Opcode::Stop),
            "yield" => self.cmd_simple(rest, Opcode::Yield),
            "return" => self.cmd_simple(rest, Opcode::ReturnFromNode),
            "loop" => self.cmd_simple(rest, Opcode::Loop),
            "join" => self.cmd_simple(rest, Opcode::JoinForks),
            "goto" => self.cmd_transfer(rest, Opcode::GotoNode, Opcode::GotoNodeIndirect),
            "branch" => self.cmd_transfer(rest, Opcode::BranchNode, Opcode::BranchNodeIndirect),
            "fork" => self.cmd_transfer(rest, Opcode::ForkNode, Opcode::ForkNodeIndirect),
            "start" => self.cmd_transfer(rest, Opcode::StartNode, Opcode::StartNodeIndirect),
            "set" => self.cmd_set(rest),
            "call" => self.cmd_call(rest),
            "choice" => self.cmd_choice(rest),
            "answer" => self.cmd_answer(rest),
            "data" => self.cmd_data(rest),
            "choose" => self.cmd_choose(rest),
            "if" => self.cmd_if(rest),
            "elseif" => self.cmd_elseif(rest),
            "else" => self.cmd_else(rest),
            "endif" => self.cmd_endif(rest),
            "while" => self.cmd_while(rest),
            "break" => self.cmd_break(rest),
            "continue" => self.cmd_continue(rest),
            "endwhile" => self.cmd_endwhile(rest),
            other => Err(self.err(CompileErrorKind::UnknownCommand(other.into()))),
        }
    }

    fn push_content(&mut self, line: &str) -> Result<(), CompileError> {
        if self.node.is_none() {
            return Err(self.err(CompileErrorKind::OutsideNode("content".into())));
        }
        if let Some((code, text)) = scan::explicit_line_code(line) {
            let code = code.to_string();
            let text = text.to_string();
            // An explicit code starts a fresh run.
            self.flush_content()?;
            if let Some(node) = self.node.as_mut() {
                node.content_code = Some(code);
                node.content_line = self.line_no;
                node.content.push(text);
            }
        } else if let Some(node) = self.node.as_mut() {
            if node.content.is_empty() {
                node.content_line = self.line_no;
                node.content_code = None;
            }
            node.content.push(line.to_string());
        }
        Ok(())
    }

    /// Emit the pending content run as a single `RunLine`.
    fn flush_content(&mut self) -> Result<(), CompileError> {
        let (text, explicit, line, node_name) = match self.node.as_mut() {
            Some(node) if !node.content.is_empty() => (
                node.content.join("\n"),
                node.content_code.take(),
                node.content_line,
                node.name.clone(),
            ),
            _ => return Ok(()),
        };
        let (code, keep_name) = match explicit {
            Some(name) => {
                let code = StrHash::new(&name);
                if self.builder.has_line(code) {
                    return Err(self.err(CompileErrorKind::DuplicateLineCode(name)));
                }
                (code, Some(name))
            }
            None => (self.gen_line_code(&node_name, line)?, None),
        };
        self.builder.add_line(code, text, keep_name);
        self.writer.emit_op(Opcode::RunLine);
        self.writer.emit_hash(code);
        if let Some(node) = self.node.as_mut() {
            node.content.clear();
        }
        Ok(())
    }

    /// Deterministic line code from file, node and line number, with a
    /// bounded numeric-suffix retry on collision.
    fn gen_line_code(&mut self, node_name: &str, line: u32) -> Result<StrHash, CompileError> {
        let base = format!("{}|{}|{}", self.file, node_name, line);
        let mut code = StrHash::new(&base);
        let mut attempt = 1usize;
        while self.builder.has_line(code) {
            attempt += 1;
            if attempt > MAX_LINE_CODE_ATTEMPTS {
                return Err(self.err(CompileErrorKind::LineCodeExhausted(MAX_LINE_CODE_ATTEMPTS)));
            }
            code = StrHash::new(&format!("{base}#{attempt}"));
        }
        Ok(code)
    }

    // -------------------------
    // Operand / expression emission
    // -------------------------

    fn track_read(&mut self, key: &VarKey, display: &str) {
        if key.is_local() {
            self.reads.entry(*key).or_insert(self.line_no);
            self.var_names
                .entry(*key)
                .or_insert_with(|| display.trim().to_string());
        }
    }

    fn parse_operand_tracked(&mut self, text: &str) -> Result<Operand, CompileError> {
        match scan::parse_operand(text, &mut self.builder) {
            Ok(op) => {
                if let Operand::Variable(key) = &op {
                    let key = *key;
                    self.track_read(&key, text);
                }
                Ok(op)
            }
            Err(m) => Err(self.err(CompileErrorKind::BadOperand(text.trim().into(), m))),
        }
    }

    fn parse_target_tracked(&mut self, text: &str) -> Result<TargetRef, CompileError> {
        let root = self.builder.root_path().to_string();
        match scan::parse_target(text, &root, &mut self.builder) {
            Ok(target) => {
                if let TargetRef::Indirect(Operand::Variable(key)) = &target {
                    let key = *key;
                    self.track_read(&key, text.trim_matches(|c| c == '[' || c == ']'));
                }
                Ok(target)
            }
            Err(_) => Err(self.err(CompileErrorKind::BadTarget(text.trim().into()))),
        }
    }

    fn emit_push(&mut self, v: &Variant) {
        self.writer.emit_op(Opcode::PushValue);
        self.writer.emit_variant(v);
    }

    fn push_operand(&mut self, op: &Operand) {
        match op {
            Operand::Literal(v) => self.emit_push(v),
            Operand::Variable(key) => {
                self.writer.emit_op(Opcode::LoadVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
            }
            Operand::Method { id, args } => {
                self.writer.emit_op(Opcode::InvokeWithReturn);
                self.writer.emit_hash(*id);
                self.writer.emit_u32(*args);
            }
        }
    }

    /// One comparison as inline opcodes, leaving a bool on the stack.
    fn compile_comparison_inline(&mut self, text: &str) -> Result<(), CompileError> {
        let shape = scan::comparison_shape(text)
            .map_err(|m| self.err(CompileErrorKind::BadExpression(text.trim().into(), m)))?;
        match shape {
            CompShape::Unary(op, lhs) => {
                let lhs = self.parse_operand_tracked(lhs)?;
                self.push_operand(&lhs);
                match op {
                    ExprOp::True => self.writer.emit_op(Opcode::CastBool),
                    ExprOp::False => self.writer.emit_op(Opcode::Not),
                    ExprOp::Exists => {
                        self.emit_push(&Variant::Null);
                        self.writer.emit_op(Opcode::NotEqual);
                    }
                    ExprOp::NotExists => {
                        self.emit_push(&Variant::Null);
                        self.writer.emit_op(Opcode::Equal);
                    }
                    _ => unreachable!("binary operator in unary shape"),
                }
            }
            CompShape::Binary(op, lhs, rhs) => {
                let lhs = self.parse_operand_tracked(lhs)?;
                let rhs = self.parse_operand_tracked(rhs)?;
                self.push_operand(&lhs);
                self.push_operand(&rhs);
                self.writer.emit_op(match op {
                    ExprOp::Less => Opcode::Less,
                    ExprOp::LessEq => Opcode::LessEq,
                    ExprOp::Equal => Opcode::Equal,
                    ExprOp::NotEqual => Opcode::NotEqual,
                    ExprOp::GreaterEq => Opcode::GreaterEq,
                    ExprOp::Greater => Opcode::Greater,
                    _ => unreachable!("unary operator in binary shape"),
                });
            }
        }
        Ok(())
    }

    fn parse_comparison_tracked(
        &mut self,
        text: &str,
    ) -> Result<weft_core::Expression, CompileError> {
        let shape = scan::comparison_shape(text)
            .map_err(|m| self.err(CompileErrorKind::BadExpression(text.trim().into(), m)))?;
        Ok(match shape {
            CompShape::Unary(op, lhs) => {
                let lhs = self.parse_operand_tracked(lhs)?;
                weft_core::Expression::unary(op, lhs)
            }
            CompShape::Binary(op, lhs, rhs) => {
                let lhs = self.parse_operand_tracked(lhs)?;
                let rhs = self.parse_operand_tracked(rhs)?;
                weft_core::Expression::binary(op, lhs, rhs)
            }
        })
    }

    /// Condition for blocks and directive guards: a single comparison goes
    /// inline, a comma list goes through the expression table.
    fn compile_condition(&mut self, parts: &[&str]) -> Result<(), CompileError> {
        let parts: Vec<&str> = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        match parts.len() {
            0 => Err(self.err(CompileErrorKind::Malformed("missing condition".into()))),
            1 => self.compile_comparison_inline(parts[0]),
            _ => self.compile_condition_table(&parts),
        }
    }

    /// Condition that must resolve through the expression table (choice
    /// availability): leaves exactly one value on the stack.
    fn compile_condition_table(&mut self, parts: &[&str]) -> Result<(), CompileError> {
        let mut run = Vec::with_capacity(parts.len());
        for p in parts {
            run.push(self.parse_comparison_tracked(p)?);
        }
        let (offset, count) = self.builder.add_expressions(run);
        if count == 1 {
            self.writer.emit_op(Opcode::EvalSingle);
            self.writer.emit_u32(offset);
        } else {
            self.writer.emit_op(Opcode::EvalAndGroup);
            self.writer.emit_u32(offset);
            self.writer.emit_u16(count);
        }
        Ok(())
    }

    // -------------------------
    // Guards (trailing directive conditionals)
    // -------------------------

    fn begin_guard(&mut self, parts: &[&str]) -> Result<Option<u32>, CompileError> {
        let parts: Vec<&str> = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Ok(None);
        }
        self.compile_condition(&parts)?;
        self.writer.emit_op(Opcode::JumpIfFalse);
        Ok(Some(self.writer.reserve_jump()))
    }

    fn end_guard(&mut self, site: Option<u32>) -> Result<(), CompileError> {
        if let Some(site) = site {
            let pos = self.writer.pos();
            self.patch(site, pos)?;
        }
        Ok(())
    }

    fn patch(&mut self, site: u32, target: u32) -> Result<(), CompileError> {
        self.writer
            .patch_jump(site, target)
            .map_err(|e| self.err(CompileErrorKind::JumpTooFar(e.to_string())))
    }

    // -------------------------
    // Commands
    // -------------------------

    fn cmd_const(&mut self, rest: &str) -> Result<(), CompileError> {
        let Some((name, value)) = rest.split_once('=') else {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$const NAME = value'".into(),
            )));
        };
        let name = name.trim();
        if is_reserved(name) {
            return Err(self.err(CompileErrorKind::ReservedName(name.into())));
        }
        self.pre
            .define_const(name, value.trim())
            .map_err(|m| self.err(CompileErrorKind::Malformed(m)))
    }

    fn cmd_macro(&mut self, rest: &str) -> Result<(), CompileError> {
        let name_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .count();
        let name = &rest[..name_len];
        if name.is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$macro name(args) template'".into(),
            )));
        }
        if is_reserved(name) {
            return Err(self.err(CompileErrorKind::ReservedName(name.into())));
        }
        let (inner, template) = scan::parse_paren_group(&rest[name_len..])
            .map_err(|m| self.err(CompileErrorKind::Malformed(m)))?;
        let mut params = Vec::new();
        if !inner.trim().is_empty() {
            for p in scan::split_top_level(inner, ',') {
                let p = p.trim();
                if !scan::is_ident(p) {
                    return Err(self.err(CompileErrorKind::Malformed(format!(
                        "bad macro parameter '{p}'"
                    ))));
                }
                params.push(p.to_string());
            }
        }
        let template = template.trim();
        if template.is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(
                "macro has no replacement text".into(),
            )));
        }
        let name = name.to_string();
        self.pre
            .define_macro(&name, params, template)
            .map_err(|m| self.err(CompileErrorKind::Malformed(m)))
    }

    /// Directives with no primary argument: `$stop`, `$yield`, `$return`,
    /// `$loop`, `$join`; each takes an optional trailing conditional.
    fn cmd_simple(&mut self, rest: &str, op: Opcode) -> Result<(), CompileError> {
        let parts = scan::split_top_level(rest, ',');
        if let Some(first) = parts.first() {
            if !first.trim().is_empty() {
                return Err(self.err(CompileErrorKind::Malformed(format!(
                    "unexpected argument '{}'",
                    first.trim()
                ))));
            }
        }
        let guard = self.begin_guard(parts.get(1..).unwrap_or(&[]))?;
        self.writer.emit_op(op);
        self.end_guard(guard)
    }

    /// Node-transfer directives: `$goto`, `$branch`, `$fork`, `$start`.
    fn cmd_transfer(
        &mut self,
        rest: &str,
        direct: Opcode,
        indirect: Opcode,
    ) -> Result<(), CompileError> {
        let parts = scan::split_top_level(rest, ',');
        let Some(target_txt) = parts.first().map(|p| p.trim()).filter(|p| !p.is_empty()) else {
            return Err(self.err(CompileErrorKind::Malformed("missing node target".into())));
        };
        let target = self.parse_target_tracked(target_txt)?;
        let guard = self.begin_guard(&parts[1..])?;
        match target {
            TargetRef::Direct(h) => {
                self.writer.emit_op(direct);
                self.writer.emit_hash(h);
            }
            TargetRef::Indirect(op) => {
                self.push_operand(&op);
                self.writer.emit_op(indirect);
            }
        }
        self.end_guard(guard)
    }

    fn cmd_set(&mut self, rest: &str) -> Result<(), CompileError> {
        let parts = scan::split_top_level(rest, ',');
        let Some(main) = parts.first().map(|p| p.trim()).filter(|p| !p.is_empty()) else {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$set var = value'".into(),
            )));
        };
        let Some((at, op_char)) = scan::find_set_op(main) else {
            return Err(self.err(CompileErrorKind::Malformed(format!(
                "no assignment operator in '{main}'"
            ))));
        };
        let lhs = main[..at].trim();
        let rhs = main[at + 1..].trim();
        let key = scan::parse_var_key(lhs)
            .map_err(|m| self.err(CompileErrorKind::BadOperand(lhs.into(), m)))?;
        if rhs.is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(format!(
                "missing value in '{main}'"
            ))));
        }

        let guard = self.begin_guard(&parts[1..])?;
        match op_char {
            '=' => {
                let value = self.parse_operand_tracked(rhs)?;
                self.push_operand(&value);
                self.writer.emit_op(Opcode::StoreVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
            }
            '+' if rhs == "1" => {
                self.writer.emit_op(Opcode::IncrementVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
            }
            '-' if rhs == "1" => {
                self.writer.emit_op(Opcode::DecrementVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
            }
            _ => {
                self.track_read(&key, lhs);
                self.writer.emit_op(Opcode::LoadVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
                let value = self.parse_operand_tracked(rhs)?;
                self.push_operand(&value);
                self.writer.emit_op(match op_char {
                    '+' => Opcode::Add,
                    '-' => Opcode::Sub,
                    '*' => Opcode::Mul,
                    '/' => Opcode::Div,
                    _ => unreachable!("find_set_op returned unknown operator"),
                });
                self.writer.emit_op(Opcode::StoreVar);
                self.writer.emit_hash(key.table);
                self.writer.emit_hash(key.key);
            }
        }
        self.end_guard(guard)?;

        if key.is_local() {
            self.writes.entry(key).or_insert(self.line_no);
            self.var_names
                .entry(key)
                .or_insert_with(|| lhs.to_string());
        }
        Ok(())
    }

    /// `$call [target->]method(args)[, cond]`. The argument text stays
    /// raw; the host's method dispatcher parses it at invocation time.
    fn cmd_call(&mut self, rest: &str) -> Result<(), CompileError> {
        let (target_txt, call_txt) = match scan::find_top_level(rest, "->") {
            Some(i) => (Some(rest[..i].trim()), rest[i + 2..].trim_start()),
            None => (None, rest),
        };
        let name_len = call_txt
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .count();
        let method = &call_txt[..name_len];
        if method.is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$call method(args)'".into(),
            )));
        }
        let (args_inner, after) = scan::parse_paren_group(&call_txt[name_len..])
            .map_err(|m| self.err(CompileErrorKind::Malformed(m)))?;
        let after = after.trim_start();
        let cond_parts: Vec<&str> = if after.is_empty() {
            Vec::new()
        } else if let Some(conds) = after.strip_prefix(',') {
            scan::split_top_level(conds, ',')
        } else {
            return Err(self.err(CompileErrorKind::Malformed(format!(
                "trailing text after call: '{after}'"
            ))));
        };

        let method_id = StrHash::new(method);
        let args_idx = self.builder.intern_string(args_inner.trim());
        let guard = self.begin_guard(&cond_parts)?;
        match target_txt {
            None => {
                self.writer.emit_op(Opcode::Invoke);
                self.writer.emit_hash(method_id);
                self.writer.emit_u32(args_idx);
            }
            Some(t) => {
                match self.parse_target_tracked(t)? {
                    TargetRef::Direct(h) => self.emit_push(&Variant::Hash(h)),
                    TargetRef::Indirect(op) => self.push_operand(&op),
                }
                self.writer.emit_op(Opcode::InvokeOnTarget);
                self.writer.emit_hash(method_id);
                self.writer.emit_u32(args_idx);
            }
        }
        self.end_guard(guard)
    }

    /// `$choice target[, cond]; display text`
    fn cmd_choice(&mut self, rest: &str) -> Result<(), CompileError> {
        let Some(semi) = scan::find_top_level(rest, ";") else {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$choice target; text'".into(),
            )));
        };
        let head = &rest[..semi];
        let text = rest[semi + 1..].trim().to_string();
        if text.is_empty() {
            return Err(self.err(CompileErrorKind::Malformed("choice has no text".into())));
        }
        let parts = scan::split_top_level(head, ',');
        let Some(mut target_txt) = parts.first().map(|p| p.trim()).filter(|p| !p.is_empty()) else {
            return Err(self.err(CompileErrorKind::Malformed("choice has no target".into())));
        };
        let selector = if let Some(stripped) = target_txt.strip_prefix('#') {
            target_txt = stripped;
            true
        } else {
            false
        };
        let target = self.parse_target_tracked(target_txt)?;

        let node_name = match self.node.as_ref() {
            Some(n) => n.name.clone(),
            None => return Err(self.err(CompileErrorKind::OutsideNode("choice".into()))),
        };
        let code = self.gen_line_code(&node_name, self.line_no)?;
        self.builder.add_line(code, text, None);

        match target {
            TargetRef::Direct(h) => self.emit_push(&Variant::Hash(h)),
            TargetRef::Indirect(op) => self.push_operand(&op),
        }
        self.emit_push(&Variant::Hash(code));

        let conds: Vec<&str> = parts[1..]
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if conds.is_empty() {
            self.emit_push(&Variant::Bool(true));
        } else {
            self.compile_condition_table(&conds)?;
        }

        self.writer.emit_op(Opcode::AddOption);
        self.writer.emit_u8(if selector {
            OptionFlags::IS_SELECTOR.bits()
        } else {
            0
        });
        if let Some(node) = self.node.as_mut() {
            node.open_choices += 1;
        }
        Ok(())
    }

    /// `$answer id[, cond...], target`
    fn cmd_answer(&mut self, rest: &str) -> Result<(), CompileError> {
        if self.open_choices() == 0 {
            return Err(self.err(CompileErrorKind::WithoutChoice("answer")));
        }
        let parts = scan::split_top_level(rest, ',');
        if parts.len() < 2 {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$answer id, target'".into(),
            )));
        }
        let id_txt = parts[0].trim();
        let target_txt = parts[parts.len() - 1].trim();
        let conds = &parts[1..parts.len() - 1];

        let guard = self.begin_guard(conds)?;
        match self.parse_target_tracked(target_txt)? {
            TargetRef::Direct(h) => self.emit_push(&Variant::Hash(h)),
            TargetRef::Indirect(op) => self.push_operand(&op),
        }
        let id = self.parse_operand_tracked(id_txt)?;
        self.push_operand(&id);
        self.writer.emit_op(Opcode::AddAnswer);
        self.end_guard(guard)
    }

    /// `$data id, value[, cond]`
    fn cmd_data(&mut self, rest: &str) -> Result<(), CompileError> {
        if self.open_choices() == 0 {
            return Err(self.err(CompileErrorKind::WithoutChoice("data")));
        }
        let parts = scan::split_top_level(rest, ',');
        if parts.len() < 2 {
            return Err(self.err(CompileErrorKind::Malformed(
                "expected '$data id, value'".into(),
            )));
        }
        let id = parts[0].trim();
        if !scan::is_ident(id) {
            return Err(self.err(CompileErrorKind::Malformed(format!("bad datum id '{id}'"))));
        }
        let id = StrHash::new(id);
        let guard = self.begin_guard(&parts[2..])?;
        let value = self.parse_operand_tracked(parts[1])?;
        self.push_operand(&value);
        self.writer.emit_op(Opcode::AddData);
        self.writer.emit_hash(id);
        self.end_guard(guard)
    }

    fn cmd_choose(&mut self, rest: &str) -> Result<(), CompileError> {
        if self.open_choices() == 0 {
            return Err(self.err(CompileErrorKind::ChooseWithoutChoice));
        }
        let mode = rest.trim().to_ascii_lowercase();
        let follow = match mode.as_str() {
            "" | "goto" => Some(Opcode::GotoNodeIndirect),
            "branch" => Some(Opcode::BranchNodeIndirect),
            "continue" => None,
            other => {
                return Err(self.err(CompileErrorKind::Malformed(format!(
                    "bad choose mode '{other}'"
                ))))
            }
        };
        self.writer.emit_op(Opcode::ShowChoices);
        match follow {
            Some(op) => self.writer.emit_op(op),
            // `continue` keeps running here; the chosen target is dropped.
            None => self.writer.emit_op(Opcode::Pop),
        }
        if let Some(node) = self.node.as_mut() {
            node.open_choices = 0;
        }
        Ok(())
    }

    fn open_choices(&self) -> u32 {
        self.node.as_ref().map_or(0, |n| n.open_choices)
    }

    // -------------------------
    // Blocks
    // -------------------------

    fn cmd_if(&mut self, rest: &str) -> Result<(), CompileError> {
        let parts = scan::split_top_level(rest, ',');
        self.compile_condition(&parts)?;
        self.writer.emit_op(Opcode::JumpIfFalse);
        let site = self.writer.reserve_jump();
        let line = self.line_no;
        if let Some(node) = self.node.as_mut() {
            let mut block = BlockLinker::new_if(line);
            block.pending_branch = Some(site);
            node.blocks.push(block);
        }
        Ok(())
    }

    fn cmd_elseif(&mut self, rest: &str) -> Result<(), CompileError> {
        let in_if = matches!(
            self.node.as_ref().and_then(|n| n.blocks.last()),
            Some(b) if b.kind == BlockKind::If && !b.seen_else
        );
        if !in_if {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("elseif", "if")));
        }
        let pending = self
            .node
            .as_mut()
            .and_then(|n| n.blocks.last_mut())
            .and_then(|b| b.pending_branch.take());
        let Some(pending) = pending else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("elseif", "if")));
        };
        // Previous branch jumps over the rest of the chain.
        self.writer.emit_op(Opcode::Jump);
        let end_site = self.writer.reserve_jump();
        let here = self.writer.pos();
        self.patch(pending, here)?;

        let parts = scan::split_top_level(rest, ',');
        self.compile_condition(&parts)?;
        self.writer.emit_op(Opcode::JumpIfFalse);
        let site = self.writer.reserve_jump();
        if let Some(block) = self.node.as_mut().and_then(|n| n.blocks.last_mut()) {
            block.end_sites.push(end_site);
            block.pending_branch = Some(site);
        }
        Ok(())
    }

    fn cmd_else(&mut self, rest: &str) -> Result<(), CompileError> {
        if !rest.trim().is_empty() {
            return Err(self.err(CompileErrorKind::Malformed("'else' takes no argument".into())));
        }
        let in_if = matches!(
            self.node.as_ref().and_then(|n| n.blocks.last()),
            Some(b) if b.kind == BlockKind::If && !b.seen_else
        );
        if !in_if {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("else", "if")));
        }
        let pending = self
            .node
            .as_mut()
            .and_then(|n| n.blocks.last_mut())
            .and_then(|b| b.pending_branch.take());
        let Some(pending) = pending else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("else", "if")));
        };
        self.writer.emit_op(Opcode::Jump);
        let end_site = self.writer.reserve_jump();
        let here = self.writer.pos();
        self.patch(pending, here)?;
        if let Some(block) = self.node.as_mut().and_then(|n| n.blocks.last_mut()) {
            block.end_sites.push(end_site);
            block.seen_else = true;
        }
        Ok(())
    }

    fn cmd_endif(&mut self, rest: &str) -> Result<(), CompileError> {
        if !rest.trim().is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(
                "'endif' takes no argument".into(),
            )));
        }
        let in_if = matches!(
            self.node.as_ref().and_then(|n| n.blocks.last()),
            Some(b) if b.kind == BlockKind::If
        );
        if !in_if {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("endif", "if")));
        }
        let Some(block) = self.node.as_mut().and_then(|n| n.blocks.pop()) else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("endif", "if")));
        };
        let here = self.writer.pos();
        if let Some(pending) = block.pending_branch {
            self.patch(pending, here)?;
        }
        for site in block.end_sites {
            self.patch(site, here)?;
        }
        Ok(())
    }

    fn cmd_while(&mut self, rest: &str) -> Result<(), CompileError> {
        let loop_start = self.writer.pos();
        let parts = scan::split_top_level(rest, ',');
        self.compile_condition(&parts)?;
        self.writer.emit_op(Opcode::JumpIfFalse);
        let site = self.writer.reserve_jump();
        let line = self.line_no;
        if let Some(node) = self.node.as_mut() {
            let mut block = BlockLinker::new_while(line, loop_start);
            block.end_sites.push(site);
            node.blocks.push(block);
        }
        Ok(())
    }

    fn enclosing_loop(&self) -> Option<usize> {
        self.node
            .as_ref()?
            .blocks
            .iter()
            .rposition(|b| b.kind == BlockKind::While)
    }

    fn cmd_break(&mut self, rest: &str) -> Result<(), CompileError> {
        let Some(idx) = self.enclosing_loop() else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("break", "while")));
        };
        let parts = scan::split_top_level(rest, ',');
        if let Some(first) = parts.first() {
            if !first.trim().is_empty() {
                return Err(self.err(CompileErrorKind::Malformed(
                    "unexpected argument to 'break'".into(),
                )));
            }
        }
        let guard = self.begin_guard(parts.get(1..).unwrap_or(&[]))?;
        self.writer.emit_op(Opcode::Jump);
        let site = self.writer.reserve_jump();
        if let Some(node) = self.node.as_mut() {
            node.blocks[idx].end_sites.push(site);
        }
        self.end_guard(guard)
    }

    fn cmd_continue(&mut self, rest: &str) -> Result<(), CompileError> {
        let Some(idx) = self.enclosing_loop() else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("continue", "while")));
        };
        let loop_start = match self.node.as_ref() {
            Some(n) => n.blocks[idx].loop_start,
            None => return Err(self.err(CompileErrorKind::OutsideNode("continue".into()))),
        };
        let parts = scan::split_top_level(rest, ',');
        if let Some(first) = parts.first() {
            if !first.trim().is_empty() {
                return Err(self.err(CompileErrorKind::Malformed(
                    "unexpected argument to 'continue'".into(),
                )));
            }
        }
        let guard = self.begin_guard(parts.get(1..).unwrap_or(&[]))?;
        self.writer.emit_op(Opcode::Jump);
        let site = self.writer.reserve_jump();
        self.patch(site, loop_start)?;
        self.end_guard(guard)
    }

    fn cmd_endwhile(&mut self, rest: &str) -> Result<(), CompileError> {
        if !rest.trim().is_empty() {
            return Err(self.err(CompileErrorKind::Malformed(
                "'endwhile' takes no argument".into(),
            )));
        }
        let in_while = matches!(
            self.node.as_ref().and_then(|n| n.blocks.last()),
            Some(b) if b.kind == BlockKind::While
        );
        if !in_while {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("endwhile", "while")));
        }
        let Some(block) = self.node.as_mut().and_then(|n| n.blocks.pop()) else {
            return Err(self.err(CompileErrorKind::StrayBlockCommand("endwhile", "while")));
        };
        self.writer.emit_op(Opcode::Jump);
        let site = self.writer.reserve_jump();
        self.patch(site, block.loop_start)?;
        let here = self.writer.pos();
        for site in block.end_sites {
            self.patch(site, here)?;
        }
        Ok(())
    }
}

/// Compile a whole source file: `:: dotted.id` headers open nodes, every
/// other line feeds `process`.
pub fn compile_source(
    file: &str,
    module: &str,
    source: &str,
) -> Result<(Package, Vec<CompileWarning>), CompileError> {
    let mut c = Compiler::new(file);
    c.start_module(module)?;
    let mut in_node = false;
    for line in source.lines() {
        let t = line.trim_start();
        if let Some(header) = t.strip_prefix("::") {
            if in_node {
                c.finish_node()?;
            }
            c.skip_line();
            c.start_node(header.trim())?;
            in_node = true;
        } else {
            c.process(line)?;
        }
    }
    if in_node {
        c.finish_node()?;
    }
    c.finish_module()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(src: &str) -> (Package, Vec<CompileWarning>) {
        compile_source("test.weft", "m", src).expect("compile")
    }

    fn compile_err(src: &str) -> CompileError {
        compile_source("test.weft", "m", src).expect_err("should not compile")
    }

    #[test]
    fn adjacent_content_coalesces_into_one_line() {
        let (pkg, _) = compile(":: m.a\nfirst\nsecond\nthird\n$stop\n");
        assert_eq!(pkg.line_count(), 1);
        let node = pkg.node(StrHash::new("m.a")).unwrap();
        // RunLine (1 + 4 bytes) + Stop (1 byte)
        assert_eq!(node.length, 6);
        let code = pkg.code();
        assert_eq!(Opcode::decode(code[node.offset as usize]), Some(Opcode::RunLine));
        let text = pkg
            .line(weft_core::StrHash::from_raw(u32::from_le_bytes(
                code[node.offset as usize + 1..node.offset as usize + 5]
                    .try_into()
                    .unwrap(),
            )))
            .map(|l| l.text.clone());
        assert_eq!(text.as_deref(), Some("first\nsecond\nthird"));
    }

    #[test]
    fn continuation_joins_physical_lines() {
        let (pkg, _) = compile(":: m.a\nfirst \\\npart\n");
        let line = pkg.line(pkg_single_line_code(&pkg)).unwrap();
        assert_eq!(line.text, "first part");
    }

    fn pkg_single_line_code(pkg: &Package) -> StrHash {
        assert_eq!(pkg.line_count(), 1);
        let node = pkg.nodes().next().unwrap();
        let code = pkg.code();
        StrHash::from_raw(u32::from_le_bytes(
            code[node.offset as usize + 1..node.offset as usize + 5]
                .try_into()
                .unwrap(),
        ))
    }

    #[test]
    fn explicit_line_codes_are_kept_and_checked() {
        let (pkg, _) = compile(":: m.a\n@hello_1: Hi.\n");
        let rec = pkg.line(StrHash::new("hello_1")).unwrap();
        assert_eq!(rec.text, "Hi.");
        assert_eq!(rec.name.as_deref(), Some("hello_1"));

        let err = compile_err(":: m.a\n@dup: a\n$yield\n@dup: b\n");
        assert!(matches!(err.kind, CompileErrorKind::DuplicateLineCode(_)));
    }

    #[test]
    fn generated_line_codes_disambiguate_deterministically() {
        let mut c = Compiler::new("f.weft");
        c.start_module("m").unwrap();
        c.start_node("m.a").unwrap();
        let first = c.gen_line_code("m.a", 7).unwrap();
        c.builder.add_line(first, "x".into(), None);
        let second = c.gen_line_code("m.a", 7).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, StrHash::new("f.weft|m.a|7#2"));
        c.builder.add_line(second, "y".into(), None);
        let third = c.gen_line_code("m.a", 7).unwrap();
        assert_eq!(third, StrHash::new("f.weft|m.a|7#3"));
    }

    #[test]
    fn unclosed_block_is_an_error() {
        let err = compile_err(":: m.a\n$if x == 1\ninside\n");
        assert_eq!(err.kind, CompileErrorKind::UnclosedBlock("if"));
        let err = compile_err(":: m.a\n$endwhile\n");
        assert_eq!(
            err.kind,
            CompileErrorKind::StrayBlockCommand("endwhile", "while")
        );
        let err = compile_err(":: m.a\n$while x < 1\n$endif\n");
        assert_eq!(err.kind, CompileErrorKind::StrayBlockCommand("endif", "if"));
    }

    #[test]
    fn duplicate_nodes_and_unknown_commands_error() {
        let err = compile_err(":: m.a\nhello\n:: m.a\nagain\n");
        assert!(matches!(err.kind, CompileErrorKind::DuplicateNode(_)));
        let err = compile_err(":: m.a\n$frobnicate now\n");
        assert!(matches!(err.kind, CompileErrorKind::UnknownCommand(_)));
    }

    #[test]
    fn choose_requires_choices() {
        let err = compile_err(":: m.a\n$choose\n");
        assert_eq!(err.kind, CompileErrorKind::ChooseWithoutChoice);
        let err = compile_err(":: m.a\n$answer 1, m.b\n");
        assert_eq!(err.kind, CompileErrorKind::WithoutChoice("answer"));
    }

    #[test]
    fn macros_and_consts_expand() {
        let (pkg, _) = compile(
            ":: m.a\n$const WHO = \"warden\"\n$macro ask(t) $choice .a, spoken !exists; {0}\n$ask(Ask the $WHO.)\n$choose\n",
        );
        // one option line, text substituted through const expansion
        assert_eq!(pkg.line_count(), 1);
        let line = pkg.line(pkg_single_line_code_any(&pkg)).unwrap();
        assert_eq!(line.text, "Ask the \"warden\".");
    }

    fn pkg_single_line_code_any(pkg: &Package) -> StrHash {
        // scan the code stream for the first AddOption's pushed line code
        // (PushValue Hash right before the condition push)
        let code = pkg.code();
        let mut i = 0usize;
        let mut last_hash = None;
        while i < code.len() {
            let op = Opcode::decode(code[i]).unwrap();
            i += 1;
            match op {
                Opcode::PushValue => {
                    let tag = code[i];
                    i += 1;
                    match tag {
                        0 => {}
                        1 => i += 1,
                        2 | 3 => i += 4,
                        4 => {
                            last_hash = Some(StrHash::from_raw(u32::from_le_bytes(
                                code[i..i + 4].try_into().unwrap(),
                            )));
                            i += 4;
                        }
                        _ => panic!("bad tag"),
                    }
                }
                Opcode::AddOption => {
                    i += 1;
                    return last_hash.expect("line code pushed before AddOption");
                }
                Opcode::RunLine | Opcode::EvalSingle => i += 4,
                Opcode::EvalAndGroup | Opcode::EvalOrGroup => i += 6,
                Opcode::LoadVar | Opcode::StoreVar | Opcode::IncrementVar
                | Opcode::DecrementVar | Opcode::Invoke | Opcode::InvokeWithReturn
                | Opcode::InvokeOnTarget | Opcode::InvokeOnTargetWithReturn => i += 8,
                Opcode::Jump | Opcode::JumpIfFalse => i += 2,
                Opcode::GotoNode | Opcode::BranchNode | Opcode::ForkNode | Opcode::StartNode => {
                    i += 4
                }
                Opcode::AddData => i += 4,
                _ => {}
            }
        }
        panic!("no AddOption found");
    }

    #[test]
    fn recursive_macros_hit_the_depth_guard() {
        let err = compile_err(":: m.a\n$macro spin() $spin()\n$spin()\n");
        assert_eq!(err.kind, CompileErrorKind::MacroDepth(MAX_MACRO_DEPTH));
    }

    #[test]
    fn reserved_macro_names_rejected() {
        let err = compile_err(":: m.a\n$const goto = x\n");
        assert!(matches!(err.kind, CompileErrorKind::ReservedName(_)));
    }

    #[test]
    fn variable_usage_warnings() {
        let (_, warnings) = compile(":: m.a\n$set unused = 3\n$goto m.b, missing == 1\n:: m.b\nbye\n");
        let messages: Vec<&str> = warnings.iter().map(|w| w.message.as_str()).collect();
        assert!(messages
            .iter()
            .any(|m| m.contains("'unused' is written but never read")));
        assert!(messages
            .iter()
            .any(|m| m.contains("'missing' is read but never written")));
    }

    #[test]
    fn jump_targets_land_on_instruction_boundaries() {
        let (pkg, _) = compile(
            ":: m.a\n$set i = 0\n$while i < 4\n$if i == 2\n$break\n$elseif i == 3\n$continue\n$else\nbody\n$endif\n$set i + 1\n$endwhile\ndone\n",
        );
        let node = pkg.node(StrHash::new("m.a")).unwrap();
        let code = &pkg.code()[node.offset as usize..(node.offset + node.length) as usize];

        // First pass: collect instruction boundaries and jump sites.
        let mut boundaries = std::collections::HashSet::new();
        let mut jumps = Vec::new();
        let mut r = weft_core::CodeReader::new(code, 0);
        while !r.at_end() {
            boundaries.insert(r.pos());
            let op = r.read_opcode().unwrap();
            match op {
                Opcode::Jump | Opcode::JumpIfFalse => {
                    let disp = r.read_i16().unwrap();
                    jumps.push((r.pos(), disp));
                }
                Opcode::PushValue => {
                    r.read_variant().unwrap();
                }
                Opcode::RunLine | Opcode::EvalSingle | Opcode::GotoNode | Opcode::BranchNode
                | Opcode::ForkNode | Opcode::StartNode | Opcode::AddData => {
                    r.read_u32().unwrap();
                }
                Opcode::EvalAndGroup | Opcode::EvalOrGroup => {
                    r.read_u32().unwrap();
                    r.read_u16().unwrap();
                }
                Opcode::LoadVar | Opcode::StoreVar | Opcode::IncrementVar
                | Opcode::DecrementVar => {
                    r.read_u32().unwrap();
                    r.read_u32().unwrap();
                }
                Opcode::Invoke | Opcode::InvokeWithReturn | Opcode::InvokeOnTarget
                | Opcode::InvokeOnTargetWithReturn => {
                    r.read_u32().unwrap();
                    r.read_u32().unwrap();
                }
                Opcode::AddOption => {
                    r.read_u8().unwrap();
                }
                _ => {}
            }
        }
        boundaries.insert(code.len() as u32);

        assert!(!jumps.is_empty());
        for (after, disp) in jumps {
            let target = i64::from(after) + i64::from(disp);
            assert!(target >= 0 && target <= code.len() as i64);
            assert!(
                boundaries.contains(&(target as u32)),
                "jump target {target} is not an instruction boundary"
            );
        }
    }
}
