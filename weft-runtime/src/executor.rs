use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use weft_core::{
    variant, ChoiceState, CodeReader, ExprOp, Expression, Opcode, Operand, OptionFlags, Package,
    StrHash, VarKey, Variant,
};

use crate::arena::ThreadArena;
use crate::plugin::{EnginePlugin, HostFlow, InvokeFlow};
use crate::thread::{ExecState, Frame, ThreadState, VmError};

/// What a suspended thread is waiting on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wait {
    /// A displayed line (the host returned `Pending` from `run_line`).
    Line,
    /// A presented choice menu awaiting `choose`.
    Choice,
    /// A pending host method invocation.
    Invoke,
    /// Tracked forked children still running.
    Join,
    /// An explicit `$yield`.
    Yield,
}

/// Result of one cooperative tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tick {
    Suspended(Wait),
    Done,
}

enum Transfer {
    Goto,
    Branch,
}

impl ThreadState {
    /// Advance this thread until it suspends or finishes.
    ///
    /// Resumption actions (pushing a resolved choice target, re-checking
    /// join liveness) happen first, then instructions dispatch in program
    /// order.
    pub fn tick(&mut self, arena: &mut ThreadArena, host: &mut dyn EnginePlugin) -> Result<Tick> {
        match self.state {
            ExecState::Done => return Ok(Tick::Done),
            ExecState::AwaitingChoice => match self.choices.state() {
                ChoiceState::Chosen => {
                    let target = self.choices.chosen_target().unwrap_or(Variant::Null);
                    self.choices.reset();
                    self.push(target)?;
                    self.state = ExecState::Default;
                }
                ChoiceState::Offering => return Ok(Tick::Suspended(Wait::Choice)),
                ChoiceState::Accumulating => {
                    bail!("resumed from a choice wait with no offered options")
                }
            },
            ExecState::AwaitingJoin => {
                self.children.retain(|h| arena.is_running(*h));
                if !self.children.is_empty() {
                    return Ok(Tick::Suspended(Wait::Join));
                }
                self.state = ExecState::Default;
            }
            ExecState::Default => {}
        }

        loop {
            let (package, node, pc) = match self.frames.last() {
                Some(f) => (f.package.clone(), f.node, f.pc),
                None => {
                    self.state = ExecState::Done;
                    host.on_end(self.handle);
                    return Ok(Tick::Done);
                }
            };

            // Natural exhaustion pops back to the branch caller.
            if pc >= node.length {
                host.on_node_exit(node.id, self.handle);
                self.frames.pop();
                continue;
            }

            let window = package
                .code()
                .get(node.offset as usize..(node.offset + node.length) as usize)
                .ok_or_else(|| {
                    anyhow!(
                        "node {} range out of package '{}' bounds",
                        node.id,
                        package.name()
                    )
                })?;
            let mut r = CodeReader::new(window, pc);
            let op = r.read_opcode()?;

            match op {
                Opcode::NoOp => {
                    self.set_pc(r.pos());
                }

                Opcode::RunLine => {
                    let code = r.read_hash()?;
                    self.set_pc(r.pos());
                    let text = host
                        .try_lookup_line(code, &package)
                        .or_else(|| package.line(code).map(|l| l.text.clone()));
                    let Some(text) = text else {
                        log::error!("line {} not found in package '{}'", code, package.name());
                        continue;
                    };
                    if let HostFlow::Pending = host.run_line(self.handle, code, &text) {
                        return Ok(Tick::Suspended(Wait::Line));
                    }
                }

                Opcode::PushValue => {
                    let v = r.read_variant()?;
                    self.set_pc(r.pos());
                    self.push(v)?;
                }
                Opcode::Pop => {
                    self.set_pc(r.pos());
                    self.pop()?;
                }
                Opcode::Duplicate => {
                    self.set_pc(r.pos());
                    let top = *self.stack.last().ok_or(VmError::StackUnderflow)?;
                    self.push(top)?;
                }

                Opcode::LoadVar => {
                    let key = self.read_var_key(&mut r)?;
                    self.set_pc(r.pos());
                    let v = self.load_var(key, host);
                    self.push(v)?;
                }
                Opcode::StoreVar => {
                    let key = self.read_var_key(&mut r)?;
                    self.set_pc(r.pos());
                    let v = self.pop()?;
                    self.store_var(key, v, host);
                }
                Opcode::IncrementVar => {
                    let key = self.read_var_key(&mut r)?;
                    self.set_pc(r.pos());
                    self.bump_var(key, Variant::Int(1), host);
                }
                Opcode::DecrementVar => {
                    let key = self.read_var_key(&mut r)?;
                    self.set_pc(r.pos());
                    self.bump_var(key, Variant::Int(-1), host);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    self.set_pc(r.pos());
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(match op {
                        Opcode::Add => variant::add(a, b),
                        Opcode::Sub => variant::sub(a, b),
                        Opcode::Mul => variant::mul(a, b),
                        _ => variant::div(a, b),
                    })?;
                }

                Opcode::Not => {
                    self.set_pc(r.pos());
                    let v = self.pop()?;
                    self.push(Variant::Bool(!v.truthy()))?;
                }
                Opcode::CastBool => {
                    self.set_pc(r.pos());
                    let v = self.pop()?;
                    self.push(Variant::Bool(v.truthy()))?;
                }
                Opcode::Less
                | Opcode::LessEq
                | Opcode::Equal
                | Opcode::NotEqual
                | Opcode::GreaterEq
                | Opcode::Greater => {
                    self.set_pc(r.pos());
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Variant::Bool(compare_op(op, &a, &b)))?;
                }

                Opcode::Jump => {
                    let disp = r.read_i16()?;
                    r.jump_by(disp)?;
                    self.set_pc(r.pos());
                }
                Opcode::JumpIfFalse => {
                    let disp = r.read_i16()?;
                    let v = self.pop()?;
                    if !v.truthy() {
                        r.jump_by(disp)?;
                    }
                    self.set_pc(r.pos());
                }

                Opcode::EvalSingle => {
                    let idx = r.read_u32()?;
                    self.set_pc(r.pos());
                    let e = package
                        .expression(idx)
                        .cloned()
                        .ok_or_else(|| anyhow!("expression index {} out of range", idx))?;
                    let v = self.eval_expr(&e, &package, host);
                    self.push(Variant::Bool(v))?;
                }
                Opcode::EvalAndGroup | Opcode::EvalOrGroup => {
                    let offset = r.read_u32()?;
                    let count = r.read_u16()?;
                    self.set_pc(r.pos());
                    let run = package
                        .expression_run(offset, count)
                        .ok_or_else(|| {
                            anyhow!("expression run {}+{} out of range", offset, count)
                        })?
                        .to_vec();
                    let want_any = op == Opcode::EvalOrGroup;
                    let mut result = !want_any;
                    for e in &run {
                        let v = self.eval_expr(e, &package, host);
                        if v == want_any {
                            result = want_any;
                            break;
                        }
                    }
                    self.push(Variant::Bool(result))?;
                }

                Opcode::Invoke
                | Opcode::InvokeWithReturn
                | Opcode::InvokeOnTarget
                | Opcode::InvokeOnTargetWithReturn => {
                    let method = r.read_hash()?;
                    let args_idx = r.read_u32()?;
                    self.set_pc(r.pos());
                    let args = package
                        .string(args_idx)
                        .ok_or_else(|| anyhow!("string index {} out of range", args_idx))?
                        .to_string();
                    let target = match op {
                        Opcode::InvokeOnTarget | Opcode::InvokeOnTargetWithReturn => {
                            let raw = self.pop()?;
                            // A hash target may name a host object.
                            Some(match raw.as_hash() {
                                Some(id) => {
                                    host.try_lookup_object(id, self.handle).unwrap_or(raw)
                                }
                                None => raw,
                            })
                        }
                        _ => None,
                    };
                    let wants_return =
                        matches!(op, Opcode::InvokeWithReturn | Opcode::InvokeOnTargetWithReturn);
                    if wants_return {
                        // Value-producing invocations are synchronous by
                        // contract; expressions cannot park mid-evaluation.
                        let v = host.invoke_with_return(self.handle, method, &args, target);
                        self.push(v)?;
                    } else {
                        match host.invoke(self.handle, method, &args, target) {
                            InvokeFlow::Ready(_) => {}
                            InvokeFlow::Pending => {
                                return Ok(Tick::Suspended(Wait::Invoke));
                            }
                        }
                    }
                }

                Opcode::GotoNode | Opcode::BranchNode => {
                    let id = r.read_hash()?;
                    self.set_pc(r.pos());
                    let kind = if op == Opcode::GotoNode {
                        Transfer::Goto
                    } else {
                        Transfer::Branch
                    };
                    self.transfer(id, kind, &package, host);
                }
                Opcode::GotoNodeIndirect | Opcode::BranchNodeIndirect => {
                    self.set_pc(r.pos());
                    let v = self.pop()?;
                    let kind = if op == Opcode::GotoNodeIndirect {
                        Transfer::Goto
                    } else {
                        Transfer::Branch
                    };
                    match v.as_hash() {
                        Some(id) => self.transfer(id, kind, &package, host),
                        None if v.is_null() => {
                            log::warn!("indirect transfer resolved to null; continuing")
                        }
                        None => log::error!("indirect transfer target is not a node id: {v}"),
                    }
                }
                Opcode::ReturnFromNode => {
                    self.set_pc(r.pos());
                    if let Some(f) = self.frames.pop() {
                        host.on_node_exit(f.node.id, self.handle);
                    }
                }
                Opcode::Stop => {
                    self.set_pc(r.pos());
                    while let Some(f) = self.frames.pop() {
                        host.on_node_exit(f.node.id, self.handle);
                    }
                }
                Opcode::Loop => {
                    self.set_pc(0);
                }
                Opcode::Yield => {
                    self.set_pc(r.pos());
                    return Ok(Tick::Suspended(Wait::Yield));
                }

                Opcode::ForkNode | Opcode::StartNode => {
                    let id = r.read_hash()?;
                    self.set_pc(r.pos());
                    self.spawn_sibling(id, op == Opcode::ForkNode, &package, arena, host);
                }
                Opcode::ForkNodeIndirect | Opcode::StartNodeIndirect => {
                    self.set_pc(r.pos());
                    let v = self.pop()?;
                    match v.as_hash() {
                        Some(id) => self.spawn_sibling(
                            id,
                            op == Opcode::ForkNodeIndirect,
                            &package,
                            arena,
                            host,
                        ),
                        None => log::error!("indirect fork target is not a node id: {v}"),
                    }
                }
                Opcode::JoinForks => {
                    self.set_pc(r.pos());
                    self.children.retain(|h| arena.is_running(*h));
                    if !self.children.is_empty() {
                        self.state = ExecState::AwaitingJoin;
                        return Ok(Tick::Suspended(Wait::Join));
                    }
                }

                Opcode::AddOption => {
                    let flags = r.read_u8()?;
                    self.set_pc(r.pos());
                    let cond = self.pop()?;
                    let line = self.pop()?;
                    let target = self.pop()?;
                    let line = line.as_hash().unwrap_or_else(|| {
                        log::error!("option line code is not a hash: {line}");
                        StrHash::NULL
                    });
                    let selector = OptionFlags::from_bits_truncate(flags)
                        .contains(OptionFlags::IS_SELECTOR);
                    self.choices
                        .add_option(target, line, cond.truthy(), selector)
                        .map_err(VmError::Choice)?;
                }
                Opcode::AddAnswer => {
                    self.set_pc(r.pos());
                    let id = self.pop()?;
                    let target = self.pop()?;
                    self.choices.add_answer(id, target).map_err(VmError::Choice)?;
                }
                Opcode::AddData => {
                    let id = r.read_hash()?;
                    self.set_pc(r.pos());
                    let value = self.pop()?;
                    self.choices.add_data(id, value).map_err(VmError::Choice)?;
                }
                Opcode::ShowChoices => {
                    self.set_pc(r.pos());
                    self.choices.offer().map_err(VmError::Choice)?;
                    if self.choices.available_count() == 0 {
                        log::debug!("no available options; resolving to null");
                        self.choices.reset();
                        self.push(Variant::Null)?;
                        continue;
                    }
                    match host.show_options(self.handle, &mut self.choices) {
                        HostFlow::Ready => match self.choices.state() {
                            ChoiceState::Chosen => {
                                let target =
                                    self.choices.chosen_target().unwrap_or(Variant::Null);
                                self.choices.reset();
                                self.push(target)?;
                            }
                            _ => bail!("host returned ready from show_options without choosing"),
                        },
                        HostFlow::Pending => {
                            self.state = ExecState::AwaitingChoice;
                            return Ok(Tick::Suspended(Wait::Choice));
                        }
                    }
                }
            }
        }
    }

    fn set_pc(&mut self, pos: u32) {
        if let Some(f) = self.frames.last_mut() {
            f.pc = pos;
        }
    }

    fn read_var_key(&self, r: &mut CodeReader<'_>) -> Result<VarKey> {
        Ok(VarKey {
            table: r.read_hash()?,
            key: r.read_hash()?,
        })
    }

    /// The `self:` table aliases the thread's actor table, when one is set.
    fn resolve_key(&self, key: VarKey) -> VarKey {
        if key.table == StrHash::new("self") {
            if let Some(actor) = self.actor {
                return VarKey {
                    table: actor,
                    key: key.key,
                };
            }
        }
        key
    }

    fn load_var(&self, key: VarKey, host: &mut dyn EnginePlugin) -> Variant {
        if key.is_local() {
            self.locals.get(&key.key).copied().unwrap_or(Variant::Null)
        } else {
            host.get_var(self.resolve_key(key), self.handle)
        }
    }

    fn store_var(&mut self, key: VarKey, value: Variant, host: &mut dyn EnginePlugin) {
        if key.is_local() {
            self.locals.insert(key.key, value);
        } else {
            host.set_var(self.resolve_key(key), value, self.handle);
        }
    }

    fn bump_var(&mut self, key: VarKey, delta: Variant, host: &mut dyn EnginePlugin) {
        if key.is_local() {
            // Incrementing a variable that was never written counts from 0.
            let current = self
                .locals
                .get(&key.key)
                .copied()
                .unwrap_or(Variant::Int(0));
            self.locals.insert(key.key, variant::add(current, delta));
        } else {
            host.increment_var(self.resolve_key(key), delta, self.handle);
        }
    }

    fn eval_operand(
        &self,
        operand: &Operand,
        package: &Package,
        host: &mut dyn EnginePlugin,
    ) -> Variant {
        match operand {
            Operand::Literal(v) => *v,
            Operand::Variable(key) => self.load_var(*key, host),
            Operand::Method { id, args } => {
                let args = package.string(*args).unwrap_or_else(|| {
                    log::error!("method argument string {} out of range", args);
                    ""
                });
                host.invoke_with_return(self.handle, *id, args, None)
            }
        }
    }

    fn eval_expr(&self, e: &Expression, package: &Package, host: &mut dyn EnginePlugin) -> bool {
        let lhs = self.eval_operand(&e.lhs, package, host);
        match e.op {
            ExprOp::True => lhs.truthy(),
            ExprOp::False => !lhs.truthy(),
            ExprOp::Exists => !lhs.is_null(),
            ExprOp::NotExists => lhs.is_null(),
            _ => {
                let rhs = self.eval_operand(&e.rhs, package, host);
                expr_compare(e.op, &lhs, &rhs)
            }
        }
    }

    /// Goto pops the current frame, branch nests on top. A missing target
    /// degrades to a logged no-op.
    fn transfer(
        &mut self,
        id: StrHash,
        kind: Transfer,
        from: &Arc<Package>,
        host: &mut dyn EnginePlugin,
    ) {
        let resolved = host
            .try_lookup_node(id, from)
            .or_else(|| from.node(id).map(|n| (from.clone(), *n)));
        let Some((package, node)) = resolved else {
            log::error!("node {} not found (from package '{}')", id, from.name());
            return;
        };
        if let Transfer::Goto = kind {
            if let Some(f) = self.frames.pop() {
                host.on_node_exit(f.node.id, self.handle);
            }
        }
        self.frames.push(Frame {
            package,
            node,
            pc: 0,
        });
        host.on_node_enter(node.id, self.handle);
    }

    /// Fork/start: the child is registered now but first runs on a later
    /// scheduler frame, never inside this tick.
    fn spawn_sibling(
        &mut self,
        id: StrHash,
        tracked: bool,
        from: &Arc<Package>,
        arena: &mut ThreadArena,
        host: &mut dyn EnginePlugin,
    ) {
        let resolved = host
            .try_lookup_node(id, from)
            .or_else(|| from.node(id).map(|n| (from.clone(), *n)));
        let Some((package, node)) = resolved else {
            log::error!("fork target {} not found (from package '{}')", id, from.name());
            return;
        };
        let child = arena.spawn(package, node);
        if tracked {
            self.children.push(child);
        }
    }
}

fn compare_op(op: Opcode, a: &Variant, b: &Variant) -> bool {
    match op {
        Opcode::Equal => a.loose_eq(b),
        Opcode::NotEqual => !a.loose_eq(b),
        Opcode::Less => matches!(a.compare(b), Some(Ordering::Less)),
        Opcode::LessEq => matches!(a.compare(b), Some(Ordering::Less | Ordering::Equal)),
        Opcode::GreaterEq => matches!(a.compare(b), Some(Ordering::Greater | Ordering::Equal)),
        Opcode::Greater => matches!(a.compare(b), Some(Ordering::Greater)),
        _ => false,
    }
}

fn expr_compare(op: ExprOp, a: &Variant, b: &Variant) -> bool {
    match op {
        ExprOp::Equal => a.loose_eq(b),
        ExprOp::NotEqual => !a.loose_eq(b),
        ExprOp::Less => matches!(a.compare(b), Some(Ordering::Less)),
        ExprOp::LessEq => matches!(a.compare(b), Some(Ordering::Less | Ordering::Equal)),
        ExprOp::GreaterEq => matches!(a.compare(b), Some(Ordering::Greater | Ordering::Equal)),
        ExprOp::Greater => matches!(a.compare(b), Some(Ordering::Greater)),
        _ => false,
    }
}
