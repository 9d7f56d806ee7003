//! Human-readable package disassembly.

use std::io::Write;

use anyhow::Result;

use weft_core::{CodeReader, Opcode, Package};

pub fn dump_package(pkg: &Package, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "package '{}' ({} nodes, {} lines, {} bytes of code)",
        pkg.name(),
        pkg.node_count(),
        pkg.line_count(),
        pkg.code().len()
    )?;

    let mut nodes: Vec<_> = pkg.nodes().collect();
    nodes.sort_by_key(|n| n.offset);
    for node in nodes {
        let name = pkg.node_name(node.id).unwrap_or("?");
        writeln!(out, "\n{} {} (+{}, {} bytes)", node.id, name, node.offset, node.length)?;
        let window = &pkg.code()[node.offset as usize..(node.offset + node.length) as usize];
        let mut r = CodeReader::new(window, 0);
        while !r.at_end() {
            let at = r.pos();
            let op = r.read_opcode()?;
            let operands = format_operands(op, &mut r, pkg)?;
            writeln!(out, "  {at:6}  {op:?}{operands}")?;
        }
    }
    Ok(())
}

fn format_operands(op: Opcode, r: &mut CodeReader<'_>, pkg: &Package) -> Result<String> {
    Ok(match op {
        Opcode::RunLine => {
            let code = r.read_hash()?;
            let text = pkg.line(code).map(|l| l.text.as_str()).unwrap_or("?");
            format!(" {} {:?}", code, text)
        }
        Opcode::PushValue => format!(" {}", r.read_variant()?),
        Opcode::LoadVar | Opcode::StoreVar | Opcode::IncrementVar | Opcode::DecrementVar => {
            let table = r.read_hash()?;
            let key = r.read_hash()?;
            format!(" {table}:{key}")
        }
        Opcode::Jump | Opcode::JumpIfFalse => {
            let disp = r.read_i16()?;
            let target = i64::from(r.pos()) + i64::from(disp);
            format!(" {disp:+} -> {target}")
        }
        Opcode::EvalSingle => format!(" expr[{}]", r.read_u32()?),
        Opcode::EvalAndGroup | Opcode::EvalOrGroup => {
            let offset = r.read_u32()?;
            let count = r.read_u16()?;
            format!(" expr[{}..{}]", offset, offset + u32::from(count))
        }
        Opcode::Invoke
        | Opcode::InvokeWithReturn
        | Opcode::InvokeOnTarget
        | Opcode::InvokeOnTargetWithReturn => {
            let method = r.read_hash()?;
            let args = r.read_u32()?;
            let text = pkg.string(args).unwrap_or("?");
            format!(" {method}({text})")
        }
        Opcode::GotoNode | Opcode::BranchNode | Opcode::ForkNode | Opcode::StartNode => {
            let id = r.read_hash()?;
            let name = pkg.node_name(id).unwrap_or("?");
            format!(" {id} {name}")
        }
        Opcode::AddOption => format!(" flags={:#04x}", r.read_u8()?),
        Opcode::AddData => format!(" {}", r.read_hash()?),
        _ => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_compiler::compile_source;

    #[test]
    fn dump_walks_every_instruction() {
        let (pkg, _) = compile_source(
            "t.weft",
            "m",
            ":: m.main\nhello\n$set i = 0\n$while i < 2\n$set i + 1\n$endwhile\n$choice m.b; go\n$choose\n:: m.b\nbye\n",
        )
        .unwrap();
        let mut out = Vec::new();
        dump_package(&pkg, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("m.main"));
        assert!(text.contains("RunLine"));
        assert!(text.contains("JumpIfFalse"));
        assert!(text.contains("ShowChoices"));
    }
}
