//! Text scanning helpers: top-level splitting that respects quotes and
//! bracket nesting, operand/comparison parsing, target resolution.

use weft_core::{ExprOp, Expression, Operand, PackageBuilder, StrHash, VarKey, Variant};

/// A node reference: a compile-time hash, or an operand evaluated at
/// runtime (the `[expr]` form).
#[derive(Debug, Clone, PartialEq)]
pub enum TargetRef {
    Direct(StrHash),
    Indirect(Operand),
}

pub fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn is_dotted_path(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_ident)
}

/// Split at top level only: separators inside `()`/`[]` nesting or inside
/// `"`/`'` quotes do not count. Empty input yields no parts.
pub fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if parts.is_empty() && s.trim().is_empty() {
        return parts;
    }
    parts.push(&s[start..]);
    parts
}

/// Find the first top-level occurrence of `needle` (used for `->`).
pub fn find_top_level(s: &str, needle: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let bytes = s.as_bytes();
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            _ => {
                if depth == 0 && bytes[i..].starts_with(needle.as_bytes()) {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Given text starting at `(`, return `(inner, rest_after_close)`.
pub fn parse_paren_group(s: &str) -> Result<(&str, &str), String> {
    let s = s.trim_start();
    if !s.starts_with('(') {
        return Err(format!("expected '(' in '{s}'"));
    }
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&s[1..i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(format!("unmatched '(' in '{s}'"))
}

/// Parse a variable reference: `name` (thread-local) or `table:name`.
pub fn parse_var_key(s: &str) -> Result<VarKey, String> {
    let s = s.trim();
    if let Some((table, name)) = s.split_once(':') {
        if !is_ident(table.trim()) || !is_ident(name.trim()) {
            return Err(format!("bad variable reference '{s}'"));
        }
        Ok(VarKey {
            table: StrHash::new(table.trim()),
            key: StrHash::new(name.trim()),
        })
    } else {
        if !is_ident(s) {
            return Err(format!("bad variable reference '{s}'"));
        }
        Ok(VarKey::local(StrHash::new(s)))
    }
}

/// Parse one operand: a literal (`null`, `true`, `false`, number, quoted
/// string hash), a variable reference, or a host method call.
pub fn parse_operand(s: &str, builder: &mut PackageBuilder) -> Result<Operand, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty operand".into());
    }

    match s {
        "null" => return Ok(Operand::Literal(Variant::Null)),
        "true" => return Ok(Operand::Literal(Variant::Bool(true))),
        "false" => return Ok(Operand::Literal(Variant::Bool(false))),
        _ => {}
    }

    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        return Ok(Operand::Literal(Variant::Hash(StrHash::new(
            &s[1..s.len() - 1],
        ))));
    }

    if let Ok(v) = s.parse::<i32>() {
        return Ok(Operand::Literal(Variant::Int(v)));
    }
    if s.contains('.') {
        if let Ok(v) = s.parse::<f32>() {
            return Ok(Operand::Literal(Variant::Float(v)));
        }
    }

    // method call: ident(raw args)
    if let Some(open) = s.find('(') {
        let name = s[..open].trim();
        if !is_ident(name) {
            return Err(format!("bad method name '{name}'"));
        }
        let (inner, rest) = parse_paren_group(&s[open..])?;
        if !rest.trim().is_empty() {
            return Err(format!("trailing text after method call: '{rest}'"));
        }
        return Ok(Operand::Method {
            id: StrHash::new(name),
            args: builder.intern_string(inner.trim()),
        });
    }

    parse_var_key(s).map(Operand::Variable)
}

/// Find the first top-level comparison operator token in `s`.
fn find_comparison_op(s: &str) -> Option<(usize, usize, ExprOp)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let bytes = s.as_bytes();
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            _ if depth == 0 => {
                let tail = &bytes[i..];
                let two = |op| Some((i, 2, op));
                let one = |op| Some((i, 1, op));
                if tail.starts_with(b"==") {
                    return two(ExprOp::Equal);
                }
                if tail.starts_with(b"!=") {
                    return two(ExprOp::NotEqual);
                }
                if tail.starts_with(b"<=") {
                    return two(ExprOp::LessEq);
                }
                if tail.starts_with(b">=") {
                    return two(ExprOp::GreaterEq);
                }
                if tail.starts_with(b"<") {
                    return one(ExprOp::Less);
                }
                if tail.starts_with(b">") {
                    return one(ExprOp::Greater);
                }
            }
            _ => {}
        }
    }
    None
}

/// The syntactic shape of a comparison, before operand parsing.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CompShape<'a> {
    Binary(ExprOp, &'a str, &'a str),
    Unary(ExprOp, &'a str),
}

/// Classify one comparison: `a == b` and friends, the unary truthiness
/// forms (`x`, `!x`), and the presence checks (`x exists`, `x !exists`).
pub(crate) fn comparison_shape(s: &str) -> Result<CompShape<'_>, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty expression".into());
    }
    if let Some((at, width, op)) = find_comparison_op(s) {
        return Ok(CompShape::Binary(op, &s[..at], &s[at + width..]));
    }
    if let Some(head) = s.strip_suffix("!exists") {
        if head.ends_with(char::is_whitespace) {
            return Ok(CompShape::Unary(ExprOp::NotExists, head));
        }
    }
    if let Some(head) = s.strip_suffix("exists") {
        if head.ends_with(char::is_whitespace) {
            return Ok(CompShape::Unary(ExprOp::Exists, head));
        }
    }
    if let Some(rest) = s.strip_prefix('!') {
        return Ok(CompShape::Unary(ExprOp::False, rest));
    }
    Ok(CompShape::Unary(ExprOp::True, s))
}

/// Parse one comparison into an expression record.
pub fn parse_comparison(s: &str, builder: &mut PackageBuilder) -> Result<Expression, String> {
    match comparison_shape(s)? {
        CompShape::Binary(op, lhs, rhs) => Ok(Expression::binary(
            op,
            parse_operand(lhs, builder)?,
            parse_operand(rhs, builder)?,
        )),
        CompShape::Unary(op, lhs) => Ok(Expression::unary(op, parse_operand(lhs, builder)?)),
    }
}

/// Find the assignment/compound operator of a `$set` body at top level.
pub(crate) fn find_set_op(s: &str) -> Option<(usize, char)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '=' | '+' | '-' | '*' | '/' if depth == 0 => return Some((i, c)),
            _ => {}
        }
    }
    None
}

/// Resolve a node identifier: dotted path, root-relative `.path`, or the
/// `[expr]` indirect form.
pub fn parse_target(s: &str, root: &str, builder: &mut PackageBuilder) -> Result<TargetRef, String> {
    let s = s.trim();
    if s.starts_with('[') && s.ends_with(']') {
        let inner = &s[1..s.len() - 1];
        return parse_operand(inner, builder).map(TargetRef::Indirect);
    }
    if let Some(rel) = s.strip_prefix('.') {
        if !is_dotted_path(rel) {
            return Err(format!("bad node path '{s}'"));
        }
        return Ok(TargetRef::Direct(StrHash::new(&format!("{root}.{rel}"))));
    }
    if !is_dotted_path(s) {
        return Err(format!("bad node path '{s}'"));
    }
    Ok(TargetRef::Direct(StrHash::new(s)))
}

/// Content lines may carry an explicit line code: `@code: text`.
pub fn explicit_line_code(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('@')?;
    let colon = rest.find(':')?;
    let code = &rest[..colon];
    if !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        Some((code, rest[colon + 1..].trim_start()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn top_level_split_respects_nesting() {
        assert_eq!(
            split_top_level("a, f(x, y), [b, c]", ','),
            vec!["a", " f(x, y)", " [b, c]"]
        );
        assert_eq!(split_top_level("\"a,b\", c", ','), vec!["\"a,b\"", " c"]);
        assert!(split_top_level("   ", ',').is_empty());
    }

    #[test]
    fn operands() {
        let mut b = PackageBuilder::new("m");
        assert_eq!(
            parse_operand("42", &mut b).unwrap(),
            Operand::Literal(Variant::Int(42))
        );
        assert_eq!(
            parse_operand("-1.5", &mut b).unwrap(),
            Operand::Literal(Variant::Float(-1.5))
        );
        assert_eq!(
            parse_operand("\"door\"", &mut b).unwrap(),
            Operand::Literal(Variant::Hash(StrHash::new("door")))
        );
        assert_eq!(
            parse_operand("score", &mut b).unwrap(),
            Operand::Variable(VarKey::local(StrHash::new("score")))
        );
        assert_eq!(
            parse_operand("save:chapter", &mut b).unwrap(),
            Operand::Variable(VarKey {
                table: StrHash::new("save"),
                key: StrHash::new("chapter"),
            })
        );
        let m = parse_operand("roll(2, 6)", &mut b).unwrap();
        match m {
            Operand::Method { id, args } => {
                assert_eq!(id, StrHash::new("roll"));
                assert_eq!(b.intern_string("2, 6"), args);
            }
            other => panic!("expected method, got {other:?}"),
        }
        assert!(parse_operand("3x!", &mut b).is_err());
    }

    #[test]
    fn comparisons() {
        let mut b = PackageBuilder::new("m");
        let e = parse_comparison("score >= 10", &mut b).unwrap();
        assert_eq!(e.op, ExprOp::GreaterEq);
        let e = parse_comparison("!seen", &mut b).unwrap();
        assert_eq!(e.op, ExprOp::False);
        let e = parse_comparison("key exists", &mut b).unwrap();
        assert_eq!(e.op, ExprOp::Exists);
        let e = parse_comparison("key !exists", &mut b).unwrap();
        assert_eq!(e.op, ExprOp::NotExists);
        let e = parse_comparison("flag", &mut b).unwrap();
        assert_eq!(e.op, ExprOp::True);
    }

    #[test]
    fn targets() {
        let mut b = PackageBuilder::new("m");
        assert_eq!(
            parse_target("intro.start", "m", &mut b).unwrap(),
            TargetRef::Direct(StrHash::new("intro.start"))
        );
        assert_eq!(
            parse_target(".start", "intro", &mut b).unwrap(),
            TargetRef::Direct(StrHash::new("intro.start"))
        );
        assert!(matches!(
            parse_target("[next_scene]", "m", &mut b).unwrap(),
            TargetRef::Indirect(Operand::Variable(_))
        ));
        assert!(parse_target("1bad", "m", &mut b).is_err());
    }

    #[test]
    fn explicit_codes() {
        assert_eq!(
            explicit_line_code("@intro_1: Hello there."),
            Some(("intro_1", "Hello there."))
        );
        assert_eq!(explicit_line_code("plain text"), None);
        assert_eq!(explicit_line_code("@ not a code"), None);
    }
}
