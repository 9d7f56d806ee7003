//! `$const` / `$macro` preprocessing: pure line-text substitution applied
//! before command parsing.

use std::collections::HashMap;

use crate::scan;

/// Command keywords that const/macro names may not shadow.
pub const RESERVED: &[&str] = &[
    "stop", "yield", "return", "loop", "goto", "branch", "fork", "start", "join", "set", "call",
    "choice", "choose", "answer", "data", "if", "elseif", "else", "endif", "while", "break",
    "continue", "endwhile", "const", "macro",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name.to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub params: Vec<String>,
    pub template: String,
}

#[derive(Debug, Default)]
pub struct Preprocessor {
    consts: HashMap<String, String>,
    macros: HashMap<String, MacroDef>,
}

impl Preprocessor {
    pub fn define_const(&mut self, name: &str, value: &str) -> Result<(), String> {
        if !scan::is_ident(name) {
            return Err(format!("bad const name '{name}'"));
        }
        if is_reserved(name) {
            return Err(format!("reserved name '{name}'"));
        }
        self.consts.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn define_macro(
        &mut self,
        name: &str,
        params: Vec<String>,
        template: &str,
    ) -> Result<(), String> {
        if !scan::is_ident(name) {
            return Err(format!("bad macro name '{name}'"));
        }
        if is_reserved(name) {
            return Err(format!("reserved name '{name}'"));
        }
        self.macros.insert(
            name.to_owned(),
            MacroDef {
                params,
                template: template.to_owned(),
            },
        );
        Ok(())
    }

    pub fn macro_def(&self, name: &str) -> Option<&MacroDef> {
        self.macros.get(name)
    }

    /// Replace every `$NAME` whose NAME is a registered const. Unknown
    /// names pass through untouched (they may be commands or macros).
    pub fn apply_consts(&self, line: &str) -> String {
        if self.consts.is_empty() || !line.contains('$') {
            return line.to_owned();
        }
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(at) = rest.find('$') {
            out.push_str(&rest[..at]);
            let tail = &rest[at + 1..];
            let end = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            let name = &tail[..end];
            if let Some(value) = self.consts.get(name) {
                out.push_str(value);
            } else {
                out.push('$');
                out.push_str(name);
            }
            rest = &tail[end..];
        }
        out.push_str(rest);
        out
    }

    /// Expand a macro invocation into replacement text; `{i}` placeholders
    /// take the i-th actual argument.
    pub fn expand(&self, name: &str, args: &[&str]) -> Result<String, String> {
        let def = self
            .macros
            .get(name)
            .ok_or_else(|| format!("unknown macro '{name}'"))?;
        if args.len() != def.params.len() {
            return Err(format!(
                "macro '{}' expects {} argument(s), got {}",
                name,
                def.params.len(),
                args.len()
            ));
        }
        let mut out = def.template.clone();
        for (i, arg) in args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), arg.trim());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn const_substitution() {
        let mut p = Preprocessor::default();
        p.define_const("HERO", "\"Maren\"").unwrap();
        assert_eq!(
            p.apply_consts("$goto intro, name == $HERO"),
            "$goto intro, name == \"Maren\""
        );
        // unknown names stay untouched
        assert_eq!(p.apply_consts("$goto $elsewhere"), "$goto $elsewhere");
    }

    #[test]
    fn reserved_names_rejected() {
        let mut p = Preprocessor::default();
        assert!(p.define_const("goto", "x").is_err());
        assert!(p.define_macro("While", vec![], "x").is_err());
    }

    #[test]
    fn macro_expansion() {
        let mut p = Preprocessor::default();
        p.define_macro(
            "visit",
            vec!["n".into()],
            "$set visits_{0} + 1",
        )
        .unwrap();
        assert_eq!(
            p.expand("visit", &["cellar"]).unwrap(),
            "$set visits_cellar + 1"
        );
        assert!(p.expand("visit", &["a", "b"]).is_err());
    }
}
