//! Preprocessor: macro table, directives and object-like expansion
//!
//! Directives are handled line-by-line before tokenization; directive lines
//! are blanked (not removed) so every surviving token keeps its original
//! source line. Macro replacement happens on the token stream afterwards.
//!
//! Function-like `#define`s are recorded but never expanded; the macro table
//! contract is object-like only.

use crate::error::{CompileError, CompileResult};
use crate::lexer::{self, Tok, Token};
use rustc_hash::FxHashMap;

/// Maximum nesting of macro replacement
const MAX_EXPANSION_DEPTH: usize = 16;

/// One preprocessor definition
#[derive(Debug, Clone)]
pub struct Macro {
    /// Replacement token sequence
    pub tokens: Vec<Tok>,
    /// Whether the definition had a parameter list (never expanded)
    pub function_like: bool,
}

/// Mutable name -> macro registry, shared across parses
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    map: FxHashMap<String, Macro>,
}

impl MacroTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a macro; redefinition replaces the prior binding
    pub fn define(&mut self, name: impl Into<String>, mac: Macro) {
        self.map.insert(name.into(), mac);
    }

    /// Tokenize `fragment` and bind it as an object-like macro
    pub fn define_source(&mut self, name: &str, fragment: &str) -> CompileResult<()> {
        let tokens = lexer::tokenize(fragment)?;
        self.define(
            name,
            Macro {
                tokens,
                function_like: false,
            },
        );
        Ok(())
    }

    /// Remove a binding
    pub fn undef(&mut self, name: &str) {
        self.map.remove(name);
    }

    /// Whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Look up a binding
    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.map.get(name)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all bindings
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

struct CondFrame {
    active: bool,
    parent_active: bool,
    seen_else: bool,
}

/// Run directives, tokenize and expand macros
pub fn preprocess(source: &str, macros: &mut MacroTable) -> CompileResult<Vec<Tok>> {
    let mut kept = String::with_capacity(source.len());
    let mut stack: Vec<CondFrame> = Vec::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let lineno = (idx + 1) as u32;
        let active = stack.iter().all(|f| f.active);
        let trimmed = raw_line.trim_start();

        if let Some(directive) = trimmed.strip_prefix('#') {
            handle_directive(directive.trim(), lineno, active, macros, &mut stack)?;
            kept.push('\n');
            continue;
        }

        if active {
            kept.push_str(raw_line);
        }
        kept.push('\n');
    }

    if !stack.is_empty() {
        return Err(CompileError::Preprocessor {
            line: source.lines().count() as u32,
            message: "unterminated #ifdef/#ifndef".to_string(),
        });
    }

    let tokens = lexer::tokenize(&kept)?;
    expand(tokens, macros)
}

fn handle_directive(
    directive: &str,
    line: u32,
    active: bool,
    macros: &mut MacroTable,
    stack: &mut Vec<CondFrame>,
) -> CompileResult<()> {
    let (name, rest) = match directive.find(char::is_whitespace) {
        Some(pos) => (&directive[..pos], directive[pos..].trim_start()),
        None => (directive, ""),
    };

    match name {
        "define" => {
            if active {
                define_from_line(rest, line, macros)?;
            }
        }
        "undef" => {
            if active {
                macros.undef(rest.trim());
            }
        }
        "ifdef" | "ifndef" => {
            let defined = macros.contains(rest.trim());
            let wanted = if name == "ifdef" { defined } else { !defined };
            stack.push(CondFrame {
                active: active && wanted,
                parent_active: active,
                seen_else: false,
            });
        }
        "else" => {
            let frame = stack.last_mut().ok_or(CompileError::Preprocessor {
                line,
                message: "#else without #ifdef".to_string(),
            })?;
            if frame.seen_else {
                return Err(CompileError::Preprocessor {
                    line,
                    message: "duplicate #else".to_string(),
                });
            }
            frame.seen_else = true;
            frame.active = frame.parent_active && !frame.active;
        }
        "endif" => {
            stack.pop().ok_or(CompileError::Preprocessor {
                line,
                message: "#endif without #ifdef".to_string(),
            })?;
        }
        // Metadata directives with no effect on execution
        "version" | "extension" | "pragma" | "line" => {}
        "if" | "elif" => {
            return Err(CompileError::Preprocessor {
                line,
                message: format!("#{name} expressions are not supported; use #ifdef"),
            });
        }
        other => {
            return Err(CompileError::Preprocessor {
                line,
                message: format!("unknown directive #{other}"),
            });
        }
    }
    Ok(())
}

fn define_from_line(rest: &str, line: u32, macros: &mut MacroTable) -> CompileResult<()> {
    let name_end = rest
        .find(|c: char| !c.is_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        return Err(CompileError::Preprocessor {
            line,
            message: "#define without a name".to_string(),
        });
    }

    let after = &rest[name_end..];
    // A parameter list with no space before `(` makes the macro
    // function-like; those are recorded but never expanded.
    let function_like = after.starts_with('(');
    let body = if function_like {
        match after.find(')') {
            Some(close) => &after[close + 1..],
            None => {
                return Err(CompileError::Preprocessor {
                    line,
                    message: "unterminated macro parameter list".to_string(),
                })
            }
        }
    } else {
        after
    };

    let tokens = lexer::tokenize(body.trim())?;
    macros.define(
        name,
        Macro {
            tokens,
            function_like,
        },
    );
    Ok(())
}

fn expand(tokens: Vec<Tok>, macros: &MacroTable) -> CompileResult<Vec<Tok>> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut active: Vec<String> = Vec::new();
    for tok in tokens {
        expand_into(tok, macros, &mut active, &mut out)?;
    }
    Ok(out)
}

fn expand_into(
    tok: Tok,
    macros: &MacroTable,
    active: &mut Vec<String>,
    out: &mut Vec<Tok>,
) -> CompileResult<()> {
    if let Token::Ident(name) = &tok.token {
        if !active.iter().any(|n| n == name) {
            if let Some(mac) = macros.get(name) {
                if !mac.function_like {
                    if active.len() >= MAX_EXPANSION_DEPTH {
                        return Err(CompileError::Preprocessor {
                            line: tok.line,
                            message: format!("macro expansion too deep at `{name}`"),
                        });
                    }
                    active.push(name.clone());
                    for t in &mac.tokens {
                        // Replacement tokens take the use-site position
                        expand_into(
                            Tok {
                                token: t.token.clone(),
                                line: tok.line,
                                col: tok.col,
                            },
                            macros,
                            active,
                            out,
                        )?;
                    }
                    active.pop();
                    return Ok(());
                }
            }
        }
    }
    out.push(tok);
    Ok(())
}
