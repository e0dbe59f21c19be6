//! Lexer for the C-family shading-language front-end
//!
//! Tokenization is done with a logos-derived lexer; tokens are re-emitted as
//! [`Tok`]s carrying 1-based line/column positions computed from byte spans.

use crate::error::{CompileError, CompileResult};
use logos::Logos;

/// Token kinds
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*[^*]*\*+([^/*][^*]*\*+)*/")]
pub enum Token {
    // Keywords
    /// `if`
    #[token("if")]
    If,
    /// `else`
    #[token("else")]
    Else,
    /// `for`
    #[token("for")]
    For,
    /// `while`
    #[token("while")]
    While,
    /// `do`
    #[token("do")]
    Do,
    /// `return`
    #[token("return")]
    Return,
    /// `break`
    #[token("break")]
    Break,
    /// `continue`
    #[token("continue")]
    Continue,
    /// `discard`
    #[token("discard")]
    Discard,
    /// `struct`
    #[token("struct")]
    Struct,
    /// `const`
    #[token("const")]
    Const,
    /// `uniform`
    #[token("uniform")]
    Uniform,
    /// `in`
    #[token("in")]
    In,
    /// `out`
    #[token("out")]
    Out,
    /// `inout`
    #[token("inout")]
    Inout,
    /// `attribute`
    #[token("attribute")]
    Attribute,
    /// `varying`
    #[token("varying")]
    Varying,
    /// `flat`
    #[token("flat")]
    Flat,
    /// `layout`
    #[token("layout")]
    Layout,
    /// `precision`
    #[token("precision")]
    Precision,
    /// `highp` / `mediump` / `lowp`
    #[token("highp")]
    #[token("mediump")]
    #[token("lowp")]
    PrecisionQualifier,
    /// `true`
    #[token("true")]
    True,
    /// `false`
    #[token("false")]
    False,

    // Literals
    /// Float literal (optional exponent and `f` suffix)
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fF]?", parse_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?[fF]?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fF]?", parse_float)]
    #[regex(r"[0-9]+[fF]", parse_float)]
    FloatLit(f32),

    /// Integer literal (decimal or hex, optional `u` suffix)
    #[regex(r"[0-9]+[uU]?", parse_int)]
    #[regex(r"0[xX][0-9a-fA-F]+[uU]?", parse_hex)]
    IntLit(i32),

    /// Identifier (type names included; dialects resolve them)
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Punctuation
    /// `(`
    #[token("(")]
    LParen,
    /// `)`
    #[token(")")]
    RParen,
    /// `{`
    #[token("{")]
    LBrace,
    /// `}`
    #[token("}")]
    RBrace,
    /// `[`
    #[token("[")]
    LBracket,
    /// `]`
    #[token("]")]
    RBracket,
    /// `,`
    #[token(",")]
    Comma,
    /// `;`
    #[token(";")]
    Semicolon,
    /// `.`
    #[token(".")]
    Dot,
    /// `?`
    #[token("?")]
    Question,
    /// `:`
    #[token(":")]
    Colon,

    // Operators
    /// `=`
    #[token("=")]
    Assign,
    /// `+=`
    #[token("+=")]
    PlusAssign,
    /// `-=`
    #[token("-=")]
    MinusAssign,
    /// `*=`
    #[token("*=")]
    StarAssign,
    /// `/=`
    #[token("/=")]
    SlashAssign,
    /// `==`
    #[token("==")]
    EqEq,
    /// `!=`
    #[token("!=")]
    NotEq,
    /// `<`
    #[token("<")]
    Lt,
    /// `<=`
    #[token("<=")]
    Le,
    /// `>`
    #[token(">")]
    Gt,
    /// `>=`
    #[token(">=")]
    Ge,
    /// `&&`
    #[token("&&")]
    AndAnd,
    /// `||`
    #[token("||")]
    OrOr,
    /// `!`
    #[token("!")]
    Not,
    /// `+`
    #[token("+")]
    Plus,
    /// `-`
    #[token("-")]
    Minus,
    /// `*`
    #[token("*")]
    Star,
    /// `/`
    #[token("/")]
    Slash,
    /// `%`
    #[token("%")]
    Percent,
    /// `++`
    #[token("++")]
    PlusPlus,
    /// `--`
    #[token("--")]
    MinusMinus,
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f32> {
    let s = lex.slice().trim_end_matches(['f', 'F']);
    s.parse().ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i32> {
    let s = lex.slice().trim_end_matches(['u', 'U']);
    // Wrap literals that only fit unsigned, the way C does
    s.parse::<i64>().ok().map(|v| v as i32)
}

fn parse_hex(lex: &mut logos::Lexer<'_, Token>) -> Option<i32> {
    let s = lex.slice().trim_end_matches(['u', 'U']);
    i64::from_str_radix(&s[2..], 16).ok().map(|v| v as i32)
}

impl Token {
    /// Printable description used in diagnostics
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier `{}`", name),
            Token::IntLit(v) => format!("integer `{}`", v),
            Token::FloatLit(v) => format!("float `{}`", v),
            other => format!("{:?}", other),
        }
    }
}

/// A token with its 1-based source position
#[derive(Debug, Clone, PartialEq)]
pub struct Tok {
    /// Token kind
    pub token: Token,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub col: u32,
}

/// Tokenize a source fragment into a positioned token stream
pub fn tokenize(source: &str) -> CompileResult<Vec<Tok>> {
    // Byte offsets of line starts, for span -> line/col mapping
    let mut line_starts = vec![0usize];
    for (i, b) in source.bytes().enumerate() {
        if b == b'\n' {
            line_starts.push(i + 1);
        }
    }
    let position = |offset: usize| -> (u32, u32) {
        let line = line_starts.partition_point(|&s| s <= offset);
        let col = offset - line_starts[line - 1] + 1;
        (line as u32, col as u32)
    };

    let mut out = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let (line, col) = position(span.start);
        match result {
            Ok(token) => out.push(Tok { token, line, col }),
            Err(()) => {
                return Err(CompileError::Parse {
                    line,
                    col,
                    message: format!("unexpected character `{}`", &source[span]),
                })
            }
        }
    }
    Ok(out)
}
