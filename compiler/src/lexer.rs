// lexer.rs — Lexer for dspl source files
//
// Tokenizes the C-like DSP language: keywords, operators, numeric literals
// with `f` suffix for single precision, identifiers, and both comment forms.
// Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// dspl token types.
///
/// Identifiers carry no value; use the span to retrieve the text. Type names
/// such as `span`, `dyn` or `block` are ordinary identifiers resolved later.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("struct")]
    Struct,
    #[token("class")]
    Class,
    #[token("template")]
    Template,
    #[token("typename")]
    Typename,
    #[token("namespace")]
    Namespace,
    #[token("using")]
    Using,
    #[token("enum")]
    Enum,
    #[token("const")]
    Const,
    #[token("static")]
    Static,
    #[token("mutable")]
    Mutable,
    #[token("auto")]
    Auto,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("public")]
    Public,
    #[token("private")]
    Private,
    #[token("operator")]
    Operator,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("this")]
    This,
    #[token("void")]
    Void,
    #[token("int")]
    Int,
    #[token("float")]
    Float,
    #[token("double")]
    Double,
    #[token("bool")]
    Bool,

    // ── Symbols ──
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("&")]
    Amp,
    #[token("~")]
    Tilde,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("::")]
    ColonColon,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("->")]
    Arrow,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("%=")]
    PercentEq,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,

    // ── Literals ──
    //
    // The float regex is the double regex plus a mandatory `f` suffix, so the
    // longest match decides the precision.
    /// Single-precision literal (`1.5f`, `2.f`, `1e3f`).
    #[regex(r"([0-9]+\.[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?[fF]", parse_float)]
    #[regex(r"[0-9]+([eE][+-]?[0-9]+)?[fF]", parse_float)]
    FloatLit(f64),

    /// Double-precision literal (`1.5`, `.5`, `1e3`).
    #[regex(r"([0-9]+\.[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?", parse_double)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_double)]
    DoubleLit(f64),

    /// Integer literal, decimal or hexadecimal.
    #[regex(r"[0-9]+", parse_int)]
    #[regex(r"0[xX][0-9a-fA-F]+", parse_hex)]
    IntLit(i64),

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    /// `/* ... */`, skipped; never emitted.
    #[token("/*", block_comment)]
    BlockComment,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::Struct => "struct",
            Token::Class => "class",
            Token::Template => "template",
            Token::Typename => "typename",
            Token::Namespace => "namespace",
            Token::Using => "using",
            Token::Enum => "enum",
            Token::Const => "const",
            Token::Static => "static",
            Token::Mutable => "mutable",
            Token::Auto => "auto",
            Token::Return => "return",
            Token::If => "if",
            Token::Else => "else",
            Token::For => "for",
            Token::While => "while",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Public => "public",
            Token::Private => "private",
            Token::Operator => "operator",
            Token::True => "true",
            Token::False => "false",
            Token::This => "this",
            Token::Void => "void",
            Token::Int => "int",
            Token::Float => "float",
            Token::Double => "double",
            Token::Bool => "bool",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Assign => "=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Bang => "!",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Amp => "&",
            Token::Tilde => "~",
            Token::Question => "?",
            Token::Colon => ":",
            Token::ColonColon => "::",
            Token::Semi => ";",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Arrow => "->",
            Token::PlusEq => "+=",
            Token::MinusEq => "-=",
            Token::StarEq => "*=",
            Token::SlashEq => "/=",
            Token::PercentEq => "%=",
            Token::PlusPlus => "++",
            Token::MinusMinus => "--",
            Token::FloatLit(v) => return write!(f, "{v}f"),
            Token::DoubleLit(v) => return write!(f, "{v}"),
            Token::IntLit(v) => return write!(f, "{v}"),
            Token::Ident => "<ident>",
            Token::BlockComment => "/*",
        };
        f.write_str(s)
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_hex(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    i64::from_str_radix(&lex.slice()[2..], 16).ok()
}

fn parse_double(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    let slice = lex.slice();
    slice[..slice.len() - 1].parse().ok()
}

/// Skips to the closing `*/`. An unterminated comment swallows the rest of
/// the source and is reported once.
fn block_comment(lex: &mut logos::Lexer<'_, Token>) -> logos::FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            logos::FilterResult::Error(())
        }
    }
}

// ── Public API ──

/// Lex a dspl source string into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(result.errors.is_empty(), "unexpected errors: {:?}", result.errors);
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("struct X { int value; };"),
            vec![
                Token::Struct,
                Token::Ident,
                Token::LBrace,
                Token::Int,
                Token::Ident,
                Token::Semi,
                Token::RBrace,
                Token::Semi,
            ]
        );
    }

    #[test]
    fn numeric_literal_precision() {
        assert_eq!(
            kinds("1 2.5 2.5f .5f 1e3 3.f 0x10"),
            vec![
                Token::IntLit(1),
                Token::DoubleLit(2.5),
                Token::FloatLit(2.5),
                Token::FloatLit(0.5),
                Token::DoubleLit(1000.0),
                Token::FloatLit(3.0),
                Token::IntLit(16),
            ]
        );
    }

    #[test]
    fn template_angle_brackets_stay_separate() {
        assert_eq!(
            kinds("span<span<int, 2>, 3>>"),
            vec![
                Token::Ident,
                Token::Lt,
                Token::Ident,
                Token::Lt,
                Token::Int,
                Token::Comma,
                Token::IntLit(2),
                Token::Gt,
                Token::Comma,
                Token::IntLit(3),
                Token::Gt,
                Token::Gt,
            ]
        );
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("a += b; ++c; d::e; f->g"),
            vec![
                Token::Ident,
                Token::PlusEq,
                Token::Ident,
                Token::Semi,
                Token::PlusPlus,
                Token::Ident,
                Token::Semi,
                Token::Ident,
                Token::ColonColon,
                Token::Ident,
                Token::Semi,
                Token::Ident,
                Token::Arrow,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("int /* block\n comment */ x; // line\n"),
            vec![Token::Int, Token::Ident, Token::Semi]
        );
    }

    #[test]
    fn doc_style_block_comments_are_skipped() {
        assert_eq!(
            kinds("/** BEGIN_TEST_DATA\n  f: main\n  END_TEST_DATA\n*/\nint x;/**/ x /= 2;"),
            vec![
                Token::Int,
                Token::Ident,
                Token::Semi,
                Token::Ident,
                Token::SlashEq,
                Token::IntLit(2),
                Token::Semi
            ]
        );
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        let result = lex("int x; /* never closed");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span.start, 7);
        assert_eq!(result.tokens.len(), 3);
    }

    #[test]
    fn unknown_character_reports_error() {
        let result = lex("int x = 1 @ 2;");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 10, end: 11 });
    }
}
