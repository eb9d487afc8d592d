// Lexer for Streamlet .str source files.
//
// Tokenizes C-like streaming source text. Uses the `logos` crate for
// DFA-based lexing.
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

/// Streamlet token types.
///
/// Keywords and symbols are matched as fixed strings. Literals carry
/// parsed values. Identifiers carry no value — use the span to retrieve
/// the text from the source.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*|/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // ── Stream keywords ──
    #[token("filter")]
    Filter,
    #[token("pipeline")]
    Pipeline,
    #[token("splitjoin")]
    Splitjoin,
    #[token("stateful")]
    Stateful,
    #[token("struct")]
    Struct,
    #[token("add")]
    Add,
    #[token("split")]
    Split,
    #[token("join")]
    Join,
    #[token("duplicate")]
    Duplicate,
    #[token("roundrobin")]
    Roundrobin,
    #[token("init")]
    Init,
    #[token("prework")]
    Prework,
    #[token("work")]
    Work,
    #[token("peek")]
    Peek,
    #[token("pop")]
    Pop,
    #[token("push")]
    Push,

    // ── Type keywords ──
    #[token("void")]
    Void,
    #[token("boolean")]
    Boolean,
    #[token("bit")]
    Bit,
    #[token("int")]
    Int,
    #[token("float")]
    Float,
    #[token("complex")]
    Complex,

    // ── Control keywords ──
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // ── Symbols ──
    #[token("->")]
    Arrow,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,

    // ── Operators ──
    //
    // Longer fixed strings win over shorter prefixes in logos, so `<<=`
    // takes priority over `<<` and `<`.
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
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
    #[token("&")]
    Amp,
    #[token("|")]
    VBar,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,

    // ── Literals ──
    //
    // The float regex must appear before the integer regex so the longer
    // match (digits + fraction/exponent) wins over a bare integer.
    /// Floating-point literal (fraction or exponent required).
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+", parse_float)]
    FloatLit(f64),

    /// Integer literal (decimal or 0x hex).
    #[regex(r"0[xX][0-9a-fA-F]+|[0-9]+", parse_int)]
    IntLit(i64),

    // ── Identifier ──
    //
    // Placed after keywords — logos prioritises fixed `#[token]` matches
    // over regex for the same length, so `work` matches Work, not Ident.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Filter => write!(f, "filter"),
            Token::Pipeline => write!(f, "pipeline"),
            Token::Splitjoin => write!(f, "splitjoin"),
            Token::Stateful => write!(f, "stateful"),
            Token::Struct => write!(f, "struct"),
            Token::Add => write!(f, "add"),
            Token::Split => write!(f, "split"),
            Token::Join => write!(f, "join"),
            Token::Duplicate => write!(f, "duplicate"),
            Token::Roundrobin => write!(f, "roundrobin"),
            Token::Init => write!(f, "init"),
            Token::Prework => write!(f, "prework"),
            Token::Work => write!(f, "work"),
            Token::Peek => write!(f, "peek"),
            Token::Pop => write!(f, "pop"),
            Token::Push => write!(f, "push"),
            Token::Void => write!(f, "void"),
            Token::Boolean => write!(f, "boolean"),
            Token::Bit => write!(f, "bit"),
            Token::Int => write!(f, "int"),
            Token::Float => write!(f, "float"),
            Token::Complex => write!(f, "complex"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::For => write!(f, "for"),
            Token::Break => write!(f, "break"),
            Token::Continue => write!(f, "continue"),
            Token::Return => write!(f, "return"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Arrow => write!(f, "->"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semicolon => write!(f, ";"),
            Token::PlusPlus => write!(f, "++"),
            Token::MinusMinus => write!(f, "--"),
            Token::PlusAssign => write!(f, "+="),
            Token::MinusAssign => write!(f, "-="),
            Token::StarAssign => write!(f, "*="),
            Token::SlashAssign => write!(f, "/="),
            Token::PercentAssign => write!(f, "%="),
            Token::AmpAssign => write!(f, "&="),
            Token::PipeAssign => write!(f, "|="),
            Token::CaretAssign => write!(f, "^="),
            Token::ShlAssign => write!(f, "<<="),
            Token::ShrAssign => write!(f, ">>="),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Amp => write!(f, "&"),
            Token::VBar => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Tilde => write!(f, "~"),
            Token::Bang => write!(f, "!"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Assign => write!(f, "="),
            Token::FloatLit(v) => write!(f, "{v}"),
            Token::IntLit(v) => write!(f, "{v}"),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    let slice = lex.slice();
    if let Some(hex) = slice.strip_prefix("0x").or_else(|| slice.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        slice.parse().ok()
    }
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

// ── Entry point ──

/// Lex a Streamlet source string into tokens.
///
/// Unrecognized characters are collected as errors and skipped, so one
/// stray character does not abort the whole front end.
pub fn lex(source: &str) -> LexResult {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in Token::lexer(source).spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unrecognized character '{}'", &source[range]),
            }),
        }
    }

    LexResult { tokens, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords_beat_identifiers() {
        assert_eq!(
            kinds("work pushed"),
            vec![Token::Work, Token::Ident] // `pushed` is not `push`
        );
    }

    #[test]
    fn filter_header() {
        assert_eq!(
            kinds("int->int filter Scale"),
            vec![
                Token::Int,
                Token::Arrow,
                Token::Int,
                Token::Filter,
                Token::Ident
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            kinds("42 0xff 3.25 1e6"),
            vec![
                Token::IntLit(42),
                Token::IntLit(255),
                Token::FloatLit(3.25),
                Token::FloatLit(1e6)
            ]
        );
    }

    #[test]
    fn compound_operators_are_single_tokens() {
        assert_eq!(
            kinds("a <<= b >> 1"),
            vec![
                Token::Ident,
                Token::ShlAssign,
                Token::Ident,
                Token::Shr,
                Token::IntLit(1)
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("push(1); // trailing\n/* block */ pop()"),
            vec![
                Token::Push,
                Token::LParen,
                Token::IntLit(1),
                Token::RParen,
                Token::Semicolon,
                Token::Pop,
                Token::LParen,
                Token::RParen
            ]
        );
    }

    #[test]
    fn stray_character_is_an_error_not_a_panic() {
        let result = lex("int ` x");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.tokens.len(), 2);
    }
}
