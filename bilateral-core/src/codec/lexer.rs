#![allow(clippy::module_name_repetitions)]

//! Token stream and frame grammar for the wire format.
//!
//! A frame body is `COMMAND` optionally followed by `:` and a `|`-separated
//! field list. The lexer uses `regal` to produce a bounded token buffer and
//! the parser composes `winnow` combinators over those tokens, yielding a
//! [`RawFrame`] that the typed decoder in the parent module interprets.

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

/// Maximum number of fields a single message may carry.
pub const MAX_FIELDS: usize = 16;
/// Command, colon, fields and separators.
pub const MAX_TOKENS: usize = MAX_FIELDS * 2 + 2;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds recognized in a frame body.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Fixed-point literal such as `3.72` or `23.5`.
    #[regex(r"[0-9]+\.[0-9]+", priority = 2)]
    Decimal,
    /// Unsigned integer literal.
    #[regex(r"[0-9]+")]
    Integer,
    /// Command names, parameter keys and enumerated parameter values.
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Word,
    /// Separates the command from its fields.
    #[token(":")]
    Colon,
    /// Separates fields.
    #[token("|")]
    Pipe,
    /// Pseudo variant used when the lexer encounters unsupported input.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token emitted by the lexer with a byte span back into the frame body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

/// Bounded token buffer to avoid dynamic allocation in `no_std` environments.
pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

/// One positional field of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
}

/// Untyped frame: command word plus positional fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub command: &'a str,
    pub fields: HeaplessVec<Field<'a>, MAX_FIELDS>,
}

/// Structural problems found while lexing or parsing a frame body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens,
    /// Underlying lexer reported an unrecoverable error.
    Engine,
    /// A byte outside the wire alphabet.
    InvalidToken { span: Range<usize> },
    /// Token did not fit the frame grammar.
    Unexpected {
        expected: &'static str,
        found: Option<TokenKind>,
    },
    /// More than [`MAX_FIELDS`] fields.
    TooManyFields,
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::TooManyTokens => f.write_str("token buffer exhausted"),
            GrammarError::Engine => f.write_str("lexer engine error"),
            GrammarError::InvalidToken { span } => write!(f, "unsupported byte at {span:?}"),
            GrammarError::Unexpected { expected, found } => {
                write!(f, "expected {expected}, found {found:?}")
            }
            GrammarError::TooManyFields => write!(f, "more than {MAX_FIELDS} fields"),
        }
    }
}

impl GrammarError {
    fn unexpected(expected: &'static str, token: Option<&Token<'_>>) -> Self {
        GrammarError::Unexpected {
            expected,
            found: token.map(|tok| tok.kind),
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

/// Tokenize a frame body (terminator already stripped).
pub fn lex(body: &str) -> Result<TokenBuffer<'_>, GrammarError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache.rebuild(compiled, body).map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }

        let span = record.start..record.end;
        let lexeme = &body[span.clone()];
        buffer
            .push(Token {
                kind: record.token,
                lexeme,
                span,
            })
            .map_err(|_| GrammarError::TooManyTokens)?;
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let span = start..start + partial.fragment.len();
        buffer
            .push(Token {
                kind: TokenKind::Error,
                lexeme: partial.fragment,
                span,
            })
            .map_err(|_| GrammarError::TooManyTokens)?;
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> GrammarError {
    match error {
        IncrementalError::TokenOverflow => GrammarError::TooManyTokens,
        _ => GrammarError::Engine,
    }
}

/// Lex and parse a frame body into its command and fields.
pub fn parse_frame(body: &str) -> Result<RawFrame<'_>, GrammarError> {
    let tokens = lex(body)?;

    if let Some(bad) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(GrammarError::InvalidToken {
            span: bad.span.clone(),
        });
    }

    let mut input = tokens.as_slice();
    let frame = match frame().parse_next(&mut input) {
        Ok(frame) => frame,
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => return Err(err),
        Err(ErrMode::Incomplete(_)) => {
            return Err(GrammarError::unexpected("token", input.first()));
        }
    };

    match input.first() {
        None => Ok(frame),
        Some(token) => Err(GrammarError::unexpected("end of frame", Some(token))),
    }
}

fn frame<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, RawFrame<'src>, GrammarError>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let command = expect_kind(TokenKind::Word, "command").parse_next(input)?;
        let mut fields = HeaplessVec::new();

        if expect_kind(TokenKind::Colon, ":")
            .parse_next(input)
            .is_ok()
        {
            push_field(&mut fields, field().parse_next(input)?)?;
            while expect_kind(TokenKind::Pipe, "|").parse_next(input).is_ok() {
                push_field(&mut fields, field().parse_next(input)?)?;
            }
        }

        Ok(RawFrame {
            command: command.lexeme,
            fields,
        })
    }
}

fn push_field<'src>(
    fields: &mut HeaplessVec<Field<'src>, MAX_FIELDS>,
    value: Field<'src>,
) -> Result<(), ErrMode<GrammarError>> {
    fields
        .push(value)
        .map_err(|_| ErrMode::Cut(GrammarError::TooManyFields))
}

fn field<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Field<'src>, GrammarError>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest))
            if matches!(
                token.kind,
                TokenKind::Integer | TokenKind::Decimal | TokenKind::Word
            ) =>
        {
            *input = rest;
            Ok(Field {
                kind: token.kind,
                text: token.lexeme,
            })
        }
        other => Err(ErrMode::Cut(GrammarError::unexpected(
            "field",
            other.map(|(token, _)| token),
        ))),
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_and_fields() {
        let frame = parse_frame("PONG:12|0|1500|1600").expect("frame should parse");

        assert_eq!(frame.command, "PONG");
        let texts: HeaplessVec<&str, MAX_FIELDS> =
            frame.fields.iter().map(|field| field.text).collect();
        assert_eq!(texts.as_slice(), &["12", "0", "1500", "1600"]);
        assert!(
            frame
                .fields
                .iter()
                .all(|field| field.kind == TokenKind::Integer)
        );
    }

    #[test]
    fn bare_command_has_no_fields() {
        let frame = parse_frame("SEED_ACK").expect("frame should parse");
        assert_eq!(frame.command, "SEED_ACK");
        assert!(frame.fields.is_empty());
    }

    #[test]
    fn decimals_and_words_are_distinct_fields() {
        let frame = parse_frame("PARAM_UPDATE:JITTER|23.5|PATTERN|rndp").expect("parse");

        let kinds: HeaplessVec<TokenKind, MAX_FIELDS> =
            frame.fields.iter().map(|field| field.kind).collect();
        assert_eq!(
            kinds.as_slice(),
            &[
                TokenKind::Word,
                TokenKind::Decimal,
                TokenKind::Word,
                TokenKind::Word
            ]
        );
    }

    #[test]
    fn empty_field_is_rejected() {
        assert!(matches!(
            parse_frame("PING:1||2"),
            Err(GrammarError::Unexpected {
                expected: "field",
                ..
            })
        ));
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        assert!(matches!(
            parse_frame("PING:1|2$"),
            Err(GrammarError::InvalidToken { .. })
        ));
    }

    #[test]
    fn trailing_colon_is_rejected() {
        assert!(parse_frame("PING:").is_err());
    }
}
