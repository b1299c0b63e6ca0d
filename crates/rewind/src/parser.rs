//! Source text → position-tagged S-expression tree.
//!
//! Tokens come from the chumsky [`lexer`]; the tree itself is built by a
//! small recursive-descent reader so that the two structural failures an
//! editor cares about ("forgot to close something", "didn't finish parse")
//! are reported with the exact span to highlight.

use crate::Name;
use crate::error::{Error, Result};
use chumsky::prelude::{Parser, SimpleSpan};
use std::fmt;

mod lexer;
pub use lexer::{LexError, Token, lexer};

mod source;
pub use source::{SourceCode, Span};

mod definitions;
pub use definitions::{Definition, Definitions, diff_named_functions, find_named_functions};

/// Lists nested deeper than this are rejected before they can exhaust the host stack.
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

pub type Node = Spanned<Expression>;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Number(f64),
    Text(Name),
    Identifier(Name),
    List(Vec<Node>),
}

impl Node {
    pub fn identifier(&self) -> Option<&Name> {
        match &self.node {
            Expression::Identifier(name) => Some(name),
            _ => None,
        }
    }

    pub fn list(&self) -> Option<&[Node]> {
        match &self.node {
            Expression::List(items) => Some(items),
            _ => None,
        }
    }

    /// Identifier in head position of a list form, e.g. `defn` in `(defn f () 1)`.
    pub fn head(&self) -> Option<&str> {
        self.list()?.first()?.identifier().map(|name| &**name)
    }
}

/// Structural content of a tree with every span removed, used for change detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Form {
    Number(f64),
    Text(Name),
    Identifier(Name),
    List(Vec<Form>),
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "\"{text}\""),
            Self::Identifier(name) => write!(f, "{name}"),
            Self::List(items) => {
                write!(f, "(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

pub fn strip_positions(node: &Node) -> Form {
    match &node.node {
        Expression::Number(number) => Form::Number(*number),
        Expression::Text(text) => Form::Text(text.clone()),
        Expression::Identifier(name) => Form::Identifier(name.clone()),
        Expression::List(items) => Form::List(items.iter().map(strip_positions).collect()),
    }
}

/// Parse exactly one top-level form.
pub fn parse(source: &str) -> Result<Node> {
    let source = SourceCode::new(source);
    let tokens = tokenize(&source)?;
    let mut reader = Reader::new(&tokens, &source);
    if tokens.is_empty() {
        return Err(Error::parse("nothing to parse", source.end_span()));
    }
    let node = reader.form(0)?;
    if let Some(span) = reader.peek_span() {
        return Err(Error::parse("didn't finish parse", span));
    }
    Ok(node)
}

/// Parse a whole program: any number of forms, read as the body of an implicit `(do ...)`.
pub fn parse_program(source: &str) -> Result<Node> {
    let source = SourceCode::new(source);
    let tokens = tokenize(&source)?;
    let mut reader = Reader::new(&tokens, &source);
    let mut forms = vec![Spanned {
        span: source.span(0..0),
        node: Expression::Identifier("do".into()),
    }];
    while let Some((token, span)) = reader.peek() {
        if token == Token::Close {
            return Err(Error::parse("didn't finish parse", span));
        }
        forms.push(reader.form(0)?);
    }
    Ok(Spanned {
        span: source.span(0..source.len()),
        node: Expression::List(forms),
    })
}

fn tokenize(source: &SourceCode) -> Result<Vec<(Token<'_>, SimpleSpan)>> {
    let (tokens, errors) = lexer().parse(source.as_str()).into_output_errors();
    if let Some(error) = errors.into_iter().next() {
        let span = source.span(error.span().into_range());
        return Err(Error::parse(format!("unreadable input: {error}"), span));
    }
    tokens.ok_or_else(|| Error::parse("unreadable input", source.end_span()))
}

struct Reader<'a, 'code> {
    tokens: &'a [(Token<'code>, SimpleSpan)],
    position: usize,
    source: &'a SourceCode,
}

impl<'a, 'code> Reader<'a, 'code> {
    fn new(tokens: &'a [(Token<'code>, SimpleSpan)], source: &'a SourceCode) -> Self {
        Self {
            tokens,
            position: 0,
            source,
        }
    }

    fn peek(&self) -> Option<(Token<'code>, Span)> {
        self.tokens
            .get(self.position)
            .map(|(token, span)| (*token, self.source.span(span.into_range())))
    }

    fn peek_span(&self) -> Option<Span> {
        self.peek().map(|(_, span)| span)
    }

    fn form(&mut self, depth: usize) -> Result<Node> {
        let Some((token, span)) = self.peek() else {
            return Err(Error::parse("unexpected end of input", self.source.end_span()));
        };
        self.position += 1;
        let node = match token {
            Token::Number(number) => Expression::Number(number),
            Token::Text(text) => Expression::Text(text.into()),
            Token::Identifier(name) => Expression::Identifier(name.into()),
            Token::Close => return Err(Error::parse("unexpected `)`", span)),
            Token::Open => return self.list(span, depth),
        };
        Ok(Spanned { span, node })
    }

    fn list(&mut self, open: Span, depth: usize) -> Result<Node> {
        if depth >= MAX_NESTING {
            return Err(Error::parse(
                format!("forms nested deeper than {MAX_NESTING} levels"),
                open,
            ));
        }
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(Error::parse("forgot to close something", open)),
                Some((Token::Close, close)) => {
                    self.position += 1;
                    return Ok(Spanned {
                        span: open.to(close),
                        node: Expression::List(items),
                    });
                }
                Some(_) => items.push(self.form(depth + 1)?),
            }
        }
    }
}
