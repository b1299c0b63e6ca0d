use chumsky::prelude::*;
use std::borrow::Cow;
use std::fmt;

pub type LexError<'code> = Rich<'code, char, SimpleSpan>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'code> {
    Open,
    Close,
    Number(f64),
    Text(&'code str),
    Identifier(&'code str),
}

impl<'code> Token<'code> {
    pub fn into_cow_str(self) -> Cow<'code, str> {
        match self {
            Self::Open => "(".into(),
            Self::Close => ")".into(),
            Self::Number(number) => number.to_string().into(),
            Self::Text(text) => format!("\"{text}\"").into(),
            Self::Identifier(identifier) => identifier.into(),
        }
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.into_cow_str())
    }
}

/// Splits source into tokens on whitespace, parentheses and `;` comments.
pub fn lexer<'code>()
-> impl Parser<'code, &'code str, Vec<(Token<'code>, SimpleSpan)>, extra::Err<LexError<'code>>> {
    let comment = just(';').then(none_of('\n').repeated()).ignored();

    let trivia = text::whitespace()
        .at_least(1)
        .ignored()
        .or(comment)
        .repeated();

    // No escape sequences: a string runs to the next double quote.
    let text = just('"')
        .ignore_then(none_of('"').repeated().to_slice())
        .then_ignore(just('"'))
        .map(Token::Text);

    let atom = none_of("();\"")
        .filter(|character: &char| !character.is_whitespace())
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|atom: &'code str| match number_literal(atom) {
            Some(number) => Token::Number(number),
            None => Token::Identifier(atom),
        });

    let token = choice((
        just('(').to(Token::Open),
        just(')').to(Token::Close),
        text,
        atom,
    ));

    trivia
        .clone()
        .ignore_then(
            token
                .map_with(|token, extra| (token, extra.span()))
                .then_ignore(trivia)
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then_ignore(end())
}

/// `-?digits(.digits)?`, also accepting `.5` and `5.`; anything else is an identifier.
fn number_literal(atom: &str) -> Option<f64> {
    let unsigned = atom.strip_prefix('-').unwrap_or(atom);
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (unsigned, None),
    };
    let all_digits = |part: &str| part.chars().all(|character| character.is_ascii_digit());
    let has_digits = !whole.is_empty() || fraction.is_some_and(|fraction| !fraction.is_empty());
    if !has_digits || !all_digits(whole) || !fraction.is_none_or(all_digits) {
        return None;
    }
    atom.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::prelude::Parser;

    fn tokens(source: &str) -> Vec<Token<'_>> {
        let result = lexer().parse(source);
        result
            .output()
            .unwrap()
            .iter()
            .map(|(token, _)| *token)
            .collect()
    }

    #[test]
    fn splits_on_parens_and_whitespace() {
        assert_eq!(
            tokens("(+ 1 x)"),
            vec![
                Token::Open,
                Token::Identifier("+"),
                Token::Number(1.0),
                Token::Identifier("x"),
                Token::Close,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        assert_eq!(
            tokens("; leading\n(a ; trailing\n b)"),
            vec![
                Token::Open,
                Token::Identifier("a"),
                Token::Identifier("b"),
                Token::Close,
            ]
        );
    }

    #[test]
    fn strings_keep_their_spaces() {
        assert_eq!(tokens("\"done now\""), vec![Token::Text("done now")]);
    }

    #[test]
    fn number_pattern() {
        assert_eq!(tokens("-3 4.5 .5 - -x 1a"), vec![
            Token::Number(-3.0),
            Token::Number(4.5),
            Token::Number(0.5),
            Token::Identifier("-"),
            Token::Identifier("-x"),
            Token::Identifier("1a"),
        ]);
    }

    #[test]
    fn spans_are_byte_ranges() {
        let result = lexer().parse("  (foo)");
        let spans: Vec<_> = result
            .output()
            .unwrap()
            .iter()
            .map(|(_, span)| span.into_range())
            .collect();
        assert_eq!(spans, vec![2..3, 3..6, 6..7]);
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(lexer().parse("(print \"oops)").has_errors());
    }
}
