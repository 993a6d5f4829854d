use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use chumsky::prelude::*;

use super::decode_string;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Real(pub f64);

impl PartialEq for Real {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Real {}

impl Hash for Real {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.to_bits());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Token {
    /// Upper-cased standard or user-defined (`!NAME`) keyword.
    Keyword(String),
    Instance(u64),
    Integer(i64),
    Real(Real),
    /// Decoded string literal.
    Str(String),
    Enum(String),
    Binary(String),
    Dollar,
    Star,
    LParen,
    RParen,
    Comma,
    Semi,
    Eq,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Keyword(name) => write!(f, "{name}"),
            Token::Instance(id) => write!(f, "#{id}"),
            Token::Integer(value) => write!(f, "{value}"),
            Token::Real(Real(value)) => write!(f, "{value}"),
            Token::Str(value) => write!(f, "'{value}'"),
            Token::Enum(value) => write!(f, ".{value}."),
            Token::Binary(value) => write!(f, "\"{value}\""),
            Token::Dollar => write!(f, "'$'"),
            Token::Star => write!(f, "'*'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
            Token::Semi => write!(f, "';'"),
            Token::Eq => write!(f, "'='"),
        }
    }
}

/// Tokens of the exchange structure with their byte ranges. Whitespace and
/// `/* */` comments are dropped.
pub(crate) fn lexer() -> impl Parser<char, Vec<(Token, Range<usize>)>, Error = Simple<char>> {
    let exponent = one_of("eE").then(one_of("+-").or_not()).then(text::digits(10)).map(
        |((marker, sign), digits): ((char, Option<char>), String)| {
            let mut raw = String::from(marker);
            raw.extend(sign);
            raw.push_str(&digits);
            raw
        },
    );
    let fraction = just('.').ignore_then(text::digits(10).or_not()).map(Option::unwrap_or_default);

    let number = one_of("+-")
        .or_not()
        .then(text::digits(10))
        .then(fraction.or_not())
        .then(exponent.or_not())
        .try_map(|(((sign, int_part), fraction), exponent), span| {
            let mut raw = String::new();
            raw.extend(sign);
            raw.push_str(&int_part);
            if fraction.is_none() && exponent.is_none() {
                if let Ok(value) = raw.parse::<i64>() {
                    return Ok(Token::Integer(value));
                }
            }
            if let Some(fraction) = fraction.filter(|digits| !digits.is_empty()) {
                raw.push('.');
                raw.push_str(&fraction);
            }
            raw.extend(exponent);
            raw.parse::<f64>()
                .map(|value| Token::Real(Real(value)))
                .map_err(|_| Simple::custom(span, "invalid number literal"))
        });

    let string = just('\'')
        .ignore_then(
            just("''").to('\'').or(filter(|c: &char| *c != '\'')).repeated().collect::<String>(),
        )
        .then_ignore(just('\''))
        .map(|raw| Token::Str(decode_string(&raw)));

    let binary = just('"')
        .ignore_then(filter(|c: &char| c.is_ascii_hexdigit()).repeated().collect::<String>())
        .then_ignore(just('"'))
        .map(Token::Binary);

    let instance = just('#').ignore_then(text::digits(10)).try_map(|digits: String, span| {
        digits
            .parse::<u64>()
            .map(Token::Instance)
            .map_err(|_| Simple::custom(span, "invalid instance number"))
    });

    let enumeration = just('.')
        .ignore_then(
            filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_')
                .repeated()
                .at_least(1)
                .collect::<String>(),
        )
        .then_ignore(just('.'))
        .map(|name| Token::Enum(name.to_ascii_uppercase()));

    let keyword = just('!')
        .or_not()
        .then(filter(|c: &char| c.is_ascii_alphabetic()))
        .then(
            filter(|c: &char| c.is_ascii_alphanumeric() || matches!(*c, '_' | '-'))
                .repeated()
                .collect::<String>(),
        )
        .map(|((bang, first), rest)| {
            let mut name = String::with_capacity(rest.len() + 2);
            name.extend(bang);
            name.push(first);
            name.push_str(&rest);
            Token::Keyword(name.to_ascii_uppercase())
        });

    let punct = choice::<_, Simple<char>>((
        just('$').to(Token::Dollar),
        just('*').to(Token::Star),
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
        just(',').to(Token::Comma),
        just(';').to(Token::Semi),
        just('=').to(Token::Eq),
    ));

    let comment = just("/*").then(take_until(just("*/"))).ignored();
    let trivia = comment.or(filter(|c: &char| c.is_whitespace()).ignored()).repeated();

    let token = choice::<_, Simple<char>>((
        string,
        binary,
        instance,
        number,
        enumeration,
        keyword,
        punct,
    ))
    .map_with_span(|tok, span| (tok, span))
    .boxed();

    trivia
        .clone()
        .ignore_then(token.then_ignore(trivia).repeated())
        .then_ignore(end())
}
