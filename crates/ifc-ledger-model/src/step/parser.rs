use chumsky::prelude::*;

use super::lexer::{Real, Token};
use super::{EntityInstance, StepHeader, Value};

#[derive(Debug, Clone)]
pub(crate) enum Section {
    Header(Vec<(String, Vec<Value>)>),
    /// Instances plus the byte offset of the closing `ENDSEC`.
    Data(Vec<EntityInstance>, usize),
    Other,
}

fn keyword(word: &'static str) -> impl Parser<Token, (), Error = Simple<Token>> + Clone {
    just(Token::Keyword(word.to_string())).ignored()
}

fn name() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    select! { Token::Keyword(name) => name }
}

fn value() -> impl Parser<Token, Value, Error = Simple<Token>> + Clone {
    recursive(|value| {
        let list = value
            .separated_by(just(Token::Comma))
            .delimited_by(just(Token::LParen), just(Token::RParen));

        choice::<_, Simple<Token>>((
            select! {
                Token::Dollar => Value::Null,
                Token::Star => Value::Derived,
                Token::Integer(value) => Value::Integer(value),
                Token::Real(Real(value)) => Value::Real(value),
                Token::Str(value) => Value::String(value),
                Token::Enum(value) => Value::Enum(value),
                Token::Instance(id) => Value::Ref(id),
                Token::Binary(hex) => Value::Binary(hex),
            },
            list.clone().map(Value::List),
            name().then(list).map(|(name, args)| Value::Typed(name, args)),
        ))
    })
}

fn parameter_list() -> impl Parser<Token, Vec<Value>, Error = Simple<Token>> + Clone {
    value()
        .separated_by(just(Token::Comma))
        .delimited_by(just(Token::LParen), just(Token::RParen))
}

fn instance() -> impl Parser<Token, EntityInstance, Error = Simple<Token>> + Clone {
    let simple = name().then(parameter_list()).map(|(name, args)| (name, args, false));
    let complex = name()
        .then(parameter_list())
        .map(|(name, args)| Value::Typed(name, args))
        .repeated()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .map(|parts| (String::new(), parts, true));

    select! { Token::Instance(id) => id }
        .then_ignore(just(Token::Eq))
        .then(simple.or(complex))
        .then_ignore(just(Token::Semi))
        .map_with_span(|(id, (type_name, attributes, complex)), span| EntityInstance {
            id,
            type_name,
            attributes,
            span,
            complex,
        })
}

/// `ISO-10303-21;` followed by sections up to `END-ISO-10303-21;`.
pub(crate) fn exchange_file() -> impl Parser<Token, Vec<Section>, Error = Simple<Token>> {
    let semi = just(Token::Semi);

    let header = keyword("HEADER")
        .then(semi.clone())
        .ignore_then(name().then(parameter_list()).then_ignore(semi.clone()).repeated())
        .then_ignore(keyword("ENDSEC"))
        .then_ignore(semi.clone())
        .map(Section::Header);

    let data = keyword("DATA")
        .then(parameter_list().or_not())
        .then(semi.clone())
        .ignore_then(instance().repeated())
        .then(keyword("ENDSEC").map_with_span(|(), span: std::ops::Range<usize>| span.start))
        .then_ignore(semi.clone())
        .map(|(entities, end)| Section::Data(entities, end));

    let other = name()
        .try_map(|name, span| match name.as_str() {
            "HEADER" | "DATA" | "END-ISO-10303-21" => {
                Err(Simple::custom(span, format!("unexpected {name}")))
            }
            _ => Ok(()),
        })
        .then(
            filter(|token: &Token| !matches!(token, Token::Keyword(name) if name == "ENDSEC"))
                .repeated(),
        )
        .then(keyword("ENDSEC"))
        .then(semi.clone())
        .to(Section::Other);

    keyword("ISO-10303-21")
        .then(semi.clone())
        .ignore_then(choice::<_, Simple<Token>>((header, data, other)).repeated())
        .then_ignore(keyword("END-ISO-10303-21"))
        .then_ignore(semi)
        .then_ignore(end())
}

pub(crate) fn collect_header(entries: Vec<(String, Vec<Value>)>) -> StepHeader {
    let strings = |value: Option<&Value>| -> Vec<String> {
        value
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };

    let mut header = StepHeader::default();
    for (name, args) in entries {
        match name.as_str() {
            "FILE_DESCRIPTION" => header.description = strings(args.first()),
            "FILE_NAME" => {
                header.file_name = args.first().and_then(Value::as_str).map(str::to_string);
                header.time_stamp = args.get(1).and_then(Value::as_str).map(str::to_string);
            }
            "FILE_SCHEMA" => header.schema = strings(args.first()),
            _ => {}
        }
    }
    header
}
