//! Exchange structure (ISO 10303-21) reading: a `chumsky` lexer over the
//! source characters with byte spans, then a grammar over the tokens for
//! header entities, data section instances, and parameter values.

use std::ops::Range;

use chumsky::{Parser as _, Stream};
use serde::Serialize;

use crate::ModelError;

mod lexer;
mod parser;

use parser::Section;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Derived,
    Integer(i64),
    Real(f64),
    String(String),
    Enum(String),
    Ref(u64),
    Binary(String),
    List(Vec<Value>),
    Typed(String, Vec<Value>),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ref_id(&self) -> Option<u64> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Instance references held directly in a list attribute.
    #[must_use]
    pub fn ref_ids(&self) -> Vec<u64> {
        self.as_list()
            .map(|items| items.iter().filter_map(Self::as_ref_id).collect())
            .unwrap_or_default()
    }

    /// `IFCBOOLEAN(.T.)` style values, also accepting `IFCLOGICAL`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        let Self::Typed(name, args) = self else {
            return None;
        };
        if name != "IFCBOOLEAN" && name != "IFCLOGICAL" {
            return None;
        }
        match args.first() {
            Some(Self::Enum(flag)) if flag == "T" => Some(true),
            Some(Self::Enum(flag)) if flag == "F" => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::Typed(
            "IFCBOOLEAN".to_string(),
            vec![Self::Enum(if value { "T" } else { "F" }.to_string())],
        )
    }

    #[must_use]
    pub fn to_step(&self) -> String {
        let mut out = String::new();
        write_value(&mut out, self);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityInstance {
    pub id: u64,
    /// Upper-cased entity name. Empty for complex (multi-leaf) instances.
    pub type_name: String,
    pub attributes: Vec<Value>,
    /// Byte range of `#id=...;` in the source text.
    pub span: Range<usize>,
    pub complex: bool,
}

impl EntityInstance {
    #[must_use]
    pub fn attribute(&self, index: usize) -> Option<&Value> {
        self.attributes.get(index)
    }

    #[must_use]
    pub fn is(&self, type_name: &str) -> bool {
        !self.complex && self.type_name.eq_ignore_ascii_case(type_name)
    }

    /// Serialise this instance with a replacement attribute list.
    #[must_use]
    pub fn render_with(&self, attributes: &[Value]) -> String {
        render_entity(self.id, &self.type_name, attributes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepHeader {
    pub description: Vec<String>,
    pub file_name: Option<String>,
    pub time_stamp: Option<String>,
    pub schema: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StepFile {
    pub header: StepHeader,
    pub entities: Vec<EntityInstance>,
    /// Byte offset of the `ENDSEC` closing the data section.
    pub data_end: usize,
}

/// Parse a complete exchange structure.
///
/// # Errors
/// Returns [`ModelError::Syntax`] with the offending line on malformed input
/// or when the text has no data section.
pub fn parse_step(text: &str) -> Result<StepFile, ModelError> {
    let eoi = text.len()..text.len() + 1;
    let chars = text.char_indices().map(|(offset, ch)| (ch, offset..offset + ch.len_utf8()));
    let (tokens, lex_errs) = lexer::lexer().parse_recovery(Stream::from_iter(eoi.clone(), chars));
    if let Some(err) = lex_errs.into_iter().next() {
        return Err(syntax_error(text, err.span().start, err.to_string()));
    }

    let tokens = tokens.unwrap_or_default();
    let (sections, parse_errs) =
        parser::exchange_file().parse_recovery(Stream::from_iter(eoi, tokens.into_iter()));
    if let Some(err) = parse_errs.into_iter().next() {
        return Err(syntax_error(text, err.span().start, err.to_string()));
    }

    let mut header = StepHeader::default();
    let mut entities = Vec::new();
    let mut data_end = None;
    for section in sections.unwrap_or_default() {
        match section {
            Section::Header(entries) => header = parser::collect_header(entries),
            Section::Data(instances, end) => {
                entities.extend(instances);
                data_end = Some(end);
            }
            Section::Other => {}
        }
    }

    let data_end =
        data_end.ok_or_else(|| syntax_error(text, text.len(), "missing DATA section"))?;
    Ok(StepFile { header, entities, data_end })
}

fn syntax_error(text: &str, offset: usize, message: impl Into<String>) -> ModelError {
    let end = offset.min(text.len());
    let line = text.as_bytes()[..end].iter().filter(|byte| **byte == b'\n').count() + 1;
    ModelError::Syntax { line, message: message.into() }
}

#[must_use]
pub fn render_entity(id: u64, type_name: &str, attributes: &[Value]) -> String {
    let mut out = format!("#{id}={type_name}(");
    write_values(&mut out, attributes);
    out.push_str(");");
    out
}

pub fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push('$'),
        Value::Derived => out.push('*'),
        Value::Integer(value) => out.push_str(&value.to_string()),
        Value::Real(value) => out.push_str(&format_real(*value)),
        Value::String(value) => out.push_str(&encode_string(value)),
        Value::Enum(value) => {
            out.push('.');
            out.push_str(value);
            out.push('.');
        }
        Value::Ref(id) => {
            out.push('#');
            out.push_str(&id.to_string());
        }
        Value::Binary(hex) => {
            out.push('"');
            out.push_str(hex);
            out.push('"');
        }
        Value::List(items) => {
            out.push('(');
            write_values(out, items);
            out.push(')');
        }
        Value::Typed(name, args) => {
            out.push_str(name);
            out.push('(');
            write_values(out, args);
            out.push(')');
        }
    }
}

fn write_values(out: &mut String, values: &[Value]) {
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_value(out, value);
    }
}

fn format_real(value: f64) -> String {
    let raw = format!("{value:?}").to_ascii_uppercase();
    match raw.split_once('E') {
        Some((mantissa, exponent)) if !mantissa.contains('.') => format!("{mantissa}.E{exponent}"),
        _ => raw,
    }
}

/// Quote a string, escaping apostrophes and backslashes and carrying
/// anything outside printable ASCII as `\X2\` UTF-16 groups.
#[must_use]
pub fn encode_string(value: &str) -> String {
    fn flush(out: &mut String, wide: &mut Vec<u16>) {
        if wide.is_empty() {
            return;
        }
        out.push_str("\\X2\\");
        for unit in wide.drain(..) {
            out.push_str(&format!("{unit:04X}"));
        }
        out.push_str("\\X0\\");
    }

    let mut out = String::from("'");
    let mut wide = Vec::new();
    for ch in value.chars() {
        if (' '..='~').contains(&ch) {
            flush(&mut out, &mut wide);
            match ch {
                '\'' => out.push_str("''"),
                '\\' => out.push_str("\\\\"),
                _ => out.push(ch),
            }
        } else {
            let mut buf = [0_u16; 2];
            wide.extend_from_slice(ch.encode_utf16(&mut buf));
        }
    }
    flush(&mut out, &mut wide);
    out.push('\'');
    out
}

/// Resolve control directives inside a string whose `''` pairs have already
/// been collapsed. Malformed directives are kept verbatim.
#[must_use]
pub fn decode_string(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut index = 0;

    while index < chars.len() {
        if chars[index] != '\\' {
            out.push(chars[index]);
            index += 1;
            continue;
        }
        let rest = &chars[index..];
        let decoded = if rest.starts_with(&['\\', '\\']) {
            Some(("\\".to_string(), 2))
        } else if rest.starts_with(&['\\', 'X', '2', '\\']) {
            decode_wide(rest, 4)
        } else if rest.starts_with(&['\\', 'X', '4', '\\']) {
            decode_wide(rest, 8)
        } else if rest.starts_with(&['\\', 'X', '\\']) {
            hex_value(rest.get(3..5))
                .and_then(char::from_u32)
                .map(|ch| (ch.to_string(), 5))
        } else if rest.starts_with(&['\\', 'S', '\\']) {
            rest.get(3)
                .and_then(|ch| char::from_u32(u32::from(*ch) + 128))
                .map(|ch| (ch.to_string(), 4))
        } else if rest.starts_with(&['\\', 'P']) && rest.get(3) == Some(&'\\') {
            Some((String::new(), 4))
        } else {
            None
        };

        match decoded {
            Some((text, consumed)) => {
                out.push_str(&text);
                index += consumed;
            }
            None => {
                out.push('\\');
                index += 1;
            }
        }
    }

    out
}

fn hex_value(digits: Option<&[char]>) -> Option<u32> {
    let digits = digits?;
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0_u32, |acc, ch| Some(acc * 16 + ch.to_digit(16)?))
}

/// `\X2\...\X0\` (width 4) or `\X4\...\X0\` (width 8), starting at `rest[0]`.
fn decode_wide(rest: &[char], width: usize) -> Option<(String, usize)> {
    let terminator = ['\\', 'X', '0', '\\'];
    let mut cursor = 4;
    let mut units = Vec::new();
    while !rest[cursor..].starts_with(&terminator) {
        units.push(hex_value(rest.get(cursor..cursor + width))?);
        cursor += width;
    }
    cursor += terminator.len();

    let text = if width == 4 {
        let units = units.into_iter().map(u16::try_from).collect::<Result<Vec<_>, _>>().ok()?;
        String::from_utf16(&units).ok()?
    } else {
        units.into_iter().map(char::from_u32).collect::<Option<String>>()?
    };
    Some((text, cursor))
}
