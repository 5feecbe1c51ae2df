//! JSON text generation.

use super::{parse, Triple, TripleValue, TypeTag, Value, NULL_SENTINEL};
use crate::error::Error;

/// How to interpret the value handed to [`emit_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    /// Try number, then boolean, then the null sentinel, else string.
    #[default]
    Auto,
    String,
    Number,
    Boolean,
    Null,
    Object,
    Array,
}

#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub value_type: ValueType,
    /// Newlines plus two-space indentation per nesting level.
    pub pretty: bool,
    /// Re-validate number lexemes before emitting them.
    pub validate_numbers: bool,
}

fn append_quoted(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\x5c\""),
            '\x5c' => out.push_str("\x5c\x5c"),
            '\u{8}' => out.push_str("\x5cb"),
            '\u{c}' => out.push_str("\x5cf"),
            '\n' => out.push_str("\x5cn"),
            '\r' => out.push_str("\x5cr"),
            '\t' => out.push_str("\x5ct"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\x5cu{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn pretty_indent(out: &mut String, depth: usize) {
    out.push('\n');
    for _ in 0..depth * 2 {
        out.push(' ');
    }
}

/// Serializes a parsed [`Value`] tree back to JSON text.
pub fn emit(value: &Value, pretty: bool) -> String {
    let mut out = String::new();
    emit_into(&mut out, value, 0, pretty);
    out
}

fn emit_into(out: &mut String, value: &Value, depth: usize, pretty: bool) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(lexeme) => out.push_str(lexeme),
        Value::String(s) => append_quoted(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if pretty {
                    pretty_indent(out, depth + 1);
                }
                emit_into(out, item, depth + 1, pretty);
            }
            if pretty && !items.is_empty() {
                pretty_indent(out, depth);
            }
            out.push(']');
        }
        Value::Object(members) => {
            out.push('{');
            for (i, (key, member)) in members.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if pretty {
                    pretty_indent(out, depth + 1);
                }
                append_quoted(out, key);
                out.push(':');
                if pretty {
                    out.push(' ');
                }
                emit_into(out, member, depth + 1, pretty);
            }
            if pretty && !members.is_empty() {
                pretty_indent(out, depth);
            }
            out.push('}');
        }
    }
}

fn parse_boolean(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Emits one scalar value as JSON text, interpreting it per
/// `opts.value_type`. Container types require triples input and are
/// rejected here; use [`emit_triples`].
pub fn emit_text(text: &str, opts: &EmitOptions) -> Result<String, Error> {
    let vt = match opts.value_type {
        ValueType::Auto => {
            if parse::number_lexeme_is_valid(text) {
                ValueType::Number
            } else if !(text.len() > 1 && text.starts_with('0'))
                && parse_boolean(text).is_some()
            {
                ValueType::Boolean
            } else if text == NULL_SENTINEL {
                ValueType::Null
            } else {
                ValueType::String
            }
        }
        explicit => explicit,
    };

    let mut out = String::new();
    match vt {
        ValueType::String => append_quoted(&mut out, text),
        ValueType::Number => {
            if opts.validate_numbers {
                parse::validate_number_lexeme(text)?;
            }
            out.push_str(text);
        }
        ValueType::Boolean => {
            let b = parse_boolean(text)
                .ok_or_else(|| Error::Internal("value is not a boolean"))?;
            out.push_str(if b { "true" } else { "false" });
        }
        ValueType::Null => out.push_str("null"),
        ValueType::Object | ValueType::Array => {
            return Err(Error::Internal("container emission requires triples"));
        }
        ValueType::Auto => unreachable!("auto resolved above"),
    }
    Ok(out)
}

/// Serializes a container described by triples. With `is_object`, triple
/// names become member names; otherwise they are ignored.
pub fn emit_triples(triples: &[Triple], is_object: bool, opts: &EmitOptions) -> Result<String, Error> {
    let mut out = String::new();
    emit_triples_into(&mut out, triples, is_object, 0, opts)?;
    Ok(out)
}

fn emit_triples_into(
    out: &mut String,
    triples: &[Triple],
    is_object: bool,
    depth: usize,
    opts: &EmitOptions,
) -> Result<(), Error> {
    out.push(if is_object { '{' } else { '[' });
    if opts.pretty && !triples.is_empty() {
        pretty_indent(out, depth + 1);
    }

    for (i, triple) in triples.iter().enumerate() {
        if i > 0 {
            out.push(',');
            if opts.pretty {
                pretty_indent(out, depth + 1);
            }
        }

        if is_object {
            append_quoted(out, &triple.name);
            out.push(':');
            if opts.pretty {
                out.push(' ');
            }
        }

        match (&triple.tag, &triple.value) {
            (TypeTag::String, TripleValue::Scalar(s)) => append_quoted(out, s),
            (TypeTag::Number, TripleValue::Scalar(s)) => {
                if opts.validate_numbers {
                    parse::validate_number_lexeme(s)?;
                }
                out.push_str(s);
            }
            (TypeTag::Boolean, TripleValue::Scalar(s)) => {
                let b = parse_boolean(s)
                    .ok_or_else(|| Error::Internal("triple value is not a boolean"))?;
                out.push_str(if b { "true" } else { "false" });
            }
            (TypeTag::Null, _) => out.push_str("null"),
            (TypeTag::Object, TripleValue::Container(inner)) => {
                emit_triples_into(out, inner, true, depth + 1, opts)?;
            }
            (TypeTag::Array, TripleValue::Container(inner)) => {
                emit_triples_into(out, inner, false, depth + 1, opts)?;
            }
            _ => return Err(Error::Internal("triple tag does not match its value")),
        }
    }

    if opts.pretty && !triples.is_empty() {
        pretty_indent(out, depth);
    }
    out.push(if is_object { '}' } else { ']' });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::json::{parse as parse_json, JsonOptions, Output, Parsed};
    use assert_matches::assert_matches;

    fn reparse(input: &str) -> Value {
        match parse_json(input, &JsonOptions::default()).unwrap() {
            Parsed::Value(value) => value,
            _ => panic!(),
        }
    }

    #[test]
    fn compact_round_trip() {
        let corpus = [
            "null",
            "true",
            "-12.5e-3",
            r#""text with \"quotes\"""#,
            "[]",
            "{}",
            r#"[1,"two",null,{"k":false}]"#,
            r#"{"a":{"b":[1,2]},"c":"d"}"#,
        ];
        for j in corpus {
            assert_eq!(emit(&reparse(j), false), j, "round trip of {j}");
        }
    }

    #[test]
    fn control_characters_are_escaped() {
        let value = Value::String("a\nb\u{7}".to_string());
        assert_eq!(emit(&value, false), "\"a\x5cnb\x5cu0007\"");
    }

    #[test]
    fn solidus_is_not_escaped() {
        let value = Value::String("a/b".to_string());
        assert_eq!(emit(&value, false), "\"a/b\"");
    }

    #[test]
    fn pretty_printing_indents_two_spaces() {
        let value = reparse(r#"{"a":[1,2]}"#);
        let expected = "{\n  \"a\": [\n    1,\n    2\n  ]\n}";
        assert_eq!(emit(&value, true), expected);
    }

    #[test]
    fn pretty_empty_containers_stay_flat() {
        assert_eq!(emit(&reparse("{}"), true), "{}");
        assert_eq!(emit(&reparse("[]"), true), "[]");
    }

    #[test]
    fn auto_type_detection_order() {
        let opts = EmitOptions::default();
        assert_eq!(emit_text("42", &opts).unwrap(), "42");
        assert_eq!(emit_text("true", &opts).unwrap(), "true");
        assert_eq!(emit_text("yes", &opts).unwrap(), "true");
        assert_eq!(emit_text(super::NULL_SENTINEL, &opts).unwrap(), "null");
        assert_eq!(emit_text("plain", &opts).unwrap(), "\"plain\"");
        // Leading zeros disqualify both number and boolean.
        assert_eq!(emit_text("0123", &opts).unwrap(), "\"0123\"");
    }

    #[test]
    fn explicit_types_override_detection() {
        let opts = EmitOptions {
            value_type: ValueType::String,
            ..EmitOptions::default()
        };
        assert_eq!(emit_text("42", &opts).unwrap(), "\"42\"");
    }

    #[test]
    fn number_validation_on_emit() {
        let opts = EmitOptions {
            value_type: ValueType::Number,
            validate_numbers: true,
            ..EmitOptions::default()
        };
        assert_eq!(emit_text("1.5e2", &opts).unwrap(), "1.5e2");
        assert_matches!(emit_text("1.5x", &opts), Err(Error::MalformedNumber(_)));

        let lax = EmitOptions {
            value_type: ValueType::Number,
            ..EmitOptions::default()
        };
        assert_eq!(emit_text("1.5x", &lax).unwrap(), "1.5x");
    }

    #[test]
    fn triples_round_trip_through_emitter() {
        let opts = JsonOptions {
            output: Output::Triples,
            ..JsonOptions::default()
        };
        let input = r#"{"a":1,"b":[true,"x"],"c":null}"#;
        let Parsed::Triples(triples) = parse_json(input, &opts).unwrap() else {
            panic!()
        };
        let emitted = emit_triples(&triples, true, &EmitOptions::default()).unwrap();
        assert_eq!(emitted, input);
    }

    #[test]
    fn mismatched_triple_shape_is_an_error() {
        let triples = [Triple {
            name: "bad".to_string(),
            tag: TypeTag::Object,
            value: TripleValue::Scalar("not a container".to_string()),
        }];
        assert_matches!(
            emit_triples(&triples, true, &EmitOptions::default()),
            Err(Error::Internal(_))
        );
    }
}
