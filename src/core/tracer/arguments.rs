//! Best-effort call-site argument resolution.
//!
//! The grammar is flat: quoted strings, numbers, `True`/`False`/`None`, bare
//! identifiers and `name=value`. Nested calls, containers and unpacking pass
//! through as opaque text.

use serde_json::{Map, Number, Value};
use tracing::debug;

use super::protocol::{FunctionSignature, TraceArguments};

/// One argument as written at the call site
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgument {
    pub keyword: Option<String>,
    pub value: Value,
}

/// Resolve `args_text` against the caller's locals and shape it to the callee's signature.
///
/// Without a signature the result is empty.
pub fn resolve_arguments(
    args_text: &str,
    caller_locals: &Map<String, Value>,
    signature: Option<&FunctionSignature>,
) -> TraceArguments {
    let Some(signature) = signature else {
        return TraceArguments::default();
    };

    let parsed = parse_call_arguments(args_text, caller_locals);
    let resolved = filter_to_signature(parsed, &signature.param_names);
    debug!(
        "Resolved {} positional / {} keyword arguments for {}",
        resolved.positional.len(),
        resolved.keyword.len(),
        signature.function_id
    );
    resolved
}

/// Keep positionals up to the declared arity and keywords naming a still-unbound parameter
pub fn filter_to_signature(arguments: Vec<CallArgument>, param_names: &[String]) -> TraceArguments {
    let mut resolved = TraceArguments::default();

    for argument in arguments {
        match argument.keyword {
            None => {
                if resolved.positional.len() < param_names.len() {
                    resolved.positional.push(argument.value);
                }
            }
            Some(keyword) => {
                let declared_at = param_names.iter().position(|p| *p == keyword);
                match declared_at {
                    Some(index) if index >= resolved.positional.len() && !resolved.keyword.contains_key(&keyword) => {
                        resolved.keyword.insert(keyword, argument.value);
                    }
                    _ => {}
                }
            }
        }
    }

    resolved
}

pub fn parse_call_arguments(args_text: &str, caller_locals: &Map<String, Value>) -> Vec<CallArgument> {
    split_top_level(args_text)
        .into_iter()
        .map(|piece| match split_keyword(piece) {
            Some((keyword, value)) => CallArgument {
                keyword: Some(keyword.to_string()),
                value: parse_value(value, caller_locals),
            },
            None => CallArgument {
                keyword: None,
                value: parse_value(piece, caller_locals),
            },
        })
        .collect()
}

/// Split on commas outside brackets and string literals
fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);

    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// `name=value` with `name` an identifier; comparisons like `a == b` are not keywords
fn split_keyword(piece: &str) -> Option<(&str, &str)> {
    let eq = piece.find('=')?;
    let (name, rest) = (piece[..eq].trim(), &piece[eq + 1..]);
    if rest.starts_with('=') || name.ends_with(['<', '>', '!']) || !is_identifier(name) {
        return None;
    }
    Some((name, rest.trim()))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => chars.all(|c| c == '_' || c.is_alphanumeric()),
        _ => false,
    }
}

fn parse_value(text: &str, caller_locals: &Map<String, Value>) -> Value {
    let text = text.trim();

    if let Some(inner) = string_literal(text) {
        return Value::String(inner.to_string());
    }

    match text {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }

    if let Some(number) = number_literal(text) {
        return number;
    }

    if is_identifier(text) {
        // Unknown names pass through as their own text
        return caller_locals
            .get(text)
            .cloned()
            .unwrap_or_else(|| Value::String(text.to_string()));
    }

    Value::String(text.to_string())
}

fn string_literal(text: &str) -> Option<&str> {
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if text.len() >= 2 * quote.len() && text.starts_with(quote) && text.ends_with(quote) {
            return Some(&text[quote.len()..text.len() - quote.len()]);
        }
    }
    None
}

fn number_literal(text: &str) -> Option<Value> {
    let first = text.trim_start_matches(['-', '+']).chars().next()?;
    if !first.is_ascii_digit() && first != '.' {
        return None;
    }
    let cleaned = text.replace('_', "");
    if let Ok(int) = cleaned.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signature(params: &[&str]) -> FunctionSignature {
        FunctionSignature {
            function_id: "/repo/m.py::callee".to_string(),
            param_names: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn locals(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn undeclared_keywords_are_dropped() {
        let resolved = resolve_arguments("a=1, c=2", &Map::new(), Some(&signature(&["a", "b"])));
        assert!(resolved.positional.is_empty());
        assert_eq!(Value::Object(resolved.keyword), json!({"a": 1}));
    }

    #[test]
    fn identifiers_resolve_from_caller_locals() {
        let caller = locals(json!({"metric": "cpu", "days": 7}));
        let resolved = resolve_arguments(
            "metric, period=days, label=unknown_name",
            &caller,
            Some(&signature(&["name", "period", "label"])),
        );
        assert_eq!(resolved.positional, vec![json!("cpu")]);
        assert_eq!(
            Value::Object(resolved.keyword),
            json!({"period": 7, "label": "unknown_name"})
        );
    }

    #[test]
    fn positionals_beyond_arity_and_rebound_keywords_are_dropped() {
        let resolved = resolve_arguments("1, 2, 3, a=9", &Map::new(), Some(&signature(&["a", "b"])));
        assert_eq!(resolved.positional, vec![json!(1), json!(2)]);
        assert!(resolved.keyword.is_empty());
    }

    #[test]
    fn failed_signature_lookup_yields_no_arguments() {
        let resolved = resolve_arguments("1, b=2", &Map::new(), None);
        assert!(resolved.is_empty());
    }

    #[test]
    fn literal_grammar() {
        let parsed = parse_call_arguments(
            r#""a, b", 'x', 1_000, -2.5, True, None, f(x, y), [1, 2], x == y, *rest"#,
            &Map::new(),
        );
        let values: Vec<Value> = parsed.into_iter().map(|a| a.value).collect();
        assert_eq!(
            values,
            vec![
                json!("a, b"),
                json!("x"),
                json!(1000),
                json!(-2.5),
                json!(true),
                Value::Null,
                json!("f(x, y)"),
                json!("[1, 2]"),
                json!("x == y"),
                json!("*rest"),
            ]
        );
    }
}
