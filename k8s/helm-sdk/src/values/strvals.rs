use super::{Value, Values};
use crate::{
    constants::{MAX_VALUES_INDEX, SET_PARAM_KEY},
    error::{MissingOverrideExpression, Result, ValuesExpression, ValuesSerialize},
};
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;

/// One step of an override path: a mapping key or a position in a sequence.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// An item of a brace-delimited inline collection.
enum Item {
    Element(Value),
    Entry(String, Value),
}

/// Compile an override expression such as `image.tag=v2,replicas=3,args={a,b}` into a nested,
/// ordered values mapping. Either the whole expression compiles or an error naming the offending
/// fragment is returned; nothing is partially applied.
pub fn parse(expression: &str) -> Result<Values> {
    let mut values = Values::new();
    let mut parser = Parser::new(expression);

    while !parser.at_end() {
        let start = parser.pos;
        let path = parser.path()?;
        let value = parser.value(start)?;
        assign(&mut values, &path, value).map_err(|reason| parser.fail(start, reason))?;
        parser.separator(start)?;
    }

    Ok(values)
}

/// Compile the override expression found under the `set` key of a caller's parameters.
pub fn parse_params(params: &HashMap<String, String>) -> Result<Values> {
    let expression = params.get(SET_PARAM_KEY).context(MissingOverrideExpression {
        key: SET_PARAM_KEY,
    })?;
    parse(expression)
}

/// Compile an override expression and render it as a YAML values document.
pub fn to_yaml(expression: &str) -> Result<String> {
    let values = parse(expression)?;
    serde_yaml::to_string(&values).context(ValuesSerialize)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(expression: &str) -> Self {
        Self {
            chars: expression.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn fail<R: ToString>(&self, start: usize, reason: R) -> crate::error::Error {
        let end = self.pos.min(self.chars.len());
        ValuesExpression {
            fragment: self.chars[start..end].iter().collect::<String>(),
            reason: reason.to_string(),
        }
        .build()
    }

    /// Reads a path up to and including its '='.
    fn path(&mut self) -> Result<Vec<Segment>> {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            KeyStart,
            InKey,
            AfterIndex,
        }

        let start = self.pos;
        let mut segments = Vec::new();
        let mut key = String::new();
        let mut state = State::KeyStart;

        loop {
            let c = match self.next() {
                Some(c) => c,
                None => return Err(self.fail(start, "missing '=' after path")),
            };
            match (state, c) {
                (_, ',') => return Err(self.fail(start, "missing '=' after path")),
                (State::KeyStart, '[') if segments.is_empty() => {
                    return Err(self.fail(start, "path must begin with a key"))
                }
                (State::KeyStart, '=' | '.' | '[') => {
                    return Err(self.fail(start, "empty path segment"))
                }
                (State::KeyStart | State::InKey, '\\') => {
                    key.push(self.next().unwrap_or('\\'));
                    state = State::InKey;
                }
                (State::InKey, '.') => {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                    state = State::KeyStart;
                }
                (State::InKey, '[') => {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                    segments.push(Segment::Index(self.index(start)?));
                    state = State::AfterIndex;
                }
                (State::InKey, '=') => {
                    segments.push(Segment::Key(key));
                    return Ok(segments);
                }
                (State::KeyStart | State::InKey, c) => {
                    key.push(c);
                    state = State::InKey;
                }
                (State::AfterIndex, '.') => state = State::KeyStart,
                (State::AfterIndex, '[') => segments.push(Segment::Index(self.index(start)?)),
                (State::AfterIndex, '=') => return Ok(segments),
                (State::AfterIndex, _) => {
                    return Err(self.fail(start, "unexpected character after list index"))
                }
            }
        }
    }

    /// Reads a list index, the opening '[' having been consumed.
    fn index(&mut self, start: usize) -> Result<usize> {
        let mut digits = String::new();
        loop {
            match self.next() {
                Some(']') => break,
                Some(c) if c.is_ascii_digit() => digits.push(c),
                Some(_) => return Err(self.fail(start, "list index must be a number")),
                None => return Err(self.fail(start, "unterminated list index")),
            }
        }
        let index: usize = digits
            .parse()
            .map_err(|_| self.fail(start, "list index must be a number"))?;
        if index > MAX_VALUES_INDEX {
            return Err(self.fail(
                start,
                format!("list index {index} exceeds the maximum of {MAX_VALUES_INDEX}"),
            ));
        }
        Ok(index)
    }

    /// Reads the value of an assignment, stopping before the separating ','.
    fn value(&mut self, start: usize) -> Result<Value> {
        if self.peek() == Some('{') {
            self.pos += 1;
            return self.collection(start);
        }

        let mut raw = String::new();
        while let Some(c) = self.peek() {
            match c {
                ',' => break,
                '\\' => {
                    self.pos += 1;
                    raw.push(self.next().unwrap_or('\\'));
                }
                c => {
                    self.pos += 1;
                    raw.push(c);
                }
            }
        }
        Ok(typed(&raw))
    }

    /// Reads an inline list `{a,b}` or map `{k: v}`, the opening '{' having been consumed.
    fn collection(&mut self, start: usize) -> Result<Value> {
        let mut items = Vec::new();
        let mut buf = String::new();
        let mut key: Option<String> = None;
        let mut nested: Option<Value> = None;

        loop {
            let c = match self.next() {
                Some(c) => c,
                None => return Err(self.fail(start, "unbalanced '{'")),
            };
            match c {
                '\\' => buf.push(self.next().unwrap_or('\\')),
                '{' if nested.is_none() && buf.trim().is_empty() => {
                    nested = Some(self.collection(start)?);
                }
                '{' => return Err(self.fail(start, "unexpected '{' inside a collection item")),
                ':' if key.is_none() && nested.is_none() => {
                    let name = buf.trim().to_string();
                    if name.is_empty() {
                        return Err(self.fail(start, "empty key in inline map"));
                    }
                    key = Some(name);
                    buf.clear();
                }
                ',' | '}' => {
                    let closing = c == '}';
                    let blank = buf.trim().is_empty() && key.is_none() && nested.is_none();
                    if !(closing && blank) {
                        let value = nested.take().unwrap_or_else(|| typed(buf.trim()));
                        items.push(match key.take() {
                            Some(name) => Item::Entry(name, value),
                            None => Item::Element(value),
                        });
                    }
                    buf.clear();
                    if closing {
                        break;
                    }
                }
                c if nested.is_some() && !c.is_whitespace() => {
                    return Err(self.fail(start, "unexpected characters after nested collection"))
                }
                c => buf.push(c),
            }
        }

        let entries = items
            .iter()
            .filter(|item| matches!(item, Item::Entry(..)))
            .count();
        if entries == 0 {
            let list = items
                .into_iter()
                .filter_map(|item| match item {
                    Item::Element(value) => Some(value),
                    Item::Entry(..) => None,
                })
                .collect();
            Ok(Value::Array(list))
        } else if entries == items.len() {
            let mut map = Values::new();
            for item in items {
                if let Item::Entry(name, value) = item {
                    map.insert(name, value);
                }
            }
            Ok(Value::Object(map))
        } else {
            Err(self.fail(start, "inline collection mixes list items and map entries"))
        }
    }

    /// Consumes the ',' between two assignments.
    fn separator(&mut self, start: usize) -> Result<()> {
        match self.next() {
            None => Ok(()),
            Some(',') if self.at_end() => Err(self.fail(start, "trailing ','")),
            Some(',') => Ok(()),
            Some(_) => Err(self.fail(start, "unexpected characters after value")),
        }
    }
}

/// Interprets a scalar: booleans, null and integers are recognized, integers with a leading zero
/// stay strings.
fn typed(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        "0" => Value::from(0),
        s if s.starts_with('0') => Value::String(s.to_string()),
        s => match s.parse::<i64>() {
            Ok(number) => Value::from(number),
            Err(_) => Value::String(s.to_string()),
        },
    }
}

fn object_at(slot: &mut Value) -> &mut Values {
    if !slot.is_object() {
        *slot = Value::Object(Values::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

fn array_at(slot: &mut Value) -> &mut Vec<Value> {
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(list) => list,
        _ => unreachable!("slot was just made an array"),
    }
}

fn assign(map: &mut Values, path: &[Segment], value: Value) -> Result<(), String> {
    match path {
        [Segment::Key(key)] => {
            map.insert(key.clone(), value);
            Ok(())
        }
        [Segment::Key(key), Segment::Key(_), ..] => {
            let slot = map.entry(key.clone()).or_insert(Value::Null);
            assign(object_at(slot), &path[1..], value)
        }
        [Segment::Key(key), Segment::Index(index), rest @ ..] => {
            let slot = map.entry(key.clone()).or_insert(Value::Null);
            assign_index(array_at(slot), *index, rest, value)
        }
        _ => Err("path must begin with a key".to_string()),
    }
}

fn assign_index(
    list: &mut Vec<Value>,
    index: usize,
    rest: &[Segment],
    value: Value,
) -> Result<(), String> {
    if list.len() <= index {
        list.resize(index + 1, Value::Null);
    }
    match rest.first() {
        None => {
            list[index] = value;
            Ok(())
        }
        Some(Segment::Key(_)) => assign(object_at(&mut list[index]), rest, value),
        Some(Segment::Index(next)) => {
            assign_index(array_at(&mut list[index]), *next, &rest[1..], value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, parse_params, to_yaml};
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_nested_scalars() {
        let values =
            parse("image.tag=v2,autoscaling.enabled=true,autoscaling.minReplicas=3").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"image": {"tag": "v2"}, "autoscaling": {"enabled": true, "minReplicas": 3}})
        );
    }

    #[test]
    fn test_scalar_typing() {
        let values = parse("a=007,b=0,c=false,d=null,e=-12,f=1.5,g=").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"a": "007", "b": 0, "c": false, "d": null, "e": -12, "f": "1.5", "g": ""})
        );
    }

    #[test]
    fn test_escapes() {
        let values = parse(r"annotations.kubernetes\.io/role=x\,y,name=a\=b").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"annotations": {"kubernetes.io/role": "x,y"}, "name": "a=b"})
        );
    }

    #[test]
    fn test_list_indices() {
        let values = parse("list[1].name=b,list[0]=a,grid[1][0]=x").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"list": ["a", {"name": "b"}], "grid": [null, ["x"]]})
        );
    }

    #[test]
    fn test_inline_collections() {
        let values = parse("args={a, b,c},limits={cpu: 100m, replicas: 2},empty={}").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({
                "args": ["a", "b", "c"],
                "limits": {"cpu": "100m", "replicas": 2},
                "empty": []
            })
        );

        let values = parse("nested={outer: {inner: 1}}").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"nested": {"outer": {"inner": 1}}})
        );
    }

    #[test]
    fn test_last_write_wins() {
        let values = parse("a.b=1,a.b=2,c=x,c.d=y").unwrap();
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"a": {"b": 2}, "c": {"d": "y"}})
        );
    }

    #[test]
    fn test_empty_expression() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_expressions() {
        for expression in [
            "a",
            "a=1,b",
            "a.=b",
            ".a=b",
            "a..b=1",
            "=1",
            "[0]=x",
            "a[x]=1",
            "a[0=1",
            "a[0]b=1",
            "a={b",
            "a={x}y",
            "a={x, k: v}",
            "a={: v}",
            "a=1,",
            "a[99999999]=1",
        ] {
            let error = parse(expression).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Parse, "{expression}");
        }
    }

    #[test]
    fn test_error_names_fragment() {
        let error = parse("good=1,bad.=2").unwrap_err().to_string();
        assert!(error.contains("bad."), "{error}");
    }

    #[test]
    fn test_parse_params() {
        let mut params = HashMap::new();
        let error = parse_params(&params).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);

        params.insert("set".to_string(), "image.tag=v2".to_string());
        let values = parse_params(&params).unwrap();
        assert_eq!(serde_json::Value::Object(values), json!({"image": {"tag": "v2"}}));
    }

    #[test]
    fn test_to_yaml() {
        let yaml = to_yaml("image.tag=v2").unwrap();
        assert_eq!(yaml, "image:\n  tag: v2\n");
    }
}
