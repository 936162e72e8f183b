//! MongoDB-subset query matching over `serde_json::Value` documents.
//!
//! A query is itself a `serde_json::Value` object. Each field maps either to
//! a literal (equality / array-membership) or to an operator object such as
//! `{"$gt": 5}`. `$or`/`$and` combine sub-queries.

use regex::Regex;
use serde_json::Value;

/// Get a value at a dot-path (`"metadata.source"`) from a JSON object.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Does `doc` satisfy `query`?
pub fn matches(doc: &Value, query: &Value) -> bool {
    let Some(query_obj) = query.as_object() else {
        return false;
    };
    if query_obj.is_empty() {
        return true;
    }

    for (key, condition) in query_obj {
        let ok = match key.as_str() {
            "$or" => condition
                .as_array()
                .map(|subs| subs.iter().any(|q| matches(doc, q)))
                .unwrap_or(false),
            "$and" => condition
                .as_array()
                .map(|subs| subs.iter().all(|q| matches(doc, q)))
                .unwrap_or(false),
            field => matches_field(doc, field, condition),
        };
        if !ok {
            return false;
        }
    }
    true
}

fn matches_field(doc: &Value, field: &str, condition: &Value) -> bool {
    let actual = get_path(doc, field);

    if let Some(obj) = condition.as_object() {
        if obj.keys().any(|k| k.starts_with('$')) {
            return obj
                .iter()
                .all(|(op, operand)| eval_operator(actual, op, operand));
        }
    }

    // Plain value: equality, or membership if the field holds an array.
    match actual {
        Some(Value::Array(arr)) => arr.iter().any(|v| v == condition),
        Some(v) => v == condition,
        None => condition.is_null(),
    }
}

fn eval_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            actual.is_some() == want
        }
        "$ne" => actual != Some(operand),
        "$gt" => cmp_numbers(actual, operand, |a, b| a > b),
        "$gte" => cmp_numbers(actual, operand, |a, b| a >= b),
        "$lt" => cmp_numbers(actual, operand, |a, b| a < b),
        "$lte" => cmp_numbers(actual, operand, |a, b| a <= b),
        "$in" => operand
            .as_array()
            .map(|options| match actual {
                Some(Value::Array(arr)) => arr.iter().any(|v| options.contains(v)),
                Some(v) => options.contains(v),
                None => false,
            })
            .unwrap_or(false),
        "$regex" => match (actual.and_then(Value::as_str), operand.as_str()) {
            (Some(text), Some(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
            _ => false,
        },
        "$not" => {
            let Some(inner) = operand.as_object() else {
                return false;
            };
            !inner
                .iter()
                .all(|(inner_op, inner_operand)| eval_operator(actual, inner_op, inner_operand))
        }
        _ => false,
    }
}

fn cmp_numbers(actual: Option<&Value>, operand: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), operand.as_f64()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_and_missing() {
        let doc = json!({"a": 1, "b": "x"});
        assert!(matches(&doc, &json!({"a": 1})));
        assert!(!matches(&doc, &json!({"a": 2})));
        assert!(matches(&doc, &json!({"c": {"$exists": false}})));
        assert!(!matches(&doc, &json!({"a": {"$exists": false}})));
    }

    #[test]
    fn array_membership() {
        let doc = json!({"entity_ids": ["e1", "e2"]});
        assert!(matches(&doc, &json!({"entity_ids": "e1"})));
        assert!(!matches(&doc, &json!({"entity_ids": "e3"})));
    }

    #[test]
    fn comparisons_and_in() {
        let doc = json!({"count": 5});
        assert!(matches(&doc, &json!({"count": {"$gt": 3}})));
        assert!(!matches(&doc, &json!({"count": {"$gt": 5}})));
        assert!(matches(&doc, &json!({"count": {"$gte": 5, "$lte": 5}})));
        assert!(matches(&doc, &json!({"count": {"$in": [1, 5, 9]}})));
    }

    #[test]
    fn or_and_and() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(&doc, &json!({"$or": [{"a": 9}, {"b": 2}]})));
        assert!(!matches(&doc, &json!({"$and": [{"a": 1}, {"b": 9}]})));
    }

    #[test]
    fn regex_and_not() {
        let doc = json!({"name": "hello.txt"});
        assert!(matches(&doc, &json!({"name": {"$regex": "^hello"}})));
        assert!(matches(&doc, &json!({"name": {"$not": {"$regex": "^world"}}})));
    }
}
