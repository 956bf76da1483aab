//! Filter evaluation for the in-memory engine

use super::value::{compare, is_truthy, type_rank, values_equal};
use bson::{Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// Engine error code for a malformed query
const BAD_VALUE: i32 = 2;

/// Returns true if `document` satisfies `filter`
pub fn matches(document: &BsonDocument, filter: &BsonDocument) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let clauses = clauses(key, condition)?;
                let mut all = true;
                for clause in clauses {
                    if !matches(document, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_clause(document, key, condition)?,
            "$nor" => !any_clause(document, key, condition)?,
            op if op.starts_with('$') => {
                return Err(DocmapError::engine_code(
                    BAD_VALUE,
                    format!("unknown top level operator: {}", op),
                ));
            }
            field => {
                let values = lookup(document, field);
                condition_matches(&values, condition)?
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_clause(document: &BsonDocument, key: &str, condition: &Bson) -> Result<bool> {
    for clause in clauses(key, condition)? {
        if matches(document, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn clauses<'a>(key: &str, condition: &'a Bson) -> Result<Vec<&'a BsonDocument>> {
    let items = match condition {
        Bson::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(DocmapError::engine_code(
                BAD_VALUE,
                format!("{} must be a nonempty array", key),
            ))
        }
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(clause) => Ok(clause),
            _ => Err(DocmapError::engine_code(
                BAD_VALUE,
                format!("{} argument's entries must be objects", key),
            )),
        })
        .collect()
}

/// Every value reachable at `path`, traversing arrays of documents
pub fn lookup<'a>(document: &'a BsonDocument, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(value) = document.get(segments[0]) {
        descend(value, &segments[1..], &mut out);
    }
    out
}

fn descend<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(inner) => {
            if let Some(child) = inner.get(*head) {
                descend(child, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    descend(child, rest, out);
                }
            }
            for item in items {
                if let Bson::Document(_) = item {
                    descend(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Operator documents have only `$`-prefixed keys
pub fn is_operator_document(document: &BsonDocument) -> bool {
    !document.is_empty() && document.keys().all(|k| k.starts_with('$'))
}

/// Match the values found at a field against a condition
pub fn condition_matches(values: &[&Bson], condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(ops) if is_operator_document(ops) => operators_match(values, ops),
        Bson::RegularExpression(regex) => {
            let compiled = compile(&regex.pattern, &regex.options)?;
            Ok(regex_matches(values, &compiled))
        }
        target => Ok(equals(values, target)),
    }
}

fn operators_match(values: &[&Bson], ops: &BsonDocument) -> Result<bool> {
    for (op, argument) in ops {
        let matched = match op.as_str() {
            "$eq" => equals(values, argument),
            "$ne" => !equals(values, argument),
            "$gt" => compares(values, argument, |o| o == Ordering::Greater),
            "$gte" => compares(values, argument, |o| o != Ordering::Less),
            "$lt" => compares(values, argument, |o| o == Ordering::Less),
            "$lte" => compares(values, argument, |o| o != Ordering::Greater),
            "$in" => one_of(values, array_argument(op, argument)?),
            "$nin" => !one_of(values, array_argument(op, argument)?),
            "$all" => {
                let targets = array_argument(op, argument)?;
                !targets.is_empty() && targets.iter().all(|t| equals(values, t))
            }
            "$exists" => is_truthy(argument) == !values.is_empty(),
            "$size" => {
                let size = super::value::as_f64(argument).ok_or_else(|| {
                    DocmapError::engine_code(BAD_VALUE, "$size needs a number")
                })?;
                values.iter().any(|v| match v {
                    Bson::Array(items) => items.len() as f64 == size,
                    _ => false,
                })
            }
            "$regex" => {
                let (pattern, inline_options) = match argument {
                    Bson::String(p) => (p.as_str(), ""),
                    Bson::RegularExpression(r) => (r.pattern.as_str(), r.options.as_str()),
                    _ => {
                        return Err(DocmapError::engine_code(
                            BAD_VALUE,
                            "$regex has to be a string",
                        ))
                    }
                };
                let options = match ops.get("$options") {
                    Some(Bson::String(o)) => o.as_str(),
                    _ => inline_options,
                };
                let compiled = compile(pattern, options)?;
                regex_matches(values, &compiled)
            }
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(DocmapError::engine_code(
                        BAD_VALUE,
                        "$options needs a $regex",
                    ));
                }
                true
            }
            "$elemMatch" => {
                let sub = match argument {
                    Bson::Document(sub) => sub,
                    _ => {
                        return Err(DocmapError::engine_code(
                            BAD_VALUE,
                            "$elemMatch needs an Object",
                        ))
                    }
                };
                let mut found = false;
                for value in values {
                    if let Bson::Array(items) = value {
                        for item in items {
                            if element_matches(item, sub)? {
                                found = true;
                                break;
                            }
                        }
                    }
                    if found {
                        break;
                    }
                }
                found
            }
            "$not" => match argument {
                Bson::Document(_) | Bson::RegularExpression(_) => {
                    !condition_matches(values, argument)?
                }
                _ => {
                    return Err(DocmapError::engine_code(
                        BAD_VALUE,
                        "$not needs a regex or a document",
                    ))
                }
            },
            other => {
                return Err(DocmapError::engine_code(
                    BAD_VALUE,
                    format!("unknown operator: {}", other),
                ))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Match a single array element against an `$elemMatch` or `$pull` condition
pub fn element_matches(element: &Bson, condition: &BsonDocument) -> Result<bool> {
    if is_operator_document(condition) {
        return operators_match(&[element], condition);
    }
    match element {
        Bson::Document(inner) => matches(inner, condition),
        _ => Ok(false),
    }
}

/// Values plus the elements of any array value
fn expanded<'a>(values: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals(values: &[&Bson], target: &Bson) -> bool {
    if values.is_empty() {
        return matches!(target, Bson::Null);
    }
    expanded(values).iter().any(|v| values_equal(v, target))
}

fn compares(values: &[&Bson], target: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    expanded(values)
        .iter()
        .any(|v| type_rank(v) == type_rank(target) && accept(compare(v, target)))
}

fn one_of(values: &[&Bson], targets: &[Bson]) -> bool {
    targets.iter().any(|t| equals(values, t))
}

fn array_argument<'a>(op: &str, argument: &'a Bson) -> Result<&'a [Bson]> {
    match argument {
        Bson::Array(items) => Ok(items),
        _ => Err(DocmapError::engine_code(
            BAD_VALUE,
            format!("{} needs an array", op),
        )),
    }
}

fn compile(pattern: &str, options: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| {
            DocmapError::engine_code(BAD_VALUE, format!("Regular expression is invalid: {}", e))
        })
}

fn regex_matches(values: &[&Bson], regex: &Regex) -> bool {
    expanded(values).iter().any(|v| match v {
        Bson::String(s) | Bson::Symbol(s) => regex.is_match(s),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn check(document: BsonDocument, filter: BsonDocument) -> bool {
        matches(&document, &filter).unwrap()
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(check(doc! { "a": 1 }, doc! {}));
    }

    #[test]
    fn test_equality_and_dot_paths() {
        assert!(check(doc! { "k": { "f": "F1" } }, doc! { "k.f": "F1" }));
        assert!(!check(doc! { "k": { "f": "F2" } }, doc! { "k.f": "F1" }));
        assert!(check(doc! { "a": 2_i64 }, doc! { "a": 2 }));
        assert!(check(doc! {}, doc! { "missing": null }));
    }

    #[test]
    fn test_arrays_match_elements() {
        assert!(check(doc! { "tags": ["x", "y"] }, doc! { "tags": "y" }));
        assert!(check(doc! { "items": [{ "q": 1 }, { "q": 7 }] }, doc! { "items.q": 7 }));
        assert!(check(doc! { "tags": ["x", "y"] }, doc! { "tags.1": "y" }));
    }

    #[test]
    fn test_comparisons() {
        let document = doc! { "param": 3 };
        assert!(check(document.clone(), doc! { "param": { "$gt": 2 } }));
        assert!(check(document.clone(), doc! { "param": { "$gte": 3, "$lt": 4 } }));
        assert!(!check(document.clone(), doc! { "param": { "$lte": 2 } }));
        assert!(check(document.clone(), doc! { "param": { "$ne": 2 } }));
        assert!(!check(document, doc! { "param": { "$gt": "a" } }));
    }

    #[test]
    fn test_membership_and_existence() {
        let document = doc! { "s": "a", "tags": [1, 2, 3] };
        assert!(check(document.clone(), doc! { "s": { "$in": ["a", "b"] } }));
        assert!(check(document.clone(), doc! { "s": { "$nin": ["c"] } }));
        assert!(check(document.clone(), doc! { "tags": { "$all": [1, 3] } }));
        assert!(!check(document.clone(), doc! { "tags": { "$all": [1, 4] } }));
        assert!(check(document.clone(), doc! { "tags": { "$size": 3 } }));
        assert!(check(document.clone(), doc! { "s": { "$exists": true } }));
        assert!(check(document, doc! { "x": { "$exists": false } }));
    }

    #[test]
    fn test_logical_operators() {
        let document = doc! { "a": 1, "b": 2 };
        assert!(check(document.clone(), doc! { "$or": [{ "a": 5 }, { "b": 2 }] }));
        assert!(!check(document.clone(), doc! { "$nor": [{ "a": 1 }] }));
        assert!(check(document.clone(), doc! { "$and": [{ "a": 1 }, { "b": 2 }] }));
        assert!(check(document, doc! { "a": { "$not": { "$gt": 3 } } }));
    }

    #[test]
    fn test_regex_and_elem_match() {
        assert!(check(doc! { "n": "John" }, doc! { "n": { "$regex": "^jo", "$options": "i" } }));
        assert!(!check(doc! { "n": "John" }, doc! { "n": { "$regex": "^jo" } }));
        let document = doc! { "items": [{ "qty": 2 }, { "qty": 9 }] };
        assert!(check(
            document.clone(),
            doc! { "items": { "$elemMatch": { "qty": { "$gt": 5 } } } }
        ));
        assert!(!check(document, doc! { "items": { "$elemMatch": { "qty": { "$gt": 10 } } } }));
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let err = matches(&doc! { "a": 1 }, &doc! { "a": { "$bogus": 1 } }).unwrap_err();
        assert_eq!(err.to_string(), "unknown operator: $bogus");
    }
}
