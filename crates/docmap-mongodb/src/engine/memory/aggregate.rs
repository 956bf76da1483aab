//! Aggregation pipeline evaluation for the in-memory engine

use super::filter::{self, matches};
use super::value::{add, as_f64, compare, is_numeric, multiply, values_equal};
use crate::path;
use bson::{doc, Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use std::cmp::Ordering;

const BAD_VALUE: i32 = 2;
const UNRECOGNIZED_STAGE: i32 = 40324;
const INVALID_EXPRESSION: i32 = 168;

/// Run `pipeline` over `documents`
///
/// `resolve` returns the documents of another collection of the same database,
/// for `$lookup`.
pub fn run(
    documents: Vec<BsonDocument>,
    pipeline: &[BsonDocument],
    resolve: &dyn Fn(&str) -> Vec<BsonDocument>,
) -> Result<Vec<BsonDocument>> {
    let mut current = documents;
    for stage in pipeline {
        let mut entries = stage.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(DocmapError::engine_code(
                    BAD_VALUE,
                    "A pipeline stage specification object must contain exactly one field.",
                ))
            }
        };
        current = match name.as_str() {
            "$match" => {
                let filter = spec_document(name, spec)?;
                let mut kept = Vec::with_capacity(current.len());
                for document in current {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            "$project" => {
                let spec = spec_document(name, spec)?;
                current
                    .iter()
                    .map(|d| project(d, spec))
                    .collect::<Result<_>>()?
            }
            "$addFields" | "$set" => {
                let spec = spec_document(name, spec)?;
                let mut out = Vec::with_capacity(current.len());
                for mut document in current {
                    for (field, expression) in spec {
                        if let Some(value) = evaluate(&document, expression)? {
                            path::set(&mut document, field, value)?;
                        }
                    }
                    out.push(document);
                }
                out
            }
            "$group" => group(&current, spec_document(name, spec)?)?,
            "$sort" => {
                let spec = spec_document(name, spec)?;
                sort(&mut current, spec);
                current
            }
            "$limit" => {
                let n = count_argument(name, spec)?;
                current.truncate(n);
                current
            }
            "$skip" => {
                let n = count_argument(name, spec)?;
                current.into_iter().skip(n).collect()
            }
            "$unwind" => unwind(current, spec)?,
            "$count" => {
                let field = match spec {
                    Bson::String(field) if !field.is_empty() && !field.starts_with('$') => field,
                    _ => {
                        return Err(DocmapError::engine_code(
                            BAD_VALUE,
                            "the count field must be a non-empty string",
                        ))
                    }
                };
                if current.is_empty() {
                    Vec::new()
                } else {
                    let total = Bson::Int32(current.len() as i32);
                    vec![doc! { field.as_str(): total }]
                }
            }
            "$lookup" => lookup(current, spec_document(name, spec)?, resolve)?,
            other => {
                return Err(DocmapError::engine_code(
                    UNRECOGNIZED_STAGE,
                    format!("Unrecognized pipeline stage name: '{}'", other),
                ))
            }
        };
    }
    Ok(current)
}

fn spec_document<'a>(stage: &str, spec: &'a Bson) -> Result<&'a BsonDocument> {
    match spec {
        Bson::Document(spec) => Ok(spec),
        _ => Err(DocmapError::engine_code(
            BAD_VALUE,
            format!("the {} specification must be an object", stage),
        )),
    }
}

fn count_argument(stage: &str, spec: &Bson) -> Result<usize> {
    match as_f64(spec) {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(DocmapError::engine_code(
            BAD_VALUE,
            format!("invalid argument to {} stage: {}", stage, spec),
        )),
    }
}

/// Evaluate an aggregation expression; `None` means the value is missing
pub fn evaluate(document: &BsonDocument, expression: &Bson) -> Result<Option<Bson>> {
    match expression {
        Bson::String(s) if s == "$$ROOT" => Ok(Some(Bson::Document(document.clone()))),
        Bson::String(s) if s.starts_with('$') => Ok(resolve_path(document, &s[1..])),
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(document, item)?.unwrap_or(Bson::Null));
            }
            Ok(Some(Bson::Array(out)))
        }
        Bson::Document(spec) => {
            let mut entries = spec.iter();
            if let (Some((op, argument)), None) = (entries.next(), entries.next()) {
                if op.starts_with('$') {
                    return operator(document, op, argument);
                }
            }
            let mut out = BsonDocument::new();
            for (field, sub) in spec {
                if let Some(value) = evaluate(document, sub)? {
                    out.insert(field.clone(), value);
                }
            }
            Ok(Some(Bson::Document(out)))
        }
        literal => Ok(Some(literal.clone())),
    }
}

/// Field path value; arrays of documents project the field of every element
fn resolve_path(document: &BsonDocument, field: &str) -> Option<Bson> {
    if let Some(value) = path::get(document, field) {
        return Some(value.clone());
    }
    let (head, rest) = field.split_once('.')?;
    match document.get(head)? {
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Bson::Document(inner) => resolve_path(inner, rest),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

fn operator(document: &BsonDocument, op: &str, argument: &Bson) -> Result<Option<Bson>> {
    if op == "$literal" {
        return Ok(Some(argument.clone()));
    }
    let arguments: Vec<Option<Bson>> = match argument {
        Bson::Array(items) => items
            .iter()
            .map(|item| evaluate(document, item))
            .collect::<Result<_>>()?,
        single => vec![evaluate(document, single)?],
    };

    let result = match op {
        "$add" | "$multiply" => {
            let combine = if op == "$add" { add } else { multiply };
            let mut total = if op == "$add" { Bson::Int32(0) } else { Bson::Int32(1) };
            for value in &arguments {
                match value {
                    Some(v) if is_numeric(v) => {
                        total = combine(&total, v).ok_or_else(|| non_numeric(op, v))?;
                    }
                    None | Some(Bson::Null) => return Ok(Some(Bson::Null)),
                    Some(other) => return Err(non_numeric(op, other)),
                }
            }
            total
        }
        "$subtract" | "$divide" => {
            let (left, right) = binary(op, &arguments)?;
            match (left, right) {
                (Some(l), Some(r)) if is_numeric(l) && is_numeric(r) => {
                    if op == "$subtract" {
                        let negated =
                            multiply(r, &Bson::Int32(-1)).ok_or_else(|| non_numeric(op, r))?;
                        add(l, &negated).ok_or_else(|| non_numeric(op, l))?
                    } else {
                        let divisor = as_f64(r).unwrap_or(0.0);
                        if divisor == 0.0 {
                            return Err(DocmapError::engine_code(2, "can't $divide by zero"));
                        }
                        Bson::Double(as_f64(l).unwrap_or(0.0) / divisor)
                    }
                }
                (None | Some(Bson::Null), _) | (_, None | Some(Bson::Null)) => Bson::Null,
                (Some(l), Some(r)) => {
                    let offending = if is_numeric(l) { r } else { l };
                    return Err(non_numeric(op, offending));
                }
            }
        }
        "$concat" => {
            let mut out = String::new();
            for value in &arguments {
                match value {
                    Some(Bson::String(s)) => out.push_str(s),
                    None | Some(Bson::Null) => return Ok(Some(Bson::Null)),
                    Some(other) => {
                        return Err(DocmapError::engine_code(
                            16702,
                            format!(
                                "$concat only supports strings, not {:?}",
                                other.element_type()
                            ),
                        ))
                    }
                }
            }
            Bson::String(out)
        }
        "$toUpper" | "$toLower" => match arguments.first() {
            Some(Some(Bson::String(s))) => Bson::String(if op == "$toUpper" {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            }),
            Some(Some(Bson::Null)) | Some(None) | None => Bson::String(String::new()),
            Some(Some(other)) => Bson::String(other.to_string()),
        },
        "$ifNull" => arguments
            .iter()
            .flatten()
            .find(|v| !matches!(v, Bson::Null))
            .cloned()
            .unwrap_or(Bson::Null),
        "$size" => match arguments.first() {
            Some(Some(Bson::Array(items))) => Bson::Int32(items.len() as i32),
            _ => {
                return Err(DocmapError::engine_code(
                    17124,
                    "The argument to $size must be an array",
                ))
            }
        },
        other => {
            return Err(DocmapError::engine_code(
                INVALID_EXPRESSION,
                format!("Unrecognized expression '{}'", other),
            ))
        }
    };
    Ok(Some(result))
}

fn binary<'a>(
    op: &str,
    arguments: &'a [Option<Bson>],
) -> Result<(Option<&'a Bson>, Option<&'a Bson>)> {
    match arguments {
        [left, right] => Ok((left.as_ref(), right.as_ref())),
        _ => Err(DocmapError::engine_code(
            16020,
            format!(
                "Expression {} takes exactly 2 arguments. {} were passed in.",
                op,
                arguments.len()
            ),
        )),
    }
}

fn non_numeric(op: &str, value: &Bson) -> DocmapError {
    DocmapError::engine_code(
        16554,
        format!("{} only supports numeric types, not {:?}", op, value.element_type()),
    )
}

fn project(document: &BsonDocument, spec: &BsonDocument) -> Result<BsonDocument> {
    let is_exclusion =
        |value: &Bson| matches!(value, Bson::Boolean(false)) || as_f64(value) == Some(0.0);
    let is_inclusion = |value: &Bson| {
        matches!(value, Bson::Boolean(true)) || as_f64(value).map_or(false, |n| n != 0.0)
    };

    let inclusive = spec
        .iter()
        .any(|(field, value)| field != "_id" && !is_exclusion(value));

    if !inclusive {
        let mut out = document.clone();
        for (field, value) in spec {
            if is_exclusion(value) {
                path::remove(&mut out, field);
            }
        }
        return Ok(out);
    }

    let mut out = BsonDocument::new();
    let keep_id = spec.get("_id").map_or(true, |v| !is_exclusion(v));
    if keep_id {
        if let Some(id) = document.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (field, value) in spec {
        if field == "_id" && (is_exclusion(value) || is_inclusion(value)) {
            continue;
        }
        let projected = if is_inclusion(value) {
            path::get(document, field).cloned()
        } else if is_exclusion(value) {
            return Err(DocmapError::engine_code(
                31254,
                format!("Cannot do exclusion on field {} in inclusion projection", field),
            ));
        } else {
            evaluate(document, value)?
        };
        if let Some(projected) = projected {
            path::set(&mut out, field, projected)?;
        }
    }
    Ok(out)
}

enum Accumulator {
    Sum(Bson),
    Avg { total: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
    Count(i32),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum(Bson::Int32(0)),
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(None),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            "$count" => Accumulator::Count(0),
            other => {
                return Err(DocmapError::engine_code(
                    15952,
                    format!("unknown group operator '{}'", other),
                ))
            }
        })
    }

    fn accumulate(&mut self, value: Option<Bson>) {
        match self {
            Accumulator::Sum(total) => {
                if let Some(v) = value.filter(is_numeric) {
                    if let Some(next) = add(total, &v) {
                        *total = next;
                    }
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(n) = value.as_ref().and_then(as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => keep_extreme(current, value, Ordering::Less),
            Accumulator::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value.unwrap_or(Bson::Null));
                }
            }
            Accumulator::Last(current) => *current = Some(value.unwrap_or(Bson::Null)),
            Accumulator::Push(items) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            Accumulator::AddToSet(items) => {
                if let Some(v) = value {
                    if !items.iter().any(|i| values_equal(i, &v)) {
                        items.push(v);
                    }
                }
            }
            Accumulator::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            Accumulator::Min(v)
            | Accumulator::Max(v)
            | Accumulator::First(v)
            | Accumulator::Last(v) => {
                v.unwrap_or(Bson::Null)
            }
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Bson::Array(items),
            Accumulator::Count(n) => Bson::Int32(n),
        }
    }
}

/// Replace `current` when `value` orders `want` relative to it; nulls are ignored
fn keep_extreme(current: &mut Option<Bson>, value: Option<Bson>, want: Ordering) {
    if let Some(v) = value.filter(|v| !matches!(v, Bson::Null)) {
        if current.as_ref().map_or(true, |c| compare(&v, c) == want) {
            *current = Some(v);
        }
    }
}

struct Group {
    key: Bson,
    accumulators: Vec<(String, Accumulator)>,
}

fn group(documents: &[BsonDocument], spec: &BsonDocument) -> Result<Vec<BsonDocument>> {
    let id_expression = spec.get("_id").ok_or_else(|| {
        DocmapError::engine_code(15955, "a group specification must include an _id")
    })?;

    let mut fields: Vec<(&str, &str, &Bson)> = Vec::new();
    for (field, accumulator) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let mut entries = match accumulator {
            Bson::Document(entries) => entries.iter(),
            _ => {
                return Err(DocmapError::engine_code(
                    40234,
                    format!("The field '{}' must be an accumulator object", field),
                ))
            }
        };
        match (entries.next(), entries.next()) {
            (Some((op, argument)), None) => fields.push((field.as_str(), op.as_str(), argument)),
            _ => {
                return Err(DocmapError::engine_code(
                    40238,
                    format!("The field '{}' must specify one accumulator", field),
                ))
            }
        }
    }

    let mut groups: Vec<Group> = Vec::new();
    for document in documents {
        let key = evaluate(document, id_expression)?.unwrap_or(Bson::Null);
        let index = match groups.iter().position(|g| values_equal(&g.key, &key)) {
            Some(index) => index,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(field, op, _)| -> Result<(String, Accumulator)> {
                        Ok((field.to_string(), Accumulator::new(op)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                groups.push(Group { key, accumulators });
                groups.len() - 1
            }
        };
        let accumulators = groups[index].accumulators.iter_mut();
        for ((_, accumulator), (_, _, argument)) in accumulators.zip(&fields) {
            let value = evaluate(document, argument)?;
            accumulator.accumulate(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|g| {
            let mut out = doc! { "_id": g.key };
            for (field, accumulator) in g.accumulators {
                out.insert(field, accumulator.finish());
            }
            out
        })
        .collect())
}

/// Stable multi-key sort; missing fields sort as null
pub fn sort(documents: &mut [BsonDocument], spec: &BsonDocument) {
    documents.sort_by(|a, b| {
        for (field, direction) in spec {
            let left = path::get(a, field).unwrap_or(&Bson::Null);
            let right = path::get(b, field).unwrap_or(&Bson::Null);
            let mut ordering = compare(left, right);
            if as_f64(direction).map_or(false, |d| d < 0.0) {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn unwind(documents: Vec<BsonDocument>, spec: &Bson) -> Result<Vec<BsonDocument>> {
    let (field_path, preserve) = match spec {
        Bson::String(p) => (p.as_str(), false),
        Bson::Document(options) => match options.get("path") {
            Some(Bson::String(p)) => (
                p.as_str(),
                matches!(options.get("preserveNullAndEmptyArrays"), Some(Bson::Boolean(true))),
            ),
            _ => {
                return Err(DocmapError::engine_code(
                    28812,
                    "no path specified to $unwind stage",
                ))
            }
        },
        _ => {
            return Err(DocmapError::engine_code(
                15981,
                "expected either a string or an object as specification for $unwind stage",
            ))
        }
    };
    let field = field_path.strip_prefix('$').ok_or_else(|| {
        DocmapError::engine_code(
            28818,
            "path option to $unwind stage should be prefixed with a '$'",
        )
    })?;

    let mut out = Vec::with_capacity(documents.len());
    for document in documents {
        match path::get(&document, field).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    path::set(&mut copy, field, item)?;
                    out.push(copy);
                }
            }
            Some(Bson::Array(_)) | Some(Bson::Null) | None => {
                if preserve {
                    out.push(document);
                }
            }
            Some(_) => out.push(document),
        }
    }
    Ok(out)
}

fn lookup(
    documents: Vec<BsonDocument>,
    spec: &BsonDocument,
    resolve: &dyn Fn(&str) -> Vec<BsonDocument>,
) -> Result<Vec<BsonDocument>> {
    let from = lookup_argument(spec, "from")?;
    let local_field = lookup_argument(spec, "localField")?;
    let foreign_field = lookup_argument(spec, "foreignField")?;
    let as_field = lookup_argument(spec, "as")?;

    let foreign = resolve(from);
    let mut out = Vec::with_capacity(documents.len());
    for mut document in documents {
        let mut locals: Vec<Bson> = Vec::new();
        for value in filter::lookup(&document, local_field) {
            match value {
                Bson::Array(items) => locals.extend(items.iter().cloned()),
                other => locals.push(other.clone()),
            }
        }
        if locals.is_empty() {
            locals.push(Bson::Null);
        }
        let condition = doc! { foreign_field: { "$in": locals } };
        let mut joined = Vec::new();
        for candidate in &foreign {
            if matches(candidate, &condition)? {
                joined.push(Bson::Document(candidate.clone()));
            }
        }
        path::set(&mut document, as_field, Bson::Array(joined))?;
        out.push(document);
    }
    Ok(out)
}

fn lookup_argument<'a>(spec: &'a BsonDocument, key: &str) -> Result<&'a str> {
    match spec.get(key) {
        Some(Bson::String(value)) => Ok(value.as_str()),
        _ => Err(DocmapError::engine_code(
            BAD_VALUE,
            format!("$lookup argument '{}' must be a string", key),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_collections(_: &str) -> Vec<BsonDocument> {
        Vec::new()
    }

    fn params() -> Vec<BsonDocument> {
        (1..=4).map(|n| doc! { "_id": n, "param": n }).collect()
    }

    #[test]
    fn test_match_then_group_sum() {
        let pipeline = vec![
            doc! { "$match": { "param": { "$gte": 2 } } },
            doc! { "$group": { "_id": 0, "sum": { "$sum": "$param" } } },
        ];
        let result = run(params(), &pipeline, &no_collections).unwrap();
        assert_eq!(result, vec![doc! { "_id": 0, "sum": 9 }]);
    }

    #[test]
    fn test_group_accumulators() {
        let documents = vec![
            doc! { "k": "a", "n": 1 },
            doc! { "k": "b", "n": 5 },
            doc! { "k": "a", "n": 3 },
        ];
        let pipeline = vec![
            doc! { "$group": {
                "_id": "$k",
                "count": { "$sum": 1 },
                "avg": { "$avg": "$n" },
                "min": { "$min": "$n" },
                "max": { "$max": "$n" },
                "first": { "$first": "$n" },
                "last": { "$last": "$n" },
                "all": { "$push": "$n" },
            } },
            doc! { "$sort": { "_id": 1 } },
        ];
        let result = run(documents, &pipeline, &no_collections).unwrap();
        assert_eq!(
            result[0],
            doc! {
                "_id": "a",
                "count": 2,
                "avg": 2.0,
                "min": 1,
                "max": 3,
                "first": 1,
                "last": 3,
                "all": [1, 3],
            }
        );
        assert_eq!(result[1].get("count"), Some(&Bson::Int32(1)));
    }

    #[test]
    fn test_sort_skip_limit() {
        let pipeline = vec![
            doc! { "$sort": { "param": -1 } },
            doc! { "$skip": 1 },
            doc! { "$limit": 2 },
        ];
        let result = run(params(), &pipeline, &no_collections).unwrap();
        let values: Vec<_> = result.iter().map(|d| d.get_i32("param").unwrap()).collect();
        assert_eq!(values, vec![3, 2]);
    }

    #[test]
    fn test_project_and_add_fields() {
        let documents = vec![doc! { "_id": 1, "a": 2, "b": 3, "name": "x" }];
        let pipeline = vec![
            doc! { "$addFields": { "total": { "$add": ["$a", "$b"] } } },
            doc! { "$project": { "_id": 0, "total": 1, "upper": { "$toUpper": "$name" } } },
        ];
        let result = run(documents, &pipeline, &no_collections).unwrap();
        assert_eq!(result, vec![doc! { "total": 5, "upper": "X" }]);

        let excluded = run(
            vec![doc! { "_id": 1, "a": 1, "b": 2 }],
            &[doc! { "$project": { "b": 0 } }],
            &no_collections,
        )
        .unwrap();
        assert_eq!(excluded, vec![doc! { "_id": 1, "a": 1 }]);
    }

    #[test]
    fn test_unwind_and_count() {
        let documents = vec![
            doc! { "tags": ["x", "y"] },
            doc! { "tags": [] },
            doc! { "tags": ["z"] },
        ];
        let unwound =
            run(documents.clone(), &[doc! { "$unwind": "$tags" }], &no_collections).unwrap();
        assert_eq!(unwound.len(), 3);
        assert_eq!(unwound[1], doc! { "tags": "y" });

        let counted = run(
            documents,
            &[doc! { "$unwind": "$tags" }, doc! { "$count": "total" }],
            &no_collections,
        )
        .unwrap();
        assert_eq!(counted, vec![doc! { "total": 3 }]);
    }

    #[test]
    fn test_lookup() {
        let orders = vec![doc! { "_id": 1, "user": 10 }, doc! { "_id": 2, "user": 99 }];
        let users = |name: &str| {
            if name == "users" {
                vec![doc! { "_id": 10, "name": "Ann" }]
            } else {
                Vec::new()
            }
        };
        let pipeline = vec![doc! { "$lookup": {
            "from": "users", "localField": "user", "foreignField": "_id", "as": "who"
        } }];
        let result = run(orders, &pipeline, &users).unwrap();
        assert_eq!(result[0].get_array("who").unwrap().len(), 1);
        assert!(result[1].get_array("who").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_stage() {
        let err = run(params(), &[doc! { "$bogus": {} }], &no_collections).unwrap_err();
        assert_eq!(err.code(), Some(40324));
    }
}
