//! Update-operator application for the in-memory engine

use super::filter::{element_matches, is_operator_document};
use super::value::{add, is_numeric, multiply, values_equal, zero_like};
use crate::path;
use bson::{Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};

const BAD_VALUE: i32 = 2;
const TYPE_MISMATCH: i32 = 14;
const FAILED_TO_PARSE: i32 = 9;
const IMMUTABLE_FIELD: i32 = 66;

const MODIFIERS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$push",
    "$addToSet",
    "$pull",
    "$pop",
    "$rename",
];

/// Returns true if `update` is a whole-document replacement
pub fn is_replacement(update: &BsonDocument) -> bool {
    !update.keys().any(|k| k.starts_with('$'))
}

/// Apply `update` to `document` in place
///
/// On error the document may be partially modified; callers apply updates to
/// a copy.
pub fn apply(document: &mut BsonDocument, update: &BsonDocument) -> Result<()> {
    if is_replacement(update) {
        return replace(document, update);
    }

    for modifier in update.keys() {
        if !MODIFIERS.contains(&modifier.as_str()) {
            return Err(DocmapError::engine_code(
                FAILED_TO_PARSE,
                format!("Unknown modifier: {}", modifier),
            ));
        }
    }

    for (modifier, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            _ => {
                return Err(DocmapError::engine_code(
                    FAILED_TO_PARSE,
                    format!(
                        "Modifiers operate on fields but we found a {:?} instead",
                        fields.element_type()
                    ),
                ))
            }
        };
        for (field, argument) in fields {
            guard_id(document, modifier, field, argument)?;
            apply_one(document, modifier, field, argument)?;
        }
    }
    Ok(())
}

fn replace(document: &mut BsonDocument, replacement: &BsonDocument) -> Result<()> {
    let id = document.get("_id").cloned();
    if let (Some(current), Some(new)) = (&id, replacement.get("_id")) {
        if !values_equal(current, new) {
            return Err(immutable_id());
        }
    }
    let mut next = BsonDocument::new();
    if let Some(id) = id {
        next.insert("_id", id);
    }
    for (key, value) in replacement {
        if key != "_id" {
            next.insert(key.clone(), value.clone());
        }
    }
    *document = next;
    Ok(())
}

fn guard_id(document: &BsonDocument, modifier: &str, field: &str, argument: &Bson) -> Result<()> {
    if path::top_level(field) != "_id" {
        let renames_onto_id = modifier == "$rename"
            && matches!(argument, Bson::String(target) if path::top_level(target) == "_id");
        if renames_onto_id {
            return Err(immutable_id());
        }
        return Ok(());
    }
    let unchanged = modifier == "$set"
        && path::get(document, field).map_or(false, |current| values_equal(current, argument));
    if unchanged {
        Ok(())
    } else {
        Err(immutable_id())
    }
}

fn immutable_id() -> DocmapError {
    DocmapError::engine_code(
        IMMUTABLE_FIELD,
        "Performing an update on the path '_id' would modify the immutable field '_id'",
    )
}

fn apply_one(
    document: &mut BsonDocument,
    modifier: &str,
    field: &str,
    argument: &Bson,
) -> Result<()> {
    match modifier {
        "$set" => path::set(document, field, argument.clone()),
        "$unset" => {
            path::remove(document, field);
            Ok(())
        }
        "$inc" | "$mul" => arithmetic(document, modifier, field, argument),
        "$push" | "$addToSet" => append(document, modifier, field, argument),
        "$pull" => {
            let Some(Bson::Array(items)) = path::get_mut(document, field) else {
                return expect_array_or_missing(document, field, modifier);
            };
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if !pull_matches(&item, argument)? {
                    kept.push(item);
                }
            }
            *items = kept;
            Ok(())
        }
        "$pop" => {
            let Some(Bson::Array(items)) = path::get_mut(document, field) else {
                return expect_array_or_missing(document, field, modifier);
            };
            if !items.is_empty() {
                if super::value::as_f64(argument).unwrap_or(1.0) < 0.0 {
                    items.remove(0);
                } else {
                    items.pop();
                }
            }
            Ok(())
        }
        "$rename" => {
            let target = match argument {
                Bson::String(target) => target.as_str(),
                _ => {
                    return Err(DocmapError::engine_code(
                        BAD_VALUE,
                        format!("The 'to' field for $rename must be a string: {}", argument),
                    ))
                }
            };
            if let Some(value) = path::remove(document, field) {
                path::set(document, target, value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn arithmetic(
    document: &mut BsonDocument,
    modifier: &str,
    field: &str,
    argument: &Bson,
) -> Result<()> {
    if !is_numeric(argument) {
        return Err(DocmapError::engine_code(
            TYPE_MISMATCH,
            format!(
                "Cannot {} with non-numeric argument: {{{}: {}}}",
                &modifier[1..],
                field,
                argument
            ),
        ));
    }
    let current = path::get(document, field).cloned();
    let next = match (&current, modifier) {
        (None, "$inc") => Some(argument.clone()),
        (None, _) => Some(zero_like(argument)),
        (Some(value), "$inc") => add(value, argument),
        (Some(value), _) => multiply(value, argument),
    };
    match next {
        Some(next) => path::set(document, field, next),
        None => Err(DocmapError::engine_code(
            TYPE_MISMATCH,
            format!(
                "Cannot apply {} to a value of non-numeric type. \
                 {{_id: {}}} has the field '{}' of non-numeric type {:?}",
                modifier,
                document.get("_id").cloned().unwrap_or(Bson::Null),
                field,
                current.map(|v| v.element_type()),
            ),
        )),
    }
}

fn append(document: &mut BsonDocument, modifier: &str, field: &str, argument: &Bson) -> Result<()> {
    let values: Vec<Bson> = match argument {
        Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Bson::Array(each)) => each.clone(),
            _ => {
                return Err(DocmapError::engine_code(
                    BAD_VALUE,
                    "The argument to $each must be an array",
                ))
            }
        },
        single => vec![single.clone()],
    };

    if path::get(document, field).is_none() {
        path::set(document, field, Bson::Array(Vec::new()))?;
    }
    let Some(Bson::Array(items)) = path::get_mut(document, field) else {
        return Err(DocmapError::engine_code(
            BAD_VALUE,
            format!("The field '{}' must be an array", field),
        ));
    };
    for value in values {
        if modifier == "$addToSet" && items.iter().any(|item| values_equal(item, &value)) {
            continue;
        }
        items.push(value);
    }
    Ok(())
}

fn pull_matches(item: &Bson, condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(spec) if is_operator_document(spec) || matches!(item, Bson::Document(_)) => {
            element_matches(item, spec)
        }
        other => Ok(values_equal(item, other)),
    }
}

fn expect_array_or_missing(document: &BsonDocument, field: &str, modifier: &str) -> Result<()> {
    if path::get(document, field).is_none() {
        return Ok(());
    }
    Err(DocmapError::engine_code(
        BAD_VALUE,
        format!("Cannot apply {} to a non-array value", modifier),
    ))
}
