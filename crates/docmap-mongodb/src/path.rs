//! Dot-path field addressing
//!
//! Paths such as `k.kk` or `tags.0` address nested documents and array
//! elements. These helpers are pure functions over `bson::Document`, shared by
//! [`crate::Document`] and the in-memory engine.

use bson::{Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};

/// Separator between path segments
pub const SEPARATOR: char = '.';

/// Most null slots a positional write may add to an array
pub const MAX_ARRAY_BACKFILL: usize = 1_500_000;

/// Returns the top-level segment of a path (`"k"` for `"k.kk"`)
pub fn top_level(path: &str) -> &str {
    path.split(SEPARATOR).next().unwrap_or(path)
}

/// Checks that a path has no empty segments
pub fn check(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(DocmapError::InvalidName("Field path cannot be empty".to_string()));
    }
    if path.split(SEPARATOR).any(str::is_empty) {
        return Err(DocmapError::InvalidName(format!(
            "Field path contains an empty segment: '{}'",
            path
        )));
    }
    Ok(())
}

/// Reads the value at `path`
pub fn get<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split(SEPARATOR);
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable access to the value at `path`
pub fn get_mut<'a>(doc: &'a mut BsonDocument, path: &str) -> Option<&'a mut Bson> {
    let mut segments = path.split(SEPARATOR);
    let mut current = doc.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get_mut(segment)?,
            Bson::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate documents
///
/// Numeric segments index into existing arrays; writing past the end pads
/// the array with nulls, at most [`MAX_ARRAY_BACKFILL`] of them. Descending
/// into a scalar, or an index further out than that, fails with `TypeMismatch`.
pub fn set(doc: &mut BsonDocument, path: &str, value: Bson) -> Result<()> {
    match path.split_once(SEPARATOR) {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(BsonDocument::new()));
            set_in(child, head, rest, value)
        }
    }
}

fn set_in(target: &mut Bson, parent: &str, path: &str, value: Bson) -> Result<()> {
    match target {
        Bson::Document(inner) => set(inner, path, value),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once(SEPARATOR) {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let index = head.parse::<usize>().map_err(|_| {
                DocmapError::TypeMismatch(format!(
                    "Cannot create field '{}' in array element '{}'",
                    head, parent
                ))
            })?;
            if index.saturating_sub(items.len()) > MAX_ARRAY_BACKFILL {
                return Err(DocmapError::TypeMismatch(format!(
                    "can't backfill more than {} elements",
                    MAX_ARRAY_BACKFILL
                )));
            }
            while items.len() <= index {
                items.push(Bson::Null);
            }
            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if items[index] == Bson::Null {
                        items[index] = Bson::Document(BsonDocument::new());
                    }
                    set_in(&mut items[index], head, rest, value)
                }
            }
        }
        other => Err(DocmapError::TypeMismatch(format!(
            "Cannot create field '{}' in element '{}' of type {:?}",
            path,
            parent,
            other.element_type()
        ))),
    }
}

/// Removes the value at `path`, returning it if present
///
/// Removing an array element by index replaces it with null, as the engine
/// does for `$unset`.
pub fn remove(doc: &mut BsonDocument, path: &str) -> Option<Bson> {
    match path.rsplit_once(SEPARATOR) {
        None => doc.remove(path),
        Some((parent, last)) => match get_mut(doc, parent)? {
            Bson::Document(inner) => inner.remove(last),
            Bson::Array(items) => {
                let slot = items.get_mut(last.parse::<usize>().ok()?)?;
                Some(std::mem::replace(slot, Bson::Null))
            }
            _ => None,
        },
    }
}

/// Returns true if a value exists at `path`
pub fn contains(doc: &BsonDocument, path: &str) -> bool {
    get(doc, path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_top_level() {
        assert_eq!(top_level("k.kk"), "k");
        assert_eq!(top_level("param"), "param");
    }

    #[test]
    fn test_check_rejects_empty_segments() {
        assert!(check("a.b").is_ok());
        assert!(check("").is_err());
        assert!(check("a..b").is_err());
        assert!(check(".a").is_err());
    }

    #[test]
    fn test_get_nested_and_array() {
        let doc = doc! { "k": { "kk": "A" }, "tags": ["x", "y"] };
        assert_eq!(get(&doc, "k.kk"), Some(&Bson::String("A".to_string())));
        assert_eq!(get(&doc, "tags.1"), Some(&Bson::String("y".to_string())));
        assert_eq!(get(&doc, "k.missing"), None);
        assert_eq!(get(&doc, "tags.7"), None);
        assert_eq!(get(&doc, "k.kk.deeper"), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = doc! {};
        set(&mut doc, "a.b.c", Bson::Int32(1)).unwrap();
        assert_eq!(doc, doc! { "a": { "b": { "c": 1 } } });
    }

    #[test]
    fn test_set_keeps_siblings() {
        let mut doc = doc! { "k": { "f": "F1" } };
        set(&mut doc, "k.kk", Bson::String("A".to_string())).unwrap();
        assert_eq!(doc, doc! { "k": { "f": "F1", "kk": "A" } });
    }

    #[test]
    fn test_set_into_array_pads_with_null() {
        let mut doc = doc! { "tags": ["x"] };
        set(&mut doc, "tags.2", Bson::String("z".to_string())).unwrap();
        assert_eq!(doc, doc! { "tags": ["x", null, "z"] });
    }

    #[test]
    fn test_set_far_past_array_end_fails() {
        let mut doc = doc! { "tags": ["x"] };
        let err = set(&mut doc, "tags.18446744073709551615", Bson::Int32(1)).unwrap_err();
        assert!(matches!(err, DocmapError::TypeMismatch(_)));
        assert_eq!(doc, doc! { "tags": ["x"] });

        let index = format!("tags.{}", MAX_ARRAY_BACKFILL + 2);
        assert!(set(&mut doc, &index, Bson::Int32(1)).is_err());
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = doc! { "a": 5 };
        let err = set(&mut doc, "a.b", Bson::Int32(1)).unwrap_err();
        assert!(matches!(err, DocmapError::TypeMismatch(_)));
        assert_eq!(doc, doc! { "a": 5 });
    }

    #[test]
    fn test_remove() {
        let mut doc = doc! { "k": { "f": "F1", "kk": "A" }, "tags": ["x", "y"] };
        assert_eq!(remove(&mut doc, "k.kk"), Some(Bson::String("A".to_string())));
        assert_eq!(remove(&mut doc, "tags.0"), Some(Bson::String("x".to_string())));
        assert_eq!(remove(&mut doc, "nope.deeper"), None);
        assert_eq!(doc, doc! { "k": { "f": "F1" }, "tags": [null, "y"] });
    }
}
