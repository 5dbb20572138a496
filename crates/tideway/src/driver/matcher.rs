//! Filter matching and sorting for the memory backend

use std::cmp::Ordering;

use bson::{Bson, Document as BsonDocument};

/// Resolve a dotted path inside a document
pub fn lookup<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(sub) => sub.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns true if `doc` satisfies `filter`
pub fn matches(doc: &BsonDocument, filter: &BsonDocument) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => as_filters(condition).iter().all(|f| matches(doc, f)),
        "$or" => as_filters(condition).iter().any(|f| matches(doc, f)),
        "$nor" => !as_filters(condition).iter().any(|f| matches(doc, f)),
        path => matches_condition(lookup(doc, path), condition),
    })
}

fn as_filters(value: &Bson) -> Vec<&BsonDocument> {
    match value {
        Bson::Array(items) => items.iter().filter_map(Bson::as_document).collect(),
        _ => Vec::new(),
    }
}

fn is_operator_document(value: &Bson) -> bool {
    match value {
        Bson::Document(d) => !d.is_empty() && d.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(field: Option<&Bson>, condition: &Bson) -> bool {
    if is_operator_document(condition) {
        let ops = condition.as_document().map(|d| d.iter());
        return ops
            .into_iter()
            .flatten()
            .all(|(op, operand)| matches_operator(field, op, operand));
    }
    equals(field, condition)
}

fn equals(field: Option<&Bson>, expected: &Bson) -> bool {
    match field {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn matches_operator(field: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$eq" => equals(field, operand),
        "$ne" => !equals(field, operand),
        "$gt" => ordered(field, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(field, operand, |o| o != Ordering::Less),
        "$lt" => ordered(field, operand, |o| o == Ordering::Less),
        "$lte" => ordered(field, operand, |o| o != Ordering::Greater),
        "$in" => match operand {
            Bson::Array(options) => options.iter().any(|o| equals(field, o)),
            _ => false,
        },
        "$nin" => match operand {
            Bson::Array(options) => !options.iter().any(|o| equals(field, o)),
            _ => true,
        },
        "$exists" => {
            let wanted = !matches!(operand, Bson::Boolean(false) | Bson::Null);
            field.is_some() == wanted
        }
        _ => false,
    }
}

fn ordered(field: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    field
        .and_then(|value| compare(value, operand))
        .map(accept)
        .unwrap_or(false)
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Equality with numeric widening (1 == 1i64 == 1.0)
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between two comparable values of the same kind
pub fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Sort documents in place by a `{field: 1 | -1}` specification
pub fn sort_documents(docs: &mut [BsonDocument], sort: &BsonDocument) {
    docs.sort_by(|left, right| {
        for (path, direction) in sort {
            let descending = as_f64(direction).map(|d| d < 0.0).unwrap_or(false);
            let ordering = match (lookup(left, path), lookup(right, path)) {
                (Some(l), Some(r)) => compare(l, r).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
