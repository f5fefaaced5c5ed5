//! Named to positional parameter expansion for drivers that only accept `?`.

use std::collections::BTreeMap;

use super::QueryError;
use crate::codec::DbValue;

/// Rewrites `:name` placeholders as `?` and returns the values in
/// placeholder order. A [`DbValue::LongList`] expands to one placeholder per
/// element; an empty list becomes `NULL` so `IN (...)` stays valid and
/// matches nothing. Quoted text is copied untouched.
///
/// # Errors
///
/// Returns [`QueryError::InvalidArgument`] for a placeholder with no value.
pub fn expand_named_parameters(
    sql: &str,
    params: &BTreeMap<String, DbValue>,
) -> Result<(String, Vec<DbValue>), QueryError> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if chars
                .peek()
                .is_some_and(|&(_, next)| next.is_ascii_alphanumeric() || next == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, next)) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    end = j + next.len_utf8();
                    chars.next();
                }
                let name = &sql[start..end];
                let value = params.get(name).ok_or_else(|| {
                    QueryError::InvalidArgument(format!("No value bound for parameter :{name}"))
                })?;
                push_placeholder(&mut out, &mut values, value);
            }
            _ => out.push(c),
        }
    }
    Ok((out, values))
}

fn push_placeholder(out: &mut String, values: &mut Vec<DbValue>, value: &DbValue) {
    match value {
        DbValue::LongList(ids) if ids.is_empty() => out.push_str("NULL"),
        DbValue::LongList(ids) => {
            out.push_str(&vec!["?"; ids.len()].join(", "));
            values.extend(ids.iter().copied().map(DbValue::Long));
        }
        other => {
            out.push('?');
            values.push(other.clone());
        }
    }
}
