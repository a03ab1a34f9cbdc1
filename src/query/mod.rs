// Query translation - filter/projection/sort values compiled to
// parameterized SQL over the JSON payload column

use crate::document::ID_FIELD;
use crate::error::{JotDbError, Result};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// A filter expression over document fields.
///
/// Filters are immutable value descriptions; nothing touches the engine
/// until the owning query executes. Comparison and membership literals must
/// be JSON scalars. Comparisons against absent fields never match: equality
/// to `null` matches only fields explicitly present with JSON null, and
/// [`Filter::Exists`] / [`Filter::Missing`] distinguish presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    Exists(String),
    Missing(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists(field.into())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Filter::Missing(field.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }
}

/// A declarative find/update/delete specification: filter, projection,
/// ordering and pagination. Building a query performs no I/O.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub(crate) filter: Option<Filter>,
    pub(crate) projection: Option<Vec<String>>,
    pub(crate) sort: Vec<(String, Order)>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
}

impl Query {
    /// Match every document in the collection.
    pub fn all() -> Self {
        Query::default()
    }

    pub fn filter(filter: Filter) -> Self {
        Query {
            filter: Some(filter),
            ..Default::default()
        }
    }

    /// Add a sort key. The identifier is appended as a stable tie-break
    /// when the sort does not already end on it, so repeated executions
    /// return identical ordering.
    pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    /// Restrict returned documents to the given field paths. The full
    /// payload is always fetched and pruning happens after decode, so this
    /// is a convenience reducer, not a storage-level projection. A
    /// projection that omits `id` strips the identifier from results.
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Compile to SQL fragments with bound values. Unsupported operators
    /// and malformed field paths fail here, before anything reaches the
    /// engine.
    pub(crate) fn compile(&self) -> Result<CompiledQuery> {
        let mut params = Vec::new();
        let where_clause = match &self.filter {
            Some(filter) => Some(compile_filter(filter, &mut params)?),
            None => None,
        };
        let order_by = compile_sort(&self.sort)?;
        if let Some(projection) = &self.projection {
            for path in projection {
                parse_path(path)?;
            }
        }
        Ok(CompiledQuery {
            where_clause,
            params,
            order_by,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Query::filter(filter)
    }
}

/// A query compiled to SQL fragments plus the values to bind, in placeholder
/// order. Ordering and pagination apply to reads only; update/delete
/// statements use just the WHERE clause.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub(crate) where_clause: Option<String>,
    pub(crate) params: Vec<SqlValue>,
    pub(crate) order_by: String,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl CompiledQuery {
    pub(crate) fn select_sql(&self, table: &str) -> String {
        let mut sql = format!(r#"SELECT id, data FROM "{table}""#);
        if let Some(clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&self.order_by);
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // OFFSET requires a LIMIT clause; -1 means unbounded
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        sql
    }

    pub(crate) fn delete_sql(&self, table: &str) -> String {
        let mut sql = format!(r#"DELETE FROM "{table}""#);
        if let Some(clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        sql
    }

    pub(crate) fn update_sql(&self, table: &str, set_expr: &str) -> String {
        let mut sql = format!(r#"UPDATE "{table}" SET {set_expr}"#);
        if let Some(clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        sql
    }
}

/// A parsed field path. `id` addresses the identifier column; everything
/// else becomes a JSON path over the payload column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldRef {
    Id,
    JsonPath(String),
}

/// Parse a dot-separated field path into the engine's JSON path syntax.
/// Identifier-like segments map to `.segment`, all-digit segments to array
/// indexes, and segments containing hyphens to quoted keys. Anything else
/// is rejected: the path text is spliced into SQL (values never are), so
/// only this vetted charset may pass through.
pub(crate) fn parse_path(path: &str) -> Result<FieldRef> {
    if path == ID_FIELD {
        return Ok(FieldRef::Id);
    }
    if path.is_empty() {
        return Err(JotDbError::UnsupportedQuery("empty field path".to_string()));
    }

    let mut json_path = String::from("$");
    for segment in path.split('.') {
        let bytes = segment.as_bytes();
        if bytes.is_empty() {
            return Err(malformed(path));
        }
        if bytes.iter().all(|b| b.is_ascii_digit()) {
            json_path.push('[');
            json_path.push_str(segment);
            json_path.push(']');
        } else if !bytes[0].is_ascii_digit()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            json_path.push('.');
            json_path.push_str(segment);
        } else if bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
        {
            json_path.push_str(&format!(".\"{segment}\""));
        } else {
            return Err(malformed(path));
        }
    }
    Ok(FieldRef::JsonPath(json_path))
}

fn malformed(path: &str) -> JotDbError {
    JotDbError::UnsupportedQuery(format!("malformed field path: {path:?}"))
}

/// JSON value extraction expression for a field.
fn extract_expr(field: &FieldRef) -> String {
    match field {
        FieldRef::Id => "id".to_string(),
        FieldRef::JsonPath(path) => format!("json_extract(data, '{path}')"),
    }
}

/// Expression distinguishing a present-with-null field from an absent one.
/// `json_extract` collapses both to SQL NULL; `json_type` returns the text
/// 'null' for an explicit JSON null and SQL NULL only for absence.
fn null_test(path: &str) -> String {
    format!("json_type(data, '{path}') = 'null'")
}

/// Bind a scalar literal. Booleans extract as 0/1 integers and numbers keep
/// the engine's integer/real distinction; no string/number coercion happens
/// here or in the engine.
fn bind_scalar(field: &str, value: &Value, params: &mut Vec<SqlValue>) -> Result<()> {
    let bound = match value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                return Err(JotDbError::UnsupportedQuery(format!(
                    "numeric literal for {field:?} out of range: {n}"
                )));
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => {
            return Err(JotDbError::UnsupportedQuery(format!(
                "comparison against {field:?} requires a scalar literal, got {value}"
            )))
        }
    };
    params.push(bound);
    Ok(())
}

fn compile_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> Result<String> {
    match filter {
        Filter::Eq(field, value) => {
            let field_ref = parse_path(field)?;
            match (&field_ref, value) {
                // matches only fields explicitly present with JSON null
                (FieldRef::JsonPath(path), Value::Null) => Ok(null_test(path)),
                // the identifier is never null
                (FieldRef::Id, Value::Null) => Ok("0".to_string()),
                _ => {
                    bind_scalar(field, value, params)?;
                    Ok(format!("{} = ?", extract_expr(&field_ref)))
                }
            }
        }
        Filter::Ne(field, value) => {
            let field_ref = parse_path(field)?;
            match (&field_ref, value) {
                // present and not JSON null; absent fields never match
                (FieldRef::JsonPath(path), Value::Null) => Ok(format!(
                    "(json_type(data, '{path}') IS NOT NULL AND NOT {})",
                    null_test(path)
                )),
                (FieldRef::Id, Value::Null) => Ok("1".to_string()),
                _ => {
                    bind_scalar(field, value, params)?;
                    Ok(format!("{} <> ?", extract_expr(&field_ref)))
                }
            }
        }
        Filter::Lt(field, value) => compile_ordering(field, "<", value, params),
        Filter::Lte(field, value) => compile_ordering(field, "<=", value, params),
        Filter::Gt(field, value) => compile_ordering(field, ">", value, params),
        Filter::Gte(field, value) => compile_ordering(field, ">=", value, params),
        Filter::In(field, values) => {
            let field_ref = parse_path(field)?;
            // the empty set matches nothing
            if values.is_empty() {
                return Ok("0".to_string());
            }
            let mut null_in_list = false;
            let mut placeholders = Vec::new();
            for value in values {
                if value.is_null() {
                    null_in_list = true;
                    continue;
                }
                bind_scalar(field, value, params)?;
                placeholders.push("?");
            }
            let membership = (!placeholders.is_empty())
                .then(|| format!("{} IN ({})", extract_expr(&field_ref), placeholders.join(", ")));
            let null_clause = null_in_list.then(|| match &field_ref {
                FieldRef::JsonPath(path) => null_test(path),
                FieldRef::Id => "0".to_string(),
            });
            match (membership, null_clause) {
                (Some(m), Some(n)) => Ok(format!("({m} OR {n})")),
                (Some(m), None) => Ok(m),
                (None, Some(n)) => Ok(n),
                (None, None) => Ok("0".to_string()),
            }
        }
        Filter::Exists(field) => match parse_path(field)? {
            FieldRef::Id => Ok("1".to_string()),
            FieldRef::JsonPath(path) => Ok(format!("json_type(data, '{path}') IS NOT NULL")),
        },
        Filter::Missing(field) => match parse_path(field)? {
            FieldRef::Id => Ok("0".to_string()),
            FieldRef::JsonPath(path) => Ok(format!("json_type(data, '{path}') IS NULL")),
        },
        Filter::And(filters) => {
            if filters.is_empty() {
                return Ok("1".to_string());
            }
            let parts = filters
                .iter()
                .map(|f| compile_filter(f, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                return Ok("0".to_string());
            }
            let parts = filters
                .iter()
                .map(|f| compile_filter(f, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        Filter::Not(inner) => Ok(format!("NOT ({})", compile_filter(inner, params)?)),
    }
}

fn compile_ordering(
    field: &str,
    op: &str,
    value: &Value,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    if value.is_null() {
        return Err(JotDbError::UnsupportedQuery(format!(
            "ordering comparison against null for {field:?}"
        )));
    }
    let field_ref = parse_path(field)?;
    bind_scalar(field, value, params)?;
    Ok(format!("{} {op} ?", extract_expr(&field_ref)))
}

fn compile_sort(sort: &[(String, Order)]) -> Result<String> {
    let mut terms = Vec::new();
    let mut ends_on_id = false;
    for (field, order) in sort {
        let field_ref = parse_path(field)?;
        ends_on_id = field_ref == FieldRef::Id;
        terms.push(format!("{} {}", extract_expr(&field_ref), order.as_sql()));
    }
    if !ends_on_id {
        // stable tie-break so repeated executions agree
        terms.push("id ASC".to_string());
    }
    Ok(terms.join(", "))
}

/// Reduce a decoded document to the projected field paths. Paths absent
/// from the document are omitted from the result; non-object documents pass
/// through unchanged.
pub(crate) fn project(document: &Value, fields: &[String]) -> Value {
    if !document.is_object() {
        return document.clone();
    }
    let mut out = serde_json::Map::new();
    for path in fields {
        let segments: Vec<&str> = path.split('.').collect();
        if let Some(value) = lookup(document, &segments) {
            insert_at(&mut out, &segments, value.clone());
        }
    }
    Value::Object(out)
}

fn lookup<'a>(mut current: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn insert_at(target: &mut serde_json::Map<String, Value>, segments: &[&str], value: Value) {
    if segments.len() == 1 {
        target.insert(segments[0].to_string(), value);
        return;
    }
    let entry = target
        .entry(segments[0].to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(inner) = entry {
        insert_at(inner, &segments[1..], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(filter: Filter) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let sql = compile_filter(&filter, &mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("id").unwrap(), FieldRef::Id);
        assert_eq!(
            parse_path("age").unwrap(),
            FieldRef::JsonPath("$.age".to_string())
        );
        assert_eq!(
            parse_path("owner.name").unwrap(),
            FieldRef::JsonPath("$.owner.name".to_string())
        );
        assert_eq!(
            parse_path("tags.0").unwrap(),
            FieldRef::JsonPath("$.tags[0]".to_string())
        );
        assert_eq!(
            parse_path("meta.content-type").unwrap(),
            FieldRef::JsonPath("$.meta.\"content-type\"".to_string())
        );
    }

    #[test]
    fn test_parse_path_malformed() {
        for bad in ["", ".", "a..b", "a.", "semi;colon", "q'uote", "sp ace", "a.b!c"] {
            let err = parse_path(bad).unwrap_err();
            assert!(matches!(err, JotDbError::UnsupportedQuery(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_eq_scalar() {
        let (sql, params) = compile(Filter::eq("name", "Luna"));
        assert_eq!(sql, "json_extract(data, '$.name') = ?");
        assert_eq!(params, vec![SqlValue::Text("Luna".to_string())]);

        let (sql, params) = compile(Filter::eq("age", 4));
        assert_eq!(sql, "json_extract(data, '$.age') = ?");
        assert_eq!(params, vec![SqlValue::Integer(4)]);

        let (_, params) = compile(Filter::eq("good", true));
        assert_eq!(params, vec![SqlValue::Integer(1)]);

        let (_, params) = compile(Filter::eq("weight", 3.5));
        assert_eq!(params, vec![SqlValue::Real(3.5)]);
    }

    #[test]
    fn test_eq_null_uses_json_type() {
        let (sql, params) = compile(Filter::eq("owner", Value::Null));
        assert_eq!(sql, "json_type(data, '$.owner') = 'null'");
        assert!(params.is_empty());
    }

    #[test]
    fn test_eq_on_identifier_column() {
        let (sql, params) = compile(Filter::eq("id", "luna"));
        assert_eq!(sql, "id = ?");
        assert_eq!(params, vec![SqlValue::Text("luna".to_string())]);
    }

    #[test]
    fn test_exists_and_missing() {
        let (sql, _) = compile(Filter::exists("owner"));
        assert_eq!(sql, "json_type(data, '$.owner') IS NOT NULL");

        let (sql, _) = compile(Filter::missing("owner"));
        assert_eq!(sql, "json_type(data, '$.owner') IS NULL");

        let (sql, _) = compile(Filter::exists("id"));
        assert_eq!(sql, "1");
    }

    #[test]
    fn test_in_list() {
        let (sql, params) = compile(Filter::is_in("type", ["dog", "cat"]));
        assert_eq!(sql, "json_extract(data, '$.type') IN (?, ?)");
        assert_eq!(params.len(), 2);

        // the empty set matches nothing
        let (sql, params) = compile(Filter::In("type".to_string(), vec![]));
        assert_eq!(sql, "0");
        assert!(params.is_empty());

        // null in the list matches explicit-null fields
        let (sql, _) = compile(Filter::In(
            "type".to_string(),
            vec![json!("dog"), Value::Null],
        ));
        assert_eq!(
            sql,
            "(json_extract(data, '$.type') IN (?) OR json_type(data, '$.type') = 'null')"
        );
    }

    #[test]
    fn test_connectives() {
        let (sql, params) = compile(Filter::and([
            Filter::eq("type", "dog"),
            Filter::or([Filter::gt("age", 3), Filter::missing("age")]),
        ]));
        assert_eq!(
            sql,
            "(json_extract(data, '$.type') = ? AND \
             (json_extract(data, '$.age') > ? OR json_type(data, '$.age') IS NULL))"
        );
        assert_eq!(params.len(), 2);

        let (sql, _) = compile(Filter::not(Filter::eq("type", "cat")));
        assert_eq!(sql, "NOT (json_extract(data, '$.type') = ?)");
    }

    #[test]
    fn test_unsupported_literals() {
        let mut params = Vec::new();
        for filter in [
            Filter::eq("tags", json!(["a"])),
            Filter::eq("meta", json!({"k": 1})),
            Filter::lt("age", Value::Null),
            Filter::gt("bad path!", 1),
        ] {
            let err = compile_filter(&filter, &mut params).unwrap_err();
            assert!(matches!(err, JotDbError::UnsupportedQuery(_)), "{filter:?}");
        }
    }

    #[test]
    fn test_sort_tie_break() {
        let sql = compile_sort(&[("age".to_string(), Order::Asc)]).unwrap();
        assert_eq!(sql, "json_extract(data, '$.age') ASC, id ASC");

        // no duplicate tie-break when the sort already ends on the identifier
        let sql = compile_sort(&[
            ("age".to_string(), Order::Desc),
            ("id".to_string(), Order::Desc),
        ])
        .unwrap();
        assert_eq!(sql, "json_extract(data, '$.age') DESC, id DESC");

        let sql = compile_sort(&[]).unwrap();
        assert_eq!(sql, "id ASC");
    }

    #[test]
    fn test_select_sql() {
        let compiled = Query::filter(Filter::eq("type", "dog"))
            .sort("age", Order::Asc)
            .limit(10)
            .offset(5)
            .compile()
            .unwrap();
        assert_eq!(
            compiled.select_sql("col_animals"),
            "SELECT id, data FROM \"col_animals\" \
             WHERE json_extract(data, '$.type') = ? \
             ORDER BY json_extract(data, '$.age') ASC, id ASC LIMIT 10 OFFSET 5"
        );

        let compiled = Query::all().offset(3).compile().unwrap();
        assert_eq!(
            compiled.select_sql("col_animals"),
            "SELECT id, data FROM \"col_animals\" ORDER BY id ASC LIMIT -1 OFFSET 3"
        );
    }

    #[test]
    fn test_update_and_delete_sql() {
        let compiled = Query::filter(Filter::eq("type", "dog")).compile().unwrap();
        assert_eq!(
            compiled.delete_sql("col_animals"),
            "DELETE FROM \"col_animals\" WHERE json_extract(data, '$.type') = ?"
        );
        assert_eq!(
            compiled.update_sql("col_animals", "data = ?"),
            "UPDATE \"col_animals\" SET data = ? WHERE json_extract(data, '$.type') = ?"
        );
    }

    #[test]
    fn test_compile_fails_fast_on_projection() {
        let err = Query::all().project(["a..b"]).compile().unwrap_err();
        assert!(matches!(err, JotDbError::UnsupportedQuery(_)));
    }

    #[test]
    fn test_project() {
        let doc = json!({
            "id": "luna",
            "name": "Luna",
            "age": 2,
            "owner": {"name": "Ada", "city": "Oslo"}
        });

        let pruned = project(&doc, &["name".to_string(), "owner.city".to_string()]);
        assert_eq!(pruned, json!({"name": "Luna", "owner": {"city": "Oslo"}}));

        // id survives only when projected
        let pruned = project(&doc, &["id".to_string(), "age".to_string()]);
        assert_eq!(pruned, json!({"id": "luna", "age": 2}));

        // absent paths are omitted
        let pruned = project(&doc, &["ghost".to_string()]);
        assert_eq!(pruned, json!({}));
    }
}
