//! SQL templating.
//!
//! Substitutes `${name}` placeholders with rendered parameter values. This is
//! plain text substitution: the SQL itself is never parsed, and substituted
//! text is never rescanned for further placeholders.

mod value;

pub use value::{is_valid_identifier, IdentifierKind, Scalar, TemplateValue};

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{QuarryError, Result};

/// Matches `${name}` and the escaped form `$${name}`.
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(\$)?\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Query text plus the parameters bound to its placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryTemplate {
    sql: String,
    params: BTreeMap<String, TemplateValue>,
}

impl QueryTemplate {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    /// Binds a parameter, replacing any earlier binding of the same name.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Binds every parameter in `params`.
    pub fn bind_all<I, K>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, TemplateValue)>,
        K: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &BTreeMap<String, TemplateValue> {
        &self.params
    }

    /// Names of the placeholders the text references, in order of first use.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for caps in placeholder_pattern().captures_iter(&self.sql) {
            if caps.get(1).is_some() {
                continue;
            }
            if let Some(name) = caps.get(2).map(|m| m.as_str()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Produces the final SQL text.
    pub fn resolve(&self) -> Result<String> {
        resolve(&self.sql, &self.params)
    }
}

/// Replaces every `${name}` in `sql` with the rendered value of `params[name]`.
///
/// `$${name}` yields a literal `${name}`. A referenced name with no binding
/// fails with [`QuarryError::UnboundParameter`].
pub fn resolve(sql: &str, params: &BTreeMap<String, TemplateValue>) -> Result<String> {
    let mut output = String::with_capacity(sql.len());
    let mut last = 0;

    for caps in placeholder_pattern().captures_iter(sql) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        output.push_str(&sql[last..whole.start()]);
        last = whole.end();

        let name = &caps[2];
        if caps.get(1).is_some() {
            output.push_str("${");
            output.push_str(name);
            output.push('}');
            continue;
        }

        let value = params
            .get(name)
            .ok_or_else(|| QuarryError::UnboundParameter {
                name: name.to_string(),
            })?;
        output.push_str(&value.render(name)?);
    }

    output.push_str(&sql[last..]);
    Ok(output)
}

/// Where query text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// Inline SQL.
    Sql(String),
    /// A file holding the SQL.
    File(PathBuf),
}

impl QuerySource {
    /// Treats `input` as a file path when it ends in `.sql`, otherwise as
    /// inline SQL.
    pub fn detect(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.to_ascii_lowercase().ends_with(".sql") && !trimmed.contains('\n') {
            Self::File(PathBuf::from(trimmed))
        } else {
            Self::Sql(input.to_string())
        }
    }

    /// Returns the SQL text, reading the file if needed.
    pub fn load(&self) -> Result<String> {
        match self {
            Self::Sql(sql) => Ok(sql.clone()),
            Self::File(path) => std::fs::read_to_string(path).map_err(QuarryError::from),
        }
    }

    /// Loads the SQL text and wraps it in a template.
    pub fn into_template(self) -> Result<QueryTemplate> {
        Ok(QueryTemplate::new(self.load()?))
    }
}

impl From<&str> for QuerySource {
    fn from(sql: &str) -> Self {
        Self::Sql(sql.to_string())
    }
}

impl From<String> for QuerySource {
    fn from(sql: String) -> Self {
        Self::Sql(sql)
    }
}

impl From<PathBuf> for QuerySource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for QuerySource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn assert_parses(sql: &str) {
        if let Err(e) = Parser::parse_sql(&GenericDialect {}, sql) {
            panic!("{sql:?} does not parse: {e}");
        }
    }

    #[test]
    fn test_resolve_identifiers_and_number() {
        let sql = QueryTemplate::new("SELECT * FROM ${schema}.${table} WHERE age > ${age}")
            .bind("schema", TemplateValue::schema("main"))
            .bind("table", TemplateValue::table("users"))
            .bind("age", 14)
            .resolve()
            .unwrap();

        assert_eq!(sql, "SELECT * FROM main.users WHERE age > 14");
        assert_parses(&sql);
    }

    #[test]
    fn test_unbound_parameter() {
        let err = QueryTemplate::new("SELECT ${a}, ${b}")
            .bind("a", 1)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, QuarryError::UnboundParameter { ref name } if name == "b"));
    }

    #[test]
    fn test_unused_parameters_are_ignored() {
        let sql = QueryTemplate::new("SELECT 1").bind("unused", "x").resolve().unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_no_recursive_expansion() {
        let sql = QueryTemplate::new("SELECT ${a}")
            .bind("a", "${b}")
            .bind("b", 2)
            .resolve()
            .unwrap();
        assert_eq!(sql, "SELECT '${b}'");

        let sql = QueryTemplate::new("SELECT ${a}")
            .bind("a", TemplateValue::raw("${b}"))
            .resolve()
            .unwrap();
        assert_eq!(sql, "SELECT ${b}");
    }

    #[test]
    fn test_escaped_placeholder() {
        let sql = QueryTemplate::new("SELECT '$${literal}', ${x}")
            .bind("x", 1)
            .resolve()
            .unwrap();
        assert_eq!(sql, "SELECT '${literal}', 1");
    }

    #[test]
    fn test_non_identifier_braces_pass_through() {
        let sql = QueryTemplate::new("SELECT '${not an ident}', '$5'")
            .resolve()
            .unwrap();
        assert_eq!(sql, "SELECT '${not an ident}', '$5'");
    }

    #[test]
    fn test_repeated_placeholder() {
        let template = QueryTemplate::new("SELECT ${v} WHERE a = ${v} OR b = ${w}")
            .bind("v", 3)
            .bind("w", 4);
        assert_eq!(template.placeholders(), vec!["v", "w"]);
        assert_eq!(
            template.resolve().unwrap(),
            "SELECT 3 WHERE a = 3 OR b = 4"
        );
    }

    #[test]
    fn test_every_value_kind_parses() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let sql = QueryTemplate::new(
            "SELECT id FROM ${db}.${table} \
             WHERE name = ${name} AND score >= ${score} AND active = ${active} \
             AND created = ${created} AND seen_at < ${seen} AND deleted IS ${deleted} \
             AND kind IN ${kinds} AND tag IN ${tags} AND ${predicate}",
        )
        .bind("db", TemplateValue::database("analytics"))
        .bind("table", TemplateValue::table("events"))
        .bind("name", "O'Brien")
        .bind("score", 0.75)
        .bind("active", true)
        .bind("created", date)
        .bind("seen", date.and_hms_milli_opt(12, 30, 1, 5).unwrap())
        .bind("deleted", TemplateValue::null())
        .bind("kinds", TemplateValue::list(["a", "b"]))
        .bind("tags", TemplateValue::list(Vec::<String>::new()))
        .bind("predicate", TemplateValue::raw("1 = 1"))
        .resolve()
        .unwrap();

        assert_eq!(
            sql,
            "SELECT id FROM analytics.events \
             WHERE name = 'O''Brien' AND score >= 0.75 AND active = TRUE \
             AND created = DATE '2024-01-31' AND seen_at < TIMESTAMP '2024-01-31 12:30:01.005' \
             AND deleted IS NULL AND kind IN ('a', 'b') AND tag IN (NULL) AND 1 = 1"
        );
        assert_parses(&sql);
    }

    #[test]
    fn test_quoted_string_survives_injection_attempt() {
        let sql = QueryTemplate::new("SELECT * FROM t WHERE name = ${name}")
            .bind("name", "x'; DROP TABLE t; --")
            .resolve()
            .unwrap();
        let statements = Parser::parse_sql(&GenericDialect {}, &sql).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_invalid_identifiers_fail_before_rendering() {
        for bad in ["users; DROP TABLE t", "users t", "users\n"] {
            let err = QueryTemplate::new("SELECT * FROM ${table}")
                .bind("table", TemplateValue::table(bad))
                .resolve()
                .unwrap_err();
            assert!(matches!(err, QuarryError::InvalidIdentifier { .. }));
        }
    }

    #[test]
    fn test_query_source_detect_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.sql");
        std::fs::write(&path, "SELECT ${n}").unwrap();

        let source = QuerySource::detect(path.to_str().unwrap());
        assert_eq!(source, QuerySource::File(path.clone()));
        let sql = source.into_template().unwrap().bind("n", 1).resolve().unwrap();
        assert_eq!(sql, "SELECT 1");

        assert_eq!(
            QuerySource::detect("SELECT 1"),
            QuerySource::Sql("SELECT 1".to_string())
        );
    }

    #[test]
    fn test_query_source_missing_file() {
        let err = QuerySource::File(PathBuf::from("/nonexistent/q.sql"))
            .load()
            .unwrap_err();
        assert!(matches!(err, QuarryError::Io(_)));
    }
}
