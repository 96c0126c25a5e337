//! SQL generation: merged JSON collection → `<label>_output.sql`.
//!
//! [`TemplateSqlGenerator`] is deterministic: the same merged file always
//! produces the same bytes. [`LlmSqlGenerator`] hands the records to the
//! language model instead.

use crate::config::{SqlMode, WorkflowConfig};
use crate::error::Exam2SqlError;
use crate::layout::{read_json, sql_output_path, write_atomic};
use crate::pipeline::llm::{LanguageModel, ModelRequest};
use crate::pipeline::postprocess::clean_sql;
use crate::prompts::{sql_user_message, SQL_SYSTEM_PROMPT};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Writes SQL for a merged collection.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Write `<sql_dir>/<label>_output.sql` from `merged` and return its path.
    async fn generate(
        &self,
        merged: &Path,
        label: &str,
        sql_dir: &Path,
    ) -> Result<PathBuf, Exam2SqlError>;
}

/// Pick the generator for `config.sql_mode`.
pub fn generator_for(
    config: &WorkflowConfig,
    model: Arc<dyn LanguageModel>,
) -> Arc<dyn SqlGenerator> {
    match config.sql_mode {
        SqlMode::Template => Arc::new(TemplateSqlGenerator::new(
            &config.sql_table,
            config.create_table,
        )),
        SqlMode::Llm => Arc::new(LlmSqlGenerator::new(model, &config.sql_table)),
    }
}

fn read_records(merged: &Path) -> Result<Vec<Value>, Exam2SqlError> {
    match read_json::<Value>(merged)? {
        Value::Array(items) => Ok(items),
        _ => Err(Exam2SqlError::SqlGenerationFailed {
            detail: format!("'{}' does not hold a JSON list", merged.display()),
        }),
    }
}

fn write_output(sql_dir: &Path, label: &str, sql: &str) -> Result<PathBuf, Exam2SqlError> {
    let path = sql_output_path(sql_dir, label);
    write_atomic(&path, sql.as_bytes())?;
    info!("SQL written to {} ({} bytes)", path.display(), sql.len());
    Ok(path)
}

// ── Template generator ───────────────────────────────────────────────────

/// Deterministic `CREATE TABLE` + `INSERT` generator.
#[derive(Debug, Clone)]
pub struct TemplateSqlGenerator {
    table: String,
    create_table: bool,
}

impl TemplateSqlGenerator {
    pub fn new(table: impl Into<String>, create_table: bool) -> Self {
        Self {
            table: table.into(),
            create_table,
        }
    }

    /// Render SQL for `records`. `label` only appears in the header comment.
    pub fn render(&self, records: &[Value], label: &str) -> String {
        let mut sql = String::new();
        let _ = writeln!(sql, "-- SQL generated from {label}");
        let _ = writeln!(sql, "-- {} records", records.len());
        sql.push('\n');

        let columns = infer_columns(records);
        let table = quote_ident(&self.table);

        if self.create_table && !columns.is_empty() {
            let _ = writeln!(sql, "CREATE TABLE IF NOT EXISTS {table} (");
            let defs: Vec<String> = columns
                .iter()
                .map(|(name, ty)| format!("    {} {}", quote_ident(name), ty.as_sql()))
                .collect();
            sql.push_str(&defs.join(",\n"));
            sql.push_str("\n);\n\n");
        }

        for (idx, record) in records.iter().enumerate() {
            match record {
                Value::Object(map) if !map.is_empty() => {
                    sql.push_str(&insert_statement(&table, map));
                    sql.push('\n');
                }
                other => {
                    let _ = writeln!(
                        sql,
                        "-- skipped record {}: {}",
                        idx + 1,
                        one_line(&other.to_string())
                    );
                }
            }
        }
        sql
    }
}

#[async_trait]
impl SqlGenerator for TemplateSqlGenerator {
    async fn generate(
        &self,
        merged: &Path,
        label: &str,
        sql_dir: &Path,
    ) -> Result<PathBuf, Exam2SqlError> {
        let records = read_records(merged)?;
        let sql = self.render(&records, label);
        write_output(sql_dir, label, &sql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ColumnType {
    Boolean,
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn of(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Real),
            _ => Some(ColumnType::Text),
        }
    }

    /// The narrowest type holding both.
    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Real) | (Real, Integer) => Real,
            _ => Text,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

/// Columns of all object records, sorted by name.
fn infer_columns(records: &[Value]) -> BTreeMap<String, ColumnType> {
    let mut columns: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();
    for map in records.iter().filter_map(Value::as_object) {
        for (key, value) in map {
            let slot = columns.entry(key.clone()).or_insert(None);
            *slot = match (*slot, ColumnType::of(value)) {
                (None, t) => t,
                (Some(a), Some(b)) => Some(a.widen(b)),
                (Some(a), None) => Some(a),
            };
        }
    }
    columns
        .into_iter()
        .map(|(k, t)| (k, t.unwrap_or(ColumnType::Text)))
        .collect()
}

fn insert_statement(table: &str, map: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let cols: Vec<String> = keys.iter().map(|k| quote_ident(k)).collect();
    let vals: Vec<String> = keys.iter().map(|k| sql_literal(&map[k.as_str()])).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({});",
        table,
        cols.join(", "),
        vals.join(", ")
    )
}

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL literal for a JSON value. Arrays and objects become JSON text.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        Value::Array(_) | Value::Object(_) => quote_str(&value.to_string()),
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn one_line(s: &str) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    if flat.chars().count() > 60 {
        format!("{}...", flat.chars().take(60).collect::<String>())
    } else {
        flat
    }
}

// ── LLM generator ────────────────────────────────────────────────────────

/// Generator that asks the language model to write the SQL.
pub struct LlmSqlGenerator {
    model: Arc<dyn LanguageModel>,
    table: String,
}

impl LlmSqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, table: impl Into<String>) -> Self {
        Self {
            model,
            table: table.into(),
        }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(
        &self,
        merged: &Path,
        label: &str,
        sql_dir: &Path,
    ) -> Result<PathBuf, Exam2SqlError> {
        let records = read_records(merged)?;
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| Exam2SqlError::json(merged, e))?;

        let reply = self
            .model
            .complete(ModelRequest {
                system: SQL_SYSTEM_PROMPT.to_string(),
                user: sql_user_message(&self.table, &json),
                images: Vec::new(),
            })
            .await?;

        let sql = clean_sql(&reply.content);
        if sql.trim().is_empty() {
            return Err(Exam2SqlError::SqlGenerationFailed {
                detail: "the model returned no SQL".to_string(),
            });
        }
        write_output(sql_dir, label, &sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ModelReply;
    use serde_json::json;

    #[test]
    fn literals_are_escaped() {
        assert_eq!(sql_literal(&json!("it's")), "'it''s'");
        assert_eq!(sql_literal(&json!(null)), "NULL");
        assert_eq!(sql_literal(&json!(true)), "TRUE");
        assert_eq!(sql_literal(&json!(2.5)), "2.5");
        assert_eq!(sql_literal(&json!(["a", "b"])), "'[\"a\",\"b\"]'");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn columns_widen_across_records() {
        let cols = infer_columns(&[
            json!({"marks": 2, "answer": null, "ok": true}),
            json!({"marks": 2.5, "answer": "b", "ok": false}),
            json!({"marks": 1, "ok": "yes"}),
        ]);
        assert_eq!(cols["marks"], ColumnType::Real);
        assert_eq!(cols["answer"], ColumnType::Text);
        assert_eq!(cols["ok"], ColumnType::Text);
    }

    #[test]
    fn render_template() {
        let gen = TemplateSqlGenerator::new("questions", true);
        let sql = gen.render(
            &[
                json!({"question_number": "1", "marks": 2, "options": ["x", "y"]}),
                json!("stray"),
            ],
            "exam_2024.pdf",
        );

        assert!(sql.starts_with("-- SQL generated from exam_2024.pdf\n"));
        assert!(sql.contains(
            "CREATE TABLE IF NOT EXISTS \"questions\" (\n    \"marks\" INTEGER,\n    \"options\" TEXT,\n    \"question_number\" TEXT\n);"
        ));
        assert!(sql.contains(
            "INSERT INTO \"questions\" (\"marks\", \"options\", \"question_number\") VALUES (2, '[\"x\",\"y\"]', '1');"
        ));
        assert!(sql.contains("-- skipped record 2: \"stray\""));
    }

    #[test]
    fn render_without_create_table() {
        let gen = TemplateSqlGenerator::new("q", false);
        let sql = gen.render(&[json!({"a": 1})], "l");
        assert!(!sql.contains("CREATE TABLE"));
        assert!(sql.contains("INSERT INTO \"q\" (\"a\") VALUES (1);"));
    }

    #[tokio::test]
    async fn template_generation_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let merged = tmp.path().join("merged_data.json");
        std::fs::write(&merged, r#"[{"b": 1, "a": "x"}, {"a": "y"}]"#).unwrap();
        let sql_dir = tmp.path().join("sql_outputs");
        let gen = TemplateSqlGenerator::new("questions", true);

        let p1 = gen.generate(&merged, "exam.pdf", &sql_dir).await.unwrap();
        let b1 = std::fs::read(&p1).unwrap();
        let p2 = gen.generate(&merged, "exam.pdf", &sql_dir).await.unwrap();
        assert_eq!(p1, sql_dir.join("exam.pdf_output.sql"));
        assert_eq!(b1, std::fs::read(&p2).unwrap());
    }

    #[tokio::test]
    async fn non_list_merged_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let merged = tmp.path().join("merged_data.json");
        std::fs::write(&merged, r#"{"a": 1}"#).unwrap();
        let err = TemplateSqlGenerator::new("q", true)
            .generate(&merged, "l", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Exam2SqlError::SqlGenerationFailed { .. }));
    }

    struct FixedModel(&'static str);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, request: ModelRequest) -> Result<ModelReply, Exam2SqlError> {
            assert!(request.user.starts_with("Table name: questions"));
            assert!(request.images.is_empty());
            Ok(ModelReply {
                content: self.0.to_string(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn llm_generator_strips_fences() {
        let tmp = tempfile::tempdir().unwrap();
        let merged = tmp.path().join("merged_data.json");
        std::fs::write(&merged, r#"[{"a": 1}]"#).unwrap();
        let gen = LlmSqlGenerator::new(
            Arc::new(FixedModel("```sql\nINSERT INTO questions (a) VALUES (1);\n```")),
            "questions",
        );

        let path = gen.generate(&merged, "exam.pdf", tmp.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "INSERT INTO questions (a) VALUES (1);\n"
        );
    }

    #[tokio::test]
    async fn llm_generator_rejects_empty_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let merged = tmp.path().join("merged_data.json");
        std::fs::write(&merged, "[1]").unwrap();
        let gen = LlmSqlGenerator::new(Arc::new(FixedModel("  ")), "questions");
        let err = gen.generate(&merged, "exam.pdf", tmp.path()).await.unwrap_err();
        assert!(matches!(err, Exam2SqlError::SqlGenerationFailed { .. }));
        assert!(!tmp.path().join("exam.pdf_output.sql").exists());
    }
}
