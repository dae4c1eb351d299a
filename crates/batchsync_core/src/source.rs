//! Source tables read by initial loads.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// A foreign key from one table to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referenced table.
    pub foreign_table: String,
    /// Local columns.
    pub columns: Vec<String>,
}

/// Definition of a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Column names in order.
    pub columns: Vec<String>,
    /// Primary key columns.
    pub pk_columns: Vec<String>,
    /// Outgoing foreign keys.
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    /// Creates a table whose first column is the primary key.
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            pk_columns: columns.first().map(|c| vec![c.to_string()]).unwrap_or_default(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a foreign key to `foreign_table`.
    #[must_use]
    pub fn with_foreign_key(mut self, foreign_table: impl Into<String>, columns: &[&str]) -> Self {
        self.foreign_keys.push(ForeignKey {
            foreign_table: foreign_table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Tables this one references, self references excluded.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.foreign_table.as_str())
            .filter(move |t| !t.eq_ignore_ascii_case(&self.name))
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }
}

/// A selected row in capture encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    /// All columns.
    pub row_data: String,
    /// Primary key columns.
    pub pk_data: String,
}

/// Encodes values the way captured rows are encoded: quoted, comma separated,
/// with NULL as an empty unquoted field.
pub fn csv_row<S: AsRef<str>>(values: &[Option<S>]) -> String {
    values
        .iter()
        .map(|v| match v {
            Some(v) => format!("\"{}\"", v.as_ref().replace('"', "\"\"")),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Read access to the source database.
pub trait SourceDatabase: Send + Sync {
    /// Definition of a table, matched case-insensitively.
    fn table(&self, name: &str) -> Option<TableDef>;

    /// All table definitions.
    fn tables(&self) -> Vec<TableDef>;

    /// Exact row count with an optional reload predicate.
    fn count_rows(&self, table: &str, predicate: Option<&str>) -> CoreResult<u64>;

    /// Cheap approximate row count.
    fn estimated_row_count(&self, table: &str) -> CoreResult<u64>;

    /// Rows in primary key order, skipping `offset` and returning at most `limit`.
    fn select_rows(
        &self,
        table: &str,
        predicate: Option<&str>,
        offset: u64,
        limit: Option<u64>,
    ) -> CoreResult<Vec<SourceRow>>;
}

/// Row filter understood by [`MemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    All,
    Equals { column: String, value: String },
}

impl Predicate {
    fn parse(predicate: Option<&str>) -> CoreResult<Self> {
        let text = predicate.map(str::trim).unwrap_or_default();
        if text.is_empty() || text.replace(' ', "") == "1=1" {
            return Ok(Self::All);
        }
        match text.split_once('=') {
            Some((column, value)) if !column.trim().is_empty() => Ok(Self::Equals {
                column: column.trim().to_string(),
                value: value.trim().trim_matches('\'').to_string(),
            }),
            _ => Err(CoreError::validation(format!(
                "unsupported reload predicate: {text}"
            ))),
        }
    }
}

#[derive(Debug)]
struct MemoryTable {
    def: TableDef,
    rows: Vec<Vec<Option<String>>>,
    estimated: Option<u64>,
}

impl MemoryTable {
    fn matching(&self, predicate: &Predicate) -> CoreResult<Vec<&Vec<Option<String>>>> {
        match predicate {
            Predicate::All => Ok(self.rows.iter().collect()),
            Predicate::Equals { column, value } => {
                let idx = self.def.column_index(column).ok_or_else(|| {
                    CoreError::validation(format!(
                        "unknown column {column} in table {}",
                        self.def.name
                    ))
                })?;
                Ok(self
                    .rows
                    .iter()
                    .filter(|row| row.get(idx).and_then(|v| v.as_deref()) == Some(value.as_str()))
                    .collect())
            }
        }
    }

    fn to_source_row(&self, row: &[Option<String>]) -> SourceRow {
        let pk: Vec<Option<&str>> = self
            .def
            .pk_columns
            .iter()
            .filter_map(|c| self.def.column_index(c))
            .map(|i| row.get(i).and_then(|v| v.as_deref()))
            .collect();
        SourceRow {
            row_data: csv_row(row),
            pk_data: csv_row(&pk),
        }
    }
}

/// Source tables held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: RwLock<BTreeMap<String, MemoryTable>>,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty table.
    pub fn add_table(&self, def: TableDef) {
        self.tables.write().insert(
            def.name.to_lowercase(),
            MemoryTable {
                def,
                rows: Vec::new(),
                estimated: None,
            },
        );
    }

    /// Appends a row. Values are matched to columns by position.
    pub fn insert_row<S: Into<String>>(&self, table: &str, values: Vec<Option<S>>) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table.to_lowercase())
            .ok_or_else(|| CoreError::not_found(format!("table {table}")))?;
        if values.len() != t.def.columns.len() {
            return Err(CoreError::validation(format!(
                "table {table} has {} columns, got {} values",
                t.def.columns.len(),
                values.len()
            )));
        }
        t.rows.push(values.into_iter().map(|v| v.map(Into::into)).collect());
        Ok(())
    }

    /// Overrides the approximate count returned by `estimated_row_count`.
    pub fn set_estimated_count(&self, table: &str, rows: u64) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table.to_lowercase())
            .ok_or_else(|| CoreError::not_found(format!("table {table}")))?;
        t.estimated = Some(rows);
        Ok(())
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&MemoryTable) -> CoreResult<T>) -> CoreResult<T> {
        let tables = self.tables.read();
        let t = tables
            .get(&table.to_lowercase())
            .ok_or_else(|| CoreError::not_found(format!("table {table}")))?;
        f(t)
    }
}

impl SourceDatabase for MemorySource {
    fn table(&self, name: &str) -> Option<TableDef> {
        self.tables.read().get(&name.to_lowercase()).map(|t| t.def.clone())
    }

    fn tables(&self) -> Vec<TableDef> {
        self.tables.read().values().map(|t| t.def.clone()).collect()
    }

    fn count_rows(&self, table: &str, predicate: Option<&str>) -> CoreResult<u64> {
        let predicate = Predicate::parse(predicate)?;
        self.with_table(table, |t| Ok(t.matching(&predicate)?.len() as u64))
    }

    fn estimated_row_count(&self, table: &str) -> CoreResult<u64> {
        self.with_table(table, |t| Ok(t.estimated.unwrap_or(t.rows.len() as u64)))
    }

    fn select_rows(
        &self,
        table: &str,
        predicate: Option<&str>,
        offset: u64,
        limit: Option<u64>,
    ) -> CoreResult<Vec<SourceRow>> {
        let predicate = Predicate::parse(predicate)?;
        self.with_table(table, |t| {
            let rows = t.matching(&predicate)?;
            let take = limit.map_or(usize::MAX, |l| l as usize);
            Ok(rows
                .into_iter()
                .skip(offset as usize)
                .take(take)
                .map(|row| t.to_source_row(row))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemorySource {
        let source = MemorySource::new();
        source.add_table(TableDef::new("orders", &["id", "status"]));
        for (id, status) in [("1", "open"), ("2", "closed"), ("3", "open")] {
            source
                .insert_row("orders", vec![Some(id), Some(status)])
                .unwrap();
        }
        source
    }

    #[test]
    fn csv_quotes_and_nulls() {
        assert_eq!(csv_row(&[Some("a\"b"), None, Some("c,d")]), "\"a\"\"b\",,\"c,d\"");
    }

    #[test]
    fn count_and_select_with_predicate() {
        let source = source();
        assert_eq!(source.count_rows("ORDERS", None).unwrap(), 3);
        assert_eq!(source.count_rows("orders", Some("status = 'open'")).unwrap(), 2);
        assert!(source.count_rows("orders", Some("color = 'red'")).is_err());

        let page = source.select_rows("orders", Some("1=1"), 1, Some(5)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].row_data, "\"2\",\"closed\"");
        assert_eq!(page[0].pk_data, "\"2\"");
    }

    #[test]
    fn estimated_count_override() {
        let source = source();
        assert_eq!(source.estimated_row_count("orders").unwrap(), 3);
        source.set_estimated_count("orders", 250_000).unwrap();
        assert_eq!(source.estimated_row_count("orders").unwrap(), 250_000);
        assert_eq!(source.count_rows("orders", None).unwrap(), 3);
    }

    #[test]
    fn dependencies_skip_self_reference() {
        let def = TableDef::new("category", &["id", "parent_id"])
            .with_foreign_key("category", &["parent_id"])
            .with_foreign_key("catalog", &["catalog_id"]);
        assert_eq!(def.dependencies().collect::<Vec<_>>(), vec!["catalog"]);
    }
}
