use std::collections::{BTreeMap, BTreeSet, HashMap};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Row, params_from_iter};

use crate::error::Result;

pub type RecordId = i64;

/// Records per statement. Keeps lookups well under SQLite's bound parameter limit.
const LOOKUP_CHUNK_SIZE: usize = 250;

/// A table whose rows are deduplicated on all of `columns` and keyed by `id_column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTable {
    pub name: &'static str,
    pub id_column: &'static str,
    pub columns: &'static [&'static str],
}

pub const TYPE_TABLE: RecordTable = RecordTable {
    name: "wbt_type",
    id_column: "wby_id",
    columns: &["wby_name"],
};

pub const TEXT_TABLE: RecordTable = RecordTable {
    name: "wbt_text",
    id_column: "wbx_id",
    columns: &["wbx_text"],
};

pub const TEXT_IN_LANG_TABLE: RecordTable = RecordTable {
    name: "wbt_text_in_lang",
    id_column: "wbxl_id",
    columns: &["wbxl_text_id", "wbxl_language"],
};

pub const TERM_IN_LANG_TABLE: RecordTable = RecordTable {
    name: "wbt_term_in_lang",
    id_column: "wbtl_id",
    columns: &["wbtl_text_in_lang_id", "wbtl_type_id"],
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnValue {
    Integer(i64),
    Text(String),
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Integer(value) => value.to_sql(),
            Self::Text(value) => value.to_sql(),
        }
    }
}

impl FromSql for ColumnValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(value) => Ok(Self::Integer(value)),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => std::str::from_utf8(bytes)
                .map(|text| Self::Text(text.to_string()))
                .map_err(|err| FromSqlError::Other(Box::new(err))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Column values of one row, in `RecordTable::columns` order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Record(pub Vec<ColumnValue>);

impl Record {
    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ColumnValue>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[ColumnValue] {
        &self.0
    }
}

/// Read access to a term store, replica or primary.
pub trait RecordReader {
    /// Ids of the given records that exist, keyed by record. Absent records are omitted.
    fn find_records(
        &self,
        table: &RecordTable,
        records: &[Record],
    ) -> Result<HashMap<Record, RecordId>>;

    /// Rows for the given ids. Ids without a row are omitted.
    fn find_records_by_ids(
        &self,
        table: &RecordTable,
        ids: &BTreeSet<RecordId>,
    ) -> Result<BTreeMap<RecordId, Record>>;

    /// The subset of `ids` that still exist.
    fn find_existing_ids(
        &self,
        table: &RecordTable,
        ids: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<RecordId>> {
        Ok(self.find_records_by_ids(table, ids)?.into_keys().collect())
    }
}

/// Write access, only ever granted for the primary.
pub trait RecordWriter: RecordReader {
    /// Inserts the records, silently skipping any that violate a uniqueness constraint.
    /// Returns the number of rows actually inserted.
    fn insert_ignoring_duplicates(&self, table: &RecordTable, records: &[Record]) -> Result<usize>;
}

impl RecordReader for Connection {
    fn find_records(
        &self,
        table: &RecordTable,
        records: &[Record],
    ) -> Result<HashMap<Record, RecordId>> {
        let mut found = HashMap::new();
        let row_condition = table
            .columns
            .iter()
            .map(|column| format!("\"{column}\" = ?"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let selected_columns = quoted_columns(table);

        for chunk in records.chunks(LOOKUP_CHUNK_SIZE) {
            let where_clause = vec![format!("({row_condition})"); chunk.len()].join(" OR ");
            let sql = format!(
                "SELECT \"{}\", {selected_columns} FROM \"{}\" WHERE {where_clause}",
                table.id_column, table.name
            );
            let mut statement = self.prepare_cached(&sql)?;
            let parameters = chunk.iter().flat_map(|record| record.values());
            let mut rows = statement.query(params_from_iter(parameters))?;
            while let Some(row) = rows.next()? {
                let id: RecordId = row.get(0)?;
                found.insert(read_record(table, row)?, id);
            }
        }
        Ok(found)
    }

    fn find_records_by_ids(
        &self,
        table: &RecordTable,
        ids: &BTreeSet<RecordId>,
    ) -> Result<BTreeMap<RecordId, Record>> {
        let ids = ids.iter().copied().collect::<Vec<_>>();
        let selected_columns = quoted_columns(table);
        let mut found = BTreeMap::new();
        for chunk in ids.chunks(LOOKUP_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT \"{id}\", {selected_columns} FROM \"{name}\" WHERE \"{id}\" IN ({placeholders})",
                id = table.id_column,
                name = table.name
            );
            let mut statement = self.prepare_cached(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk))?;
            while let Some(row) = rows.next()? {
                let id: RecordId = row.get(0)?;
                found.insert(id, read_record(table, row)?);
            }
        }
        Ok(found)
    }
}

fn quoted_columns(table: &RecordTable) -> String {
    table
        .columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads the record columns that follow the id in column 0.
fn read_record(table: &RecordTable, row: &Row<'_>) -> rusqlite::Result<Record> {
    let mut values = Vec::with_capacity(table.columns.len());
    for index in 0..table.columns.len() {
        values.push(row.get::<_, ColumnValue>(index + 1)?);
    }
    Ok(Record(values))
}

impl RecordWriter for Connection {
    fn insert_ignoring_duplicates(&self, table: &RecordTable, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let columns = quoted_columns(table);
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO \"{}\" ({columns}) VALUES ({placeholders})",
            table.name
        );

        self.execute_batch("SAVEPOINT record_insert")?;
        let result = (|| -> Result<usize> {
            let mut statement = self.prepare_cached(&sql)?;
            let mut inserted = 0usize;
            for record in records {
                inserted += statement.execute(params_from_iter(record.values()))?;
            }
            Ok(inserted)
        })();

        match result {
            Ok(inserted) => {
                self.execute_batch("RELEASE SAVEPOINT record_insert")?;
                Ok(inserted)
            }
            Err(err) => {
                let _ = self.execute_batch("ROLLBACK TO SAVEPOINT record_insert");
                let _ = self.execute_batch("RELEASE SAVEPOINT record_insert");
                Err(err)
            }
        }
    }
}
