use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{Result, TermStoreError};
use crate::record::{Record, RecordId, RecordReader, RecordTable, RecordWriter};

pub const DEFAULT_MAX_INSERT_ATTEMPTS: usize = 5;

/// Resolves records to durable ids, creating rows that do not exist yet.
///
/// The output has one `(record, id)` entry per input record, in input order.
/// Duplicate input records share one id.
pub trait RecordIdsAcquirer {
    fn acquire_ids(&self, table: &RecordTable, records: &[Record])
    -> Result<Vec<(Record, RecordId)>>;
}

/// Looks records up on the replica first, then on the primary, and inserts
/// only what neither has.
pub struct ReplicaPrimaryAwareRecordIdsAcquirer<'a, R: ?Sized, P: ?Sized> {
    replica: &'a R,
    primary: &'a P,
    max_insert_attempts: usize,
}

impl<'a, R, P> ReplicaPrimaryAwareRecordIdsAcquirer<'a, R, P>
where
    R: RecordReader + ?Sized,
    P: RecordWriter + ?Sized,
{
    pub fn new(replica: &'a R, primary: &'a P) -> Self {
        Self {
            replica,
            primary,
            max_insert_attempts: DEFAULT_MAX_INSERT_ATTEMPTS,
        }
    }

    pub fn with_max_insert_attempts(mut self, attempts: usize) -> Self {
        self.max_insert_attempts = attempts.max(1);
        self
    }

    /// Same store, but never consulting the replica.
    pub fn ignoring_replica(&self) -> PrimaryRecordIdsAcquirer<'a, P> {
        PrimaryRecordIdsAcquirer {
            primary: self.primary,
            max_insert_attempts: self.max_insert_attempts,
        }
    }
}

impl<R, P> RecordIdsAcquirer for ReplicaPrimaryAwareRecordIdsAcquirer<'_, R, P>
where
    R: RecordReader + ?Sized,
    P: RecordWriter + ?Sized,
{
    fn acquire_ids(
        &self,
        table: &RecordTable,
        records: &[Record],
    ) -> Result<Vec<(Record, RecordId)>> {
        let distinct = distinct_records(records);
        if distinct.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = self.replica.find_records(table, &distinct)?;
        let needed = missing_records(&distinct, &found);
        debug!(
            table = table.name,
            distinct = distinct.len(),
            replica_hits = found.len(),
            "looked up records on replica"
        );

        acquire_on_primary(self.primary, table, needed, &mut found, self.max_insert_attempts)?;
        assemble(table, records, &found)
    }
}

/// Looks records up on, and inserts them into, the primary only.
///
/// Used where replica state cannot be trusted, e.g. after rows may have been
/// deleted on the primary while the replica still shows them.
pub struct PrimaryRecordIdsAcquirer<'a, P: ?Sized> {
    primary: &'a P,
    max_insert_attempts: usize,
}

impl<'a, P: RecordWriter + ?Sized> PrimaryRecordIdsAcquirer<'a, P> {
    pub fn new(primary: &'a P) -> Self {
        Self {
            primary,
            max_insert_attempts: DEFAULT_MAX_INSERT_ATTEMPTS,
        }
    }

    pub fn with_max_insert_attempts(mut self, attempts: usize) -> Self {
        self.max_insert_attempts = attempts.max(1);
        self
    }
}

impl<P: RecordWriter + ?Sized> RecordIdsAcquirer for PrimaryRecordIdsAcquirer<'_, P> {
    fn acquire_ids(
        &self,
        table: &RecordTable,
        records: &[Record],
    ) -> Result<Vec<(Record, RecordId)>> {
        let distinct = distinct_records(records);
        let mut found = HashMap::new();
        acquire_on_primary(self.primary, table, distinct, &mut found, self.max_insert_attempts)?;
        assemble(table, records, &found)
    }
}

/// Re-reads the primary after every insert; a record inserted by someone else
/// in between is simply picked up by the next read.
fn acquire_on_primary<P: RecordWriter + ?Sized>(
    primary: &P,
    table: &RecordTable,
    mut needed: Vec<Record>,
    found: &mut HashMap<Record, RecordId>,
    max_insert_attempts: usize,
) -> Result<()> {
    let mut attempts = 0usize;
    loop {
        if needed.is_empty() {
            return Ok(());
        }

        let on_primary = primary.find_records(table, &needed)?;
        needed.retain(|record| !on_primary.contains_key(record));
        debug!(
            table = table.name,
            primary_hits = on_primary.len(),
            still_needed = needed.len(),
            "looked up records on primary"
        );
        found.extend(on_primary);
        if needed.is_empty() {
            return Ok(());
        }

        if attempts >= max_insert_attempts {
            return Err(TermStoreError::AcquisitionExhausted {
                table: table.name,
                missing: needed.len(),
                attempts,
            });
        }
        let inserted = primary.insert_ignoring_duplicates(table, &needed)?;
        attempts += 1;
        debug!(
            table = table.name,
            inserted,
            requested = needed.len(),
            attempt = attempts,
            "inserted missing records into primary"
        );
    }
}

fn distinct_records(records: &[Record]) -> Vec<Record> {
    let mut seen = BTreeSet::new();
    records
        .iter()
        .filter(|record| seen.insert(*record))
        .cloned()
        .collect()
}

fn missing_records(records: &[Record], found: &HashMap<Record, RecordId>) -> Vec<Record> {
    records
        .iter()
        .filter(|record| !found.contains_key(*record))
        .cloned()
        .collect()
}

fn assemble(
    table: &RecordTable,
    records: &[Record],
    found: &HashMap<Record, RecordId>,
) -> Result<Vec<(Record, RecordId)>> {
    records
        .iter()
        .map(|record| {
            found
                .get(record)
                .map(|id| (record.clone(), *id))
                .ok_or(TermStoreError::AcquisitionExhausted {
                    table: table.name,
                    missing: 1,
                    attempts: 0,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use rusqlite::Connection;

    use super::*;
    use crate::record::ColumnValue;

    const TEST_TABLE: RecordTable = RecordTable {
        name: "replica_primary_aware_record_ids_acquirer_test",
        id_column: "id",
        columns: &["column_value", "column_id"],
    };

    fn test_db() -> Connection {
        let connection = Connection::open_in_memory().expect("open in-memory db");
        connection
            .execute_batch(
                "CREATE TABLE replica_primary_aware_record_ids_acquirer_test (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    column_value TEXT NOT NULL,
                    column_id INTEGER NOT NULL,
                    UNIQUE (column_value, column_id)
                );",
            )
            .expect("create test table");
        connection
    }

    fn record(value: &str, id: i64) -> Record {
        Record(vec![ColumnValue::from(value), ColumnValue::Integer(id)])
    }

    fn test_records() -> Vec<Record> {
        vec![
            record("valueA1", 1),
            record("valueA2", 2),
            record("valueA3", 3),
            record("valueA4", 4),
        ]
    }

    fn test_records_with_duplicate() -> Vec<Record> {
        vec![
            record("valueA1", 1),
            record("valueA2", 2),
            record("valueA3", 3),
            record("valueA3", 3),
            record("valueA4", 4),
        ]
    }

    fn insert(db: &Connection, records: &[Record]) {
        db.insert_ignoring_duplicates(&TEST_TABLE, records)
            .expect("seed records");
    }

    fn count_in(db: &Connection, records: &[Record]) -> usize {
        db.find_records(&TEST_TABLE, records).expect("find").len()
    }

    #[test]
    fn reuses_replica_ids_without_touching_primary() {
        let (replica, primary) = (test_db(), test_db());
        let records = test_records();
        insert(&replica, &records);
        let replica_ids = replica.find_records(&TEST_TABLE, &records).expect("find");

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer.acquire_ids(&TEST_TABLE, &records).expect("acquire");

        assert_eq!(count_in(&primary, &records), 0);
        assert_eq!(acquired.len(), records.len());
        for (record, id) in &acquired {
            assert_eq!(replica_ids[record], *id);
        }
    }

    #[test]
    fn reuses_primary_ids_when_replica_lags() {
        let (replica, primary) = (test_db(), test_db());
        let records = test_records();
        insert(&primary, &records);

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer.acquire_ids(&TEST_TABLE, &records).expect("acquire");

        assert_eq!(count_in(&replica, &records), 0);
        assert_eq!(count_in(&primary, &records), records.len());
        let primary_ids = primary.find_records(&TEST_TABLE, &records).expect("find");
        for (record, id) in &acquired {
            assert_eq!(primary_ids[record], *id);
        }
    }

    #[test]
    fn inserts_records_missing_everywhere_into_primary() {
        let (replica, primary) = (test_db(), test_db());
        let records = test_records_with_duplicate();

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer.acquire_ids(&TEST_TABLE, &records).expect("acquire");

        assert_eq!(count_in(&replica, &records), 0);
        assert_eq!(count_in(&primary, &records), 4);
        assert_eq!(acquired.len(), records.len());
        assert_eq!(acquired[2], acquired[3]);
        for ((record, _), input) in acquired.iter().zip(&records) {
            assert_eq!(record, input);
        }
    }

    #[test]
    fn inserts_only_records_found_in_neither_store() {
        let (replica, primary) = (test_db(), test_db());
        let records = test_records_with_duplicate();
        let in_replica = vec![records[0].clone(), records[1].clone()];
        let in_primary = vec![records[2].clone()];
        insert(&replica, &in_replica);
        insert(&primary, &in_primary);

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer.acquire_ids(&TEST_TABLE, &records).expect("acquire");

        assert_eq!(acquired.len(), records.len());
        let replica_ids = replica.find_records(&TEST_TABLE, &in_replica).expect("find");
        let primary_ids = primary.find_records(&TEST_TABLE, &records[2..]).expect("find");
        for (index, (record, id)) in acquired.iter().enumerate() {
            let owner = if index < 2 { &replica_ids } else { &primary_ids };
            assert_eq!(owner[record], *id, "record {index} got a foreign id");
        }
        assert_eq!(acquired[2], acquired[3]);
        assert_eq!(count_in(&primary, &[records[4].clone()]), 1);
        assert_eq!(count_in(&primary, &in_replica), 0);
        assert_eq!(count_in(&replica, &in_primary), 0);
    }

    #[test]
    fn ignoring_replica_inserts_into_primary() {
        let (replica, primary) = (test_db(), test_db());
        let records = test_records();
        insert(&replica, &records);

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer
            .ignoring_replica()
            .acquire_ids(&TEST_TABLE, &records)
            .expect("acquire");

        assert_eq!(acquired.len(), records.len());
        assert_eq!(count_in(&primary, &records), records.len());
    }

    #[test]
    fn empty_input_acquires_nothing() {
        let (replica, primary) = (test_db(), test_db());
        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        assert!(acquirer.acquire_ids(&TEST_TABLE, &[]).expect("acquire").is_empty());
    }

    /// Lets another writer insert the same rows just before our own insert runs.
    struct RacingPrimary {
        inner: Connection,
        rival: Cell<bool>,
    }

    impl RecordReader for RacingPrimary {
        fn find_records(
            &self,
            table: &RecordTable,
            records: &[Record],
        ) -> Result<HashMap<Record, RecordId>> {
            self.inner.find_records(table, records)
        }

        fn find_records_by_ids(
            &self,
            table: &RecordTable,
            ids: &BTreeSet<RecordId>,
        ) -> Result<BTreeMap<RecordId, Record>> {
            self.inner.find_records_by_ids(table, ids)
        }
    }

    impl RecordWriter for RacingPrimary {
        fn insert_ignoring_duplicates(
            &self,
            table: &RecordTable,
            records: &[Record],
        ) -> Result<usize> {
            if self.rival.replace(false) {
                self.inner.insert_ignoring_duplicates(table, records)?;
            }
            self.inner.insert_ignoring_duplicates(table, records)
        }
    }

    #[test]
    fn concurrent_insert_of_same_records_is_not_an_error() {
        let replica = test_db();
        let primary = RacingPrimary {
            inner: test_db(),
            rival: Cell::new(true),
        };
        let records = test_records();

        let acquirer = ReplicaPrimaryAwareRecordIdsAcquirer::new(&replica, &primary);
        let acquired = acquirer.acquire_ids(&TEST_TABLE, &records).expect("acquire");

        assert!(!primary.rival.get());
        assert_eq!(count_in(&primary.inner, &records), records.len());
        let stored = primary.inner.find_records(&TEST_TABLE, &records).expect("find");
        for (record, id) in &acquired {
            assert_eq!(stored[record], *id);
        }
    }

    /// A primary whose rows vanish as soon as they are written.
    struct VanishingPrimary;

    impl RecordReader for VanishingPrimary {
        fn find_records(
            &self,
            _table: &RecordTable,
            _records: &[Record],
        ) -> Result<HashMap<Record, RecordId>> {
            Ok(HashMap::new())
        }

        fn find_records_by_ids(
            &self,
            _table: &RecordTable,
            _ids: &BTreeSet<RecordId>,
        ) -> Result<BTreeMap<RecordId, Record>> {
            Ok(BTreeMap::new())
        }
    }

    impl RecordWriter for VanishingPrimary {
        fn insert_ignoring_duplicates(
            &self,
            _table: &RecordTable,
            records: &[Record],
        ) -> Result<usize> {
            Ok(records.len())
        }
    }

    #[test]
    fn gives_up_after_max_insert_attempts() {
        let acquirer = PrimaryRecordIdsAcquirer::new(&VanishingPrimary).with_max_insert_attempts(2);
        let err = acquirer
            .acquire_ids(&TEST_TABLE, &test_records())
            .expect_err("rows never become visible");

        assert!(matches!(
            err,
            TermStoreError::AcquisitionExhausted {
                missing: 4,
                attempts: 2,
                ..
            }
        ));
    }
}
