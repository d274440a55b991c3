use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TermStoreError};
use crate::record::{ColumnValue, Record, RecordId, RecordReader, RecordWriter, TYPE_TABLE};
use crate::record_ids::{RecordIdsAcquirer, ReplicaPrimaryAwareRecordIdsAcquirer};
use crate::terms::TermType;

/// Durable small-integer ids for the term type vocabulary.
pub trait TypeIdsStore {
    /// Ids for `types`, creating them on first use. Repeated calls return the same ids.
    fn acquire_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>>;

    /// Ids for `types` that already exist; unknown types are omitted.
    fn lookup_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>>;

    /// Types behind `ids`; unknown ids are omitted.
    fn resolve_type_ids(&self, ids: &[RecordId]) -> Result<BTreeMap<RecordId, TermType>>;
}

/// Process-local type ids, numbered from 1 in order of first use.
#[derive(Debug, Default)]
pub struct InMemoryTypeIdsStore {
    ids: RefCell<BTreeMap<TermType, RecordId>>,
}

impl InMemoryTypeIdsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TypeIdsStore for InMemoryTypeIdsStore {
    fn acquire_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>> {
        let mut ids = self.ids.borrow_mut();
        for term_type in types {
            if !ids.contains_key(term_type) {
                let next = ids.values().max().copied().unwrap_or(0) + 1;
                ids.insert(*term_type, next);
            }
        }
        Ok(select_types(&ids, types))
    }

    fn lookup_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>> {
        Ok(select_types(&self.ids.borrow(), types))
    }

    fn resolve_type_ids(&self, ids: &[RecordId]) -> Result<BTreeMap<RecordId, TermType>> {
        Ok(select_ids(&self.ids.borrow(), ids))
    }
}

/// Type ids stored in `wbt_type`, cached for the lifetime of the store.
pub struct DatabaseTypeIdsStore<'a, R: ?Sized, P: ?Sized> {
    replica: &'a R,
    primary: &'a P,
    cache: RefCell<BTreeMap<TermType, RecordId>>,
}

impl<'a, R, P> DatabaseTypeIdsStore<'a, R, P>
where
    R: RecordReader + ?Sized,
    P: RecordWriter + ?Sized,
{
    pub fn new(replica: &'a R, primary: &'a P) -> Self {
        Self {
            replica,
            primary,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    fn uncached(&self, types: &[TermType]) -> Vec<TermType> {
        let cache = self.cache.borrow();
        let mut seen = BTreeSet::new();
        types
            .iter()
            .copied()
            .filter(|term_type| !cache.contains_key(term_type) && seen.insert(*term_type))
            .collect()
    }

    fn remember(&self, records: impl IntoIterator<Item = (Record, RecordId)>) -> Result<()> {
        let mut cache = self.cache.borrow_mut();
        for (record, id) in records {
            cache.insert(type_from_record(&record)?, id);
        }
        Ok(())
    }
}

impl<R, P> TypeIdsStore for DatabaseTypeIdsStore<'_, R, P>
where
    R: RecordReader + ?Sized,
    P: RecordWriter + ?Sized,
{
    fn acquire_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>> {
        let uncached = self.uncached(types);
        if !uncached.is_empty() {
            let records = uncached.iter().map(|term_type| type_record(*term_type)).collect::<Vec<_>>();
            let acquired = ReplicaPrimaryAwareRecordIdsAcquirer::new(self.replica, self.primary)
                .acquire_ids(&TYPE_TABLE, &records)?;
            self.remember(acquired)?;
        }
        Ok(select_types(&self.cache.borrow(), types))
    }

    fn lookup_type_ids(&self, types: &[TermType]) -> Result<BTreeMap<TermType, RecordId>> {
        let uncached = self.uncached(types);
        if !uncached.is_empty() {
            let records = uncached.iter().map(|term_type| type_record(*term_type)).collect::<Vec<_>>();
            let mut found = self.replica.find_records(&TYPE_TABLE, &records)?;
            let missing = records
                .iter()
                .filter(|record| !found.contains_key(*record))
                .cloned()
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                found.extend(self.primary.find_records(&TYPE_TABLE, &missing)?);
            }
            self.remember(found)?;
        }
        Ok(select_types(&self.cache.borrow(), types))
    }

    fn resolve_type_ids(&self, ids: &[RecordId]) -> Result<BTreeMap<RecordId, TermType>> {
        let unknown = {
            let cache = self.cache.borrow();
            let cached = cache.values().copied().collect::<BTreeSet<_>>();
            ids.iter()
                .copied()
                .filter(|id| !cached.contains(id))
                .collect::<BTreeSet<_>>()
        };
        if !unknown.is_empty() {
            let mut found = self.replica.find_records_by_ids(&TYPE_TABLE, &unknown)?;
            let missing = unknown
                .iter()
                .copied()
                .filter(|id| !found.contains_key(id))
                .collect::<BTreeSet<_>>();
            if !missing.is_empty() {
                found.extend(self.primary.find_records_by_ids(&TYPE_TABLE, &missing)?);
            }
            self.remember(found.into_iter().map(|(id, record)| (record, id)))?;
        }
        Ok(select_ids(&self.cache.borrow(), ids))
    }
}

fn type_record(term_type: TermType) -> Record {
    Record::new([term_type.as_str()])
}

fn type_from_record(record: &Record) -> Result<TermType> {
    match record.values() {
        [ColumnValue::Text(name)] => name.parse(),
        other => Err(TermStoreError::UnknownTermType(format!("{other:?}"))),
    }
}

fn select_types(
    ids: &BTreeMap<TermType, RecordId>,
    types: &[TermType],
) -> BTreeMap<TermType, RecordId> {
    types
        .iter()
        .filter_map(|term_type| ids.get(term_type).map(|id| (*term_type, *id)))
        .collect()
}

fn select_ids(
    ids: &BTreeMap<TermType, RecordId>,
    wanted: &[RecordId],
) -> BTreeMap<RecordId, TermType> {
    ids.iter()
        .filter(|(_, id)| wanted.contains(id))
        .map(|(term_type, id)| (*id, *term_type))
        .collect()
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::migrate::apply_schema;

    fn term_store_db() -> Connection {
        let connection = Connection::open_in_memory().expect("open in-memory db");
        apply_schema(&connection).expect("apply schema");
        connection
    }

    #[test]
    fn in_memory_store_numbers_types_in_order_of_first_use() {
        let store = InMemoryTypeIdsStore::new();
        let first = store
            .acquire_type_ids(&[TermType::Label, TermType::Description, TermType::Alias])
            .expect("acquire");
        assert_eq!(first[&TermType::Label], 1);
        assert_eq!(first[&TermType::Description], 2);
        assert_eq!(first[&TermType::Alias], 3);

        let again = store.acquire_type_ids(&[TermType::Alias]).expect("acquire again");
        assert_eq!(again, BTreeMap::from([(TermType::Alias, 3)]));
        assert_eq!(
            store.resolve_type_ids(&[2, 9]).expect("resolve"),
            BTreeMap::from([(2, TermType::Description)])
        );
    }

    #[test]
    fn in_memory_lookup_does_not_create_ids() {
        let store = InMemoryTypeIdsStore::new();
        assert!(store.lookup_type_ids(&[TermType::Label]).expect("lookup").is_empty());
        store.acquire_type_ids(&[TermType::Label]).expect("acquire");
        assert_eq!(store.lookup_type_ids(&[TermType::Label]).expect("lookup").len(), 1);
    }

    #[test]
    fn database_store_persists_ids_across_instances() {
        let db = term_store_db();
        let first = DatabaseTypeIdsStore::new(&db, &db)
            .acquire_type_ids(&[TermType::Label, TermType::Alias])
            .expect("acquire");

        let second_store = DatabaseTypeIdsStore::new(&db, &db);
        let second = second_store
            .acquire_type_ids(&[TermType::Alias, TermType::Label])
            .expect("acquire again");
        assert_eq!(first, second);

        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM wbt_type", [], |row| row.get(0))
            .expect("count types");
        assert_eq!(count, 2);

        let label_id = first[&TermType::Label];
        let resolved = DatabaseTypeIdsStore::new(&db, &db)
            .resolve_type_ids(&[label_id])
            .expect("resolve");
        assert_eq!(resolved, BTreeMap::from([(label_id, TermType::Label)]));
    }

    #[test]
    fn database_lookup_falls_back_to_primary() {
        let (replica, primary) = (term_store_db(), term_store_db());
        DatabaseTypeIdsStore::new(&primary, &primary)
            .acquire_type_ids(&[TermType::Description])
            .expect("acquire on primary");

        let store = DatabaseTypeIdsStore::new(&replica, &primary);
        let found = store
            .lookup_type_ids(&[TermType::Description, TermType::Label])
            .expect("lookup");
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![TermType::Description]);
    }

    #[test]
    fn database_store_rejects_unknown_stored_names() {
        let db = term_store_db();
        db.execute("INSERT INTO wbt_type (wby_name) VALUES ('sitelink')", [])
            .expect("insert bogus type");
        let id = db.last_insert_rowid();

        let err = DatabaseTypeIdsStore::new(&db, &db)
            .resolve_type_ids(&[id])
            .expect_err("unknown name");
        assert!(matches!(err, TermStoreError::UnknownTermType(name) if name == "sitelink"));
    }
}
