use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, params_from_iter};

use crate::acquirer::TermInLangId;
use crate::error::{Result, TermStoreError};
use crate::record::RecordId;
use crate::terms::{TermType, TermsArray};
use crate::type_ids::TypeIdsStore;

const RESOLVE_CHUNK_SIZE: usize = 250;

/// Restricts resolved terms to some types and/or languages. Empty means no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveFilter {
    pub types: BTreeSet<TermType>,
    pub languages: BTreeSet<String>,
}

impl ResolveFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, term_type: TermType) -> Self {
        self.types.insert(term_type);
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.languages.insert(language.to_string());
        self
    }

    fn accepts(&self, term_type: TermType, language: &str) -> bool {
        (self.types.is_empty() || self.types.contains(&term_type))
            && (self.languages.is_empty() || self.languages.contains(language))
    }
}

#[derive(Debug, Clone)]
struct ResolvedRow {
    type_id: RecordId,
    language: String,
    text: String,
}

/// Reads term-in-lang ids back into terms, from the replica where possible.
pub struct DatabaseTermInLangIdsResolver<'a, T: ?Sized> {
    replica: &'a Connection,
    primary: &'a Connection,
    type_ids: &'a T,
}

impl<'a, T: TypeIdsStore + ?Sized> DatabaseTermInLangIdsResolver<'a, T> {
    pub fn new(replica: &'a Connection, primary: &'a Connection, type_ids: &'a T) -> Self {
        Self {
            replica,
            primary,
            type_ids,
        }
    }

    /// Terms behind `ids`. Ids that exist nowhere are skipped; duplicate ids count once.
    pub fn resolve_term_in_lang_ids(
        &self,
        ids: &[TermInLangId],
        filter: &ResolveFilter,
    ) -> Result<TermsArray> {
        let rows = self.load_rows(ids)?;
        let types = self.types_for(&rows)?;
        let mut terms = TermsArray::new();
        for id in distinct_in_order(ids) {
            if let Some(row) = rows.get(&id) {
                append_row(&mut terms, &types, row, filter)?;
            }
        }
        Ok(terms)
    }

    /// Like [`Self::resolve_term_in_lang_ids`] for several groups at once,
    /// e.g. the term ids of several entities.
    pub fn resolve_grouped_term_in_lang_ids<K: Ord + Clone>(
        &self,
        groups: &BTreeMap<K, Vec<TermInLangId>>,
        filter: &ResolveFilter,
    ) -> Result<BTreeMap<K, TermsArray>> {
        let all_ids = groups.values().flatten().copied().collect::<Vec<_>>();
        let rows = self.load_rows(&all_ids)?;
        let types = self.types_for(&rows)?;

        let mut out = BTreeMap::new();
        for (key, ids) in groups {
            let mut terms = TermsArray::new();
            for id in distinct_in_order(ids) {
                if let Some(row) = rows.get(&id) {
                    append_row(&mut terms, &types, row, filter)?;
                }
            }
            out.insert(key.clone(), terms);
        }
        Ok(out)
    }

    fn load_rows(&self, ids: &[TermInLangId]) -> Result<BTreeMap<TermInLangId, ResolvedRow>> {
        let wanted = ids.iter().copied().collect::<BTreeSet<_>>();
        let mut rows = select_rows(self.replica, &wanted)?;
        let missing = wanted
            .iter()
            .copied()
            .filter(|id| !rows.contains_key(id))
            .collect::<BTreeSet<_>>();
        if !missing.is_empty() {
            rows.extend(select_rows(self.primary, &missing)?);
        }
        Ok(rows)
    }

    fn types_for(
        &self,
        rows: &BTreeMap<TermInLangId, ResolvedRow>,
    ) -> Result<BTreeMap<RecordId, TermType>> {
        let type_ids = rows
            .values()
            .map(|row| row.type_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        self.type_ids.resolve_type_ids(&type_ids)
    }
}

fn append_row(
    terms: &mut TermsArray,
    types: &BTreeMap<RecordId, TermType>,
    row: &ResolvedRow,
    filter: &ResolveFilter,
) -> Result<()> {
    let term_type = types
        .get(&row.type_id)
        .copied()
        .ok_or(TermStoreError::UnknownTypeId(row.type_id))?;
    if filter.accepts(term_type, &row.language) {
        terms.insert(term_type, &row.language, &row.text);
    }
    Ok(())
}

fn distinct_in_order(ids: &[TermInLangId]) -> Vec<TermInLangId> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn select_rows(
    connection: &Connection,
    ids: &BTreeSet<TermInLangId>,
) -> Result<BTreeMap<TermInLangId, ResolvedRow>> {
    let ids = ids.iter().copied().collect::<Vec<_>>();
    let mut out = BTreeMap::new();
    for chunk in ids.chunks(RESOLVE_CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT wbtl_id, wbtl_type_id, wbxl_language, wbx_text
             FROM wbt_term_in_lang
             JOIN wbt_text_in_lang ON wbtl_text_in_lang_id = wbxl_id
             JOIN wbt_text ON wbxl_text_id = wbx_id
             WHERE wbtl_id IN ({placeholders})"
        );
        let mut statement = connection.prepare_cached(&sql)?;
        let rows = statement.query_map(params_from_iter(chunk), |row| {
            Ok((
                row.get::<_, TermInLangId>(0)?,
                ResolvedRow {
                    type_id: row.get(1)?,
                    language: row.get(2)?,
                    text: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (id, resolved) = row?;
            out.insert(id, resolved);
        }
    }
    Ok(out)
}
