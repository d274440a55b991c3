//! Acquisition of term-in-lang ids over the normalized term store.
//!
//! A term (type, language, text) is stored on three levels, each deduplicated
//! by a unique index: `wbt_text` holds the text, `wbt_text_in_lang` pairs a text
//! with a language, and `wbt_term_in_lang` pairs that with a term type. The
//! term-in-lang id is what callers store as a foreign key.
//!
//! Rows nobody references may be deleted at any time by an external cleaner.
//! Acquisition is therefore split in two phases: [`DatabaseTermInLangIdsAcquirer::acquire`]
//! hands out ids, the caller writes its references, and
//! [`DatabaseTermInLangIdsAcquirer::finalize`] recreates anything the cleaner
//! removed in between.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{Result, TermStoreError};
use crate::record::{
    ColumnValue, Record, RecordId, RecordReader, RecordWriter, TERM_IN_LANG_TABLE,
    TEXT_IN_LANG_TABLE, TEXT_TABLE,
};
use crate::record_ids::{
    DEFAULT_MAX_INSERT_ATTEMPTS, PrimaryRecordIdsAcquirer, RecordIdsAcquirer,
    ReplicaPrimaryAwareRecordIdsAcquirer,
};
use crate::terms::{DEFAULT_TEXT_MAX_BYTES, Term, TermType, TermsArray, flatten_terms};
use crate::type_ids::TypeIdsStore;

pub type TermInLangId = RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirerOptions {
    /// Texts longer than this many bytes are cut on a character boundary.
    pub text_max_bytes: usize,
    pub max_insert_attempts: usize,
}

impl Default for AcquirerOptions {
    fn default() -> Self {
        Self {
            text_max_bytes: DEFAULT_TEXT_MAX_BYTES,
            max_insert_attempts: DEFAULT_MAX_INSERT_ATTEMPTS,
        }
    }
}

/// One input term occurrence together with the ids acquired for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredTerm {
    pub term: Term,
    pub type_id: RecordId,
    pub term_in_lang_id: TermInLangId,
}

/// Result of the first acquisition phase, to be passed to `finalize`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquiredBatch {
    terms: Vec<AcquiredTerm>,
}

impl AcquiredBatch {
    /// One id per term occurrence, in the canonical order of [`Self::terms`].
    pub fn term_in_lang_ids(&self) -> Vec<TermInLangId> {
        self.terms.iter().map(|term| term.term_in_lang_id).collect()
    }

    pub fn terms(&self) -> &[AcquiredTerm] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

pub struct DatabaseTermInLangIdsAcquirer<'a, R: ?Sized, P: ?Sized, T: ?Sized> {
    replica: &'a R,
    primary: &'a P,
    type_ids: &'a T,
    options: AcquirerOptions,
}

impl<'a, R, P, T> DatabaseTermInLangIdsAcquirer<'a, R, P, T>
where
    R: RecordReader + ?Sized,
    P: RecordWriter + ?Sized,
    T: TypeIdsStore + ?Sized,
{
    pub fn new(replica: &'a R, primary: &'a P, type_ids: &'a T) -> Self {
        Self {
            replica,
            primary,
            type_ids,
            options: AcquirerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AcquirerOptions) -> Self {
        self.options = options;
        self
    }

    /// First phase: resolves every term occurrence to a term-in-lang id,
    /// reusing rows from the replica or primary and inserting the rest.
    ///
    /// Occurrences come out in canonical order: label, description, alias,
    /// then language code, then the text order within an alias list. The
    /// order of keys in a parsed JSON document is not kept.
    ///
    /// The ids are not yet safe to reference; pass the batch to
    /// [`Self::finalize`] once the references are written.
    pub fn acquire(&self, terms: &TermsArray) -> Result<AcquiredBatch> {
        let flat = flatten_terms(terms, self.options.text_max_bytes);
        if flat.is_empty() {
            return Ok(AcquiredBatch::default());
        }

        let types = flat
            .iter()
            .map(|term| term.term_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let type_ids = self.type_ids.acquire_type_ids(&types)?;
        let typed = flat
            .into_iter()
            .map(|term| -> Result<(Term, RecordId)> {
                let type_id = type_ids
                    .get(&term.term_type)
                    .copied()
                    .ok_or_else(|| unknown_type(term.term_type))?;
                Ok((term, type_id))
            })
            .collect::<Result<Vec<_>>>()?;

        let records = ReplicaPrimaryAwareRecordIdsAcquirer::new(self.replica, self.primary)
            .with_max_insert_attempts(self.options.max_insert_attempts);
        let ids = acquire_term_in_lang_ids_with(&records, &typed)?;
        debug!(
            terms = typed.len(),
            distinct_term_in_lang = ids.iter().collect::<BTreeSet<_>>().len(),
            "acquired term_in_lang ids"
        );

        Ok(AcquiredBatch {
            terms: typed
                .into_iter()
                .zip(ids)
                .map(|((term, type_id), term_in_lang_id)| AcquiredTerm {
                    term,
                    type_id,
                    term_in_lang_id,
                })
                .collect(),
        })
    }

    /// Second phase: checks on the primary that every acquired id still leads
    /// through text-in-lang and text rows to the acquired term, and recreates
    /// the chains that do not, ignoring the replica.
    ///
    /// Returns one id per input occurrence. Recreated rows get new ids; all
    /// occurrences of a lost id are updated. Safe to call again after an error.
    pub fn finalize(&self, batch: &AcquiredBatch) -> Result<Vec<TermInLangId>> {
        let mut ids = batch.term_in_lang_ids();
        if ids.is_empty() {
            return Ok(ids);
        }

        let broken = self.broken_chains(batch)?;
        if broken.is_empty() {
            return Ok(ids);
        }

        let lost = broken
            .iter()
            .map(|index| {
                let acquired = &batch.terms[*index];
                (acquired.term.clone(), acquired.type_id)
            })
            .collect::<Vec<_>>();
        warn!(
            occurrences = lost.len(),
            "term_in_lang chains were incomplete on primary before finalize, restoring"
        );

        let primary_only = PrimaryRecordIdsAcquirer::new(self.primary)
            .with_max_insert_attempts(self.options.max_insert_attempts);
        let restored = acquire_term_in_lang_ids_with(&primary_only, &lost)?;
        for (index, id) in broken.into_iter().zip(restored) {
            ids[index] = id;
        }
        Ok(ids)
    }

    /// Positions in `batch` whose term-in-lang -> text-in-lang -> text chain is
    /// missing or differs from the acquired term on the primary.
    fn broken_chains(&self, batch: &AcquiredBatch) -> Result<Vec<usize>> {
        let term_in_lang_ids = batch
            .terms
            .iter()
            .map(|acquired| acquired.term_in_lang_id)
            .collect::<BTreeSet<_>>();
        let term_in_lang_rows = self
            .primary
            .find_records_by_ids(&TERM_IN_LANG_TABLE, &term_in_lang_ids)?;

        let text_in_lang_ids = term_in_lang_rows
            .values()
            .filter_map(|record| integer_at(record, 0))
            .collect::<BTreeSet<_>>();
        let text_in_lang_rows = self
            .primary
            .find_records_by_ids(&TEXT_IN_LANG_TABLE, &text_in_lang_ids)?;

        let text_ids = text_in_lang_rows
            .values()
            .filter_map(|record| integer_at(record, 0))
            .collect::<BTreeSet<_>>();
        let text_rows = self.primary.find_records_by_ids(&TEXT_TABLE, &text_ids)?;

        Ok(batch
            .terms
            .iter()
            .enumerate()
            .filter(|(_, acquired)| {
                !chain_matches(acquired, &term_in_lang_rows, &text_in_lang_rows, &text_rows)
            })
            .map(|(index, _)| index)
            .collect())
    }

    /// Both phases around a caller section that writes references to the ids.
    ///
    /// `on_before_return` receives one id per input occurrence and runs even
    /// when `terms` is empty.
    pub fn acquire_term_in_lang_ids<F, E>(
        &self,
        terms: &TermsArray,
        on_before_return: F,
    ) -> std::result::Result<Vec<TermInLangId>, E>
    where
        F: FnOnce(&[TermInLangId]) -> std::result::Result<(), E>,
        E: From<TermStoreError>,
    {
        let batch = self.acquire(terms)?;
        on_before_return(&batch.term_in_lang_ids())?;
        Ok(self.finalize(&batch)?)
    }
}

/// Walks text -> text-in-lang -> term-in-lang. Each level is deduplicated by
/// the record acquirer and expanded back to one id per input term.
fn acquire_term_in_lang_ids_with<A: RecordIdsAcquirer>(
    acquirer: &A,
    terms: &[(Term, RecordId)],
) -> Result<Vec<TermInLangId>> {
    let text_records = terms
        .iter()
        .map(|(term, _)| Record::new([term.text.as_str()]))
        .collect::<Vec<_>>();
    let text_ids = acquirer.acquire_ids(&TEXT_TABLE, &text_records)?;

    let text_in_lang_records = terms
        .iter()
        .zip(&text_ids)
        .map(|((term, _), (_, text_id))| {
            Record(vec![
                ColumnValue::Integer(*text_id),
                ColumnValue::from(term.language.as_str()),
            ])
        })
        .collect::<Vec<_>>();
    let text_in_lang_ids = acquirer.acquire_ids(&TEXT_IN_LANG_TABLE, &text_in_lang_records)?;

    let term_in_lang_records = terms
        .iter()
        .zip(&text_in_lang_ids)
        .map(|((_, type_id), (_, text_in_lang_id))| {
            Record::new([*text_in_lang_id, *type_id])
        })
        .collect::<Vec<_>>();
    let term_in_lang_ids = acquirer.acquire_ids(&TERM_IN_LANG_TABLE, &term_in_lang_records)?;

    Ok(term_in_lang_ids.into_iter().map(|(_, id)| id).collect())
}

fn integer_at(record: &Record, index: usize) -> Option<RecordId> {
    match record.values().get(index) {
        Some(ColumnValue::Integer(value)) => Some(*value),
        _ => None,
    }
}

fn chain_matches(
    acquired: &AcquiredTerm,
    term_in_lang_rows: &BTreeMap<RecordId, Record>,
    text_in_lang_rows: &BTreeMap<RecordId, Record>,
    text_rows: &BTreeMap<RecordId, Record>,
) -> bool {
    let Some(term_in_lang) = term_in_lang_rows.get(&acquired.term_in_lang_id) else {
        return false;
    };
    let [ColumnValue::Integer(text_in_lang_id), ColumnValue::Integer(type_id)] =
        term_in_lang.values()
    else {
        return false;
    };
    if *type_id != acquired.type_id {
        return false;
    }
    let Some(text_in_lang) = text_in_lang_rows.get(text_in_lang_id) else {
        return false;
    };
    let [ColumnValue::Integer(text_id), ColumnValue::Text(language)] = text_in_lang.values() else {
        return false;
    };
    if *language != acquired.term.language {
        return false;
    }
    matches!(
        text_rows.get(text_id).map(Record::values),
        Some([ColumnValue::Text(text)]) if *text == acquired.term.text
    )
}

fn unknown_type(term_type: TermType) -> TermStoreError {
    TermStoreError::UnknownTermType(term_type.as_str().to_string())
}
