use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TermStoreError};

/// Byte limit of the `wbt_text.wbx_text` column.
pub const DEFAULT_TEXT_MAX_BYTES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermType {
    Label,
    Description,
    Alias,
}

impl TermType {
    pub const ALL: [TermType; 3] = [Self::Label, Self::Description, Self::Alias];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Description => "description",
            Self::Alias => "alias",
        }
    }

    /// Aliases hold a list of texts per language; labels and descriptions hold one.
    pub fn is_multi_valued(self) -> bool {
        matches!(self, Self::Alias)
    }
}

impl fmt::Display for TermType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TermType {
    type Err = TermStoreError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|term_type| term_type.as_str() == value)
            .ok_or_else(|| TermStoreError::UnknownTermType(value.to_string()))
    }
}

/// Texts of one term type in one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermTexts {
    Single(String),
    Multiple(Vec<String>),
}

impl TermTexts {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::Single(text) => std::slice::from_ref(text),
            Self::Multiple(texts) => texts,
        }
    }
}

/// Nested terms document: term type -> language code -> text(s).
///
/// Iteration is canonical (type, then language code), not the key order of the source JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermsArray(BTreeMap<TermType, BTreeMap<String, TermTexts>>);

impl TermsArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_label(mut self, language: &str, text: &str) -> Self {
        self.insert(TermType::Label, language, text);
        self
    }

    pub fn with_description(mut self, language: &str, text: &str) -> Self {
        self.insert(TermType::Description, language, text);
        self
    }

    pub fn with_aliases(mut self, language: &str, texts: &[&str]) -> Self {
        for text in texts {
            self.insert(TermType::Alias, language, text);
        }
        self
    }

    /// Adds a text. Single-valued types are overwritten, aliases are appended.
    pub fn insert(&mut self, term_type: TermType, language: &str, text: &str) {
        let by_language = self.0.entry(term_type).or_default();
        if !term_type.is_multi_valued() {
            by_language.insert(language.to_string(), TermTexts::Single(text.to_string()));
            return;
        }
        let entry = by_language
            .entry(language.to_string())
            .or_insert_with(|| TermTexts::Multiple(Vec::new()));
        if let TermTexts::Single(first) = entry {
            *entry = TermTexts::Multiple(vec![std::mem::take(first)]);
        }
        if let TermTexts::Multiple(texts) = entry {
            texts.push(text.to_string());
        }
    }

    pub fn get(&self, term_type: TermType, language: &str) -> Option<&TermTexts> {
        self.0.get(&term_type)?.get(language)
    }

    pub fn is_empty(&self) -> bool {
        self.term_count() == 0
    }

    /// Number of (type, language, text) occurrences, duplicates included.
    pub fn term_count(&self) -> usize {
        self.iter().count()
    }

    pub fn term_types(&self) -> BTreeSet<TermType> {
        self.0.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TermType, &str, &str)> + '_ {
        self.0.iter().flat_map(|(term_type, by_language)| {
            by_language.iter().flat_map(move |(language, texts)| {
                texts
                    .as_slice()
                    .iter()
                    .map(move |text| (*term_type, language.as_str(), text.as_str()))
            })
        })
    }
}

/// One flattened term occurrence with its text already cut to the column limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub term_type: TermType,
    pub language: String,
    pub text: String,
}

pub fn flatten_terms(terms: &TermsArray, text_max_bytes: usize) -> Vec<Term> {
    terms
        .iter()
        .map(|(term_type, language, text)| Term {
            term_type,
            language: language.to_string(),
            text: truncate_to_byte_limit(text, text_max_bytes).to_string(),
        })
        .collect()
}

/// Cuts `text` to at most `max_bytes` bytes without splitting a character.
pub fn truncate_to_byte_limit(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
