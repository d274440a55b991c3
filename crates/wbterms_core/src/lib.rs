pub mod acquirer;
pub mod config;
pub mod error;
pub mod migrate;
pub mod record;
pub mod record_ids;
pub mod resolver;
pub mod runtime;
pub mod terms;
pub mod type_ids;

pub use acquirer::{AcquiredBatch, AcquirerOptions, DatabaseTermInLangIdsAcquirer};
pub use error::{Result, TermStoreError};
pub use record::{RecordId, RecordReader, RecordWriter};
pub use resolver::{DatabaseTermInLangIdsResolver, ResolveFilter};
pub use terms::{TermTexts, TermType, TermsArray};
pub use type_ids::{DatabaseTypeIdsStore, InMemoryTypeIdsStore, TypeIdsStore};
