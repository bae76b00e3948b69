//! Text handling for archive metadata: markup stripping and record
//! normalization.

pub mod markup;
pub mod normalize;

pub use markup::{collapse_whitespace, decode_entities, strip_markup, truncate_chars};
pub use normalize::{
    NormalizeError, NormalizedRecord, NormalizerConfig, RecordNormalizer, resolve_path,
};
