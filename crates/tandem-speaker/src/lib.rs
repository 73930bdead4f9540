//! Speaker identity for Tandem
//!
//! Aligns transcript segments with diarization turns and matches voice
//! embeddings against the persistent cross-meeting speaker index.

pub mod align;
pub mod index;

pub use align::align_transcript;
pub use index::{
    cosine_similarity, MatchOutcome, SpeakerEmbeddingIndex, SpeakerMatch,
    DEFAULT_SIMILARITY_THRESHOLD, TIE_EPSILON,
};
