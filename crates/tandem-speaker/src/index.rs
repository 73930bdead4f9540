//! Cross-meeting speaker index
//!
//! Persists known speakers with their voice embeddings and matches the
//! per-meeting diarization embeddings against them by cosine similarity.
//! Two known speakers scoring within a small epsilon of each other are a
//! tie; the caller must ask the user rather than auto-assign.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tandem_types::{Error, KnownSpeaker, Result, SpeakerEmbedding};

/// Minimum cosine similarity for a suggestion.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.75;

/// Two matches closer than this are indistinguishable.
pub const TIE_EPSILON: f32 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeakerStore {
    version: i32,
    speakers: Vec<KnownSpeaker>,
}

impl Default for SpeakerStore {
    fn default() -> Self {
        Self {
            version: 1,
            speakers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeakerMatch {
    pub speaker: KnownSpeaker,
    pub similarity: f32,
}

/// Outcome of matching one meeting embedding against the index.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Best match at or above the threshold, if any.
    pub best: Option<SpeakerMatch>,
    /// True when the runner-up scored within [`TIE_EPSILON`] of the best.
    pub ambiguous: bool,
}

impl MatchOutcome {
    fn none() -> Self {
        Self {
            best: None,
            ambiguous: false,
        }
    }
}

/// Persistent speaker store backed by `speakers.json`.
pub struct SpeakerEmbeddingIndex {
    path: PathBuf,
    data: Arc<RwLock<SpeakerStore>>,
}

impl SpeakerEmbeddingIndex {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        let path = data_dir.join("speakers.json");

        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            SpeakerStore::default()
        };

        tracing::info!(
            "Speaker index: loaded {} speakers from {:?}",
            data.speakers.len(),
            path
        );

        Ok(Self {
            path,
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Match a meeting embedding against every known speaker.
    pub fn match_embedding(&self, embedding: &[f32], threshold: f32) -> MatchOutcome {
        let data = self.data.read();
        if data.speakers.is_empty() {
            return MatchOutcome::none();
        }

        let mut scored: Vec<(&KnownSpeaker, f32)> = data
            .speakers
            .iter()
            .map(|s| (s, cosine_similarity(embedding, &s.embedding.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best, best_sim) = scored[0];
        if best_sim < threshold {
            return MatchOutcome::none();
        }

        let ambiguous = scored
            .get(1)
            .map(|&(_, second)| second >= threshold && best_sim - second < TIE_EPSILON)
            .unwrap_or(false);

        if ambiguous {
            tracing::info!(
                "Speaker match is a near tie: {} at {:.3} vs {:.3}",
                best.name,
                best_sim,
                scored[1].1
            );
        }

        MatchOutcome {
            best: Some(SpeakerMatch {
                speaker: best.clone(),
                similarity: best_sim,
            }),
            ambiguous,
        }
    }

    /// Register a new speaker from a meeting embedding.
    pub fn add(&self, name: &str, vector: Vec<f32>) -> Result<KnownSpeaker> {
        {
            let data = self.data.read();
            if let Some(existing) = data.speakers.first() {
                if existing.embedding.dim() != vector.len() {
                    return Err(Error::EmbeddingDimension {
                        expected: existing.embedding.dim(),
                        got: vector.len(),
                    });
                }
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let speaker = KnownSpeaker {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            embedding: SpeakerEmbedding::new(normalize(&vector)),
            created_at: now.clone(),
            updated_at: now,
        };

        {
            let mut data = self.data.write();
            data.speakers.push(speaker.clone());
        }
        self.save()?;

        tracing::info!("Speaker added: {} ({})", speaker.name, &speaker.id[..8]);
        Ok(speaker)
    }

    /// Fold a fresh meeting embedding into an existing speaker.
    ///
    /// Weighted running average: the stored vector carries the weight of
    /// every sample folded in so far, the new one a weight of one. The
    /// result is re-normalized before storing, so the stored embedding is
    /// the weighted average up to positive scale only; cosine matching is
    /// scale-invariant, so matches are unaffected.
    pub fn reinforce(&self, id: &str, new_vector: &[f32]) -> Result<()> {
        {
            let mut data = self.data.write();
            let speaker = data
                .speakers
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::Config(format!("Unknown speaker id: {id}")))?;

            if speaker.embedding.dim() != new_vector.len() {
                return Err(Error::EmbeddingDimension {
                    expected: speaker.embedding.dim(),
                    got: new_vector.len(),
                });
            }

            let count = speaker.embedding.sample_count as f32;
            for (old, &new) in speaker.embedding.vector.iter_mut().zip(new_vector) {
                *old = (*old * count + new) / (count + 1.0);
            }
            speaker.embedding.vector = normalize(&speaker.embedding.vector);
            speaker.embedding.sample_count += 1;
            speaker.updated_at = chrono::Utc::now().to_rfc3339();

            tracing::debug!(
                "Speaker reinforced: {} (samples={})",
                speaker.name,
                speaker.embedding.sample_count
            );
        }
        self.save()
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<()> {
        {
            let mut data = self.data.write();
            let speaker = data
                .speakers
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::Config(format!("Unknown speaker id: {id}")))?;
            speaker.name = name.to_string();
            speaker.updated_at = chrono::Utc::now().to_rfc3339();
        }
        self.save()
    }

    pub fn all(&self) -> Vec<KnownSpeaker> {
        self.data.read().speakers.clone()
    }

    pub fn count(&self) -> usize {
        self.data.read().speakers.len()
    }

    /// Atomic write via temp file so a crash never truncates the store.
    fn save(&self) -> Result<()> {
        let data = self.data.read();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&*data)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

/// Cosine similarity in f64 to avoid drift on long embeddings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut norm_a: f64 = 0.0;
    let mut norm_b: f64 = 0.0;

    for i in 0..a.len() {
        let x = a[i] as f64;
        let y = b[i] as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let sum_sq: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum();
    if sum_sq < 1e-10 {
        return v.to_vec();
    }
    let inv = (1.0 / sum_sq.sqrt()) as f32;
    v.iter().map(|&x| x * inv).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> (SpeakerEmbeddingIndex, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let index = SpeakerEmbeddingIndex::new(dir.path().to_path_buf()).unwrap();
        (index, dir)
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_dims_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn empty_index_never_matches() {
        let (index, _dir) = index();
        let outcome = index.match_embedding(&[1.0, 0.0, 0.0], DEFAULT_SIMILARITY_THRESHOLD);
        assert!(outcome.best.is_none());
        assert!(!outcome.ambiguous);
    }

    #[test]
    fn match_above_threshold_suggests_name() {
        let (index, _dir) = index();
        index.add("Alice", vec![1.0, 0.0, 0.0]).unwrap();
        index.add("Bob", vec![0.0, 1.0, 0.0]).unwrap();

        let outcome = index.match_embedding(&[0.98, 0.2, 0.0], DEFAULT_SIMILARITY_THRESHOLD);
        let best = outcome.best.expect("should match Alice");
        assert_eq!(best.speaker.name, "Alice");
        assert!(best.similarity > 0.9);
        assert!(!outcome.ambiguous);
    }

    #[test]
    fn below_threshold_is_no_match() {
        let (index, _dir) = index();
        index.add("Alice", vec![1.0, 0.0, 0.0]).unwrap();

        let outcome = index.match_embedding(&[0.2, 1.0, 0.0], DEFAULT_SIMILARITY_THRESHOLD);
        assert!(outcome.best.is_none());
    }

    #[test]
    fn near_tie_is_flagged_ambiguous() {
        let (index, _dir) = index();
        // Two speakers nearly equidistant from the probe.
        index.add("Alice", vec![1.0, 0.1, 0.0]).unwrap();
        index.add("Bob", vec![1.0, -0.1, 0.0]).unwrap();

        let outcome = index.match_embedding(&[1.0, 0.0, 0.0], DEFAULT_SIMILARITY_THRESHOLD);
        assert!(outcome.best.is_some());
        assert!(outcome.ambiguous, "equidistant speakers must surface as a tie");
    }

    #[test]
    fn clear_winner_is_not_ambiguous() {
        let (index, _dir) = index();
        index.add("Alice", vec![1.0, 0.0, 0.0]).unwrap();
        index.add("Bob", vec![0.6, 0.8, 0.0]).unwrap();

        let outcome = index.match_embedding(&[1.0, 0.02, 0.0], DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(outcome.best.unwrap().speaker.name, "Alice");
        assert!(!outcome.ambiguous);
    }

    #[test]
    fn reinforce_applies_weighted_average() {
        let (index, _dir) = index();
        let added = index.add("Alice", vec![1.0, 0.0]).unwrap();

        // First reinforcement: old weight 1, new weight 1.
        index.reinforce(&added.id, &[0.0, 1.0]).unwrap();
        let after_one = &index.all()[0].embedding;
        assert_eq!(after_one.sample_count, 2);
        let v = &after_one.vector;
        assert!((v[0] - v[1]).abs() < 1e-6, "equal weights average to the midpoint");

        // Second reinforcement: old weight 2, new weight 1.
        index.reinforce(&added.id, &[0.0, 1.0]).unwrap();
        let after_two = &index.all()[0].embedding;
        assert_eq!(after_two.sample_count, 3);
        // Pre-normalization blend is (2*(.5,.5)+(0,1))/3 up to scale, so the
        // second component must dominate.
        assert!(after_two.vector[1] > after_two.vector[0]);
    }

    #[test]
    fn reinforce_rejects_dimension_mismatch() {
        let (index, _dir) = index();
        let added = index.add("Alice", vec![1.0, 0.0, 0.0]).unwrap();
        let err = index.reinforce(&added.id, &[1.0]).unwrap_err();
        assert!(matches!(err, Error::EmbeddingDimension { expected: 3, got: 1 }));
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = SpeakerEmbeddingIndex::new(dir.path().to_path_buf()).unwrap();
            index.add("Alice", vec![1.0, 0.0]).unwrap();
            index.add("Bob", vec![0.0, 1.0]).unwrap();
        }

        let reloaded = SpeakerEmbeddingIndex::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.count(), 2);
        let names: Vec<_> = reloaded.all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn rename_updates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let index = SpeakerEmbeddingIndex::new(dir.path().to_path_buf()).unwrap();
        let added = index.add("Alice", vec![1.0, 0.0]).unwrap();
        index.rename(&added.id, "Alicia").unwrap();

        let reloaded = SpeakerEmbeddingIndex::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.all()[0].name, "Alicia");
    }
}
