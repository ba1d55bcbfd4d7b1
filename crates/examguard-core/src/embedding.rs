//! Embedding Cache: one mean embedding per user, held in memory.
//!
//! Rebuilt wholesale by each training pass and lost on restart; the Sample
//! Store stays the source of truth.

use crate::types::Embedding;
use std::collections::BTreeMap;

/// Best cache entry for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestUser {
    pub user_id: String,
    /// Cosine distance in [0, 2], lower = closer.
    pub distance: f32,
    /// Whether `distance` is strictly below the acceptance threshold.
    pub accepted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingCache {
    means: BTreeMap<String, Embedding>,
}

impl EmbeddingCache {
    /// Build from per-user embedding sets; users with no usable embedding
    /// are left out.
    pub fn from_user_embeddings(per_user: BTreeMap<String, Vec<Embedding>>) -> Self {
        let means = per_user
            .into_iter()
            .filter_map(|(user, embeddings)| Embedding::mean(&embeddings).map(|m| (user, m)))
            .collect();
        Self { means }
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.means.contains_key(user_id)
    }

    /// Nearest user mean by cosine distance. Every entry is compared.
    pub fn nearest(&self, probe: &Embedding, threshold: f32) -> Option<NearestUser> {
        let mut best: Option<(&String, f32)> = None;

        for (user, mean) in &self.means {
            let distance = probe.cosine_distance(mean);
            let is_better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((user, distance));
            }
        }

        best.map(|(user, distance)| NearestUser {
            user_id: user.clone(),
            distance,
            accepted: distance < threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    fn cache() -> EmbeddingCache {
        let mut per_user = BTreeMap::new();
        per_user.insert("alice".to_string(), vec![emb(vec![1.0, 0.0, 0.0]), emb(vec![0.9, 0.1, 0.0])]);
        per_user.insert("bob".to_string(), vec![emb(vec![0.0, 1.0, 0.0])]);
        per_user.insert("nobody".to_string(), vec![]);
        EmbeddingCache::from_user_embeddings(per_user)
    }

    #[test]
    fn test_users_without_embeddings_are_skipped() {
        let c = cache();
        assert_eq!(c.len(), 2);
        assert!(!c.contains("nobody"));
    }

    #[test]
    fn test_nearest_accepts_close_probe() {
        let hit = cache().nearest(&emb(vec![1.0, 0.05, 0.0]), 0.4).unwrap();
        assert_eq!(hit.user_id, "alice");
        assert!(hit.accepted);
    }

    #[test]
    fn test_nearest_compares_every_entry() {
        // Best match is the last entry in key order
        let hit = cache().nearest(&emb(vec![0.0, 1.0, 0.0]), 0.4).unwrap();
        assert_eq!(hit.user_id, "bob");
        assert!(hit.distance.abs() < 1e-6);
    }

    #[test]
    fn test_nearest_rejects_far_probe() {
        let hit = cache().nearest(&emb(vec![0.0, 0.0, 1.0]), 0.4).unwrap();
        assert!(!hit.accepted);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        // Orthogonal to both means: distance exactly 1.0
        let hit = cache().nearest(&emb(vec![0.0, 0.0, 1.0]), 1.0).unwrap();
        assert!((hit.distance - 1.0).abs() < 1e-6);
        assert!(!hit.accepted);
    }

    #[test]
    fn test_empty_cache() {
        assert!(EmbeddingCache::default().nearest(&emb(vec![1.0]), 0.4).is_none());
    }
}
