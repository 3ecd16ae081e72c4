//! Cache key construction.

use kbqa_core::{CacheKey, EngineConfig, PayloadKind, RerankBlend, SearchFilter};

/// Everything that shapes a cached result.
#[derive(Debug, Clone, Copy)]
pub struct KeyInput<'a> {
    pub kind: PayloadKind,
    pub query: &'a str,
    pub top_k: usize,
    pub filter: &'a SearchFilter,

    /// Scoring, fusion and rerank settings.
    pub config: &'a EngineConfig,

    /// Model id of the query embedder.
    pub embedder: &'a str,

    /// Model id of the answer generator; only hashed for answers.
    pub generator: Option<&'a str>,
}

impl KeyInput<'_> {
    /// Content-addressed key (blake3, hex).
    ///
    /// Fields are length-prefixed so distinct inputs can never collide by
    /// concatenation.
    pub fn key(&self) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        let config = self.config;

        field(self.kind.as_str().as_bytes());
        field(normalize_query(self.query).as_bytes());
        field(&(self.top_k as u64).to_le_bytes());

        field(&config.keyword.k1.to_bits().to_le_bytes());
        field(&config.keyword.b.to_bits().to_le_bytes());
        field(self.embedder.as_bytes());
        field(&config.vector.min_score.to_bits().to_le_bytes());
        field(&(config.fusion.fetch_count(self.top_k) as u64).to_le_bytes());
        field(&config.fusion.rrf_k.to_bits().to_le_bytes());

        let rerank = &config.rerank;
        if rerank.enabled {
            let blend: &[u8] = match rerank.blend {
                RerankBlend::Multiplicative => b"mul",
                RerankBlend::Additive => b"add",
            };
            field(blend);
            field(&rerank.weight.to_bits().to_le_bytes());
        } else {
            field(b"off");
        }

        if self.kind == PayloadKind::Answer {
            field(self.generator.unwrap_or("").as_bytes());
            field(&(config.answer.context_chunks as u64).to_le_bytes());
        }

        // BTreeSet iteration is already sorted
        match &self.filter.document_ids {
            None => field(b"*"),
            Some(ids) => {
                field(&(ids.len() as u64).to_le_bytes());
                for id in ids {
                    field(id.as_str().as_bytes());
                }
            }
        }

        CacheKey::new(hex::encode(hasher.finalize().as_bytes()))
    }
}

/// Lower-case, collapse runs of whitespace, trim.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        query: &'a str,
        config: &'a EngineConfig,
        filter: &'a SearchFilter,
    ) -> KeyInput<'a> {
        KeyInput {
            kind: PayloadKind::Retrieval,
            query,
            top_k: 10,
            filter,
            config,
            embedder: "hash-256",
            generator: None,
        }
    }

    fn changed(edit: impl FnOnce(&mut EngineConfig)) -> EngineConfig {
        let mut config = EngineConfig::default();
        edit(&mut config);
        config
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  What IS\tBM25?\n "), "what is bm25?");
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn test_equivalent_queries_share_key() {
        let config = EngineConfig::default();
        let filter = SearchFilter::all();
        let a = input("Hybrid  Search", &config, &filter).key();
        let b = input(" hybrid search ", &config, &filter).key();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_parameters_change_key() {
        let config = EngineConfig::default();
        let filter = SearchFilter::all();
        let base = input("hybrid search", &config, &filter);

        let mut other = base;
        other.top_k = 5;
        assert_ne!(base.key(), other.key());

        let mut other = base;
        other.kind = PayloadKind::Answer;
        assert_ne!(base.key(), other.key());

        let mut other = base;
        other.embedder = "hash-512";
        assert_ne!(base.key(), other.key());

        let scoped = SearchFilter::documents(["d1"]);
        assert_ne!(base.key(), input("hybrid search", &config, &scoped).key());
    }

    #[test]
    fn test_scoring_settings_change_key() {
        let filter = SearchFilter::all();
        let base = input("hybrid search", &EngineConfig::default(), &filter).key();

        let variants = [
            changed(|c| c.keyword.k1 = 1.5),
            changed(|c| c.keyword.b = 0.5),
            changed(|c| c.vector.min_score = 0.2),
            changed(|c| c.fusion.rrf_k = 30.0),
            changed(|c| c.fusion.min_candidates = 50),
            changed(|c| c.rerank.enabled = false),
            changed(|c| c.rerank.weight = 0.9),
        ];
        for config in &variants {
            assert_ne!(base, input("hybrid search", config, &filter).key());
        }
    }

    #[test]
    fn test_fetch_count_not_raw_multiplier() {
        // Both settings fetch 20 candidates for top_k 10
        let filter = SearchFilter::all();
        let a = changed(|c| c.fusion.candidate_multiplier = 1);
        let b = changed(|c| c.fusion.candidate_multiplier = 2);
        assert_eq!(
            input("q", &a, &filter).key(),
            input("q", &b, &filter).key()
        );
    }

    #[test]
    fn test_answer_settings_only_shape_answer_keys() {
        let filter = SearchFilter::all();
        let config = EngineConfig::default();
        let fewer = changed(|c| c.answer.context_chunks = 2);

        let retrieval = input("q", &config, &filter);
        assert_eq!(retrieval.key(), input("q", &fewer, &filter).key());

        let answer = KeyInput {
            kind: PayloadKind::Answer,
            generator: Some("scripted"),
            ..retrieval
        };
        let other_context = KeyInput {
            config: &fewer,
            ..answer
        };
        let other_model = KeyInput {
            generator: Some("extractive"),
            ..answer
        };
        assert_ne!(answer.key(), other_context.key());
        assert_ne!(answer.key(), other_model.key());
    }

    #[test]
    fn test_filter_order_is_irrelevant() {
        let config = EngineConfig::default();
        let a = SearchFilter::documents(["d2", "d1"]);
        let b = SearchFilter::documents(["d1", "d2"]);
        assert_eq!(
            input("q", &config, &a).key(),
            input("q", &config, &b).key()
        );
    }

    #[test]
    fn test_no_concatenation_collision() {
        let config = EngineConfig::default();
        let a = SearchFilter::documents(["ab", "c"]);
        let b = SearchFilter::documents(["a", "bc"]);
        assert_ne!(
            input("q", &config, &a).key(),
            input("q", &config, &b).key()
        );
    }
}
