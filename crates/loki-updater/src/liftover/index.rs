use super::chain::Chain;
use std::collections::HashMap;

/// All chains from one build to another, grouped by old chromosome.
///
/// Within a chromosome chains are ordered by descending score (ties by id)
/// and each chain's segments by `old_start`.
#[derive(Debug, Clone, Default)]
pub struct ChainIndex {
    old_build: i64,
    new_build: i64,
    by_chr: HashMap<String, Vec<Chain>>,
}

/// A successful mapping: chromosome and closed interval in the new build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedInterval {
    pub chain_id: i64,
    pub chr: String,
    pub start: i64,
    pub end: i64,
}

impl ChainIndex {
    pub fn new(old_build: i64, new_build: i64, chains: Vec<Chain>) -> Self {
        let mut by_chr: HashMap<String, Vec<Chain>> = HashMap::new();
        for mut chain in chains {
            chain.segments.sort_by_key(|s| s.old_start);
            by_chr.entry(chain.old_chr.clone()).or_default().push(chain);
        }
        for chains in by_chr.values_mut() {
            chains.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));
        }
        Self {
            old_build,
            new_build,
            by_chr,
        }
    }

    pub fn old_build(&self) -> i64 {
        self.old_build
    }

    pub fn new_build(&self) -> i64 {
        self.new_build
    }

    pub fn is_empty(&self) -> bool {
        self.by_chr.is_empty()
    }

    pub fn chain_count(&self) -> usize {
        self.by_chr.values().map(Vec::len).sum()
    }

    /// Chains on `chr` overlapping `start..=end`, best score first
    pub fn candidates<'a>(
        &'a self,
        chr: &str,
        start: i64,
        end: i64,
    ) -> impl Iterator<Item = &'a Chain> + 'a {
        self.by_chr
            .get(chr)
            .into_iter()
            .flatten()
            .filter(move |c| c.overlaps(start, end))
    }

    /// Map through the highest-scoring chain that covers enough of the interval
    pub fn map_interval(
        &self,
        chr: &str,
        start: i64,
        end: i64,
        min_coverage: f64,
    ) -> Option<MappedInterval> {
        let (start, end) = if start > end { (end, start) } else { (start, end) };
        self.candidates(chr, start, end).find_map(|chain| {
            chain
                .map_interval(start, end, min_coverage)
                .map(|(new_start, new_end)| MappedInterval {
                    chain_id: chain.id,
                    chr: chain.new_chr.clone(),
                    start: new_start,
                    end: new_end,
                })
        })
    }
}
