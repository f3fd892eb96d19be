use super::index::ChainIndex;
use super::storage;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A labelled interval with caller data carried through the mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region<P> {
    pub label: String,
    pub chr: String,
    pub start: i64,
    pub end: i64,
    pub payload: P,
}

impl<P> Region<P> {
    pub fn new(label: impl Into<String>, chr: impl Into<String>, start: i64, end: i64, payload: P) -> Self {
        Self {
            label: label.into(),
            chr: chr.into(),
            start,
            end,
            payload,
        }
    }

    pub fn is_point(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifted<P> {
    /// Region expressed in the new build
    Mapped(Region<P>),
    /// Original region; no chain covered enough of it
    Unmapped(Region<P>),
}

impl<P> Lifted<P> {
    pub fn mapped(self) -> Option<Region<P>> {
        match self {
            Lifted::Mapped(region) => Some(region),
            Lifted::Unmapped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftTally {
    pub mapped: u64,
    pub unmapped: u64,
}

impl LiftTally {
    pub fn add(&mut self, other: LiftTally) {
        self.mapped += other.mapped;
        self.unmapped += other.unmapped;
    }
}

type UnmappedCallback<P> = Box<dyn FnMut(&Region<P>) + Send>;

/// Lazy mapping of a region sequence; regions are mapped as they are pulled
pub struct LiftOver<I, P> {
    index: Arc<ChainIndex>,
    regions: I,
    min_coverage: f64,
    tally: LiftTally,
    on_unmapped: Option<UnmappedCallback<P>>,
}

impl<I, P> LiftOver<I, P>
where
    I: Iterator<Item = Region<P>>,
{
    pub fn new(index: Arc<ChainIndex>, regions: I, min_coverage: f64) -> Self {
        Self {
            index,
            regions,
            min_coverage,
            tally: LiftTally::default(),
            on_unmapped: None,
        }
    }

    /// Called with each region that could not be mapped
    pub fn on_unmapped(mut self, callback: impl FnMut(&Region<P>) + Send + 'static) -> Self {
        self.on_unmapped = Some(Box::new(callback));
        self
    }

    /// Counts so far
    pub fn tally(&self) -> LiftTally {
        self.tally
    }
}

impl<I, P> Iterator for LiftOver<I, P>
where
    I: Iterator<Item = Region<P>>,
{
    type Item = Lifted<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.regions.next()?;
        match self
            .index
            .map_interval(&region.chr, region.start, region.end, self.min_coverage)
        {
            Some(mapped) => {
                self.tally.mapped += 1;
                let end = if region.is_point() { mapped.start } else { mapped.end };
                Some(Lifted::Mapped(Region {
                    label: region.label,
                    chr: mapped.chr,
                    start: mapped.start,
                    end,
                    payload: region.payload,
                }))
            },
            None => {
                self.tally.unmapped += 1;
                if let Some(callback) = self.on_unmapped.as_mut() {
                    callback(&region);
                }
                Some(Lifted::Unmapped(region))
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.regions.size_hint()
    }
}

/// Maps regions between builds, caching one [`ChainIndex`] per build pair
pub struct LiftOverEngine {
    min_coverage: f64,
    cache: RwLock<HashMap<(i64, i64), Arc<ChainIndex>>>,
}

impl LiftOverEngine {
    pub fn new(min_coverage: f64) -> Self {
        Self {
            min_coverage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn min_coverage(&self) -> f64 {
        self.min_coverage
    }

    /// Chain index for a build pair, loading it on first use
    pub async fn index(
        &self,
        conn: &mut SqliteConnection,
        old_build: i64,
        new_build: i64,
    ) -> Result<Arc<ChainIndex>> {
        if let Some(index) = self.cache.read().await.get(&(old_build, new_build)) {
            return Ok(Arc::clone(index));
        }

        let chains = storage::load_chains(conn, old_build, new_build).await?;
        let index = Arc::new(ChainIndex::new(old_build, new_build, chains));
        info!(
            old_build,
            new_build,
            chains = index.chain_count(),
            "chain index built"
        );
        self.cache
            .write()
            .await
            .insert((old_build, new_build), Arc::clone(&index));
        Ok(index)
    }

    /// Drop cached indexes after chain tables change
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        if !cache.is_empty() {
            debug!(entries = cache.len(), "chain index cache invalidated");
            cache.clear();
        }
    }

    pub async fn has_chains(
        &self,
        conn: &mut SqliteConnection,
        old_build: i64,
        new_build: i64,
    ) -> Result<bool> {
        storage::has_chains(conn, old_build, new_build).await
    }

    /// Lazily map `regions` from `old_build` to `new_build`
    pub async fn map_regions<I, P>(
        &self,
        conn: &mut SqliteConnection,
        old_build: i64,
        new_build: i64,
        regions: I,
    ) -> Result<LiftOver<I::IntoIter, P>>
    where
        I: IntoIterator<Item = Region<P>>,
    {
        let index = self.index(conn, old_build, new_build).await?;
        Ok(LiftOver::new(index, regions.into_iter(), self.min_coverage))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::chain::{Chain, ChainSegment};
    use super::*;
    use std::sync::Mutex;

    fn index() -> Arc<ChainIndex> {
        Arc::new(ChainIndex::new(
            18,
            19,
            vec![Chain {
                id: 1,
                old_build: 18,
                old_chr: "chr1".into(),
                old_start: 900,
                old_end: 2100,
                new_build: 19,
                new_chr: "chr1".into(),
                new_start: 5900,
                new_end: 7100,
                score: 1,
                forward: true,
                segments: vec![ChainSegment {
                    old_start: 900,
                    old_end: 2100,
                    new_start: 5900,
                }],
            }],
        ))
    }

    #[test]
    fn test_lazy_mapping_with_tally_and_callback() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let regions = vec![
            Region::new("gene", "chr1", 1000, 2000, 1u32),
            Region::new("snp", "chr1", 1500, 1500, 2u32),
            Region::new("far", "chr1", 5000, 6000, 3u32),
        ];

        let mut lift = LiftOver::new(index(), regions.into_iter(), 0.95)
            .on_unmapped(move |r| sink.lock().unwrap().push(r.label.clone()));

        let first = lift.next().unwrap().mapped().unwrap();
        assert_eq!((first.chr.as_str(), first.start, first.end), ("chr1", 6000, 7000));
        assert_eq!(lift.tally(), LiftTally { mapped: 1, unmapped: 0 });

        let rest: Vec<_> = lift.by_ref().collect();
        assert!(matches!(&rest[0], Lifted::Mapped(r) if r.start == 6500 && r.end == 6500));
        assert!(matches!(&rest[1], Lifted::Unmapped(r) if r.payload == 3));
        assert_eq!(lift.tally(), LiftTally { mapped: 2, unmapped: 1 });
        assert_eq!(*dropped.lock().unwrap(), vec!["far".to_string()]);
    }
}
