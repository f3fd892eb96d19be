//! Liftover and build reconciliation tests
//!
//! Coverage includes:
//! - Region mapping over stored chains
//! - Coverage threshold and chain scoring
//! - Reconciliation of sources on older builds during a refresh
//! - Purged sources dropping out of target selection
//! - Cross-mapping warnings recorded once per load
//! - Zone fix-up after loads and liftover
//! - Run abort when a deferred fix-up fails

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use common::{chain, env, env_with, gene, ChainSource, GeneSource};
use loki_updater::liftover::LiftTally;
use loki_updater::{
    FixUp, Lifted, Region, RefreshRequest, RunStatus, UpdateError, ZoneFixUp,
};
use sqlx::SqliteConnection;
use std::sync::{Arc, Mutex};

async fn region_of(env: &common::TestEnv, gene_id: i64) -> Option<(String, i64, i64)> {
    sqlx::query_as("SELECT chr, pos_start, pos_end FROM gene_region WHERE gene_id = ?")
        .bind(gene_id)
        .fetch_optional(env.store().pool())
        .await
        .unwrap()
}

// ============================================================================
// Region Mapping
// ============================================================================

#[tokio::test]
async fn test_region_inside_segment_maps_with_offset() {
    let env = env(vec![Arc::new(ChainSource::new(vec![chain(
        18, 19, 900, 2100, 5900, 100,
    )]))])
    .await;
    assert!(env.updater.refresh(RefreshRequest::default()).await.unwrap().success);

    let lifted: Vec<_> = env
        .updater
        .map_regions(18, 19, vec![Region::new("BRCA1", "chr1", 1000, 2000, 7u32)])
        .await
        .unwrap()
        .collect();

    match &lifted[0] {
        Lifted::Mapped(r) => {
            assert_eq!((r.label.as_str(), r.chr.as_str(), r.start, r.end), ("BRCA1", "chr1", 6000, 7000));
            assert_eq!(r.payload, 7);
        },
        other => panic!("expected a mapping, got {other:?}"),
    }
}

#[tokio::test]
async fn test_highest_scoring_chain_wins() {
    let env = env(vec![Arc::new(ChainSource::new(vec![
        chain(18, 19, 900, 2100, 5900, 100),
        chain(18, 19, 900, 2100, 105900, 500),
    ]))])
    .await;
    env.updater.refresh(RefreshRequest::default()).await.unwrap();

    let mapped = env
        .updater
        .map_regions(18, 19, vec![Region::new("r", "chr1", 1000, 2000, ())])
        .await
        .unwrap()
        .next()
        .unwrap()
        .mapped()
        .unwrap();
    assert_eq!((mapped.start, mapped.end), (106000, 107000));
}

#[tokio::test]
async fn test_partial_coverage_is_unmapped() {
    let env = env(vec![Arc::new(ChainSource::new(vec![chain(
        18, 19, 900, 2100, 5900, 100,
    )]))])
    .await;
    env.updater.refresh(RefreshRequest::default()).await.unwrap();

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dropped);
    let regions = vec![
        Region::new("inside", "chr1", 1000, 2000, ()),
        Region::new("straddling", "chr1", 2000, 2300, ()),
        Region::new("point", "chr1", 1500, 1500, ()),
    ];
    let mut lift = env
        .updater
        .map_regions(18, 19, regions)
        .await
        .unwrap()
        .on_unmapped(move |r| sink.lock().unwrap().push(r.label.clone()));

    let results: Vec<_> = lift.by_ref().collect();
    assert!(matches!(&results[1], Lifted::Unmapped(r) if r.start == 2000 && r.end == 2300));
    assert!(matches!(&results[2], Lifted::Mapped(r) if r.start == 6500 && r.end == 6500));
    assert_eq!(lift.tally(), LiftTally { mapped: 2, unmapped: 1 });
    assert_eq!(*dropped.lock().unwrap(), vec!["straddling".to_string()]);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_refresh_lifts_sources_onto_newest_build() {
    let old = Arc::new(
        GeneSource::new(
            "Old",
            vec![
                gene(1, "A1BG", "chr1", 1000, 2000),
                gene(2, "NAT2", "chr2", 500, 600),
            ],
        )
        .on_build(18),
    );
    let new = Arc::new(
        GeneSource::new("New", vec![gene(3, "ADA", "chr1", 150000, 250000)]).on_build(19),
    );
    let chains = Arc::new(ChainSource::new(vec![chain(18, 19, 1, 1_000_000, 5001, 1000)]));
    let env = env_with(
        vec![chains, old.clone(), new.clone()],
        |_| {},
        |u| u.with_fixup(ZoneFixUp::new("gene_region", "gene_zone").entity_column("gene_id")),
    )
    .await;

    let report = env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert!(report.success);
    assert_eq!(report.reconciliation.target_build, Some(19));
    assert_eq!(report.reconciliation.lifted.len(), 1);
    let lifted = &report.reconciliation.lifted[0];
    assert_eq!(lifted.source, "Old");
    assert_eq!((lifted.from_build, lifted.to_build), (18, 19));
    assert_eq!((lifted.mapped, lifted.unmapped), (1, 1));
    assert_eq!(report.fixups, vec!["zones".to_string()]);

    assert_eq!(region_of(&env, 1).await, Some(("chr1".to_string(), 6000, 7000)));
    // no chain covers chr2
    assert_eq!(region_of(&env, 2).await, None);
    assert_eq!(region_of(&env, 3).await, Some(("chr1".to_string(), 150000, 250000)));

    let sources = env.updater.sources().await.unwrap();
    for source in sources.iter().filter(|s| s.name != "liftOver") {
        assert_eq!(source.current_build, Some(19), "{}", source.name);
        assert_eq!(source.target_build, Some(19), "{}", source.name);
    }
    assert_eq!(
        env.store().get_setting("target_build").await.unwrap().as_deref(),
        Some("19")
    );

    let zones: Vec<(i64, i64)> =
        sqlx::query_as("SELECT gene_id, zone FROM gene_zone ORDER BY gene_id, zone")
            .fetch_all(env.store().pool())
            .await
            .unwrap();
    assert_eq!(zones, vec![(1, 0), (3, 1), (3, 2)]);

    let warnings = env.updater.warnings("Old").await.unwrap();
    assert!(warnings.iter().any(|w| w.message.contains("could not be lifted")));

    // nothing changed: no reload, no liftover, no fix-up
    let again = env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert!(again.success);
    assert!(again.reconciliation.lifted.is_empty());
    assert!(again.fixups.is_empty());
    assert_eq!(old.loads(), 1);
    assert_eq!(region_of(&env, 1).await, Some(("chr1".to_string(), 6000, 7000)));
}

#[tokio::test]
async fn test_source_without_chains_stays_on_its_build() {
    let old = Arc::new(GeneSource::new("Old", vec![gene(1, "A1BG", "chr1", 1000, 2000)]).on_build(18));
    let new = Arc::new(GeneSource::new("New", vec![gene(3, "ADA", "chr1", 5000, 6000)]).on_build(19));
    let env = env(vec![old, new]).await;

    let report = env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert!(report.success);
    assert_eq!(report.reconciliation.skipped, vec!["Old".to_string()]);

    let sources = env.updater.sources().await.unwrap();
    let old = sources.iter().find(|s| s.name == "Old").unwrap();
    assert_eq!(old.current_build, Some(18));
    assert_eq!(old.target_build, Some(19));
    assert_eq!(region_of(&env, 1).await, Some(("chr1".to_string(), 1000, 2000)));

    let warnings = env.updater.warnings("Old").await.unwrap();
    assert!(warnings
        .iter()
        .any(|w| w.message.contains("no chains from hg18 to hg19")));
}

#[tokio::test]
async fn test_grch_declaration_is_cross_mapped() {
    let ensembl = Arc::new(
        GeneSource::new("Ensembl", vec![gene(4, "CFTR", "chr7", 117480025, 117668665)]).on_grch(37),
    );
    let chains = Arc::new(ChainSource::new(Vec::new()).with_equivalence(37, 19));
    let env = env(vec![chains, ensembl]).await;

    let report = env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert!(report.success);
    assert_eq!(report.reconciliation.target_build, Some(19));

    let sources = env.updater.sources().await.unwrap();
    let ensembl = sources.iter().find(|s| s.name == "Ensembl").unwrap();
    assert_eq!(ensembl.grch, Some(37));
    assert_eq!(ensembl.ucschg, Some(19));
    assert_eq!(ensembl.current_build, Some(19));
}

#[tokio::test]
async fn test_unmatched_grch_warned_only_when_loaded() {
    let ensembl = Arc::new(
        GeneSource::new("Ensembl", vec![gene(4, "CFTR", "chr7", 117480025, 117668665)]).on_grch(37),
    );
    let env = env(vec![ensembl.clone()]).await;

    env.updater.refresh(RefreshRequest::default()).await.unwrap();
    env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert_eq!(ensembl.loads(), 1);

    let warnings = env.updater.warnings("Ensembl").await.unwrap();
    let unmatched: Vec<_> = warnings
        .iter()
        .filter(|w| w.message.contains("GRCh37"))
        .collect();
    assert_eq!(unmatched.len(), 1);
}

#[tokio::test]
async fn test_purged_source_does_not_set_target() {
    let old = Arc::new(GeneSource::new("Old", vec![gene(1, "A1BG", "chr1", 1000, 2000)]).on_build(18));
    let new = Arc::new(GeneSource::new("New", vec![gene(3, "ADA", "chr1", 5000, 6000)]).on_build(19));
    let chains = Arc::new(ChainSource::new(vec![chain(18, 19, 1, 1_000_000, 5001, 1000)]));
    let env = env(vec![chains, old, new]).await;

    let report = env
        .updater
        .refresh(RefreshRequest::for_sources(&["liftOver", "New"]))
        .await
        .unwrap();
    assert_eq!(report.reconciliation.target_build, Some(19));

    env.updater.purge("New").await.unwrap();
    let sources = env.updater.sources().await.unwrap();
    let purged = sources.iter().find(|s| s.name == "New").unwrap();
    assert_eq!(purged.current_build, None);
    assert_eq!(purged.ucschg, None);

    // hg19 rows are gone, so Old stays on hg18 despite the chains
    let report = env
        .updater
        .refresh(RefreshRequest::for_sources(&["Old"]))
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.reconciliation.target_build, Some(18));
    assert!(report.reconciliation.lifted.is_empty());
    assert_eq!(region_of(&env, 1).await, Some(("chr1".to_string(), 1000, 2000)));
}

// ============================================================================
// Abort
// ============================================================================

struct LockedZones;

#[async_trait]
impl FixUp for LockedZones {
    fn name(&self) -> &str {
        "locked-zones"
    }

    fn triggers(&self) -> Vec<&str> {
        vec!["gene_region"]
    }

    async fn apply(&self, _conn: &mut SqliteConnection) -> loki_updater::Result<u64> {
        Err(UpdateError::Consistency("zone table is locked".to_string()))
    }
}

#[tokio::test]
async fn test_failing_fixup_rolls_back_whole_run() {
    let hgnc = Arc::new(GeneSource::new("HGNC", vec![gene(1, "BRCA1", "chr17", 100, 200)]));
    let env = env_with(vec![hgnc.clone()], |_| {}, |u| u.with_fixup(LockedZones)).await;

    let report = env.updater.refresh(RefreshRequest::default()).await.unwrap();
    assert!(!report.success);
    assert!(report.aborted.as_deref().unwrap().contains("zone table is locked"));
    assert_eq!(hgnc.loads(), 1);

    // the load was rolled back with the rest of the run
    assert_eq!(env.count("gene").await, 0);
    assert_eq!(env.count("source_file").await, 0);
    assert_eq!(env.count_where("phase_run", "status = 'running'").await, 0);

    let status = env.updater.get_source_status("HGNC").await.unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Failed);
    assert!(status.error.as_deref().unwrap().contains("refresh aborted"));

    let warnings = env.updater.warnings("HGNC").await.unwrap();
    assert!(warnings.iter().any(|w| w.message.contains("zone table is locked")));

    let sources = env.updater.sources().await.unwrap();
    assert_eq!(sources[0].last_status, RunStatus::Failed);
}
