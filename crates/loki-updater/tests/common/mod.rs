//! Shared fixtures for updater integration tests
//!
//! Every test gets its own in-memory store and temporary work directory.
//! The catalog adds a small gene/region/SNP schema on top of the core
//! tables, and the mock plugins below load it.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use loki_updater::liftover::{ChainSegment, NewChain};
use loki_updater::{
    LoadContext, PluginRegistry, PositionColumns, SchemaCatalog, SourceOptions, SourcePlugin,
    Store, TableSpec, Updater, UpdaterConfig,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn gene_table() -> TableSpec {
    TableSpec::new(
        "gene",
        r#"CREATE TABLE IF NOT EXISTS gene (
            gene_id INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            source_id INTEGER NOT NULL
        )"#,
    )
    .source_column("source_id")
    .index(&["label"])
}

pub fn gene_region_table() -> TableSpec {
    TableSpec::new(
        "gene_region",
        r#"CREATE TABLE IF NOT EXISTS gene_region (
            gene_id INTEGER NOT NULL REFERENCES gene(gene_id),
            chr TEXT NOT NULL,
            pos_start INTEGER NOT NULL,
            pos_end INTEGER NOT NULL,
            source_id INTEGER NOT NULL,
            UNIQUE (gene_id, chr, pos_start, pos_end)
        )"#,
    )
    .source_column("source_id")
    .depends_on(&["gene"])
    .positions(PositionColumns::region("chr", "pos_start", "pos_end"))
    .index(&["chr", "pos_start"])
}

pub fn gene_zone_table() -> TableSpec {
    TableSpec::new(
        "gene_zone",
        r#"CREATE TABLE IF NOT EXISTS gene_zone (
            gene_id INTEGER NOT NULL,
            chr TEXT NOT NULL,
            zone INTEGER NOT NULL,
            PRIMARY KEY (gene_id, chr, zone)
        )"#,
    )
}

pub fn snp_locus_table() -> TableSpec {
    TableSpec::new(
        "snp_locus",
        r#"CREATE TABLE IF NOT EXISTS snp_locus (
            rs INTEGER NOT NULL,
            chr TEXT NOT NULL,
            pos INTEGER NOT NULL,
            source_id INTEGER NOT NULL,
            PRIMARY KEY (rs, chr, pos)
        )"#,
    )
    .source_column("source_id")
    .positions(PositionColumns::point("chr", "pos"))
}

pub fn catalog() -> SchemaCatalog {
    SchemaCatalog::core()
        .with_table(gene_table())
        .unwrap()
        .with_table(gene_region_table())
        .unwrap()
        .with_table(gene_zone_table())
        .unwrap()
        .with_table(snp_locus_table())
        .unwrap()
}

pub struct TestEnv {
    pub updater: Updater,
    pub config: UpdaterConfig,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn store(&self) -> &Store {
        self.updater.store()
    }

    pub fn cache_dir(&self, source: &str) -> PathBuf {
        self.config.work_dir.join(source)
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.store().pool())
            .await
            .unwrap()
    }

    pub async fn count_where(&self, table: &str, clause: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {clause}"))
            .fetch_one(self.store().pool())
            .await
            .unwrap()
    }
}

pub fn test_config(dir: &Path) -> UpdaterConfig {
    UpdaterConfig::in_memory(dir.join("cache"))
}

pub async fn env(plugins: Vec<Arc<dyn SourcePlugin>>) -> TestEnv {
    env_with(plugins, |_| {}, |u| u).await
}

pub async fn env_with(
    plugins: Vec<Arc<dyn SourcePlugin>>,
    configure: impl FnOnce(&mut UpdaterConfig),
    extend: impl FnOnce(Updater) -> Updater,
) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);

    let store = Store::open(&config, catalog()).await.unwrap();
    let mut registry = PluginRegistry::new();
    for plugin in plugins {
        registry.register(plugin).unwrap();
    }
    let updater = extend(Updater::new(store, config.clone(), registry));
    TestEnv {
        updater,
        config,
        dir,
    }
}

#[derive(Debug, Clone)]
pub struct Gene {
    pub id: i64,
    pub label: &'static str,
    pub chr: &'static str,
    pub start: i64,
    pub end: i64,
}

pub fn gene(id: i64, label: &'static str, chr: &'static str, start: i64, end: i64) -> Gene {
    Gene {
        id,
        label,
        chr,
        start,
        end,
    }
}

/// Downloads one file and loads genes with their regions
pub struct GeneSource {
    name: String,
    payload: Mutex<String>,
    genes: Mutex<Vec<Gene>>,
    grch: Option<i64>,
    ucschg: Option<i64>,
    warning: Option<String>,
    required_option: Option<String>,
    fail_load: AtomicBool,
    pub downloads: AtomicU32,
    pub loads: AtomicU32,
}

impl GeneSource {
    pub fn new(name: &str, genes: Vec<Gene>) -> Self {
        Self {
            name: name.to_string(),
            payload: Mutex::new(format!("{name} release 1")),
            genes: Mutex::new(genes),
            grch: None,
            ucschg: None,
            warning: None,
            required_option: None,
            fail_load: AtomicBool::new(false),
            downloads: AtomicU32::new(0),
            loads: AtomicU32::new(0),
        }
    }

    pub fn on_build(mut self, ucschg: i64) -> Self {
        self.ucschg = Some(ucschg);
        self
    }

    pub fn on_grch(mut self, grch: i64) -> Self {
        self.grch = Some(grch);
        self
    }

    pub fn with_warning(mut self, message: &str) -> Self {
        self.warning = Some(message.to_string());
        self
    }

    pub fn requiring(mut self, option: &str) -> Self {
        self.required_option = Some(option.to_string());
        self
    }

    pub fn failing(self) -> Self {
        self.fail_load.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Change the published file and the rows it holds
    pub fn publish(&self, payload: &str, genes: Vec<Gene>) {
        *self.payload.lock().unwrap() = payload.to_string();
        *self.genes.lock().unwrap() = genes;
    }

    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourcePlugin for GeneSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn version_string(&self) -> String {
        "genes-1.0".to_string()
    }

    fn validate_options(&self, options: &SourceOptions) -> Result<(), String> {
        match &self.required_option {
            Some(required) if !options.contains_key(required) => {
                Err(format!("missing required option '{required}'"))
            },
            _ => Ok(()),
        }
    }

    async fn download(&self, _options: &SourceOptions, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let payload = self.payload.lock().unwrap().clone();
        let path = dir.join("genes.tsv");
        tokio::fs::write(&path, payload).await?;
        Ok(vec![path])
    }

    async fn update(
        &self,
        ctx: &mut LoadContext<'_>,
        _options: &SourceOptions,
        _dir: &Path,
    ) -> anyhow::Result<()> {
        let genes = self.genes.lock().unwrap().clone();
        let fail = self.fail_load.load(Ordering::SeqCst);

        ctx.prepare_table_for_update("gene").await?;
        ctx.prepare_table_for_update("gene_region").await?;
        if let Some(warning) = &self.warning {
            ctx.add_warning(warning.clone());
        }

        let source_id = ctx.source_id();
        for (i, g) in genes.iter().enumerate() {
            if fail && i == 1 {
                anyhow::bail!("malformed record at line {}", i + 1);
            }
            sqlx::query("INSERT INTO gene (gene_id, label, source_id) VALUES (?, ?, ?)")
                .bind(g.id)
                .bind(g.label)
                .bind(source_id)
                .execute(ctx.conn())
                .await?;
            sqlx::query(
                "INSERT INTO gene_region (gene_id, chr, pos_start, pos_end, source_id) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(g.id)
            .bind(g.chr)
            .bind(g.start)
            .bind(g.end)
            .bind(source_id)
            .execute(ctx.conn())
            .await?;
        }
        if fail {
            anyhow::bail!("truncated file");
        }

        ctx.declare_build(self.grch, self.ucschg);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Loads alignment chains and build equivalences
pub struct ChainSource {
    chains: Vec<NewChain>,
    equivalences: Vec<(i64, i64)>,
}

impl ChainSource {
    pub fn new(chains: Vec<NewChain>) -> Self {
        Self {
            chains,
            equivalences: Vec::new(),
        }
    }

    pub fn with_equivalence(mut self, grch: i64, ucschg: i64) -> Self {
        self.equivalences.push((grch, ucschg));
        self
    }
}

#[async_trait]
impl SourcePlugin for ChainSource {
    fn name(&self) -> &str {
        "liftOver"
    }

    fn display_name(&self) -> &str {
        "UCSC liftOver chains"
    }

    fn version_string(&self) -> String {
        "chains-1.0".to_string()
    }

    async fn download(&self, _options: &SourceOptions, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let path = dir.join("chains.txt");
        tokio::fs::write(&path, format!("{:?}\n{:?}", self.chains, self.equivalences)).await?;
        Ok(vec![path])
    }

    async fn update(
        &self,
        ctx: &mut LoadContext<'_>,
        _options: &SourceOptions,
        _dir: &Path,
    ) -> anyhow::Result<()> {
        for chain in &self.chains {
            ctx.insert_chain(chain).await?;
        }
        for &(grch, ucschg) in &self.equivalences {
            ctx.add_build_equivalence(grch, ucschg).await?;
        }
        Ok(())
    }
}

/// A source whose server never answers
pub struct UnreachableSource;

#[async_trait]
impl SourcePlugin for UnreachableSource {
    fn name(&self) -> &str {
        "dbSNP"
    }

    fn version_string(&self) -> String {
        "snp-1.0".to_string()
    }

    async fn download(&self, _options: &SourceOptions, _dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        anyhow::bail!("connection timed out")
    }

    async fn update(
        &self,
        _ctx: &mut LoadContext<'_>,
        _options: &SourceOptions,
        _dir: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One-segment chain on chr1
pub fn chain(old_build: i64, new_build: i64, old_start: i64, old_end: i64, new_start: i64, score: i64) -> NewChain {
    NewChain {
        old_build,
        old_chr: "chr1".to_string(),
        new_build,
        new_chr: "chr1".to_string(),
        score,
        forward: true,
        segments: vec![ChainSegment {
            old_start,
            old_end,
            new_start,
        }],
    }
}
