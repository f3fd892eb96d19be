//! Source plugin contract
//!
//! A plugin knows how to fetch and parse one external source. The updater
//! drives it through download, transform and load, and hands it a
//! [`LoadContext`] to write rows with.

use crate::db::{mode, SchemaCatalog};
use crate::error::{Result, UpdateError};
use crate::liftover::{storage as chain_storage, NewChain};
use crate::orchestrator::RunContext;
use crate::registry::{self, DeclaredBuild, SourceOptions};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Registry name, e.g. `"HGNC"`
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    /// Version of the loader itself; a change forces a reload
    fn version_string(&self) -> String;

    /// Reject unknown or inconsistent options with a message
    fn validate_options(&self, _options: &SourceOptions) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Fetch the source's files into `dir`; returns the files written
    async fn download(&self, options: &SourceOptions, dir: &Path) -> anyhow::Result<Vec<PathBuf>>;

    /// Optional pre-load processing of downloaded files; may return a hash of its output
    async fn transform(&self, _options: &SourceOptions, _dir: &Path) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Load the files in `dir` into the store
    async fn update(
        &self,
        ctx: &mut LoadContext<'_>,
        options: &SourceOptions,
        dir: &Path,
    ) -> anyhow::Result<()>;
}

/// Statically populated list of available plugins
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn SourcePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn SourcePlugin>) -> Result<()> {
        if self.get(plugin.name()).is_some() {
            return Err(UpdateError::Validation(format!(
                "plugin '{}' registered twice",
                plugin.name()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn with(mut self, plugin: impl SourcePlugin + 'static) -> Result<Self> {
        self.register(Arc::new(plugin))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourcePlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// What a load produced besides rows
#[derive(Debug, Default)]
pub struct LoadOutput {
    pub warnings: Vec<String>,
    pub declared: DeclaredBuild,
}

/// Write access handed to a plugin during `update`.
///
/// Everything written goes through the source's nested checkpoint, so a
/// failing load leaves no trace. Warnings are buffered and recorded after
/// the checkpoint resolves, so they survive a rollback.
pub struct LoadContext<'a> {
    conn: &'a mut SqliteConnection,
    catalog: &'a SchemaCatalog,
    run: &'a mut RunContext,
    source_id: i64,
    source_name: &'a str,
    output: LoadOutput,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        conn: &'a mut SqliteConnection,
        catalog: &'a SchemaCatalog,
        run: &'a mut RunContext,
        source_id: i64,
        source_name: &'a str,
    ) -> Self {
        Self {
            conn,
            catalog,
            run,
            source_id,
            source_name,
            output: LoadOutput::default(),
        }
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    pub fn source_name(&self) -> &str {
        self.source_name
    }

    /// Connection inside the source's checkpoint
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
    }

    /// Declare intent to write `table`.
    ///
    /// Records the table as updated for this run and, in bulk-write mode,
    /// drops its indexes until the run rebuilds them.
    pub async fn prepare_table_for_update(&mut self, table: &str) -> Result<()> {
        let spec = self
            .catalog
            .get(table)
            .ok_or_else(|| UpdateError::Validation(format!("unknown table '{table}'")))?;
        if spec.managed {
            return Err(UpdateError::Validation(format!(
                "table '{table}' is managed by the updater"
            )));
        }
        if self.run.needs_deindex(table) {
            mode::drop_indexes(self.conn, spec).await?;
            self.run.mark_deindexed(table);
        }
        self.run.mark_updated(table);
        debug!(source = self.source_name, table, "table prepared for update");
        Ok(())
    }

    /// Run a statement with no bound parameters; returns rows affected
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(sqlx::query(sql)
            .execute(&mut *self.conn)
            .await?
            .rows_affected())
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(source = self.source_name, %message, "source warning");
        self.output.warnings.push(message);
    }

    /// Builds the loaded rows are expressed in
    pub fn declare_build(&mut self, grch: Option<i64>, ucschg: Option<i64>) {
        self.output.declared = DeclaredBuild { grch, ucschg };
    }

    pub async fn insert_chain(&mut self, chain: &NewChain) -> Result<i64> {
        self.prepare_table_for_update(crate::db::schema::CHAIN_TABLE)
            .await?;
        self.prepare_table_for_update(crate::db::schema::CHAIN_SEGMENT_TABLE)
            .await?;
        chain_storage::insert_chain(self.conn, self.source_id, chain).await
    }

    pub async fn add_build_equivalence(&mut self, grch: i64, ucschg: i64) -> Result<()> {
        self.prepare_table_for_update(crate::db::schema::BUILD_EQUIVALENCE_TABLE)
            .await?;
        registry::add_build_equivalence(self.conn, self.source_id, grch, ucschg).await
    }

    pub fn finish(self) -> LoadOutput {
        self.output
    }
}
