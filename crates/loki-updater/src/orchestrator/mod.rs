//! Update orchestrator
//!
//! A refresh selects sources, downloads and fingerprints them in parallel,
//! then drives each one through extract, transform and load inside its own
//! nested checkpoint of one outer checkpoint. After every source has been
//! processed the stored builds are reconciled, dropped indexes rebuilt and
//! deferred fix-ups run; a failure there rolls back the whole run.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(updater: loki_updater::Updater) -> loki_updater::Result<()> {
//! use loki_updater::RefreshRequest;
//!
//! let report = updater.refresh(RefreshRequest::for_sources(&["HGNC"])).await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod download;
pub mod fixup;
pub mod reconcile;

pub use context::{RunContext, RunSnapshot};
pub use fixup::{FixUp, ZoneFixUp};
pub use reconcile::{LiftedSource, Reconciliation};

use crate::config::UpdaterConfig;
use crate::db::{mode, Checkpoint, SchemaCatalog, StoreMode, Store};
use crate::error::{Result, UpdateError};
use crate::liftover::{LiftOver, LiftOverEngine, Region};
use crate::phase::{self, ExtractOutcome, Phase, PhaseRun, RunStatus};
use crate::plugin::{LoadContext, PluginRegistry, SourcePlugin};
use crate::purge::PurgePlanner;
use crate::registry::{self, SourceOptions, SourceRecord, SourceWarning};
use download::{FetchJob, Fetched};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What a refresh should do
#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    /// Sources to process; `None` means every active source with a plugin
    pub sources: Option<Vec<String>>,
    /// Option overrides per source; others reuse their persisted options
    pub options: HashMap<String, SourceOptions>,
    /// Compare the local cache against the store without downloading or writing
    pub cache_only: bool,
    /// Reprocess even when nothing changed
    pub force: bool,
    /// Use files already in the work directory
    pub skip_download: bool,
    /// Stop after downloading
    pub only_download: bool,
}

impl RefreshRequest {
    pub fn for_sources(names: &[&str]) -> Self {
        Self {
            sources: Some(names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn with_options(mut self, source: &str, options: SourceOptions) -> Self {
        self.options.insert(source.to_string(), options);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub run: PhaseRun,
    pub warnings: Vec<String>,
}

impl SourceOutcome {
    pub fn failed(&self) -> bool {
        self.run.status == RunStatus::Failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub batch_id: Uuid,
    /// No source failed and the run was not aborted
    pub success: bool,
    /// Set when reconciliation or a fix-up failed and the run was rolled back
    pub aborted: Option<String>,
    pub reconciliation: Reconciliation,
    /// Fix-ups that ran
    pub fixups: Vec<String>,
    pub sources: Vec<SourceOutcome>,
}

impl RefreshReport {
    fn new(
        batch_id: Uuid,
        sources: Vec<SourceOutcome>,
        aborted: Option<String>,
        reconciliation: Reconciliation,
        fixups: Vec<String>,
    ) -> Self {
        let success = aborted.is_none() && !sources.iter().any(SourceOutcome::failed);
        Self {
            batch_id,
            success,
            aborted,
            reconciliation,
            fixups,
            sources,
        }
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.sources.iter().find(|o| o.source == source)
    }
}

struct Selected {
    plugin: Arc<dyn SourcePlugin>,
    options: SourceOptions,
    /// Removed earlier and named explicitly in this request
    reactivate: bool,
}

/// One source's attempt within a run
struct Attempt {
    source_id: i64,
    run: PhaseRun,
    warnings: Vec<String>,
}

pub struct Updater {
    store: Store,
    config: UpdaterConfig,
    plugins: PluginRegistry,
    liftover: LiftOverEngine,
    purger: PurgePlanner,
    fixups: Vec<Box<dyn FixUp>>,
}

impl Updater {
    pub fn new(store: Store, config: UpdaterConfig, plugins: PluginRegistry) -> Self {
        let liftover = LiftOverEngine::new(config.liftover_min_coverage);
        let purger = PurgePlanner::new(Arc::clone(store.catalog()), config.purge_overrides.clone());
        Self {
            store,
            config,
            plugins,
            liftover,
            purger,
            fixups: Vec::new(),
        }
    }

    /// Register a fix-up; fix-ups run in registration order
    pub fn with_fixup(mut self, fixup: impl FixUp + 'static) -> Self {
        self.fixups.push(Box::new(fixup));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn liftover(&self) -> &LiftOverEngine {
        &self.liftover
    }

    pub fn purger(&self) -> &PurgePlanner {
        &self.purger
    }

    fn catalog(&self) -> &SchemaCatalog {
        self.store.catalog()
    }

    fn source_dir(&self, name: &str) -> PathBuf {
        self.config.work_dir.join(name)
    }

    /// Refresh the selected sources.
    ///
    /// Fails outright (before any write) when the store is not writable or
    /// the request is invalid. Otherwise returns a report whose `success`
    /// is false if any source failed or the run was rolled back.
    #[instrument(skip(self, request), fields(cache_only = request.cache_only, force = request.force))]
    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshReport> {
        if !request.cache_only {
            self.store.ensure_writable().await?;
        }
        let selected = self.select(&request).await?;
        info!(sources = selected.len(), "refresh starting");

        let jobs = selected
            .iter()
            .map(|s| FetchJob {
                plugin: Arc::clone(&s.plugin),
                options: s.options.clone(),
                dir: self.source_dir(s.plugin.name()),
            })
            .collect();
        let download = !(request.cache_only || request.skip_download);
        let mut fetched = download::fetch_all(jobs, &self.config, download).await;

        let mut run = RunContext::new(self.config.bulk_mode && !request.cache_only);
        let report = if request.cache_only {
            self.compare_cache(&selected, &mut fetched, &run).await?
        } else {
            let mut conn = self.store.acquire().await?;
            // Pragmas cannot change inside the run's transaction, so query
            // mode returns after the commit. Indexes are rebuilt inside it,
            // before fix-ups read the loaded tables.
            if run.bulk_mode() {
                mode::apply_mode(&mut conn, StoreMode::BulkWrite).await?;
            }
            let result = self
                .run_batch(&mut conn, &mut run, &selected, &mut fetched, &request)
                .await;
            if run.bulk_mode() {
                if let Err(e) = mode::apply_mode(&mut conn, StoreMode::Query).await {
                    warn!(error = %e, "could not restore query mode");
                }
            }
            result?
        };

        if !self.config.keep_downloads && !request.cache_only && !request.only_download {
            for source in &selected {
                download::discard(&self.source_dir(source.plugin.name())).await;
            }
        }

        info!(
            batch_id = %report.batch_id,
            success = report.success,
            failed = report.sources.iter().filter(|o| o.failed()).count(),
            "refresh finished"
        );
        Ok(report)
    }

    /// Resolve and validate the request. Reads only.
    async fn select(&self, request: &RefreshRequest) -> Result<Vec<Selected>> {
        let mut conn = self.store.acquire().await?;
        let known = registry::list_sources(&mut conn, false).await?;

        let names: Vec<String> = match &request.sources {
            Some(requested) => {
                let mut names: Vec<String> = Vec::with_capacity(requested.len());
                for name in requested {
                    if self.plugins.get(name).is_none() {
                        return Err(UpdateError::Validation(format!("unknown source '{name}'")));
                    }
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                names
            },
            None => self
                .plugins
                .names()
                .filter(|name| !known.iter().any(|s| s.name == *name && !s.active))
                .map(String::from)
                .collect(),
        };

        if let Some(stray) = request.options.keys().find(|k| !names.contains(k)) {
            return Err(UpdateError::Validation(format!(
                "options given for source '{stray}', which is not selected"
            )));
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let plugin = self
                .plugins
                .get(&name)
                .ok_or_else(|| UpdateError::Validation(format!("unknown source '{name}'")))?;
            let options = match request.options.get(&name) {
                Some(options) => options.clone(),
                None => match known.iter().find(|s| s.name == name) {
                    Some(source) => registry::get_options(&mut conn, source.id).await?,
                    None => SourceOptions::new(),
                },
            };
            plugin
                .validate_options(&options)
                .map_err(|msg| UpdateError::Validation(format!("{name}: {msg}")))?;
            let reactivate = known.iter().any(|s| s.name == name && !s.active);
            selected.push(Selected {
                plugin,
                options,
                reactivate,
            });
        }
        Ok(selected)
    }

    /// `cache_only`: report what a refresh would do, writing nothing
    async fn compare_cache(
        &self,
        selected: &[Selected],
        fetched: &mut HashMap<String, Result<Fetched>>,
        run: &RunContext,
    ) -> Result<RefreshReport> {
        let mut conn = self.store.acquire().await?;
        let mut outcomes = Vec::with_capacity(selected.len());

        for source in selected {
            let name = source.plugin.name();
            let record = registry::find_source(&mut conn, name).await?;
            let mut phase_run = PhaseRun::new(record.as_ref().map_or(0, |r| r.id), run.batch_id());
            let mut warnings = Vec::new();

            match take_fetched(fetched, name) {
                Ok(files) => {
                    let previous = match &record {
                        Some(r) => phase::storage::last_completed_extract_hash(&mut conn, r.id).await?,
                        None => None,
                    };
                    phase_run.begin(Phase::Extract, false)?;
                    let outcome = phase_run.complete_extract(files.hash, previous.as_deref(), false)?;
                    if outcome == ExtractOutcome::Changed {
                        phase_run.stop_after(Phase::Extract);
                    }
                },
                Err(e) => {
                    phase_run.fail(Phase::Extract, e.to_string());
                    warnings.push(e.to_string());
                },
            }
            outcomes.push(SourceOutcome {
                source: name.to_string(),
                run: phase_run,
                warnings,
            });
        }

        Ok(RefreshReport::new(
            run.batch_id(),
            outcomes,
            None,
            Reconciliation::default(),
            Vec::new(),
        ))
    }

    async fn run_batch(
        &self,
        conn: &mut SqliteConnection,
        run: &mut RunContext,
        selected: &[Selected],
        fetched: &mut HashMap<String, Result<Fetched>>,
        request: &RefreshRequest,
    ) -> Result<RefreshReport> {
        let mut outcomes = Vec::with_capacity(selected.len());
        let mut outer = Checkpoint::on(&mut *conn, "refresh").await?;

        for source in selected {
            let files = take_fetched(fetched, source.plugin.name());
            let outcome = self
                .process_source(&mut outer, run, source, files, request)
                .await?;
            outcomes.push(outcome);
        }

        if request.only_download {
            outer.release().await?;
            return Ok(RefreshReport::new(
                run.batch_id(),
                outcomes,
                None,
                Reconciliation::default(),
                Vec::new(),
            ));
        }

        match self.finish_run(outer.conn(), run).await {
            Ok((reconciliation, fixups)) => {
                outer.release().await?;
                Ok(RefreshReport::new(
                    run.batch_id(),
                    outcomes,
                    None,
                    reconciliation,
                    fixups,
                ))
            },
            Err(e) => {
                error!(error = %e, "refresh aborted; rolling back every source");
                outer.rollback().await?;
                self.liftover.invalidate().await;
                let message = format!("refresh aborted: {e}");
                self.record_abort(conn, &mut outcomes, &message).await?;
                Ok(RefreshReport::new(
                    run.batch_id(),
                    outcomes,
                    Some(message),
                    Reconciliation::default(),
                    Vec::new(),
                ))
            },
        }
    }

    /// Process one source in a nested checkpoint and record its outcome in
    /// the outer one
    #[instrument(skip_all, fields(source = source.plugin.name()))]
    async fn process_source(
        &self,
        outer: &mut Checkpoint<'_>,
        run: &mut RunContext,
        source: &Selected,
        fetched: Result<Fetched>,
        request: &RefreshRequest,
    ) -> Result<SourceOutcome> {
        let name = source.plugin.name();
        let source_id =
            registry::ensure_source(outer.conn(), name, source.plugin.display_name()).await?;
        if source.reactivate {
            registry::set_active(outer.conn(), source_id, true).await?;
            info!("removed source requested by name; reactivated");
        }
        let mut attempt = Attempt {
            source_id,
            run: PhaseRun::new(source_id, run.batch_id()),
            warnings: Vec::new(),
        };

        match fetched {
            Err(e) => {
                let phase = attempt.run.fail_current(e.to_string());
                attempt.warnings.push(format!("{phase} failed: {e}"));
            },
            Ok(files) => {
                let snapshot = run.snapshot();
                let mut scope = outer.nested(name).await?;
                let result = self
                    .run_phases(&mut scope, run, source, &files, request, &mut attempt)
                    .await;
                match result {
                    Ok(()) => scope.release().await?,
                    Err(e) => {
                        scope.rollback().await?;
                        run.restore(snapshot);
                        let phase = attempt.run.fail_current(e.to_string());
                        error!(%phase, error = %e, "source failed; its changes were rolled back");
                        attempt.warnings.push(format!("{phase} failed: {e}"));
                    },
                }
            },
        }

        let conn = outer.conn();
        let run_id = phase::storage::save_run(conn, &mut attempt.run).await?;
        for message in &attempt.warnings {
            registry::add_warning(conn, source_id, Some(run_id), message).await?;
        }
        if attempt.run.status != RunStatus::Pending {
            registry::set_last_status(conn, source_id, attempt.run.status).await?;
        }

        Ok(SourceOutcome {
            source: name.to_string(),
            run: attempt.run,
            warnings: attempt.warnings,
        })
    }

    async fn run_phases(
        &self,
        scope: &mut Checkpoint<'_>,
        run: &mut RunContext,
        source: &Selected,
        fetched: &Fetched,
        request: &RefreshRequest,
        attempt: &mut Attempt,
    ) -> Result<()> {
        let plugin = &source.plugin;
        let force = request.force;
        let phase_run = &mut attempt.run;

        let previous =
            phase::storage::last_completed_extract_hash(scope.conn(), attempt.source_id).await?;
        phase_run.begin(Phase::Extract, force)?;
        let outcome = phase_run.complete_extract(fetched.hash.clone(), previous.as_deref(), force)?;
        if outcome == ExtractOutcome::Unchanged {
            info!("source is up to date");
            return Ok(());
        }
        if request.only_download {
            phase_run.stop_after(Phase::Extract);
            info!(files = fetched.files.len(), "download finished; processing skipped");
            return Ok(());
        }

        registry::replace_files(scope.conn(), attempt.source_id, &fetched.files).await?;
        registry::replace_options(scope.conn(), attempt.source_id, &source.options).await?;

        phase_run.begin(Phase::Transform, force)?;
        let transform_hash = plugin
            .transform(&source.options, &fetched.dir)
            .await
            .map_err(|e| UpdateError::processing(Phase::Transform, format!("{e:#}")))?;
        phase_run.complete(Phase::Transform, transform_hash)?;

        phase_run.begin(Phase::Load, force)?;
        let purged = self.purger.purge_in(scope.conn(), attempt.source_id).await?;
        for table in purged.touched_tables() {
            run.mark_updated(table);
        }

        let mut ctx = LoadContext::new(
            scope.conn(),
            self.store.catalog(),
            run,
            attempt.source_id,
            plugin.name(),
        );
        let loaded = plugin.update(&mut ctx, &source.options, &fetched.dir).await;
        let output = ctx.finish();
        attempt.warnings.extend(output.warnings);
        loaded.map_err(|e| UpdateError::processing(Phase::Load, format!("{e:#}")))?;

        registry::record_load(
            scope.conn(),
            attempt.source_id,
            &plugin.version_string(),
            output.declared,
        )
        .await?;
        run.mark_loaded(attempt.source_id);
        phase_run.complete(Phase::Load, None)?;
        info!(purged = purged.total, "source loaded");
        Ok(())
    }

    /// Reconcile builds, rebuild dropped indexes and run fix-ups
    async fn finish_run(
        &self,
        conn: &mut SqliteConnection,
        run: &mut RunContext,
    ) -> Result<(Reconciliation, Vec<String>)> {
        if run.chains_changed() {
            self.liftover.invalidate().await;
        }

        let reconciliation = reconcile::reconcile_builds(
            conn,
            self.catalog(),
            &self.liftover,
            run,
            self.config.liftover_batch_size,
        )
        .await
        .map_err(consistency("build reconciliation"))?;

        let deindexed: Vec<String> = run.deindexed().map(String::from).collect();
        for table in &deindexed {
            if let Some(spec) = self.catalog().get(table) {
                mode::create_indexes(conn, spec)
                    .await
                    .map_err(consistency("index rebuild"))?;
            }
        }

        let fixups = self
            .apply_fixups(conn, |table| run.is_updated(table))
            .await?;
        Ok((reconciliation, fixups))
    }

    async fn apply_fixups(
        &self,
        conn: &mut SqliteConnection,
        updated: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for fixup in &self.fixups {
            if !fixup.triggers().into_iter().any(&updated) {
                continue;
            }
            let rows = fixup
                .apply(conn)
                .await
                .map_err(consistency(fixup.name()))?;
            info!(fixup = fixup.name(), rows, "fix-up applied");
            applied.push(fixup.name().to_string());
        }
        Ok(applied)
    }

    /// After a rollback, record every attempted run as failed in a fresh
    /// transaction
    async fn record_abort(
        &self,
        conn: &mut SqliteConnection,
        outcomes: &mut [SourceOutcome],
        message: &str,
    ) -> Result<()> {
        let mut checkpoint = Checkpoint::on(conn, "abort").await?;
        for outcome in outcomes.iter_mut() {
            let display = self
                .plugins
                .get(&outcome.source)
                .map(|p| p.display_name().to_string())
                .unwrap_or_else(|| outcome.source.clone());
            let source_id =
                registry::ensure_source(checkpoint.conn(), &outcome.source, &display).await?;
            outcome.run.source_id = source_id;
            outcome.run.abort(message);
            outcome.warnings.push(message.to_string());

            let run_id = phase::storage::save_run(checkpoint.conn(), &mut outcome.run).await?;
            for warning in &outcome.warnings {
                registry::add_warning(checkpoint.conn(), source_id, Some(run_id), warning).await?;
            }
            registry::set_last_status(checkpoint.conn(), source_id, RunStatus::Failed).await?;
        }
        checkpoint.release().await
    }

    /// Latest recorded attempt for a source, `None` if it was never run
    pub async fn get_source_status(&self, name: &str) -> Result<Option<PhaseRun>> {
        let mut conn = self.store.acquire().await?;
        let Some(source) = registry::find_source(&mut conn, name).await? else {
            return Ok(None);
        };
        phase::storage::latest_run(&mut conn, source.id).await
    }

    pub async fn warnings(&self, name: &str) -> Result<Vec<SourceWarning>> {
        let mut conn = self.store.acquire().await?;
        let source = registry::require_source(&mut conn, name).await?;
        registry::list_warnings(&mut conn, source.id).await
    }

    pub async fn sources(&self) -> Result<Vec<SourceRecord>> {
        let mut conn = self.store.acquire().await?;
        registry::list_sources(&mut conn, false).await
    }

    /// Delete every row a source contributed; returns rows deleted.
    ///
    /// The source's build pointers and file fingerprints go with them, so
    /// it no longer sets the target build and its next refresh reloads it.
    #[instrument(skip(self))]
    pub async fn purge(&self, name: &str) -> Result<u64> {
        self.purge_source(name, false).await
    }

    /// Deactivate a source and delete its rows
    #[instrument(skip(self))]
    pub async fn remove_source(&self, name: &str) -> Result<u64> {
        self.purge_source(name, true).await
    }

    async fn purge_source(&self, name: &str, deactivate: bool) -> Result<u64> {
        self.store.ensure_writable().await?;
        let mut checkpoint = Checkpoint::begin(self.store.pool(), "purge").await?;
        let source = registry::require_source(checkpoint.conn(), name).await?;
        if deactivate {
            registry::set_active(checkpoint.conn(), source.id, false).await?;
        }

        let report = self.purger.purge_in(checkpoint.conn(), source.id).await?;
        registry::reset_after_purge(checkpoint.conn(), source.id).await?;
        let touched: Vec<&str> = report.touched_tables().collect();
        self.apply_fixups(checkpoint.conn(), |table| touched.iter().any(|t| *t == table))
            .await?;
        checkpoint.release().await?;

        self.liftover.invalidate().await;
        info!(source = name, rows = report.total, deactivate, "source purged");
        Ok(report.total)
    }

    /// Lazily map regions between builds using the stored chains
    pub async fn map_regions<I, P>(
        &self,
        old_build: i64,
        new_build: i64,
        regions: I,
    ) -> Result<LiftOver<I::IntoIter, P>>
    where
        I: IntoIterator<Item = Region<P>>,
    {
        let mut conn = self.store.acquire().await?;
        self.liftover
            .map_regions(&mut conn, old_build, new_build, regions)
            .await
    }
}

fn take_fetched(fetched: &mut HashMap<String, Result<Fetched>>, name: &str) -> Result<Fetched> {
    fetched
        .remove(name)
        .unwrap_or_else(|| Err(UpdateError::Validation(format!("no files fetched for '{name}'"))))
}

/// Failures after sources were processed abort the run
fn consistency(stage: &str) -> impl Fn(UpdateError) -> UpdateError + '_ {
    move |e| match e {
        UpdateError::Consistency(_) => e,
        other => UpdateError::Consistency(format!("{stage}: {other}")),
    }
}
