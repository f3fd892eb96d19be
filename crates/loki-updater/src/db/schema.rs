//! Statically registered table catalog
//!
//! Every table the updater touches is declared up front as a [`TableSpec`]:
//! its DDL, the column tying rows to a source, the tables it depends on,
//! its indexes and, for positional data, the coordinate columns. The
//! purge planner, the bulk-write mode and liftover all work from this
//! catalog instead of reflecting over the live schema.

use loki_common::LokiError;

/// Coordinate columns of a position-bearing table.
///
/// `end` is `None` for point tables (one position column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionColumns {
    pub chr: String,
    pub start: String,
    pub end: Option<String>,
}

impl PositionColumns {
    pub fn region(chr: &str, start: &str, end: &str) -> Self {
        Self {
            chr: chr.to_string(),
            start: start.to_string(),
            end: Some(end.to_string()),
        }
    }

    pub fn point(chr: &str, pos: &str) -> Self {
        Self {
            chr: chr.to_string(),
            start: pos.to_string(),
            end: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub ddl: String,
    /// Column holding the owning source id, if rows belong to a source
    pub source_column: Option<String>,
    /// Tables this one references (parents); children are purged first
    pub depends_on: Vec<String>,
    pub positions: Option<PositionColumns>,
    /// Secondary indexes, each a list of columns
    pub indexes: Vec<Vec<String>>,
    /// Source-management tables are never purged or lifted
    pub managed: bool,
}

impl TableSpec {
    pub fn new(name: &str, ddl: &str) -> Self {
        Self {
            name: name.to_string(),
            ddl: ddl.to_string(),
            source_column: None,
            depends_on: Vec::new(),
            positions: None,
            indexes: Vec::new(),
            managed: false,
        }
    }

    pub fn source_column(mut self, column: &str) -> Self {
        self.source_column = Some(column.to_string());
        self
    }

    pub fn depends_on(mut self, parents: &[&str]) -> Self {
        self.depends_on.extend(parents.iter().map(|p| p.to_string()));
        self
    }

    pub fn positions(mut self, positions: PositionColumns) -> Self {
        self.positions = Some(positions);
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    fn managed(mut self) -> Self {
        self.managed = true;
        self
    }

    /// `idx_{table}_{col1}_{col2}`
    pub fn index_name(&self, columns: &[String]) -> String {
        format!("idx_{}_{}", self.name, columns.join("_"))
    }

    pub fn create_index_sql(&self, columns: &[String]) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.index_name(columns),
            self.name,
            columns.join(", ")
        )
    }

    fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.source_column.as_deref())
            .chain(self.depends_on.iter().map(String::as_str))
            .chain(self.indexes.iter().flatten().map(String::as_str))
            .chain(self.positions.iter().flat_map(|p| {
                [Some(p.chr.as_str()), Some(p.start.as_str()), p.end.as_deref()]
                    .into_iter()
                    .flatten()
            }))
    }
}

/// SQL identifiers are interpolated into statements, so only plain names pass
pub fn validate_identifier(name: &str) -> Result<(), LokiError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(LokiError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableSpec>,
}

impl SchemaCatalog {
    /// Catalog holding only the updater's own tables
    pub fn core() -> Self {
        Self {
            tables: core_tables(),
        }
    }

    /// Append a table. Registration order is also the fallback creation
    /// order used when the purge planner cannot sort the dependency graph.
    pub fn register(&mut self, spec: TableSpec) -> Result<(), LokiError> {
        for ident in spec.identifiers() {
            validate_identifier(ident)?;
        }
        if self.get(&spec.name).is_some() {
            return Err(LokiError::Config(format!(
                "table '{}' registered twice",
                spec.name
            )));
        }
        self.tables.push(spec);
        Ok(())
    }

    pub fn with_table(mut self, spec: TableSpec) -> Result<Self, LokiError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables holding per-source rows that a purge must clear
    pub fn purgeable(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables
            .iter()
            .filter(|t| !t.managed && t.source_column.is_some())
    }

    /// Source-owned tables with coordinates that liftover rewrites
    pub fn positional(&self) -> impl Iterator<Item = &TableSpec> {
        self.purgeable().filter(|t| t.positions.is_some())
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::core()
    }
}

pub const SETTING_TABLE: &str = "setting";
pub const CHAIN_TABLE: &str = "chain";
pub const CHAIN_SEGMENT_TABLE: &str = "chain_segment";
pub const BUILD_EQUIVALENCE_TABLE: &str = "build_equivalence";

fn core_tables() -> Vec<TableSpec> {
    vec![
        TableSpec::new(
            SETTING_TABLE,
            r#"CREATE TABLE IF NOT EXISTS setting (
                setting TEXT PRIMARY KEY NOT NULL,
                value TEXT
            )"#,
        )
        .managed(),
        TableSpec::new(
            "source",
            r#"CREATE TABLE IF NOT EXISTS source (
                source_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL UNIQUE,
                display_name TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                version TEXT,
                grch INTEGER,
                ucschg INTEGER,
                current_build INTEGER,
                target_build INTEGER,
                last_status TEXT NOT NULL DEFAULT 'pending',
                last_updated TEXT,
                purge_mark INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .managed(),
        TableSpec::new(
            "source_option",
            r#"CREATE TABLE IF NOT EXISTS source_option (
                source_id INTEGER NOT NULL REFERENCES source(source_id),
                option TEXT NOT NULL,
                value TEXT,
                PRIMARY KEY (source_id, option)
            )"#,
        )
        .source_column("source_id")
        .depends_on(&["source"])
        .managed(),
        TableSpec::new(
            "source_file",
            r#"CREATE TABLE IF NOT EXISTS source_file (
                source_id INTEGER NOT NULL REFERENCES source(source_id),
                filename TEXT NOT NULL,
                size INTEGER,
                modified INTEGER,
                md5 TEXT,
                PRIMARY KEY (source_id, filename)
            )"#,
        )
        .source_column("source_id")
        .depends_on(&["source"])
        .managed(),
        TableSpec::new(
            "phase_run",
            r#"CREATE TABLE IF NOT EXISTS phase_run (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL REFERENCES source(source_id),
                batch_id TEXT NOT NULL,
                status TEXT NOT NULL,
                extract_status TEXT NOT NULL,
                extract_start TEXT,
                extract_end TEXT,
                extract_hash TEXT,
                transform_status TEXT NOT NULL,
                transform_start TEXT,
                transform_end TEXT,
                transform_hash TEXT,
                load_status TEXT NOT NULL,
                load_start TEXT,
                load_end TEXT,
                load_hash TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .source_column("source_id")
        .depends_on(&["source"])
        .index(&["source_id", "status"])
        .managed(),
        TableSpec::new(
            "warning",
            r#"CREATE TABLE IF NOT EXISTS warning (
                warning_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL REFERENCES source(source_id),
                run_id INTEGER,
                warning TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .source_column("source_id")
        .depends_on(&["source"])
        .index(&["source_id"])
        .managed(),
        TableSpec::new(
            BUILD_EQUIVALENCE_TABLE,
            r#"CREATE TABLE IF NOT EXISTS build_equivalence (
                grch INTEGER PRIMARY KEY NOT NULL,
                ucschg INTEGER NOT NULL,
                source_id INTEGER NOT NULL
            )"#,
        )
        .source_column("source_id"),
        TableSpec::new(
            CHAIN_TABLE,
            r#"CREATE TABLE IF NOT EXISTS chain (
                chain_id INTEGER PRIMARY KEY AUTOINCREMENT,
                old_build INTEGER NOT NULL,
                old_chr TEXT NOT NULL,
                old_start INTEGER NOT NULL,
                old_end INTEGER NOT NULL,
                new_build INTEGER NOT NULL,
                new_chr TEXT NOT NULL,
                new_start INTEGER NOT NULL,
                new_end INTEGER NOT NULL,
                score INTEGER NOT NULL,
                is_fwd INTEGER NOT NULL,
                source_id INTEGER NOT NULL
            )"#,
        )
        .source_column("source_id")
        .index(&["old_build", "new_build", "old_chr"]),
        TableSpec::new(
            CHAIN_SEGMENT_TABLE,
            r#"CREATE TABLE IF NOT EXISTS chain_segment (
                chain_id INTEGER NOT NULL REFERENCES chain(chain_id),
                old_start INTEGER NOT NULL,
                old_end INTEGER NOT NULL,
                new_start INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                PRIMARY KEY (chain_id, old_start)
            )"#,
        )
        .source_column("source_id")
        .depends_on(&[CHAIN_TABLE]),
    ]
}
