//! Migration definitions.
//!
//! A definition is user-authored code that knows which numeric range a
//! migration covers and how to process one slice of it. Definitions are
//! registered by their 14-digit timestamp at startup and resolved through
//! a [`MigrationRegistry`] instead of being loaded from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, HandlerError};

/// Length of the timestamp prefix of a migration identifier.
pub const TIMESTAMP_LEN: usize = 14;

/// Range and batch size reported by a definition.
///
/// Unset fields fall back to the migrator's defaults. `max: None` means
/// there is nothing to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationParameters {
    /// First unit of the range.
    pub min: Option<i64>,
    /// Last unit of the range.
    pub max: Option<i64>,
    /// Units per batch.
    pub batch_size: Option<i64>,
}

impl MigrationParameters {
    /// Parameters covering `[min, max]`.
    pub fn range(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            batch_size: None,
        }
    }

    /// Parameters reporting no work.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// User-authored batched migration logic.
#[async_trait]
pub trait MigrationHandler: Send + Sync {
    /// Report the range to cover.
    async fn parameters(&self) -> Result<MigrationParameters, HandlerError>;

    /// Process the inclusive range `[start, end]`.
    ///
    /// A batch may be re-run after a crash that happened before its
    /// checkpoint was written, so applying the same range twice must be
    /// harmless.
    async fn run_batch(&self, start: i64, end: i64) -> Result<(), HandlerError>;
}

/// Extract the 14-digit timestamp from an identifier such as
/// `20230406184103_backfill_users` or `20230406184103_backfill_users.rs`.
pub fn parse_timestamp(identifier: &str) -> Result<&str, Error> {
    let bytes = identifier.as_bytes();
    if bytes.len() < TIMESTAMP_LEN || !bytes[..TIMESTAMP_LEN].iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidIdentifier(identifier.to_string()));
    }
    match bytes.get(TIMESTAMP_LEN) {
        None | Some(b'_') | Some(b'.') => Ok(&identifier[..TIMESTAMP_LEN]),
        Some(_) => Err(Error::InvalidIdentifier(identifier.to_string())),
    }
}

/// A handler bound to its timestamp.
#[derive(Clone)]
pub struct RegisteredMigration {
    /// 14-digit timestamp.
    pub timestamp: String,
    /// Name the definition was registered under.
    pub filename: String,
    /// The migration logic.
    pub handler: Arc<dyn MigrationHandler>,
}

impl std::fmt::Debug for RegisteredMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMigration")
            .field("timestamp", &self.timestamp)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Lookup table of the definitions this process was deployed with.
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    migrations: BTreeMap<String, RegisteredMigration>,
}

impl MigrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its definition filename.
    pub fn register(
        &mut self,
        filename: impl Into<String>,
        handler: Arc<dyn MigrationHandler>,
    ) -> Result<(), Error> {
        let filename = filename.into();
        let timestamp = parse_timestamp(&filename)?.to_string();

        if let Some(existing) = self.migrations.get(&timestamp) {
            return Err(Error::DuplicateDefinition {
                timestamp,
                first: existing.filename.clone(),
                second: filename,
            });
        }

        tracing::debug!(%timestamp, %filename, "registered batched migration");
        self.migrations.insert(
            timestamp.clone(),
            RegisteredMigration {
                timestamp,
                filename,
                handler,
            },
        );
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        filename: impl Into<String>,
        handler: Arc<dyn MigrationHandler>,
    ) -> Result<Self, Error> {
        self.register(filename, handler)?;
        Ok(self)
    }

    /// Look up a definition by timestamp.
    pub fn resolve(&self, timestamp: &str) -> Option<&RegisteredMigration> {
        self.migrations.get(timestamp)
    }

    /// Look up a definition by any identifier carrying a timestamp.
    pub fn resolve_identifier(&self, identifier: &str) -> Result<Option<&RegisteredMigration>, Error> {
        Ok(self.resolve(parse_timestamp(identifier)?))
    }

    /// Registered definitions in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredMigration> {
        self.migrations.values()
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Discovered files that have no registered handler.
    pub fn unregistered<'a>(&self, files: &'a [DefinitionFile]) -> Vec<&'a DefinitionFile> {
        files
            .iter()
            .filter(|file| !self.migrations.contains_key(&file.timestamp))
            .collect()
    }
}

/// A migration definition file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionFile {
    /// 14-digit timestamp parsed from the filename.
    pub timestamp: String,
    /// File name without directory.
    pub filename: String,
    /// Full path.
    pub path: PathBuf,
}

/// Scan directories for migration definition files.
///
/// Only files directly inside each directory whose extension is listed and
/// whose name starts with a timestamp are returned, ordered by timestamp.
/// Missing directories are skipped.
pub fn discover_definitions<P: AsRef<Path>>(
    dirs: &[P],
    extensions: &[&str],
) -> Result<Vec<DefinitionFile>, Error> {
    let mut found: BTreeMap<String, DefinitionFile> = BTreeMap::new();

    for dir in dirs {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "migration directory does not exist");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let matches_extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    extensions
                        .iter()
                        .any(|wanted| wanted.trim_start_matches('.') == ext)
                })
                .unwrap_or(false);
            if !matches_extension {
                continue;
            }

            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Ok(timestamp) = parse_timestamp(filename) else {
                continue;
            };

            if let Some(existing) = found.get(timestamp) {
                return Err(Error::DuplicateDefinition {
                    timestamp: timestamp.to_string(),
                    first: existing.filename.clone(),
                    second: filename.to_string(),
                });
            }

            found.insert(
                timestamp.to_string(),
                DefinitionFile {
                    timestamp: timestamp.to_string(),
                    filename: filename.to_string(),
                    path: path.clone(),
                },
            );
        }
    }

    Ok(found.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MigrationHandler for Noop {
        async fn parameters(&self) -> Result<MigrationParameters, HandlerError> {
            Ok(MigrationParameters::empty())
        }

        async fn run_batch(&self, _start: i64, _end: i64) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("20230406184103").unwrap(), "20230406184103");
        assert_eq!(
            parse_timestamp("20230406184103_backfill_users").unwrap(),
            "20230406184103"
        );
        assert_eq!(parse_timestamp("20230406184103.rs").unwrap(), "20230406184103");
    }

    #[test]
    fn test_parse_timestamp_rejects_malformed() {
        for bad in ["", "2023040618410", "2023040618410x_a", "202304061841031", "backfill"] {
            assert!(
                matches!(parse_timestamp(bad), Err(Error::InvalidIdentifier(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_registry_resolves_by_timestamp() {
        let registry = MigrationRegistry::new()
            .with("20230406184103_backfill_users.rs", Arc::new(Noop))
            .unwrap()
            .with("20230501000000_fill_totals", Arc::new(Noop))
            .unwrap();

        assert_eq!(registry.len(), 2);
        let found = registry.resolve("20230406184103").unwrap();
        assert_eq!(found.filename, "20230406184103_backfill_users.rs");

        let by_identifier = registry
            .resolve_identifier("20230501000000_whatever_suffix")
            .unwrap()
            .unwrap();
        assert_eq!(by_identifier.timestamp, "20230501000000");

        assert!(registry.resolve("20990101000000").is_none());
        let order: Vec<_> = registry.iter().map(|m| m.timestamp.as_str()).collect();
        assert_eq!(order, ["20230406184103", "20230501000000"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_timestamp() {
        let mut registry = MigrationRegistry::new();
        registry.register("20230406184103_a", Arc::new(Noop)).unwrap();
        let err = registry
            .register("20230406184103_b", Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDefinition { .. }));
    }

    #[test]
    fn test_discover_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20230406184103_backfill.rs"), "").unwrap();
        std::fs::write(dir.path().join("20230101000000_first.sql"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        std::fs::write(dir.path().join("notes_20230101.rs"), "").unwrap();
        std::fs::write(other.path().join("20230501000000_third.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("20230601000000_dir.rs")).unwrap();

        let missing = dir.path().join("missing");
        let files = discover_definitions(
            &[dir.path(), other.path(), missing.as_path()],
            &["rs", ".sql"],
        )
        .unwrap();

        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(
            names,
            [
                "20230101000000_first.sql",
                "20230406184103_backfill.rs",
                "20230501000000_third.rs"
            ]
        );
        assert_eq!(files[1].path, dir.path().join("20230406184103_backfill.rs"));

        let registry = MigrationRegistry::new()
            .with("20230406184103_backfill.rs", Arc::new(Noop))
            .unwrap();
        let unregistered: Vec<_> = registry
            .unregistered(&files)
            .into_iter()
            .map(|f| f.timestamp.as_str())
            .collect();
        assert_eq!(unregistered, ["20230101000000", "20230501000000"]);
    }

    #[test]
    fn test_discover_rejects_duplicate_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20230406184103_a.rs"), "").unwrap();
        std::fs::write(dir.path().join("20230406184103_b.rs"), "").unwrap();

        let err = discover_definitions(&[dir.path()], &["rs"]).unwrap_err();
        assert!(matches!(err, Error::DuplicateDefinition { .. }));
    }
}
