//! The top-level owner of every database under one base directory.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{collection::CollectionOptions, database::Database, error::StorageError};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    databases: Vec<String>,
}

/// Owns the `manifest.json` listing databases and an open handle per
/// database.
pub struct DatabaseManager {
    base_path: PathBuf,
    options: CollectionOptions,
    databases: RwLock<BTreeMap<String, Arc<Database>>>,
}

impl DatabaseManager {
    /// Open the manager at `base_path`, loading every database named in the
    /// manifest.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_options(base_path, CollectionOptions::default())
    }

    pub fn open_with_options(
        base_path: impl Into<PathBuf>,
        options: CollectionOptions,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        let manifest = Self::read_manifest(&base_path)?;
        let mut databases = BTreeMap::new();
        for name in manifest.databases {
            let db = Database::open(&name, base_path.join(&name), options)?;
            databases.insert(name, Arc::new(db));
        }
        info!(
            "database manager at {}: {} databases",
            base_path.display(),
            databases.len()
        );

        Ok(Self {
            base_path,
            options,
            databases: RwLock::new(databases),
        })
    }

    fn read_manifest(base_path: &Path) -> Result<Manifest, StorageError> {
        let path = base_path.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::corrupt(path, e.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_manifest(&self) -> Result<(), StorageError> {
        let manifest = Manifest {
            databases: self.databases.read().keys().cloned().collect(),
        };
        let path = self.base_path.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::corrupt(&path, e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<Database>, StorageError> {
        if self.databases.read().contains_key(name) {
            return Err(StorageError::DatabaseExists(name.to_owned()));
        }
        let db = Arc::new(Database::open(name, self.base_path.join(name), self.options)?);
        self.databases.write().insert(name.to_owned(), db.clone());
        self.write_manifest()?;
        Ok(db)
    }

    /// Remove the database and its directory. Deleting a database that does
    /// not exist is fine.
    pub fn delete_database(&self, name: &str) -> Result<(), StorageError> {
        let removed = self.databases.write().remove(name);
        if removed.is_none() {
            return Ok(());
        }
        let dir = self.base_path.join(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        self.write_manifest()
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>, StorageError> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::DatabaseNotFound(name.to_owned()))
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
    }

    pub fn list_databases(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();
        for db in databases {
            db.checkpoint()?;
        }
        Ok(())
    }
}
