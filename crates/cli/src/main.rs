//! Backup tooling for TissDB data directories.
//!
//! `backup` copies every `.db` (SSTable) and `.log` (WAL) file under the
//! data directory, preserving the database/collection layout. `restore`
//! copies a backup back, overwriting whatever is in the way. JSON metadata
//! (`manifest.json`, `schema.json`, `indexes.meta`) and index dumps ride
//! along; indexes rebuild from WAL replay if they are missing.

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "tissdb-backup", version, about = "TissDB backup utility")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy storage files from a data directory into a backup directory.
    Backup {
        data_dir: PathBuf,
        backup_dir: PathBuf,
    },
    /// Copy a backup into a data directory, overwriting existing files.
    Restore {
        backup_dir: PathBuf,
        data_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let result = match args.command {
        Command::Backup {
            data_dir,
            backup_dir,
        } => run_copy(&data_dir, &backup_dir, true),
        Command::Restore {
            backup_dir,
            data_dir,
        } => run_copy(&backup_dir, &data_dir, false),
    };

    match result {
        Ok(copied) => {
            info!("done, {copied} files copied");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Copy `src` into `dst` recursively. With `filter_storage` set only TissDB
/// storage and metadata files are taken; a restore copies everything the
/// backup holds.
fn run_copy(src: &Path, dst: &Path, filter_storage: bool) -> anyhow::Result<u64> {
    if !src.is_dir() {
        bail!("source directory {} does not exist", src.display());
    }
    fs::create_dir_all(dst)
        .with_context(|| format!("create destination {}", dst.display()))?;
    copy_tree(src, dst, filter_storage)
}

fn copy_tree(src: &Path, dst: &Path, filter_storage: bool) -> anyhow::Result<u64> {
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copied += copy_tree(&path, &target, filter_storage)?;
        } else if !filter_storage || wanted(&path) {
            fs::copy(&path, &target)
                .with_context(|| format!("copy {} -> {}", path.display(), target.display()))?;
            info!("copied {}", path.display());
            copied += 1;
        }
    }
    Ok(copied)
}

fn wanted(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("db") | Some("log") | Some("bpt") | Some("meta") => true,
        Some("json") => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn backup_copies_storage_tree_and_restore_overwrites() {
        let data = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();

        touch(&data.path().join("manifest.json"), "{\"databases\":[\"app\"]}");
        touch(&data.path().join("app/users/wal.log"), "wal");
        touch(&data.path().join("app/users/sstable_1.db"), "table");
        touch(&data.path().join("app/users/email.bpt"), "index");
        touch(&data.path().join("app/users/indexes.meta"), "{}");
        touch(&data.path().join("app/users/junk.tmp"), "scratch");

        let copied = run_copy(data.path(), backup.path(), true).unwrap();
        assert_eq!(copied, 5, "junk.tmp is not backed up");
        assert!(backup.path().join("app/users/sstable_1.db").exists());
        assert!(!backup.path().join("app/users/junk.tmp").exists());

        // Mutate and then restore over it.
        touch(&data.path().join("app/users/wal.log"), "corrupted");
        let restored = run_copy(backup.path(), data.path(), false).unwrap();
        assert_eq!(restored, 5);
        assert_eq!(
            fs::read_to_string(data.path().join("app/users/wal.log")).unwrap(),
            "wal"
        );
    }

    #[test]
    fn missing_source_fails() {
        let dst = tempfile::tempdir().unwrap();
        assert!(run_copy(Path::new("/nonexistent-tissdb"), dst.path(), true).is_err());
    }
}
