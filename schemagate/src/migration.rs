use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::history::MigrationHistoryRecord;

/// One forward migration script read from the migrations directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// File name, e.g. `002_add_email.sql`. Recorded verbatim in the history table.
    pub name: String,
    pub path: PathBuf,
    /// Raw file content, before any preprocessing.
    pub sql: String,
}

impl MigrationFile {
    /// Read every `*.sql` file in `dir`, ordered by file name.
    ///
    /// # IMPORTANT
    ///
    /// The byte-wise order of the names *is* the apply order. Use a zero-padded
    /// numeric prefix (`001_`, `002_`, ...) so that `010_` sorts after `009_`.
    pub fn load_dir(dir: &Path) -> Result<Vec<MigrationFile>, Error> {
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "migrations directory {} does not exist",
                dir.display()
            )));
        }

        let entries = fs::read_dir(dir)
            .map_err(|e| Error::io(format!("Error reading directory {}", dir.display()), e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io(format!("Error reading directory {}", dir.display()), e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let sql = fs::read_to_string(&path)
                .map_err(|e| Error::io(format!("Error reading file {}", path.display()), e))?;
            files.push(MigrationFile { name, path, sql });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// SHA-256 of the raw content, as lowercase hex.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Files whose name is not in `applied`, keeping the order of `files`.
pub fn pending_migrations<'a>(
    files: &'a [MigrationFile],
    applied: &[MigrationHistoryRecord],
) -> Vec<&'a MigrationFile> {
    let applied: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
    files
        .iter()
        .filter(|file| !applied.contains(file.name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(id: u64, name: &str) -> MigrationHistoryRecord {
        MigrationHistoryRecord {
            id,
            name: name.to_string(),
            created_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn loads_sql_files_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("010_late.sql"), "SELECT 10;").unwrap();
        fs::write(dir.path().join("002_add_email.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("001_init.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(dir.path().join("003_dir.sql")).unwrap();

        let files = MigrationFile::load_dir(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();

        assert_eq!(names, vec!["001_init.sql", "002_add_email.sql", "010_late.sql"]);
        assert_eq!(files[0].sql, "SELECT 1;");
        assert_eq!(files[0].path, dir.path().join("001_init.sql"));
    }

    #[test]
    fn missing_directory_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MigrationFile::load_dir(&dir.path().join("nope"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn pending_preserves_file_order() {
        let files: Vec<MigrationFile> = ["001_a.sql", "002_b.sql", "003_c.sql", "004_d.sql"]
            .iter()
            .map(|name| MigrationFile {
                name: name.to_string(),
                path: PathBuf::from(name),
                sql: String::new(),
            })
            .collect();

        let applied = vec![record(1, "003_c.sql"), record(2, "001_a.sql")];
        let pending: Vec<_> = pending_migrations(&files, &applied)
            .into_iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(pending, vec!["002_b.sql", "004_d.sql"]);

        let everything: Vec<_> = files.iter().map(|f| record(0, &f.name)).collect();
        assert!(pending_migrations(&files, &everything).is_empty());
    }

    #[test]
    fn checksum_tracks_content() {
        let file = MigrationFile {
            name: "001_init.sql".into(),
            path: PathBuf::from("001_init.sql"),
            sql: "CREATE TABLE users (id INT);".into(),
        };
        let mut edited = file.clone();
        edited.sql.push(' ');

        assert_eq!(file.checksum().len(), 64);
        assert_eq!(file.checksum(), file.clone().checksum());
        assert_ne!(file.checksum(), edited.checksum());
    }
}
