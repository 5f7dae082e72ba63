//!
//! # Comparing dump trees
//!
//! Two dumps of the same schema rarely match byte for byte: definers differ,
//! auto increment counters move, and the dump tool wraps statements in version
//! comments. Each tree is therefore reduced to a sorted list of normalized
//! statements before anything is compared.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::dump::BULK_DUMP_FILE;
use crate::error::Error;
use crate::history::HISTORY_TABLE;
use crate::sql::split_statements;

static EXECUTABLE_COMMENT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\*!\d*\s?").expect("valid regex"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static DEFINER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s*DEFINER\s*=\s*(`[^`]*`|'[^']*'|[^\s@]+)(@(`[^`]*`|'[^']*'|\S+))?"#)
        .expect("valid regex")
});
static AUTO_INCREMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+AUTO_INCREMENT=\d+").expect("valid regex"));
/// Statements whose target is the history table itself.
static HISTORY_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    let table = regex::escape(HISTORY_TABLE);
    Regex::new(&format!(
        r"(?i)^(CREATE\s+TABLE(\s+IF\s+NOT\s+EXISTS)?|ALTER\s+TABLE|INSERT\s+INTO|REPLACE\s+INTO)\s+(`{table}`|{table}\b)"
    ))
    .expect("valid regex")
});

/// Statement prefixes that only set up the dump session.
const NOISE: [&str; 5] = ["SET ", "LOCK TABLES", "UNLOCK TABLES", "USE ", "DROP "];

/// Outcome of comparing two dump trees.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SchemaComparisonResult {
    pub is_identical: bool,
    /// Empty when identical. `-` lines exist only in the source tree, `+`
    /// lines only in the target tree.
    pub diff: String,
}

impl fmt::Display for SchemaComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identical {
            write!(f, "Schemas are identical.")
        } else {
            write!(f, "Schemas differ.")
        }
    }
}

/// Capability to compare two dump trees.
pub trait SchemaDiff: Send + Sync {
    fn diff_trees(&self, source: &Path, target: &Path) -> Result<SchemaComparisonResult, Error>;
}

/// Compares dump trees after normalizing away non-semantic noise.
#[derive(Debug, Clone, Default)]
pub struct SchemaComparator;

impl SchemaComparator {
    pub fn new() -> Self {
        Self
    }

    pub fn compare(&self, source: &Path, target: &Path) -> Result<SchemaComparisonResult, Error> {
        info!(source = %source.display(), target = %target.display(), "Comparing schemas");
        let source_statements = normalize(&read_tree(source)?);
        let target_statements = normalize(&read_tree(target)?);
        debug!(
            source = source_statements.len(),
            target = target_statements.len(),
            "Normalized statements"
        );

        let diff = diff_statements(&source_statements, &target_statements);
        let result = SchemaComparisonResult {
            is_identical: diff.is_empty(),
            diff: if diff.is_empty() {
                String::new()
            } else {
                format!(
                    "--- {}\n+++ {}\n{}",
                    source.display(),
                    target.display(),
                    diff
                )
            },
        };
        info!("{result}");
        Ok(result)
    }
}

impl SchemaDiff for SchemaComparator {
    fn diff_trees(&self, source: &Path, target: &Path) -> Result<SchemaComparisonResult, Error> {
        self.compare(source, target)
    }
}

/// Contents of every `*.sql` file under `root`, in path order. Hidden entries,
/// the history table file and the bulk dump are skipped.
fn read_tree(root: &Path) -> Result<String, Error> {
    if !root.is_dir() {
        return Err(Error::Comparison(format!(
            "schema directory {} does not exist",
            root.display()
        )));
    }

    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut content = String::new();
    for path in files {
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::Comparison(format!("reading {}: {e}", path.display())))?;
        content.push_str(&text);
        content.push('\n');
    }
    Ok(content)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), Error> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Comparison(format!("reading {}: {e}", dir.display())))?;
    let history_file = format!("{HISTORY_TABLE}.sql");

    for entry in entries {
        let entry = entry.map_err(|e| Error::Comparison(format!("reading {}: {e}", dir.display())))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if name.ends_with(".sql") && name != history_file && name != BULK_DUMP_FILE {
            files.push(path);
        }
    }
    Ok(())
}

/// Sorted statements of `sql` with comments, definers, counters and session
/// noise removed. Statements creating or filling the history table are
/// dropped; other objects that merely mention it are kept.
pub fn normalize(sql: &str) -> Vec<String> {
    let sql = unwrap_executable_comments(sql);
    let sql = BLOCK_COMMENT.replace_all(&sql, "");
    let sql = DEFINER.replace_all(&sql, "");
    let sql = AUTO_INCREMENT.replace_all(&sql, "");
    let sql: String = sql
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    let mut statements: Vec<String> = split_statements(&sql)
        .into_iter()
        .map(|statement| statement.trim().to_string())
        .filter(|statement| {
            let upper = statement.to_ascii_uppercase();
            !statement.is_empty()
                && statement != ";"
                && !NOISE.iter().any(|prefix| upper.starts_with(prefix))
                && !HISTORY_STATEMENT.is_match(statement)
        })
        .collect();
    statements.sort();
    statements
}

/// Replace every `/*!NNNNN body */` with `body`. Block comments nested in the
/// body are kept (and removed later) instead of ending the version comment.
fn unwrap_executable_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(start) = EXECUTABLE_COMMENT_START.find(rest) {
        out.push_str(&rest[..start.start()]);
        rest = &rest[start.end()..];

        let mut depth = 0usize;
        let mut end = rest.len();
        let mut close_len = 0;
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            match (bytes[i], bytes[i + 1]) {
                (b'/', b'*') => {
                    depth += 1;
                    i += 2;
                }
                (b'*', b'/') if depth == 0 => {
                    end = i;
                    close_len = 2;
                    break;
                }
                (b'*', b'/') => {
                    depth -= 1;
                    i += 2;
                }
                _ => i += 1,
            }
        }
        out.push_str(&rest[..end]);
        rest = &rest[end + close_len..];
    }
    out.push_str(rest);
    out
}

/// Merge two sorted statement lists. Multi-line statements keep their line
/// breaks, each line prefixed with the side it belongs to.
fn diff_statements(source: &[String], target: &[String]) -> String {
    let mut out = String::new();
    let mut emit = |sign: char, statement: &str| {
        for line in statement.lines() {
            out.push(sign);
            out.push_str(line);
            out.push('\n');
        }
    };

    let (mut i, mut j) = (0, 0);
    while i < source.len() || j < target.len() {
        let order = match (source.get(i), target.get(j)) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            _ => Ordering::Greater,
        };
        match order {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                emit('-', &source[i]);
                i += 1;
            }
            Ordering::Greater => {
                emit('+', &target[j]);
                j += 1;
            }
        }
    }
    out
}
