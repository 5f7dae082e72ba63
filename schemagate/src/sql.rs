//! Text-level helpers for SQL scripts and dump files.
//!
//! `DELIMITER` is a convention of the `mysql` command line client, not SQL the
//! server understands. Scripts written for the client use it around stored
//! program bodies; everything here knows how to read it.

const DEFAULT_DELIMITER: &str = ";";

/// If `line` is a `DELIMITER x` directive, return `x`.
fn delimiter_directive(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let keyword = trimmed.get(..9)?;
    if !keyword.eq_ignore_ascii_case("DELIMITER") {
        return None;
    }
    let rest = &trimmed[9..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let delimiter = rest.trim();
    (!delimiter.is_empty()).then_some(delimiter)
}

fn is_line_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("--") || trimmed.starts_with('#')
}

/// Remove `DELIMITER` directives and rewrite custom terminators back to `;`,
/// so the whole script can be sent to the server in one multi-statement query.
pub fn preprocess_sql(sql: &str) -> String {
    let mut delimiter = DEFAULT_DELIMITER.to_string();
    let mut out: Vec<String> = Vec::new();

    for line in sql.lines() {
        if let Some(next) = delimiter_directive(line) {
            delimiter = next.to_string();
            continue;
        }
        if delimiter != DEFAULT_DELIMITER {
            let end = line.trim_end();
            if let Some(body) = end.strip_suffix(delimiter.as_str()) {
                out.push(format!("{};", body.trim_end()));
                continue;
            }
        }
        out.push(line.to_string());
    }

    out.join("\n")
}

/// True when nothing but whitespace and line comments remains.
pub fn is_blank(sql: &str) -> bool {
    sql.lines()
        .all(|line| line.trim().is_empty() || is_line_comment(line))
}

/// Split a script into statements, honouring `DELIMITER` directives.
///
/// A statement ends on a line whose trailing text is the current delimiter.
/// The delimiter is replaced by `;`, full-line comments are skipped and a
/// trailing statement without terminator is kept as is.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut delimiter = DEFAULT_DELIMITER.to_string();
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in sql.lines() {
        if let Some(next) = delimiter_directive(line) {
            delimiter = next.to_string();
            continue;
        }
        if is_line_comment(line) || (current.is_empty() && line.trim().is_empty()) {
            continue;
        }
        let end = line.trim_end();
        match end.strip_suffix(delimiter.as_str()) {
            Some(body) => {
                let mut statement = current.join("\n");
                if !statement.is_empty() {
                    statement.push('\n');
                }
                statement.push_str(body.trim_end());
                statement.push(';');
                statements.push(statement);
                current.clear();
            }
            None => current.push(end),
        }
    }

    let rest = current.join("\n");
    if !rest.trim().is_empty() {
        statements.push(rest.trim().to_string());
    }
    statements
}

/// The `INSERT` statements of a dump, in file order. Table definitions and
/// session statements are ignored.
pub fn extract_insert_statements(sql: &str) -> Vec<String> {
    split_statements(sql)
        .into_iter()
        .filter(|statement| {
            statement
                .trim_start()
                .get(..6)
                .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"))
        })
        .collect()
}
