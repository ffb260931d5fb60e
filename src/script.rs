//! Deploy, revert and verify scripts
//!
//! A script is loaded whole from disk. Besides its content we classify
//! whether it manages its own transaction (`BEGIN; ... COMMIT;`), which
//! decides whether the engine wraps it in a transaction of its own.

use crate::error::{Error, Result};
use crate::id::script_hash;
use std::fmt;
use std::path::{Path, PathBuf};

/// The three scripts every change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Deploy,
    Revert,
    Verify,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 3] = [ScriptKind::Deploy, ScriptKind::Revert, ScriptKind::Verify];

    /// Directory under the top dir holding scripts of this kind.
    pub fn dir(&self) -> &'static str {
        match self {
            ScriptKind::Deploy => "deploy",
            ScriptKind::Revert => "revert",
            ScriptKind::Verify => "verify",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// A loaded SQL script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub path: PathBuf,
    pub content: String,
    self_managed: bool,
}

impl Script {
    /// Read a script from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_source(path, content))
    }

    pub fn from_source(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let content = content.into();
        let self_managed = manages_transaction(&content);
        Self {
            path: path.into(),
            content,
            self_managed,
        }
    }

    /// True when the script contains its own transaction control.
    pub fn is_self_managed(&self) -> bool {
        self.self_managed
    }

    pub fn hash(&self) -> String {
        script_hash(self.content.as_bytes())
    }
}

/// Best-effort check for statement-level transaction control.
///
/// Only the leading words of each statement count, and string literals,
/// quoted identifiers and comments are skipped, so a trigger body
/// (`CREATE TRIGGER ... BEGIN ... END;`) or `RAISE(ROLLBACK, ...)` is not
/// mistaken for transaction control. A bare `END` is ambiguous with trigger
/// bodies and is ignored; `END TRANSACTION` counts.
pub fn manages_transaction(sql: &str) -> bool {
    for statement in leading_words(sql) {
        let words: Vec<&str> = statement.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["BEGIN", ..] | ["COMMIT", ..] | ["ROLLBACK", ..] => return true,
            ["START", "TRANSACTION", ..] | ["END", "TRANSACTION", ..] => return true,
            _ => {}
        }
    }
    false
}

/// Up to the first two upper-cased words of every statement.
fn leading_words(sql: &str) -> Vec<Vec<String>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current: Vec<String> = Vec::new();
    // Once a statement has any non-word token, its leading words are settled
    let mut settled = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                i = skip_quoted(&chars, i, c);
                settled = true;
            }
            '[' => {
                i = skip_quoted(&chars, i, ']');
                settled = true;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            ';' => {
                if !current.is_empty() {
                    statements.push(std::mem::take(&mut current));
                }
                settled = false;
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if !settled && current.len() < 2 {
                    let word: String = chars[start..i].iter().collect();
                    current.push(word.to_uppercase());
                }
                if current.len() >= 2 {
                    settled = true;
                }
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                settled = true;
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    statements
}

/// Index just past the closing `close` of a literal opened at `start`.
/// Doubled delimiters inside the literal are escapes.
fn skip_quoted(chars: &[char], start: usize, close: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if close != ']' && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ddl_is_not_self_managed() {
        let sql = "CREATE TABLE users (name TEXT PRIMARY KEY);\nINSERT INTO users VALUES ('x');";
        assert!(!manages_transaction(sql));
    }

    #[test]
    fn test_begin_commit_is_self_managed() {
        let sql = "-- Deploy flipr:users to sqlite\n\nBEGIN;\n\nCREATE TABLE users (name TEXT);\n\nCOMMIT;\n";
        assert!(manages_transaction(sql));
    }

    #[test]
    fn test_begin_variants() {
        assert!(manages_transaction("begin immediate; select 1; commit"));
        assert!(manages_transaction("START TRANSACTION; SELECT 1;"));
        assert!(manages_transaction("SELECT 1; END TRANSACTION;"));
        assert!(manages_transaction("select 1;\nrollback;"));
    }

    #[test]
    fn test_keywords_in_literals_and_comments_are_ignored() {
        let sql = "INSERT INTO log VALUES ('BEGIN; COMMIT;');\n\
                   -- COMMIT;\n\
                   /* ROLLBACK; */\n\
                   SELECT \"commit\" FROM t;";
        assert!(!manages_transaction(sql));
    }

    #[test]
    fn test_escaped_quotes_do_not_end_literal() {
        let sql = "INSERT INTO t VALUES ('it''s; COMMIT');";
        assert!(!manages_transaction(sql));
    }

    #[test]
    fn test_trigger_body_is_not_transaction_control() {
        let sql = "CREATE TRIGGER t AFTER INSERT ON users FOR EACH ROW\n\
                   BEGIN\n\
                     UPDATE counts SET n = n + 1;\n\
                     SELECT RAISE(ROLLBACK, 'nope') WHERE NEW.name = '';\n\
                   END;";
        assert!(!manages_transaction(sql));
    }

    #[test]
    fn test_load_reads_content_and_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("users.sql");
        std::fs::write(&path, "BEGIN;\nCREATE TABLE users (name TEXT);\nCOMMIT;\n").unwrap();

        let script = Script::load(&path).unwrap();
        assert!(script.is_self_managed());
        assert_eq!(script.hash().len(), 40);
        assert_eq!(script.path, path);
    }

    #[test]
    fn test_load_missing_script_reports_path() {
        let err = Script::load(Path::new("/nonexistent/deploy/users.sql")).unwrap_err();
        assert!(err.to_string().contains("deploy/users.sql"));
    }
}
