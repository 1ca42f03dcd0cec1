//! Database schema definitions

use std::fmt;

/// Stored in `PRAGMA user_version`. Any mismatch drops and recreates every table.
pub const SCHEMA_VERSION: i64 = 2;

/// SQL to create the analysis payload table
pub const CREATE_ANALYSIS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis (
    id TEXT PRIMARY KEY,
    payload BLOB NOT NULL
)
"#;

/// SQL to create the analysis metadata table
/// `files` holds the JSON-encoded file reference graph
pub const CREATE_ANALYSIS_META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_meta (
    id TEXT PRIMARY KEY,
    files TEXT NOT NULL,
    time INTEGER NOT NULL,
    title TEXT NOT NULL
)
"#;

/// SQL to create the file payload table
pub const CREATE_FILE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS file (
    id TEXT PRIMARY KEY,
    payload BLOB NOT NULL
)
"#;

/// SQL to create the file reference count table
pub const CREATE_FILE_META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS file_meta (
    id TEXT PRIMARY KEY,
    count INTEGER NOT NULL CHECK (count >= 1)
)
"#;

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_ANALYSIS_TABLE,
        CREATE_ANALYSIS_META_TABLE,
        CREATE_FILE_TABLE,
        CREATE_FILE_META_TABLE,
    ]
}

/// Statements that remove every table, used on a version change
pub fn drop_statements() -> Vec<String> {
    Collection::ALL
        .iter()
        .map(|c| format!("DROP TABLE IF EXISTS {}", c.table()))
        .collect()
}

/// One of the four stored collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Analysis,
    AnalysisMeta,
    File,
    FileMeta,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Analysis,
        Collection::AnalysisMeta,
        Collection::File,
        Collection::FileMeta,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Analysis => "analysis",
            Collection::AnalysisMeta => "analysis_meta",
            Collection::File => "file",
            Collection::FileMeta => "file_meta",
        }
    }

    /// Whether records in this collection are `(id, payload)` pairs
    pub fn holds_payload(&self) -> bool {
        matches!(self, Collection::Analysis | Collection::File)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_collection_has_a_create_statement() {
        let stmts = all_schema_statements();
        for collection in Collection::ALL {
            let needle = format!("CREATE TABLE IF NOT EXISTS {} (", collection.table());
            assert!(stmts.iter().any(|s| s.contains(&needle)), "{collection}");
        }
    }

    #[test]
    fn test_drop_statements_cover_all_tables() {
        let drops = drop_statements();
        assert_eq!(drops.len(), 4);
        assert!(drops.contains(&"DROP TABLE IF EXISTS file_meta".to_string()));
    }
}
