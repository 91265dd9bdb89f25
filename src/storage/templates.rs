//! Named SQL templates
//!
//! One template per logical DDL/DML operation, retrieved by name and
//! parameterized only with identifiers through the single `{table}`
//! substitution point. Data values never pass through here.

/// Structure table: id plus the serialized body. The id column is declared
/// without affinity so the same template serves integer and text id types.
pub const CREATE_STRUCTURE: &str = r#"
CREATE TABLE IF NOT EXISTS [{table}] (
    StructureId PRIMARY KEY,
    Json TEXT NOT NULL
)
"#;

/// Narrow index table: one row per (structure, member path, value) fact
pub const CREATE_INDEXES: &str = r#"
CREATE TABLE IF NOT EXISTS [{table}] (
    StructureId NOT NULL,
    MemberPath TEXT NOT NULL,
    MemberValue
)
"#;

pub const CREATE_INDEXES_IX_PATH: &str =
    "CREATE INDEX IF NOT EXISTS [{table}_IxPath] ON [{table}] (MemberPath, MemberValue)";

pub const CREATE_INDEXES_IX_SID: &str =
    "CREATE INDEX IF NOT EXISTS [{table}_IxSid] ON [{table}] (StructureId)";

/// Uniques table for client-generated (Guid/string) ids: the structure id
/// is embedded as data and the constraint pair is the key.
pub const CREATE_UNIQUES_GUID: &str = r#"
CREATE TABLE IF NOT EXISTS [{table}] (
    StructureId NOT NULL,
    MemberPath TEXT NOT NULL,
    MemberValue NOT NULL,
    PRIMARY KEY (MemberPath, MemberValue)
)
"#;

/// Uniques table for server-assigned identity ids: needs an auto-increment
/// surrogate key, with the constraint pair enforced separately.
pub const CREATE_UNIQUES_IDENTITY: &str = r#"
CREATE TABLE IF NOT EXISTS [{table}] (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    StructureId INTEGER NOT NULL,
    MemberPath TEXT NOT NULL,
    MemberValue NOT NULL,
    UNIQUE (MemberPath, MemberValue)
)
"#;

pub const TABLE_EXISTS: &str =
    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1";

/// Look up a template by logical operation name
pub fn get_sql(name: &str) -> Option<&'static str> {
    match name {
        "CreateStructure" => Some(CREATE_STRUCTURE),
        "CreateIndexes" => Some(CREATE_INDEXES),
        "CreateIndexesIxPath" => Some(CREATE_INDEXES_IX_PATH),
        "CreateIndexesIxSid" => Some(CREATE_INDEXES_IX_SID),
        "CreateUniquesGuid" => Some(CREATE_UNIQUES_GUID),
        "CreateUniquesIdentity" => Some(CREATE_UNIQUES_IDENTITY),
        "TableExists" => Some(TABLE_EXISTS),
        _ => None,
    }
}

/// Substitute the table-name placeholder
pub fn inject(template: &str, table: &str) -> String {
    template.replace("{table}", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert!(get_sql("CreateUniquesGuid").is_some());
        assert!(get_sql("CreateUniquesIdentity").is_some());
        assert!(get_sql("NoSuchTemplate").is_none());
    }

    #[test]
    fn test_inject_replaces_every_placeholder() {
        let sql = inject(CREATE_INDEXES_IX_PATH, "ItemIndexes");
        assert!(!sql.contains("{table}"));
        assert!(sql.contains("[ItemIndexes_IxPath]"));
        assert!(sql.contains("ON [ItemIndexes]"));
    }
}
