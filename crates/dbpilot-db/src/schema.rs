//! Built-in migrations for the incident database.
//!
//! Append new migrations to the end of [`registry`]; never reorder or rename
//! entries that have shipped.

use dbpilot_common::Result;

use crate::migrations::{Migration, SqlMigration};
use crate::registry::MigrationRegistry;
use crate::relation::SymmetricPairIndex;

pub const CREATE_INCIDENTS_TABLE: &str = "create_incidents_table";
pub const CREATE_RESPONSES_TABLE: &str = "create_responses_table";
pub const CREATE_INCIDENT_RELATIONS_TABLE: &str = "create_incident_relations_table";

const INCIDENTS_UP: &str = "
CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    datetime TEXT,
    status VARCHAR(50) NOT NULL,
    judgment VARCHAR(50) NOT NULL,
    content TEXT NOT NULL,
    assignee VARCHAR(100) NOT NULL,
    priority VARCHAR(10) NOT NULL,
    from_email VARCHAR(100) NOT NULL,
    to_email VARCHAR(100) NOT NULL,
    subject VARCHAR(200) NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

const RESPONSES_UP: &str = "
CREATE TABLE IF NOT EXISTS responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id INTEGER NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
    datetime TEXT NOT NULL,
    responder VARCHAR(100) NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_responses_incident_id
    ON responses(incident_id);
";

const INCIDENT_RELATIONS_UP: &str = "
CREATE TABLE IF NOT EXISTS incident_relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id INTEGER NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
    related_incident_id INTEGER NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_incident_relations_incident_id
    ON incident_relations(incident_id);

CREATE INDEX IF NOT EXISTS idx_incident_relations_related_incident_id
    ON incident_relations(related_incident_id);
";

/// Related incidents are an undirected relation.
pub const INCIDENT_RELATIONS_UNIQUE_PAIR: SymmetricPairIndex = SymmetricPairIndex {
    name: "idx_incident_relations_unique_pair",
    table: "incident_relations",
    left: "incident_id",
    right: "related_incident_id",
};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(SqlMigration::new(
            CREATE_INCIDENTS_TABLE,
            INCIDENTS_UP,
            "DROP TABLE IF EXISTS incidents;",
        )),
        Box::new(SqlMigration::new(
            CREATE_RESPONSES_TABLE,
            RESPONSES_UP,
            "DROP TABLE IF EXISTS responses;",
        )),
        Box::new(SqlMigration::new(
            CREATE_INCIDENT_RELATIONS_TABLE,
            format!(
                "{INCIDENT_RELATIONS_UP}\n{}",
                INCIDENT_RELATIONS_UNIQUE_PAIR.create_sql()
            ),
            format!(
                "{}\nDROP TABLE IF EXISTS incident_relations;",
                INCIDENT_RELATIONS_UNIQUE_PAIR.drop_sql()
            ),
        )),
    ]
}

pub fn registry() -> Result<MigrationRegistry> {
    MigrationRegistry::new(migrations())
}
