//! Table definitions, executed on every open. `IF NOT EXISTS` keeps the
//! statements idempotent across restarts.

pub const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS preferences (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credentials (
        id             TEXT PRIMARY KEY,
        encrypted_data TEXT NOT NULL,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL
    )",
];
