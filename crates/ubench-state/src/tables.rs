//! redb table definitions.
//!
//! Values are JSON-serialized domain types stored in `&[u8]` columns.

use redb::TableDefinition;

/// Holds a single row, [`SNAPSHOT_KEY`], whose value is the JSON array of
/// every instance in creation order.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Key of the instance snapshot row.
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Discovery entries keyed by logical service name.
pub const DISCOVERY: TableDefinition<&str, &[u8]> = TableDefinition::new("discovery");
