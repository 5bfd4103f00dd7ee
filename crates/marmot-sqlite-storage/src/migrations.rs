use rusqlite::Connection;

use crate::error::Error;

refinery::embed_migrations!("migrations");

/// History table, named per crate so the sidecar database can host other refinery schemas
const HISTORY_TABLE: &str = "_refinery_schema_history_marmot";

/// Bring the group, key package and ledger tables up to the latest schema
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<(), Error> {
    let report = migrations::runner()
        .set_migration_table_name(HISTORY_TABLE)
        .run(conn)?;

    for migration in report.applied_migrations() {
        tracing::info!(
            target: "marmot_sqlite_storage",
            version = migration.version(),
            "Applied schema migration {}",
            migration.name()
        );
    }

    Ok(())
}
