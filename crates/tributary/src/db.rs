//! Database connection utilities.

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

/// SQLite pragmas applied to file-backed databases.
///
/// Collectors write raw pages from many concurrent tasks, so readers must not
/// block writers (`WAL`) and writers must wait for locks instead of failing.
const SQLITE_PRAGMAS: [&str; 3] = [
    "PRAGMA journal_mode=WAL",
    "PRAGMA busy_timeout=5000",
    "PRAGMA synchronous=NORMAL",
];

async fn configure_sqlite(db: &DatabaseConnection) -> Result<(), DbErr> {
    for pragma in SQLITE_PRAGMAS {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            pragma.to_string(),
        ))
        .await?;
    }
    Ok(())
}

/// Establish a connection to the database.
///
/// File-backed SQLite databases get WAL journaling, a 5 second busy timeout
/// and `synchronous=NORMAL`.
///
/// # Arguments
/// * `database_url` - Connection string, e.g. `sqlite://tributary.db?mode=rwc`,
///   `sqlite::memory:` or `postgres:///tributary`
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    if database_url.starts_with("sqlite://") {
        configure_sqlite(&db).await?;
    }

    Ok(db)
}

/// Establish a connection and create or upgrade the state tables.
///
/// Raw, tool and domain tables are not managed here: raw tables are created
/// on demand by collectors, the others belong to plugins.
///
/// # Example
/// ```ignore
/// let db = tributary::connect_and_migrate("sqlite://tributary.db?mode=rwc").await?;
/// ```
#[cfg(feature = "migrate")]
pub async fn connect_and_migrate(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    use sea_orm_migration::MigratorTrait;

    let db = connect(database_url).await?;
    crate::migration::Migrator::up(&db, None).await?;
    Ok(db)
}
