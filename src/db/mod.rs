pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

/// Database connection wrapper for persisted session state
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open() -> Result<Self, SessionError> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the database at an explicit path
  pub fn open_at(path: &Path) -> Result<Self, SessionError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Private in-memory database, used by tests and ephemeral sessions
  pub fn in_memory() -> Result<Self, SessionError> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, SessionError> {
    Ok(data_dir()?.join("session.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), SessionError> {
    self.conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }
}

/// Application data directory (`$XDG_DATA_HOME/perch`).
pub fn data_dir() -> Result<PathBuf, SessionError> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or(SessionError::NoDataDir)?;

  Ok(data_dir.join("perch"))
}
