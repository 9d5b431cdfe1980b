//! Credential persistence.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::db::Database;
use crate::error::SessionError;

/// Persisted credentials for one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
  /// Bearer token sent on every request
  pub access_token: String,
  /// Session credential presented to the refresh endpoint
  pub session_token: Option<String>,
  pub user_id: Option<String>,
}

impl Credentials {
  pub fn new(access_token: impl Into<String>) -> Self {
    Self {
      access_token: access_token.into(),
      session_token: None,
      user_id: None,
    }
  }

  pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
    self.session_token = Some(token.into());
    self
  }

  pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
  fn load(&self) -> Result<Option<Credentials>, SessionError>;

  fn save(&self, credentials: &Credentials) -> Result<(), SessionError>;

  fn clear(&self) -> Result<(), SessionError>;
}

/// Store that keeps credentials only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
  slot: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_credentials(credentials: Credentials) -> Self {
    Self {
      slot: Mutex::new(Some(credentials)),
    }
  }
}

impl CredentialStore for MemoryCredentialStore {
  fn load(&self) -> Result<Option<Credentials>, SessionError> {
    Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
  }

  fn save(&self, credentials: &Credentials) -> Result<(), SessionError> {
    *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
    Ok(())
  }

  fn clear(&self) -> Result<(), SessionError> {
    *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    Ok(())
  }
}

/// SQLite-backed credential store.
pub struct SqliteCredentialStore {
  db: Mutex<Database>,
}

impl SqliteCredentialStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self, SessionError> {
    Ok(Self::from_database(Database::open()?))
  }

  pub fn from_database(db: Database) -> Self {
    Self { db: Mutex::new(db) }
  }
}

impl CredentialStore for SqliteCredentialStore {
  fn load(&self) -> Result<Option<Credentials>, SessionError> {
    let db = self.db.lock().unwrap_or_else(|e| e.into_inner());

    let credentials = db
      .conn()
      .query_row(
        "SELECT access_token, session_token, user_id FROM credentials WHERE slot = 0",
        [],
        |row| {
          Ok(Credentials {
            access_token: row.get(0)?,
            session_token: row.get(1)?,
            user_id: row.get(2)?,
          })
        },
      )
      .optional()?;

    Ok(credentials)
  }

  fn save(&self, credentials: &Credentials) -> Result<(), SessionError> {
    let db = self.db.lock().unwrap_or_else(|e| e.into_inner());

    db.conn().execute(
      "INSERT OR REPLACE INTO credentials (slot, access_token, session_token, user_id, saved_at)
       VALUES (0, ?, ?, ?, datetime('now'))",
      params![
        credentials.access_token,
        credentials.session_token,
        credentials.user_id
      ],
    )?;

    Ok(())
  }

  fn clear(&self) -> Result<(), SessionError> {
    let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
    db.conn().execute("DELETE FROM credentials", [])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_store_persists_and_clears() {
    let store = SqliteCredentialStore::from_database(Database::in_memory().unwrap());
    assert_eq!(store.load().unwrap(), None);

    let creds = Credentials::new("abc")
      .with_session_token("sess")
      .with_user_id("u1");
    store.save(&creds).unwrap();
    assert_eq!(store.load().unwrap(), Some(creds));

    // Saving again replaces the single slot
    store.save(&Credentials::new("def")).unwrap();
    assert_eq!(store.load().unwrap().unwrap().access_token, "def");

    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
  }

  #[test]
  fn test_memory_store() {
    let store = MemoryCredentialStore::with_credentials(Credentials::new("t"));
    assert_eq!(store.load().unwrap().unwrap().access_token, "t");
    store.clear().unwrap();
    assert!(store.load().unwrap().is_none());
  }
}
