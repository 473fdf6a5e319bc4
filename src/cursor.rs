//! Per-channel pagination cursors. They live in their own table of the main
//! database so a page of videos and the cursor that follows it commit together.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::SyncResult;
use crate::model::Cursor;
use crate::store::Store;

pub(crate) fn read(conn: &Connection, channel_id: &str) -> rusqlite::Result<Cursor> {
  let stored: Option<String> = conn
    .query_row("SELECT token FROM cursors WHERE channel_id = ?1", params![channel_id], |r| r.get(0))
    .optional()?;
  Ok(Cursor::from_stored(stored))
}

/// `Unset` deletes the row.
pub(crate) fn write(conn: &Connection, channel_id: &str, cursor: &Cursor) -> rusqlite::Result<()> {
  match cursor.to_stored() {
    Some(token) => conn.execute(
      "INSERT INTO cursors (channel_id, token) VALUES (?1, ?2)
       ON CONFLICT(channel_id) DO UPDATE SET token = excluded.token",
      params![channel_id, token],
    )?,
    None => conn.execute("DELETE FROM cursors WHERE channel_id = ?1", params![channel_id])?,
  };
  Ok(())
}

/// Cursor access on its own, for callers that do not also touch videos.
#[derive(Clone)]
pub struct CursorStore {
  store: Store,
}

impl CursorStore {
  pub fn new(store: &Store) -> Self {
    Self { store: store.clone() }
  }

  pub fn get(&self, channel_id: &str) -> SyncResult<Cursor> {
    Ok(read(&self.store.conn(), channel_id)?)
  }

  pub fn set(&self, channel_id: &str, cursor: &Cursor) -> SyncResult<()> {
    write(&self.store.conn(), channel_id, cursor)?;
    debug!(channel_id, cursor = ?cursor, "cursor: stored");
    Ok(())
  }

  /// Back to `Unset`: the next fetch starts a new cursor series from page one.
  pub fn reset(&self, channel_id: &str) -> SyncResult<()> {
    self.set(channel_id, &Cursor::Unset)
  }
}
