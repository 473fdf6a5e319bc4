//! SQLite-backed persistent store for channels, videos and watch history.
//!
//! All methods are blocking; async callers go through [`blocking`]. Every write
//! runs in a single transaction and, once committed, queues a redelivery for
//! the live queries registered on the touched table.

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak, mpsc as std_mpsc};
use tracing::{debug, info, warn};

use crate::cursor;
use crate::error::SyncResult;
use crate::live::{Delivery, LiveRegistry, Observer, Subscription, Table};
use crate::model::{Channel, Cursor, HistoryEntry, HistoryRecord, Video};

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS channels (
    channel_id    TEXT PRIMARY KEY,
    handle        TEXT NOT NULL,
    title         TEXT NOT NULL,
    thumbnail_url TEXT,
    fetched_at    INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS idx_channels_handle ON channels(handle);

  CREATE TABLE IF NOT EXISTS videos (
    video_id      TEXT PRIMARY KEY,
    channel_id    TEXT NOT NULL,
    description   TEXT NOT NULL,
    thumbnail_url TEXT,
    fetched_at    INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id, fetched_at);

  CREATE TABLE IF NOT EXISTS history (
    video_id       TEXT PRIMARY KEY,
    view_timestamp INTEGER NOT NULL,
    position       INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS idx_history_view ON history(view_timestamp);

  CREATE TABLE IF NOT EXISTS cursors (
    channel_id TEXT PRIMARY KEY,
    token      TEXT NOT NULL
  );
";

const CHANNEL_COLUMNS: &str = "channel_id, handle, title, thumbnail_url, fetched_at";
const VIDEO_COLUMNS: &str = "video_id, channel_id, description, thumbnail_url, fetched_at";

/// Shared handle to the store. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
  inner: Arc<Inner>,
}

struct Inner {
  conn: Mutex<Connection>,
  live: Arc<LiveRegistry>,
}

/// Run blocking store work off the async runtime.
pub async fn blocking<R, F>(f: F) -> SyncResult<R>
where
  F: FnOnce() -> SyncResult<R> + Send + 'static,
  R: Send + 'static,
{
  tokio::task::spawn_blocking(f).await?
}

impl Store {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> SyncResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    info!(path = %path.display(), "store: opened database");
    Self::from_connection(conn)
  }

  /// In-memory database, used by tests.
  pub fn open_memory() -> SyncResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> SyncResult<Self> {
    conn.execute_batch(SCHEMA)?;

    let (queue, deliveries) = std_mpsc::channel();
    let inner = Arc::new(Inner { conn: Mutex::new(conn), live: Arc::new(LiveRegistry::new(queue)) });
    let weak = Arc::downgrade(&inner);
    std::thread::Builder::new().name("store-delivery".into()).spawn(move || deliver(weak, deliveries))?;
    Ok(Self { inner })
  }

  pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
    // An interrupted transaction rolls back on drop, so the connection is usable.
    self.inner.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  // --- Live queries ---

  /// Channels ordered by title.
  pub fn observe_channels(&self) -> Subscription<Channel> {
    self.inner.live.subscribe_channels()
  }

  /// Videos of one channel ordered by `fetched_at` ascending.
  pub fn observe_videos(&self, channel_id: &str) -> Subscription<Video> {
    self.inner.live.subscribe_videos(channel_id)
  }

  /// History joined with video metadata, newest view first.
  pub fn observe_history(&self) -> Subscription<HistoryRecord> {
    self.inner.live.subscribe_history()
  }

  // --- Channels ---

  pub fn upsert_channels(&self, rows: &[Channel]) -> SyncResult<()> {
    if rows.is_empty() {
      return Ok(());
    }
    {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      {
        let mut stmt = tx.prepare_cached(&format!("INSERT OR REPLACE INTO channels ({CHANNEL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"))?;
        for c in rows {
          stmt.execute(params![c.channel_id, c.handle, c.title, c.thumbnail_url, c.fetched_at])?;
        }
      }
      tx.commit()?;
    }
    debug!(count = rows.len(), "store: channels upserted");
    self.inner.live.notify(Table::Channels);
    Ok(())
  }

  pub fn delete_channels<S: AsRef<str>>(&self, ids: &[S]) -> SyncResult<usize> {
    if ids.is_empty() {
      return Ok(0);
    }
    let removed = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let mut removed = 0;
      {
        let mut stmt = tx.prepare_cached("DELETE FROM channels WHERE channel_id = ?1")?;
        for id in ids {
          removed += stmt.execute(params![id.as_ref()])?;
        }
      }
      tx.commit()?;
      removed
    };
    debug!(removed, "store: channels deleted");
    self.inner.live.notify(Table::Channels);
    Ok(removed)
  }

  pub fn channels(&self) -> SyncResult<Vec<Channel>> {
    let conn = self.conn();
    let mut stmt = conn.prepare_cached(&format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY title ASC, channel_id ASC"))?;
    let rows = stmt.query_map([], channel_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
  }

  /// Handles may collide; the most recently fetched row wins.
  pub fn get_channel_by_handle(&self, handle: &str) -> SyncResult<Option<Channel>> {
    let conn = self.conn();
    let channel = conn
      .query_row(
        &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE handle = ?1 ORDER BY fetched_at DESC LIMIT 1"),
        params![handle],
        channel_from_row,
      )
      .optional()?;
    Ok(channel)
  }

  // --- Videos ---

  pub fn upsert_videos(&self, rows: &[Video]) -> SyncResult<()> {
    if rows.is_empty() {
      return Ok(());
    }
    {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      insert_videos(&tx, rows)?;
      tx.commit()?;
    }
    debug!(count = rows.len(), "store: videos upserted");
    self.inner.live.notify(Table::Videos);
    Ok(())
  }

  /// Merge one fetched page and advance the channel's cursor in a single
  /// transaction: either both land or neither does.
  pub fn store_page(&self, channel_id: &str, rows: &[Video], next: &Cursor) -> SyncResult<()> {
    {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      insert_videos(&tx, rows)?;
      cursor::write(&tx, channel_id, next)?;
      tx.commit()?;
    }
    debug!(channel_id, count = rows.len(), cursor = ?next, "store: page stored");
    self.inner.live.notify(Table::Videos);
    Ok(())
  }

  /// Drop a channel's videos and its cursor together, so the next fetch
  /// starts over from page one.
  pub fn reset_channel(&self, channel_id: &str) -> SyncResult<usize> {
    let removed = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let removed = tx.execute("DELETE FROM videos WHERE channel_id = ?1", params![channel_id])?;
      cursor::write(&tx, channel_id, &Cursor::Unset)?;
      tx.commit()?;
      removed
    };
    debug!(channel_id, removed, "store: channel reset");
    self.inner.live.notify(Table::Videos);
    Ok(removed)
  }

  pub fn cursor(&self, channel_id: &str) -> SyncResult<Cursor> {
    Ok(cursor::read(&self.conn(), channel_id)?)
  }

  /// Returns whether a row was removed.
  pub fn delete_video(&self, video_id: &str) -> SyncResult<bool> {
    let removed = self.conn().execute("DELETE FROM videos WHERE video_id = ?1", params![video_id])?;
    if removed > 0 {
      self.inner.live.notify(Table::Videos);
    }
    Ok(removed > 0)
  }

  pub fn delete_videos_for_channel(&self, channel_id: &str) -> SyncResult<usize> {
    let removed = self.conn().execute("DELETE FROM videos WHERE channel_id = ?1", params![channel_id])?;
    debug!(channel_id, removed, "store: channel videos cleared");
    self.inner.live.notify(Table::Videos);
    Ok(removed)
  }

  pub fn videos_for_channel(&self, channel_id: &str) -> SyncResult<Vec<Video>> {
    let conn = self.conn();
    let mut stmt = conn.prepare_cached(&format!(
      "SELECT {VIDEO_COLUMNS} FROM videos WHERE channel_id = ?1 ORDER BY fetched_at ASC, video_id ASC"
    ))?;
    let rows = stmt.query_map(params![channel_id], video_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
  }

  pub fn count_videos_for_channel(&self, channel_id: &str) -> SyncResult<usize> {
    let count: i64 =
      self.conn().query_row("SELECT COUNT(video_id) FROM videos WHERE channel_id = ?1", params![channel_id], |r| r.get(0))?;
    Ok(count as usize)
  }

  pub fn get_video(&self, video_id: &str) -> SyncResult<Option<Video>> {
    let conn = self.conn();
    let video = conn
      .query_row(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = ?1"), params![video_id], video_from_row)
      .optional()?;
    Ok(video)
  }

  // --- History ---

  pub fn insert_or_update_history(&self, entry: HistoryEntry<'_>) -> SyncResult<()> {
    upsert_history(&self.conn(), entry)?;
    self.inner.live.notify(Table::History);
    Ok(())
  }

  /// Keep the `limit` most recent views. Ties on `view_timestamp` are broken
  /// by video id so the survivors are deterministic.
  pub fn prune_history(&self, limit: usize) -> SyncResult<usize> {
    let removed = prune(&self.conn(), limit)?;
    if removed > 0 {
      self.inner.live.notify(Table::History);
    }
    Ok(removed)
  }

  /// Upsert a view and prune in one transaction.
  pub fn record_history(&self, entry: HistoryEntry<'_>, limit: usize) -> SyncResult<usize> {
    let removed = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      upsert_history(&tx, entry)?;
      let removed = prune(&tx, limit)?;
      tx.commit()?;
      removed
    };
    self.inner.live.notify(Table::History);
    Ok(removed)
  }

  /// `(view_timestamp, position)` of one history row.
  pub fn get_history(&self, video_id: &str) -> SyncResult<Option<(i64, u32)>> {
    let conn = self.conn();
    let row = conn
      .query_row("SELECT view_timestamp, position FROM history WHERE video_id = ?1", params![video_id], |r| {
        Ok((r.get(0)?, r.get(1)?))
      })
      .optional()?;
    Ok(row)
  }

  /// All history rows joined with their videos, newest view first. Rows whose
  /// video is gone come back with `video: None`.
  pub fn history_newest_first(&self) -> SyncResult<Vec<HistoryRecord>> {
    let conn = self.conn();
    let mut stmt = conn.prepare_cached(
      "SELECT h.video_id, h.view_timestamp, h.position,
              v.video_id, v.channel_id, v.description, v.thumbnail_url, v.fetched_at
         FROM history h
         LEFT JOIN videos v ON v.video_id = h.video_id
        ORDER BY h.view_timestamp DESC, h.video_id ASC",
    )?;
    let rows = stmt
      .query_map([], |r| {
        let joined: Option<String> = r.get(3)?;
        let video = match joined {
          Some(video_id) => Some(Video {
            video_id,
            channel_id: r.get(4)?,
            description: r.get(5)?,
            thumbnail_url: r.get(6)?,
            fetched_at: r.get(7)?,
          }),
          None => None,
        };
        Ok(HistoryRecord { video_id: r.get(0)?, view_timestamp: r.get(1)?, position: r.get(2)?, video })
      })?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
  }

  fn send_snapshot(&self, id: u64, observer: Observer) {
    let delivered = match observer {
      Observer::Channels(tx) => self.channels().map(|rows| tx.send(rows).is_ok()),
      Observer::Videos { channel_id, tx } => self.videos_for_channel(&channel_id).map(|rows| tx.send(rows).is_ok()),
      Observer::History(tx) => self.history_newest_first().map(|rows| tx.send(rows).is_ok()),
    };
    match delivered {
      Ok(true) => {}
      Ok(false) => self.inner.live.unsubscribe(id),
      Err(e) => warn!(id, err = %e, "store: snapshot query failed, observer not updated"),
    }
  }
}

fn insert_videos(conn: &Connection, rows: &[Video]) -> rusqlite::Result<()> {
  let mut stmt = conn.prepare_cached(&format!("INSERT OR REPLACE INTO videos ({VIDEO_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"))?;
  for v in rows {
    stmt.execute(params![v.video_id, v.channel_id, v.description, v.thumbnail_url, v.fetched_at])?;
  }
  Ok(())
}

fn upsert_history(conn: &Connection, entry: HistoryEntry<'_>) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT INTO history (video_id, view_timestamp, position) VALUES (?1, ?2, ?3)
     ON CONFLICT(video_id) DO UPDATE SET
       view_timestamp = excluded.view_timestamp,
       position = excluded.position",
    params![entry.video_id, entry.view_timestamp, entry.position],
  )
}

fn prune(conn: &Connection, limit: usize) -> rusqlite::Result<usize> {
  conn.execute(
    "DELETE FROM history WHERE video_id NOT IN (
       SELECT video_id FROM history ORDER BY view_timestamp DESC, video_id ASC LIMIT ?1
     )",
    params![limit as i64],
  )
}

fn channel_from_row(r: &Row<'_>) -> rusqlite::Result<Channel> {
  Ok(Channel {
    channel_id: r.get(0)?,
    handle: r.get(1)?,
    title: r.get(2)?,
    thumbnail_url: r.get(3)?,
    fetched_at: r.get(4)?,
  })
}

fn video_from_row(r: &Row<'_>) -> rusqlite::Result<Video> {
  Ok(Video {
    video_id: r.get(0)?,
    channel_id: r.get(1)?,
    description: r.get(2)?,
    thumbnail_url: r.get(3)?,
    fetched_at: r.get(4)?,
  })
}

/// Delivery thread body: drains queued work, coalesces it and sends one fresh
/// snapshot per affected observer. Exits once the store is dropped.
fn deliver(store: Weak<Inner>, deliveries: std_mpsc::Receiver<Delivery>) {
  while let Ok(first) = deliveries.recv() {
    let mut batch = vec![first];
    batch.extend(deliveries.try_iter());

    let Some(inner) = store.upgrade() else { break };
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for delivery in &batch {
      for (id, observer) in inner.live.targets(delivery) {
        if seen.insert(id) {
          targets.push((id, observer));
        }
      }
    }

    let handle = Store { inner };
    for (id, observer) in targets {
      handle.send_snapshot(id, observer);
    }
  }
  debug!("store: delivery thread stopped");
}
