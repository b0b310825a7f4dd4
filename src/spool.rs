use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{error, info};

use crate::error::Result;

/// A packet that could not be delivered before the link went away.
#[derive(Debug, Clone, PartialEq)]
pub struct SpooledPacket {
    pub message_id: u32,
    pub spooled_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Local SQLite store for undelivered telemetry, so a reboot does not lose it.
pub struct Spool {
    conn: Connection,
}

impl Spool {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        info!(path = %path.display(), "Initializing telemetry spool.");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS spooled_packets (
                id INTEGER PRIMARY KEY,
                message_id INTEGER NOT NULL,
                spooled_at TEXT NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Spool { conn })
    }

    pub fn push(&self, message_id: u32, payload: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO spooled_packets (message_id, spooled_at, payload) VALUES (?1, ?2, ?3)",
            params![message_id, Utc::now(), payload],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM spooled_packets", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes and returns up to `batch_size` packets, oldest first.
    pub fn take_batch(&mut self, batch_size: u32) -> Result<Vec<SpooledPacket>> {
        let tx = self.conn.transaction()?;

        let (packets, ids_to_delete) = {
            let mut stmt = tx.prepare(
                "SELECT id, message_id, spooled_at, payload FROM spooled_packets ORDER BY id LIMIT ?",
            )?;
            let rows = stmt.query_map(params![batch_size], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    SpooledPacket {
                        message_id: row.get(1)?,
                        spooled_at: row.get(2)?,
                        payload: row.get(3)?,
                    },
                ))
            })?;

            let mut packets = Vec::new();
            let mut ids_to_delete = Vec::new();
            for row in rows {
                let (id, packet) = row?;
                packets.push(packet);
                ids_to_delete.push(id);
            }
            (packets, ids_to_delete)
        };

        for id in &ids_to_delete {
            if let Err(e) = tx.execute("DELETE FROM spooled_packets WHERE id = ?", params![id]) {
                error!(error = %e, id, "Failed to delete spooled packet.");
            }
        }

        tx.commit()?;
        if !packets.is_empty() {
            info!(count = packets.len(), "Restored packets from spool.");
        }
        Ok(packets)
    }
}
