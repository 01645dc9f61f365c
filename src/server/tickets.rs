//! SQLite ticket store
//!
//! Issued tickets outlive a restart, so a sender that is still solving a
//! puzzle can resubmit after the relay comes back.

use super::{Result, TicketError};
use crate::address::AddressHash;
use crate::message::MessageId;
use crate::pow::ProofOfWork;
use crate::transport::Ticket;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

/// Fixed-width UTC timestamps so string comparison orders them
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw column values of one ticket row
struct TicketRow {
    id: String,
    from_addr: String,
    to_addr: String,
    valid: bool,
    expires_at: String,
    message_id: String,
    pow_bits: Option<u32>,
    pow_data: Option<String>,
    pow_proof: Option<i64>,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            TicketError::Corrupt(format!("ticket {}: bad {}: {}", self.id, what, e))
        };

        let pow = match (self.pow_bits, &self.pow_data) {
            (Some(bits), Some(data)) => {
                let data = STANDARD.decode(data).map_err(|e| corrupt("challenge", &e))?;
                let proof = self.pow_proof.unwrap_or(0) as u64;
                Some(ProofOfWork::new(bits, data, proof))
            }
            _ => None,
        };

        Ok(Ticket {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt("id", &e))?,
            from: self.from_addr.parse::<AddressHash>().map_err(|e| corrupt("from", &e))?,
            to: self.to_addr.parse::<AddressHash>().map_err(|e| corrupt("to", &e))?,
            valid: self.valid,
            expires_at: DateTime::parse_from_rfc3339(&self.expires_at)
                .map_err(|e| corrupt("expiry", &e))?
                .with_timezone(&Utc),
            message_id: self
                .message_id
                .parse::<MessageId>()
                .map_err(|e| corrupt("message id", &e))?,
            pow,
        })
    }
}

/// Persistent ticket store
pub struct TicketStore {
    conn: Connection,
}

impl TicketStore {
    /// Open (and create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                valid INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                message_id TEXT NOT NULL,
                pow_bits INTEGER,
                pow_data TEXT,
                pow_proof INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_expires ON tickets(expires_at);
            "#,
        )?;
        Ok(())
    }

    pub fn insert(&self, ticket: &Ticket) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO tickets
                (id, from_addr, to_addr, valid, expires_at, message_id,
                 pow_bits, pow_data, pow_proof, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                ticket.id.to_string(),
                ticket.from.as_str(),
                ticket.to.as_str(),
                ticket.valid,
                timestamp(ticket.expires_at),
                ticket.message_id.to_string(),
                ticket.pow.as_ref().map(|p| p.bits),
                ticket.pow.as_ref().map(|p| STANDARD.encode(&p.data)),
                ticket.pow.as_ref().map(|p| p.proof as i64),
                timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Ticket>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, from_addr, to_addr, valid, expires_at, message_id,
                       pow_bits, pow_data, pow_proof
                FROM tickets WHERE id = ?1
                "#,
                params![id.to_string()],
                |row| {
                    Ok(TicketRow {
                        id: row.get(0)?,
                        from_addr: row.get(1)?,
                        to_addr: row.get(2)?,
                        valid: row.get(3)?,
                        expires_at: row.get(4)?,
                        message_id: row.get(5)?,
                        pow_bits: row.get(6)?,
                        pow_data: row.get(7)?,
                        pow_proof: row.get(8)?,
                    })
                },
            )
            .optional()?;

        row.map(TicketRow::into_ticket).transpose()
    }

    /// Record an accepted proof and mark the ticket valid
    pub fn validate(&self, id: &Uuid, proof: u64) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE tickets SET valid = 1, pow_proof = ?2 WHERE id = ?1",
            params![id.to_string(), proof as i64],
        )?;
        Ok(updated > 0)
    }

    /// Remove a ticket; false if it did not exist
    pub fn delete(&self, id: &Uuid) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id.to_string()])?;
        Ok(deleted > 0)
    }

    /// Drop every ticket that expired at or before `now`, returning their IDs
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let cutoff = timestamp(now);
        let tx = self.conn.unchecked_transaction()?;

        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM tickets WHERE expires_at <= ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw = row?;
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| TicketError::Corrupt(format!("ticket {}: bad id: {}", raw, e)))?;
                ids.push(id);
            }
            ids
        };

        tx.execute(
            "DELETE FROM tickets WHERE expires_at <= ?1",
            params![cutoff],
        )?;
        tx.commit()?;

        if !ids.is_empty() {
            tracing::debug!(purged = ids.len(), "Purged expired tickets");
        }
        Ok(ids)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn ticket(expires_in: Duration, pow: Option<ProofOfWork>) -> Ticket {
        Ticket {
            id: Uuid::new_v4(),
            from: AddressHash::from_address("john@example!"),
            to: AddressHash::from_address("jane@example!"),
            valid: pow.is_none(),
            expires_at: Utc::now() + expires_in,
            message_id: MessageId::new(),
            pow,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = TicketStore::in_memory().unwrap();
        let t = ticket(
            Duration::minutes(30),
            Some(ProofOfWork::new(12, vec![1, 2, 3], 0)),
        );
        store.insert(&t).unwrap();

        let loaded = store.get(&t.id).unwrap().unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.from, t.from);
        assert_eq!(loaded.message_id, t.message_id);
        assert_eq!(loaded.pow, t.pow);
        assert!(!loaded.valid);
        assert_eq!(
            loaded.expires_at.timestamp_micros(),
            t.expires_at.timestamp_micros()
        );

        assert!(store.get(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_validate() {
        let store = TicketStore::in_memory().unwrap();
        let t = ticket(Duration::minutes(30), Some(ProofOfWork::new(8, vec![9], 0)));
        store.insert(&t).unwrap();

        assert!(store.validate(&t.id, 1234).unwrap());
        let loaded = store.get(&t.id).unwrap().unwrap();
        assert!(loaded.valid);
        assert_eq!(loaded.pow.unwrap().proof, 1234);

        assert!(!store.validate(&Uuid::new_v4(), 1).unwrap());
    }

    #[test]
    fn test_purge_expired() {
        let store = TicketStore::in_memory().unwrap();
        let old = ticket(Duration::minutes(-1), None);
        let fresh = ticket(Duration::minutes(30), None);
        store.insert(&old).unwrap();
        store.insert(&fresh).unwrap();

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), vec![old.id]);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn test_large_proof_survives_storage() {
        let store = TicketStore::in_memory().unwrap();
        let proof = u64::MAX - 41;
        let t = ticket(
            Duration::minutes(30),
            Some(ProofOfWork::new(8, vec![5, 6], proof)),
        );
        store.insert(&t).unwrap();
        assert_eq!(store.get(&t.id).unwrap().unwrap().pow.unwrap().proof, proof);

        store.validate(&t.id, u64::MAX).unwrap();
        assert_eq!(
            store.get(&t.id).unwrap().unwrap().pow.unwrap().proof,
            u64::MAX
        );
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tickets.db");
        let t = ticket(Duration::minutes(30), None);

        TicketStore::open(&path).unwrap().insert(&t).unwrap();
        let store = TicketStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.delete(&t.id).unwrap());
        assert!(!store.delete(&t.id).unwrap());
    }
}
