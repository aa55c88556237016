//! Refresh-token ledger.
//!
//! Every refresh token handed out is recorded here, and this is the only code
//! that writes to `refresh_tokens`. A record moves one way only: active, then
//! replaced (rotation), revoked (logout) or expired. Nothing brings it back.

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use murmur_types::models::RefreshTokenRecord;

use crate::{Database, DbError, Result, parse_ts, parse_uuid, ts};

const RECORD_COLUMNS: &str =
    "id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by";

/// SHA-256 hex digest of a token value; what the ledger stores and looks up.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Clone)]
pub struct TokenLedger {
    db: Arc<Database>,
}

impl TokenLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a newly issued refresh token as active.
    pub fn issue(&self, user_id: Uuid, token: &str, ttl: Duration) -> Result<RefreshTokenRecord> {
        self.db.with_conn(|conn| insert_record(conn, user_id, token, ttl))
    }

    /// Fetch the record for a token in whatever state it is in.
    pub fn find(&self, token: &str) -> Result<Option<RefreshTokenRecord>> {
        let digest = token_digest(token);
        self.db
            .with_conn(|conn| query_record(conn, "token_hash", &digest))
    }

    /// Fetch the record only if it can still be exchanged.
    pub fn lookup_active(&self, token: &str) -> Result<RefreshTokenRecord> {
        match self.find(token)? {
            Some(record) if record.is_active_at(Utc::now()) => Ok(record),
            _ => Err(DbError::NotFound),
        }
    }

    /// Replace an active record with a new one in a single transaction.
    ///
    /// The old row is stamped with `replaced_by` only if it is still active
    /// at commit time. If it was already rotated, revoked or expired the
    /// transaction rolls back, nothing is written, and `StaleRecord` is
    /// returned. Two callers racing on the same record: exactly one wins.
    pub fn rotate(&self, old_id: Uuid, new_token: &str, ttl: Duration) -> Result<RefreshTokenRecord> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let old = query_record(&tx, "id", &old_id.to_string())?.ok_or(DbError::NotFound)?;
            if !old.is_active_at(now) {
                return Err(DbError::StaleRecord);
            }

            let new = insert_record(&tx, old.user_id, new_token, ttl)?;

            let stamped = tx.execute(
                "UPDATE refresh_tokens SET replaced_by = ?1
                 WHERE id = ?2 AND replaced_by IS NULL AND revoked_at IS NULL AND expires_at > ?3",
                (new.id.to_string(), old_id.to_string(), ts(now)),
            )?;
            if stamped != 1 {
                return Err(DbError::StaleRecord);
            }

            tx.commit()?;
            debug!("Rotated refresh token {} -> {}", old_id, new.id);
            Ok(new)
        })
    }

    /// Stamp `revoked_at` on the token's record. Revoking an unknown or
    /// already revoked token is a no-op. Returns whether this call did the
    /// revoking.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        let digest = token_digest(token);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE refresh_tokens SET revoked_at = ?1
                 WHERE token_hash = ?2 AND revoked_at IS NULL",
                (ts(Utc::now()), digest),
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete records that expired before `cutoff`. Returns how many went.
    pub fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM refresh_tokens WHERE expires_at < ?1",
                [ts(cutoff)],
            )?;
            Ok(removed)
        })
    }
}

fn insert_record(conn: &Connection, user_id: Uuid, token: &str, ttl: Duration) -> Result<RefreshTokenRecord> {
    let issued_at = Utc::now().trunc_subsecs(6);
    let record = RefreshTokenRecord {
        id: Uuid::new_v4(),
        user_id,
        token_hash: token_digest(token),
        issued_at,
        expires_at: issued_at + ttl,
        revoked_at: None,
        replaced_by: None,
    };

    conn.execute(
        "INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            record.id.to_string(),
            record.user_id.to_string(),
            &record.token_hash,
            ts(record.issued_at),
            ts(record.expires_at),
        ),
    )?;

    Ok(record)
}

fn query_record(conn: &Connection, column: &str, value: &str) -> Result<Option<RefreshTokenRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE {column} = ?1");
    let record = conn.query_row(&sql, [value], map_record).optional()?;
    Ok(record)
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<RefreshTokenRecord> {
    let revoked_at: Option<String> = row.get(5)?;
    let replaced_by: Option<String> = row.get(6)?;

    Ok(RefreshTokenRecord {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        user_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        token_hash: row.get(2)?,
        issued_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        expires_at: parse_ts(4, &row.get::<_, String>(4)?)?,
        revoked_at: revoked_at.as_deref().map(|raw| parse_ts(5, raw)).transpose()?,
        replaced_by: replaced_by.as_deref().map(|raw| parse_uuid(6, raw)).transpose()?,
    })
}
