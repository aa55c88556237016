use chrono::{SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::{MessageRow, NewMessage, NewUser, UserRow};
use crate::{Database, DbError, Result, parse_ts, parse_uuid, ts};

const USER_COLUMNS: &str = "id, username, email, password_hash, display_name, avatar_url, \
     is_private, is_verified, is_active, created_at, last_login_at";

impl Database {
    // -- Users --

    /// Insert a new account. Fails with `Conflict` when the username or email
    /// is already taken, including when a concurrent signup wins the race.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<UserRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE email = ?1 OR username = ?2",
                    (user.email, user.username),
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(DbError::Conflict("username or email".into()));
            }

            let id = Uuid::new_v4();
            let now = Utc::now();
            tx.execute(
                "INSERT INTO users (id, username, email, password_hash, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    user.username,
                    user.email,
                    user.password_hash,
                    user.display_name,
                    ts(now),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::Conflict("username or email".into())
                } else {
                    DbError::from(e)
                }
            })?;

            let row = query_user(&tx, "id", &id.to_string())?.ok_or(DbError::NotFound)?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id.to_string()))
    }

    pub fn touch_last_login(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                (ts(Utc::now()), id.to_string()),
            )?;
            Ok(())
        })
    }

    pub fn set_user_active(&self, id: Uuid, active: bool) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                (active, id.to_string()),
            )?;
            if changed == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
    }

    // -- Messages --

    /// Persist a chat message and return it with its assigned id.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<MessageRow> {
        let row = MessageRow {
            id: Uuid::new_v4(),
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            text: msg.text.map(str::to_string),
            media_url: msg.media_url.map(str::to_string),
            created_at: Utc::now().trunc_subsecs(6),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, text, media_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id.to_string(),
                    row.conversation_id.to_string(),
                    row.sender_id.to_string(),
                    row.receiver_id.to_string(),
                    row.text,
                    row.media_url,
                    ts(row.created_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, conversation_id, sender_id, receiver_id, text, media_url, created_at
                     FROM messages WHERE id = ?1",
                    [id.to_string()],
                    map_message,
                )
                .optional()?;
            Ok(row)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1");
    let row = conn.query_row(&sql, [value], map_user).optional()?;
    Ok(row)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    let last_login: Option<String> = row.get(10)?;
    Ok(UserRow {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        display_name: row.get(4)?,
        avatar_url: row.get(5)?,
        is_private: row.get(6)?,
        is_verified: row.get(7)?,
        is_active: row.get(8)?,
        created_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        last_login_at: last_login.as_deref().map(|raw| parse_ts(10, raw)).transpose()?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        conversation_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        sender_id: parse_uuid(2, &row.get::<_, String>(2)?)?,
        receiver_id: parse_uuid(3, &row.get::<_, String>(3)?)?,
        text: row.get(4)?,
        media_url: row.get(5)?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
    })
}
