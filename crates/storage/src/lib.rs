use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{random_slug, slugify, GroupId, MembershipId, MessageId, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub group_id: GroupId,
    pub slug: String,
    pub display_name: Option<String>,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub membership_id: MembershipId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: Role,
    pub nickname: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub email: String,
    pub role: Role,
    pub nickname: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub url: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub is_image: bool,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub attachment: Option<StoredAttachment>,
    pub created_at: DateTime<Utc>,
}

/// A group row annotated with its latest message, for the group-list view.
#[derive(Debug, Clone)]
pub struct GroupWithLastMessage {
    pub group: GroupRow,
    pub last_message_content: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender: Option<String>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_groups (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                slug         TEXT NOT NULL UNIQUE,
                display_name TEXT,
                is_private   INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure chat_groups table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memberships (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id     INTEGER NOT NULL REFERENCES chat_groups(id),
                user_id      INTEGER NOT NULL REFERENCES users(id),
                role         TEXT NOT NULL DEFAULT 'member',
                nickname     TEXT,
                last_read_at TEXT,
                UNIQUE(group_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure memberships table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id      INTEGER NOT NULL REFERENCES chat_groups(id),
                author_id     INTEGER NOT NULL REFERENCES users(id),
                body          TEXT,
                file_url      TEXT,
                file_name     TEXT,
                file_mime     TEXT,
                file_is_image INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_group_created
             ON messages (group_id, created_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages index exists")?;

        Ok(())
    }

    pub async fn create_user(&self, email: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (email) VALUES (?)
             ON CONFLICT(email) DO UPDATE SET email=excluded.email
             RETURNING id",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
        }))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
        }))
    }

    /// Creates a public group. The slug is derived from the display name when
    /// one is given, otherwise a random token. The UNIQUE constraint on the
    /// slug column is the authority for collision handling: a violation means
    /// retry with the next numeric suffix, so concurrent creations with the
    /// same name cannot race past a read-then-write check.
    pub async fn create_public_group(&self, display_name: Option<&str>) -> Result<GroupRow> {
        let base_slug = match display_name {
            Some(name) if !slugify(name).is_empty() => slugify(name),
            _ => random_slug("public-group"),
        };

        let mut suffix = 0u32;
        loop {
            let candidate = if suffix == 0 {
                base_slug.clone()
            } else {
                format!("{base_slug}-{suffix}")
            };
            match self
                .try_insert_group(&candidate, display_name, false)
                .await?
            {
                Some(group) => return Ok(group),
                None => suffix += 1,
            }
        }
    }

    /// Inserts a group row, returning `None` when the slug is already taken.
    async fn try_insert_group(
        &self,
        slug: &str,
        display_name: Option<&str>,
        is_private: bool,
    ) -> Result<Option<GroupRow>> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO chat_groups (slug, display_name, is_private, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(slug)
        .bind(display_name)
        .bind(is_private)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(rec) => Ok(Some(GroupRow {
                group_id: GroupId(rec.get::<i64, _>(0)),
                slug: slug.to_string(),
                display_name: display_name.map(str::to_string),
                is_private,
                created_at,
            })),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Creates a private group with one `member` membership per user, all in
    /// one transaction. Callers pass a deduplicated member id list; exact-set
    /// reuse is checked first via `find_private_group_by_members`.
    pub async fn create_private_group(&self, member_ids: &[UserId]) -> Result<GroupRow> {
        let slug = random_slug("private-group");
        let created_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO chat_groups (slug, display_name, is_private, created_at)
             VALUES (?, NULL, 1, ?)
             RETURNING id",
        )
        .bind(&slug)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let group_id = GroupId(rec.get::<i64, _>(0));

        for user_id in member_ids {
            sqlx::query(
                "INSERT INTO memberships (group_id, user_id, role, last_read_at)
                 VALUES (?, ?, 'member', ?)",
            )
            .bind(group_id.0)
            .bind(user_id.0)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(GroupRow {
            group_id,
            slug,
            display_name: None,
            is_private: true,
            created_at,
        })
    }

    /// Finds an existing private group whose member set matches `member_ids`
    /// exactly. Candidates are narrowed to the first member's private groups,
    /// then each candidate's full member set is compared.
    pub async fn find_private_group_by_members(
        &self,
        member_ids: &[UserId],
    ) -> Result<Option<GroupRow>> {
        let Some(first) = member_ids.first() else {
            return Ok(None);
        };

        let candidates = sqlx::query(
            "SELECT g.id, g.slug, g.display_name, g.is_private, g.created_at
             FROM chat_groups g
             INNER JOIN memberships m ON m.group_id = g.id
             WHERE g.is_private = 1 AND m.user_id = ?",
        )
        .bind(first.0)
        .fetch_all(&self.pool)
        .await?;

        let mut wanted: Vec<i64> = member_ids.iter().map(|id| id.0).collect();
        wanted.sort_unstable();

        for row in candidates {
            let group_id = row.get::<i64, _>(0);
            let mut members: Vec<i64> =
                sqlx::query_scalar("SELECT user_id FROM memberships WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_all(&self.pool)
                    .await?;
            members.sort_unstable();
            if members == wanted {
                return Ok(Some(group_row_from(&row)));
            }
        }
        Ok(None)
    }

    pub async fn group_by_slug(&self, slug: &str) -> Result<Option<GroupRow>> {
        let row = sqlx::query(
            "SELECT id, slug, display_name, is_private, created_at
             FROM chat_groups WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| group_row_from(&r)))
    }

    pub async fn update_group(
        &self,
        group_id: GroupId,
        display_name: Option<&str>,
        is_private: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chat_groups
             SET display_name = COALESCE(?, display_name),
                 is_private = COALESCE(?, is_private)
             WHERE id = ?",
        )
        .bind(display_name)
        .bind(is_private)
        .bind(group_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts a membership, returning `None` when the (group, user) pair
    /// already exists. The UNIQUE constraint enforces the invariant; a second
    /// join is rejected, not upgraded.
    pub async fn insert_membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: Role,
    ) -> Result<Option<MembershipRow>> {
        let last_read_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO memberships (group_id, user_id, role, last_read_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(last_read_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(rec) => Ok(Some(MembershipRow {
                membership_id: MembershipId(rec.get::<i64, _>(0)),
                group_id,
                user_id,
                role,
                nickname: None,
                last_read_at: Some(last_read_at),
            })),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Option<MembershipRow>> {
        let row = sqlx::query(
            "SELECT id, group_id, user_id, role, nickname, last_read_at
             FROM memberships WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| membership_row_from(&r)))
    }

    /// Fetch-or-create used by fan-out payload enrichment only; the join
    /// endpoint goes through `insert_membership` so duplicates still conflict.
    pub async fn membership_or_insert(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<MembershipRow> {
        if let Some(existing) = self.membership(group_id, user_id).await? {
            return Ok(existing);
        }
        match self.insert_membership(group_id, user_id, Role::Member).await? {
            Some(created) => Ok(created),
            // Lost a race with a concurrent insert; the row exists now.
            None => self
                .membership(group_id, user_id)
                .await?
                .context("membership vanished after conflicting insert"),
        }
    }

    pub async fn update_nickname(
        &self,
        group_id: GroupId,
        user_id: UserId,
        nickname: Option<&str>,
    ) -> Result<Option<MembershipRow>> {
        sqlx::query(
            "UPDATE memberships SET nickname = COALESCE(?, nickname)
             WHERE group_id = ? AND user_id = ?",
        )
        .bind(nickname)
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        self.membership(group_id, user_id).await
    }

    pub async fn mark_read(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE memberships SET last_read_at = ?
             WHERE group_id = ? AND user_id = ?",
        )
        .bind(Utc::now())
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM memberships WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_members(&self, group_id: GroupId) -> Result<Vec<MemberRow>> {
        let rows = sqlx::query(
            "SELECT u.email, m.role, m.nickname, m.last_read_at
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?
             ORDER BY lower(u.email) ASC",
        )
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| MemberRow {
                email: r.get::<String, _>(0),
                role: Role::from_str_or_member(&r.get::<String, _>(1)),
                nickname: r.get::<Option<String>, _>(2),
                last_read_at: r.get::<Option<DateTime<Utc>>, _>(3),
            })
            .collect())
    }

    pub async fn insert_message(
        &self,
        group_id: GroupId,
        author_id: UserId,
        body: Option<&str>,
        attachment: Option<&StoredAttachment>,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (group_id, author_id, body, file_url, file_name, file_mime, file_is_image, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(group_id.0)
        .bind(author_id.0)
        .bind(body)
        .bind(attachment.map(|a| a.url.as_str()))
        .bind(attachment.map(|a| a.filename.as_str()))
        .bind(attachment.and_then(|a| a.mime_type.as_deref()))
        .bind(attachment.map(|a| a.is_image).unwrap_or(false))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            group_id,
            author_id,
            body: body.map(str::to_string),
            attachment: attachment.cloned(),
            created_at,
        })
    }

    /// Newest-first page of a group's messages. `before` names the last row
    /// of the previous page; the next page resumes strictly after it in
    /// display order, keyed on (created_at, id) so racing appends whose
    /// timestamps commit out of id order cannot skip or repeat a row at a
    /// page boundary. `body_filter` is a case-insensitive substring match on
    /// the text body.
    pub async fn list_messages(
        &self,
        group_id: GroupId,
        limit: u32,
        before: Option<MessageId>,
        body_filter: Option<&str>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, group_id, author_id, body, file_url, file_name, file_mime, file_is_image, created_at
             FROM messages
             WHERE group_id = ?1
               AND (?2 IS NULL OR (created_at, id) <
                    (SELECT c.created_at, c.id FROM messages c WHERE c.id = ?2))
               AND (?3 IS NULL OR body LIKE '%' || ?3 || '%')
             ORDER BY created_at DESC, id DESC
             LIMIT ?4",
        )
        .bind(group_id.0)
        .bind(before.map(|id| id.0))
        .bind(body_filter)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_row_from).collect())
    }

    /// Groups the user belongs to, annotated with the latest message, ordered
    /// by last activity. `search` matches the display name or a member email.
    pub async fn list_groups_for_user(
        &self,
        user_id: UserId,
        search: Option<&str>,
    ) -> Result<Vec<GroupWithLastMessage>> {
        let rows = sqlx::query(
            "SELECT g.id, g.slug, g.display_name, g.is_private, g.created_at,
                    (SELECT CASE WHEN lm.body IS NOT NULL THEN lm.body ELSE 'Attachment sent' END
                     FROM messages lm WHERE lm.group_id = g.id
                     ORDER BY lm.created_at DESC, lm.id DESC LIMIT 1),
                    (SELECT lm.created_at
                     FROM messages lm WHERE lm.group_id = g.id
                     ORDER BY lm.created_at DESC, lm.id DESC LIMIT 1),
                    (SELECT lu.email
                     FROM messages lm INNER JOIN users lu ON lu.id = lm.author_id
                     WHERE lm.group_id = g.id
                     ORDER BY lm.created_at DESC, lm.id DESC LIMIT 1)
             FROM chat_groups g
             INNER JOIN memberships m ON m.group_id = g.id
             WHERE m.user_id = ?1
               AND (?2 IS NULL
                    OR g.display_name LIKE '%' || ?2 || '%'
                    OR EXISTS (
                        SELECT 1 FROM memberships sm
                        INNER JOIN users su ON su.id = sm.user_id
                        WHERE sm.group_id = g.id AND su.email LIKE '%' || ?2 || '%'
                    ))
             ORDER BY 7 DESC",
        )
        .bind(user_id.0)
        .bind(search)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| GroupWithLastMessage {
                group: group_row_from(&r),
                last_message_content: r.get::<Option<String>, _>(5),
                last_message_time: r.get::<Option<DateTime<Utc>>, _>(6),
                last_message_sender: r.get::<Option<String>, _>(7),
            })
            .collect())
    }
}

fn group_row_from(row: &sqlx::sqlite::SqliteRow) -> GroupRow {
    GroupRow {
        group_id: GroupId(row.get::<i64, _>(0)),
        slug: row.get::<String, _>(1),
        display_name: row.get::<Option<String>, _>(2),
        is_private: row.get::<bool, _>(3),
        created_at: row.get::<DateTime<Utc>, _>(4),
    }
}

fn membership_row_from(row: &sqlx::sqlite::SqliteRow) -> MembershipRow {
    MembershipRow {
        membership_id: MembershipId(row.get::<i64, _>(0)),
        group_id: GroupId(row.get::<i64, _>(1)),
        user_id: UserId(row.get::<i64, _>(2)),
        role: Role::from_str_or_member(&row.get::<String, _>(3)),
        nickname: row.get::<Option<String>, _>(4),
        last_read_at: row.get::<Option<DateTime<Utc>>, _>(5),
    }
}

fn message_row_from(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    let attachment = row
        .get::<Option<String>, _>(4)
        .map(|url| StoredAttachment {
            url,
            filename: row
                .get::<Option<String>, _>(5)
                .unwrap_or_else(|| "attachment".to_string()),
            mime_type: row.get::<Option<String>, _>(6),
            is_image: row.get::<bool, _>(7),
        });
    StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        group_id: GroupId(row.get::<i64, _>(1)),
        author_id: UserId(row.get::<i64, _>(2)),
        body: row.get::<Option<String>, _>(3),
        attachment,
        created_at: row.get::<DateTime<Utc>, _>(8),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().map(|dbe| dbe.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
