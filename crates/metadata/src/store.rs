//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{BranchRow, RepoFileCountRow, RepoInfoRow, RepoRow, RepoSizeRow, VirtualRepoRow};
use crate::repos::{BranchRepo, RegistryRepo, SizeRepo, VirtualRepoRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    BranchRepo + RegistryRepo + SizeRepo + VirtualRepoRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS repos (
        repo_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 1,
        status INTEGER NOT NULL DEFAULT 0,
        is_encrypted INTEGER NOT NULL DEFAULT 0,
        enc_version INTEGER NOT NULL DEFAULT 0,
        magic TEXT,
        random_key TEXT,
        salt TEXT
    )",
    "CREATE TABLE IF NOT EXISTS branches (
        repo_id TEXT NOT NULL,
        name TEXT NOT NULL,
        commit_id TEXT NOT NULL,
        PRIMARY KEY (repo_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS repo_info (
        repo_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        update_time INTEGER NOT NULL,
        version INTEGER NOT NULL,
        is_encrypted INTEGER NOT NULL,
        last_modifier TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS repo_size (
        repo_id TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        head_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS repo_file_count (
        repo_id TEXT PRIMARY KEY,
        file_count INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS virtual_repos (
        repo_id TEXT PRIMARY KEY,
        origin_repo TEXT NOT NULL,
        path TEXT NOT NULL,
        base_commit TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_virtual_repos_origin ON virtual_repos (origin_repo)",
];

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures and makes the
            // select-then-update branch CAS serializable.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BranchRepo for SqliteStore {
    async fn get_branch(&self, repo_id: &str, name: &str) -> MetadataResult<Option<BranchRow>> {
        let row = sqlx::query_as::<_, BranchRow>(
            "SELECT repo_id, name, commit_id FROM branches WHERE repo_id = ? AND name = ?",
        )
        .bind(repo_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_branch(&self, branch: &BranchRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO branches (repo_id, name, commit_id) VALUES (?, ?, ?)
             ON CONFLICT (repo_id, name) DO UPDATE SET commit_id = excluded.commit_id",
        )
        .bind(&branch.repo_id)
        .bind(&branch.name)
        .bind(&branch.commit_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_branch_cas(
        &self,
        repo_id: &str,
        name: &str,
        new_commit_id: &str,
        old_commit_id: &str,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query("SELECT commit_id FROM branches WHERE repo_id = ? AND name = ?")
                .bind(repo_id)
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get(0));

        if current.as_deref() != Some(old_commit_id) {
            tx.rollback().await?;
            return Err(MetadataError::StaleHead {
                repo_id: repo_id.to_string(),
                expected: old_commit_id.to_string(),
            });
        }

        sqlx::query("UPDATE branches SET commit_id = ? WHERE repo_id = ? AND name = ?")
            .bind(new_commit_id)
            .bind(repo_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryRepo for SqliteStore {
    async fn get_repo(&self, repo_id: &str) -> MetadataResult<Option<RepoRow>> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT repo_id, name, description, version, status, is_encrypted, enc_version,
                    magic, random_key, salt
             FROM repos WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_repo(&self, repo: &RepoRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO repos (repo_id, name, description, version, status, is_encrypted,
                                enc_version, magic, random_key, salt)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&repo.repo_id)
        .bind(&repo.name)
        .bind(&repo.desc)
        .bind(repo.version)
        .bind(repo.status)
        .bind(repo.is_encrypted)
        .bind(repo.enc_version)
        .bind(&repo.magic)
        .bind(&repo.random_key)
        .bind(&repo.salt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_repo_name_desc(
        &self,
        repo_id: &str,
        name: &str,
        desc: &str,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET name = ?, description = ? WHERE repo_id = ?")
            .bind(name)
            .bind(desc)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_repo_info(&self, info: &RepoInfoRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO repo_info (repo_id, name, update_time, version, is_encrypted, last_modifier)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (repo_id) DO UPDATE SET
                 name = excluded.name,
                 update_time = excluded.update_time,
                 version = excluded.version,
                 is_encrypted = excluded.is_encrypted,
                 last_modifier = excluded.last_modifier",
        )
        .bind(&info.repo_id)
        .bind(&info.name)
        .bind(info.update_time)
        .bind(info.version)
        .bind(info.is_encrypted)
        .bind(&info.last_modifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_repo_info(&self, repo_id: &str) -> MetadataResult<Option<RepoInfoRow>> {
        let row = sqlx::query_as::<_, RepoInfoRow>(
            "SELECT repo_id, name, update_time, version, is_encrypted, last_modifier
             FROM repo_info WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl SizeRepo for SqliteStore {
    async fn get_repo_size(&self, repo_id: &str) -> MetadataResult<Option<RepoSizeRow>> {
        let row = sqlx::query_as::<_, RepoSizeRow>(
            "SELECT repo_id, size, head_id FROM repo_size WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_repo_file_count(
        &self,
        repo_id: &str,
    ) -> MetadataResult<Option<RepoFileCountRow>> {
        let row = sqlx::query_as::<_, RepoFileCountRow>(
            "SELECT repo_id, file_count FROM repo_file_count WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_size_and_file_count(
        &self,
        repo_id: &str,
        head_id: &str,
        size: i64,
        file_count: i64,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO repo_size (repo_id, size, head_id) VALUES (?, ?, ?)
             ON CONFLICT (repo_id) DO UPDATE SET size = excluded.size, head_id = excluded.head_id",
        )
        .bind(repo_id)
        .bind(size)
        .bind(head_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO repo_file_count (repo_id, file_count) VALUES (?, ?)
             ON CONFLICT (repo_id) DO UPDATE SET file_count = excluded.file_count",
        )
        .bind(repo_id)
        .bind(file_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl VirtualRepoRepo for SqliteStore {
    async fn get_virtual_info(&self, repo_id: &str) -> MetadataResult<Option<VirtualRepoRow>> {
        let row = sqlx::query_as::<_, VirtualRepoRow>(
            "SELECT repo_id, origin_repo, path, base_commit FROM virtual_repos WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_virtual_info_by_origin(
        &self,
        origin_repo: &str,
    ) -> MetadataResult<Vec<VirtualRepoRow>> {
        let rows = sqlx::query_as::<_, VirtualRepoRow>(
            "SELECT repo_id, origin_repo, path, base_commit FROM virtual_repos
             WHERE origin_repo = ?",
        )
        .bind(origin_repo)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_virtual_repo(&self, row: &VirtualRepoRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO virtual_repos (repo_id, origin_repo, path, base_commit)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&row.repo_id)
        .bind(&row.origin_repo)
        .bind(&row.path)
        .bind(&row.base_commit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_virtual_repo_base_commit_path(
        &self,
        repo_id: &str,
        base_commit: &str,
        path: &str,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE virtual_repos SET base_commit = ?, path = ? WHERE repo_id = ?")
            .bind(base_commit)
            .bind(path)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn del_virtual_repo(&self, repo_id: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM virtual_repos WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db")).await.unwrap();
        (dir, store)
    }

    fn branch(commit: &str) -> BranchRow {
        BranchRow {
            repo_id: "r1".to_string(),
            name: "master".to_string(),
            commit_id: commit.to_string(),
        }
    }

    #[tokio::test]
    async fn branch_cas_advances_from_observed_head() {
        let (_dir, store) = store().await;
        store.set_branch(&branch("c0")).await.unwrap();

        store.update_branch_cas("r1", "master", "c1", "c0").await.unwrap();
        let head = store.get_branch("r1", "master").await.unwrap().unwrap();
        assert_eq!(head.commit_id, "c1");
    }

    #[tokio::test]
    async fn branch_cas_rejects_stale_head() {
        let (_dir, store) = store().await;
        store.set_branch(&branch("c0")).await.unwrap();
        store.update_branch_cas("r1", "master", "c1", "c0").await.unwrap();

        let err = store
            .update_branch_cas("r1", "master", "c2", "c0")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::StaleHead { .. }));
        // Pointer is untouched.
        let head = store.get_branch("r1", "master").await.unwrap().unwrap();
        assert_eq!(head.commit_id, "c1");
    }

    #[tokio::test]
    async fn size_and_file_count_upsert_together() {
        let (_dir, store) = store().await;

        store.set_size_and_file_count("r1", "h1", 100, 3).await.unwrap();
        store.set_size_and_file_count("r1", "h2", 250, 5).await.unwrap();

        let size = store.get_repo_size("r1").await.unwrap().unwrap();
        assert_eq!((size.size, size.head_id.as_str()), (250, "h2"));
        let count = store.get_repo_file_count("r1").await.unwrap().unwrap();
        assert_eq!(count.file_count, 5);
    }

    #[tokio::test]
    async fn virtual_repo_lifecycle() {
        let (_dir, store) = store().await;
        let row = VirtualRepoRow {
            repo_id: "v1".to_string(),
            origin_repo: "o1".to_string(),
            path: "/src".to_string(),
            base_commit: "b0".to_string(),
        };
        store.create_virtual_repo(&row).await.unwrap();

        let by_origin = store.get_virtual_info_by_origin("o1").await.unwrap();
        assert_eq!(by_origin.len(), 1);

        store
            .set_virtual_repo_base_commit_path("v1", "b1", "/source")
            .await
            .unwrap();
        let info = store.get_virtual_info("v1").await.unwrap().unwrap();
        assert_eq!((info.path.as_str(), info.base_commit.as_str()), ("/source", "b1"));

        store.del_virtual_repo("v1").await.unwrap();
        assert!(store.get_virtual_info("v1").await.unwrap().is_none());
    }
}
