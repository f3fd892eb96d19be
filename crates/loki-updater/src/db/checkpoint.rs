//! Nested transactional checkpoints
//!
//! A [`Checkpoint`] is a rollback boundary. The outermost one is a real
//! SQLite transaction; [`Checkpoint::nested`] opens a savepoint inside it.
//! Releasing a nested checkpoint folds its writes into the parent, rolling
//! it back discards only its own writes. Dropping a checkpoint without
//! releasing it rolls it back.

use crate::error::Result;
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

pub struct Checkpoint<'c> {
    tx: Transaction<'c, Sqlite>,
    label: String,
    depth: usize,
}

impl Checkpoint<'static> {
    /// Outer checkpoint on a pooled connection
    pub async fn begin(pool: &SqlitePool, label: &str) -> Result<Self> {
        let tx = pool.begin().await?;
        debug!(checkpoint = label, depth = 0, "checkpoint opened");
        Ok(Self {
            tx,
            label: label.to_string(),
            depth: 0,
        })
    }
}

impl<'c> Checkpoint<'c> {
    /// Outer checkpoint on a connection the caller already holds
    pub async fn on(conn: &'c mut SqliteConnection, label: &str) -> Result<Self> {
        let tx = Connection::begin(conn).await?;
        debug!(checkpoint = label, depth = 0, "checkpoint opened");
        Ok(Self {
            tx,
            label: label.to_string(),
            depth: 0,
        })
    }

    /// Savepoint scoped inside this checkpoint
    pub async fn nested(&mut self, label: &str) -> Result<Checkpoint<'_>> {
        let depth = self.depth + 1;
        let tx = Connection::begin(&mut *self.tx).await?;
        debug!(checkpoint = label, depth, "nested checkpoint opened");
        Ok(Checkpoint {
            tx,
            label: label.to_string(),
            depth,
        })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Keep this checkpoint's writes (commit, or release the savepoint)
    pub async fn release(self) -> Result<()> {
        debug!(checkpoint = %self.label, depth = self.depth, "checkpoint released");
        self.tx.commit().await?;
        Ok(())
    }

    /// Discard this checkpoint's writes
    pub async fn rollback(self) -> Result<()> {
        debug!(checkpoint = %self.label, depth = self.depth, "checkpoint rolled back");
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn values(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query("SELECT v FROM t ORDER BY v")
            .fetch_all(pool)
            .await
            .unwrap()
            .iter()
            .map(|r| r.get::<i64, _>("v"))
            .collect()
    }

    async fn insert(conn: &mut SqliteConnection, v: i64) {
        sqlx::query("INSERT INTO t (v) VALUES (?)")
            .bind(v)
            .execute(conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nested_rollback_keeps_siblings() {
        let pool = pool().await;
        let mut outer = Checkpoint::begin(&pool, "run").await.unwrap();
        insert(outer.conn(), 1).await;

        let mut ok = outer.nested("a").await.unwrap();
        assert_eq!(ok.depth(), 1);
        insert(ok.conn(), 2).await;
        ok.release().await.unwrap();

        let mut failed = outer.nested("b").await.unwrap();
        insert(failed.conn(), 3).await;
        failed.rollback().await.unwrap();

        let mut ok = outer.nested("c").await.unwrap();
        insert(ok.conn(), 4).await;
        ok.release().await.unwrap();

        outer.release().await.unwrap();
        assert_eq!(values(&pool).await, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_outer_rollback_discards_released_children() {
        let pool = pool().await;
        let mut outer = Checkpoint::begin(&pool, "run").await.unwrap();
        let mut child = outer.nested("a").await.unwrap();
        insert(child.conn(), 1).await;
        child.release().await.unwrap();
        outer.rollback().await.unwrap();

        assert!(values(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_checkpoint_rolls_back() {
        let pool = pool().await;
        {
            let mut outer = Checkpoint::begin(&pool, "run").await.unwrap();
            insert(outer.conn(), 1).await;
        }
        assert!(values(&pool).await.is_empty());
    }
}
