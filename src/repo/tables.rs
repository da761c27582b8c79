use crate::db::models::DiningTable;
use crate::db::pool::ConnectionPool;
use crate::error::{BistroError, Result};

#[derive(Clone)]
pub struct TablesRepo {
    pool: ConnectionPool,
}

impl TablesRepo {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<DiningTable>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as("SELECT * FROM tables ORDER BY table_id")
            .fetch_all(&mut *conn)
            .await?)
    }

    pub async fn get(&self, table_id: i64) -> Result<DiningTable> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_as("SELECT * FROM tables WHERE table_id = ?")
            .bind(table_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| BistroError::NotFound(format!("no table {table_id}")))
    }

    pub async fn get_capacity(&self, table_id: i64) -> Result<i64> {
        Ok(self.get(table_id).await?.capacity)
    }

    /// Capacities of every physical table, for feasibility checks.
    pub async fn capacities(&self) -> Result<Vec<i64>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT capacity FROM tables")
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    /// Free tables, smallest first: the order the seating scan wants.
    pub async fn available(&self) -> Result<Vec<DiningTable>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT * FROM tables WHERE status = 'AVAILABLE' ORDER BY capacity, table_id",
        )
        .fetch_all(&mut *conn)
        .await?)
    }

    pub async fn add(&self, table_id: i64, capacity: i64) -> Result<DiningTable> {
        if table_id <= 0 || capacity <= 0 {
            return Err(BistroError::Validation(
                "table id and capacity must be positive".into(),
            ));
        }
        let mut conn = self.pool.acquire().await?;
        let inserted = sqlx::query_as(
            "INSERT INTO tables (table_id, capacity, status) VALUES (?, ?, 'AVAILABLE') RETURNING *",
        )
        .bind(table_id)
        .bind(capacity)
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(table) => Ok(table),
            Err(e) if is_unique_violation(&e) => Err(BistroError::Conflict(format!(
                "table {table_id} already exists"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a table, allowed only while it is free.
    pub async fn delete_safely(&self, table_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM tables WHERE table_id = ? AND status = 'AVAILABLE'")
            .bind(table_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT table_id FROM tables WHERE table_id = ?")
            .bind(table_id)
            .fetch_optional(&mut *conn)
            .await?;
        match exists {
            Some(_) => Err(BistroError::WrongState(format!(
                "table {table_id} is occupied"
            ))),
            None => Err(BistroError::NotFound(format!("no table {table_id}"))),
        }
    }

    /// Change capacity, allowed only while the table is free.
    pub async fn update_capacity(&self, table_id: i64, capacity: i64) -> Result<DiningTable> {
        if capacity <= 0 {
            return Err(BistroError::Validation("capacity must be positive".into()));
        }
        let mut conn = self.pool.acquire().await?;
        let updated: Option<DiningTable> = sqlx::query_as(
            "UPDATE tables SET capacity = ? WHERE table_id = ? AND status = 'AVAILABLE' RETURNING *",
        )
        .bind(capacity)
        .bind(table_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(table) = updated {
            return Ok(table);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT table_id FROM tables WHERE table_id = ?")
            .bind(table_id)
            .fetch_optional(&mut *conn)
            .await?;
        match exists {
            Some(_) => Err(BistroError::WrongState(format!(
                "table {table_id} is occupied"
            ))),
            None => Err(BistroError::NotFound(format!("no table {table_id}"))),
        }
    }

}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TableStatus;
    use crate::db::Database;

    async fn setup() -> (TablesRepo, Database) {
        let db = Database::test_db().await;
        (TablesRepo::new(db.pool.clone()), db)
    }

    /// Production code flips table status inside the order operations; tests
    /// seed it directly.
    async fn set_status(db: &Database, table_id: i64, status: &str) {
        let mut conn = db.pool.acquire().await.unwrap();
        sqlx::query("UPDATE tables SET status = ? WHERE table_id = ?")
            .bind(status)
            .bind(table_id)
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_and_list() {
        let (repo, _db) = setup().await;
        repo.add(2, 4).await.unwrap();
        repo.add(1, 2).await.unwrap();

        let tables = repo.list().await.unwrap();
        assert_eq!(
            tables.iter().map(|t| t.table_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(tables.iter().all(|t| t.status == TableStatus::Available));
    }

    #[tokio::test]
    async fn add_duplicate_id_is_a_conflict() {
        let (repo, _db) = setup().await;
        repo.add(1, 2).await.unwrap();
        assert!(matches!(
            repo.add(1, 6).await.unwrap_err(),
            BistroError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn add_rejects_non_positive_values() {
        let (repo, _db) = setup().await;
        assert!(matches!(
            repo.add(0, 4).await.unwrap_err(),
            BistroError::Validation(_)
        ));
        assert!(matches!(
            repo.add(3, 0).await.unwrap_err(),
            BistroError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn occupied_tables_refuse_mutation() {
        let (repo, db) = setup().await;
        repo.add(1, 4).await.unwrap();
        set_status(&db, 1, "OCCUPIED").await;

        assert!(matches!(
            repo.delete_safely(1).await.unwrap_err(),
            BistroError::WrongState(_)
        ));
        assert!(matches!(
            repo.update_capacity(1, 8).await.unwrap_err(),
            BistroError::WrongState(_)
        ));

        set_status(&db, 1, "AVAILABLE").await;
        repo.update_capacity(1, 8).await.unwrap();
        assert_eq!(repo.get_capacity(1).await.unwrap(), 8);
        repo.delete_safely(1).await.unwrap();
        assert!(matches!(
            repo.get(1).await.unwrap_err(),
            BistroError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let (repo, _db) = setup().await;
        assert!(matches!(
            repo.delete_safely(9).await.unwrap_err(),
            BistroError::NotFound(_)
        ));
        assert!(matches!(
            repo.update_capacity(9, 4).await.unwrap_err(),
            BistroError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn available_is_sorted_by_capacity() {
        let (repo, db) = setup().await;
        repo.add(10, 6).await.unwrap();
        repo.add(11, 2).await.unwrap();
        repo.add(12, 4).await.unwrap();
        set_status(&db, 12, "OCCUPIED").await;

        let free = repo.available().await.unwrap();
        assert_eq!(free.iter().map(|t| t.table_id).collect::<Vec<_>>(), vec![11, 10]);
    }
}
