//! Isolated test database helpers.
//!
//! Each harness run creates a temporary database via CREATE DATABASE, runs
//! the foodmesh migrations into it, and drops it on cleanup. Used by the
//! `#[ignore]`d Postgres-backed tests.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;

/// Holds the test database pool, name, and admin connection for cleanup.
pub struct IsolatedDb {
    /// Pool connected to the isolated test database.
    pub pool: PgPool,
    /// Name of the temporary database.
    pub dbname: String,
    admin: PgPool,
}

/// Create an isolated test database, run the migrations, and return
/// handles.
///
/// `admin_url` should point to a database that allows CREATE/DROP DATABASE
/// (typically `postgresql:///postgres`).
pub async fn isolated_db(admin_url: &str) -> IsolatedDb {
    let dbname = format!("foodmesh_test_{}", uuid::Uuid::new_v4().simple());

    let admin_opts = PgConnectOptions::from_str(admin_url).expect("admin_url parse failed");
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_opts)
        .await
        .expect("admin connect failed");

    sqlx::query(&format!(r#"CREATE DATABASE "{dbname}""#))
        .execute(&admin)
        .await
        .expect("CREATE DATABASE failed");

    let test_opts = PgConnectOptions::from_str(admin_url)
        .expect("admin_url parse failed")
        .database(&dbname);
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(test_opts)
        .await
        .expect("test database connect failed");

    for (name, sql) in foodmesh_postgres::MIGRATIONS {
        sqlx::raw_sql(sql)
            .execute(&pool)
            .await
            .unwrap_or_else(|e| panic!("migration {name} failed: {e}"));
    }

    IsolatedDb {
        pool,
        dbname,
        admin,
    }
}

impl IsolatedDb {
    /// Drop the temporary database. Call at the end of a test; remaining
    /// connections are force-terminated first.
    pub async fn cleanup(self) {
        self.pool.close().await;
        let _ = sqlx::query(&format!(
            r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#,
            self.dbname
        ))
        .execute(&self.admin)
        .await;
        self.admin.close().await;
    }
}
