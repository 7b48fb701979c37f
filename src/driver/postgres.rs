//! PostgreSQL driver (feature `driver-postgres`), one `sqlx` connection per
//! session. The store name is used as the database name.
use crate::driver::{ConnectOptions, Driver, DriverError, Session};
use crate::store::StoreConfig;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};

#[derive(Clone, Debug)]
pub struct PostgresDriver {
    user: String,
    password: Option<String>,
    application_name: String,
}

impl PostgresDriver {
    pub fn new(opts: ConnectOptions) -> Self {
        Self {
            user: opts.get("user").unwrap_or("postgres").to_string(),
            password: opts.get("password").map(str::to_string),
            application_name: opts
                .get("application_name")
                .unwrap_or("store-load")
                .to_string(),
        }
    }

    fn options_for(&self, store: &StoreConfig) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&store.ip)
            .port(store.port)
            .database(&store.store_name)
            .username(&self.user)
            .application_name(&self.application_name);
        if let Some(pw) = &self.password {
            options = options.password(pw);
        }
        options
    }
}

#[async_trait::async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self, store: &StoreConfig) -> Result<Box<dyn Session>, DriverError> {
        let conn = PgConnection::connect_with(&self.options_for(store))
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;
        Ok(Box::new(PostgresSession { conn }))
    }
}

struct PostgresSession {
    conn: PgConnection,
}

fn map_execute_error(e: sqlx::Error) -> DriverError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            DriverError::Disconnected
        }
        sqlx::Error::PoolTimedOut => DriverError::Timeout,
        other => DriverError::Execute(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Session for PostgresSession {
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let rows = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(map_execute_error)?;
        Ok(rows.len() as u64)
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.conn
            .close()
            .await
            .map_err(|e| DriverError::Other(e.to_string()))
    }
}
