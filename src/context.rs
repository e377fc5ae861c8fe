use anyhow::{anyhow, Result};

use crate::database::Database;

/// Shared command context. Connections are opened lazily so commands that
/// never touch the store do not require one.
#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub fn initialize(database_url: Option<String>) -> Self {
        Self { database_url }
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!("DATABASE_URL must be set for this command."));
        };
        Database::new(database_url).await
    }
}
