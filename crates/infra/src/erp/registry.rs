//! ERP readers by company alias.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::runtime::Runtime;
use tracing::info;

use super::{ErpError, ErpReader, ErpResult, PgErpReader, RetryingErpReader};
use crate::config::ErpConfig;

pub type SharedErpReader = Arc<dyn ErpReader>;

/// Registry initialized at startup; looked up at job start.
#[derive(Default)]
pub struct ErpRegistry {
    readers: RwLock<HashMap<String, SharedErpReader>>,
}

impl std::fmt::Debug for ErpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErpRegistry")
            .field("aliases", &self.aliases())
            .finish()
    }
}

impl ErpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One retrying Postgres reader per configured connection.
    pub fn from_config(config: &ErpConfig, runtime: Arc<Runtime>) -> ErpResult<Self> {
        let registry = Self::new();
        for (alias, connection) in &config.connections {
            let reader = PgErpReader::connect(
                runtime.clone(),
                connection,
                config.read_timeout(),
            )?;
            registry.register(
                alias,
                RetryingErpReader::new(reader, config.retry.policy(), alias.clone()),
            );
            info!(erp = %alias, schema = %connection.schema, "erp reader registered");
        }
        Ok(registry)
    }

    pub fn register(&self, alias: &str, reader: impl ErpReader + 'static) {
        self.register_shared(alias, Arc::new(reader));
    }

    pub fn register_shared(&self, alias: &str, reader: SharedErpReader) {
        if let Ok(mut readers) = self.readers.write() {
            readers.insert(alias.trim().to_string(), reader);
        }
    }

    /// Reader of `alias`; an unknown alias is a configuration error.
    pub fn get(&self, alias: &str) -> ErpResult<SharedErpReader> {
        let readers = self
            .readers
            .read()
            .map_err(|_| ErpError::Config("erp registry poisoned".into()))?;
        readers
            .get(alias.trim())
            .cloned()
            .ok_or_else(|| ErpError::Config(format!("no erp connection configured for '{alias}'")))
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .readers
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        aliases.sort();
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::InMemoryErpReader;

    #[test]
    fn lookup_by_alias() {
        let registry = ErpRegistry::new();
        registry.register("acme", InMemoryErpReader::new());

        assert!(registry.get("acme").is_ok());
        assert!(registry.get(" acme ").is_ok());
        assert!(matches!(registry.get("globex"), Err(ErpError::Config(_))));
        assert_eq!(registry.aliases(), vec!["acme".to_string()]);
    }
}
