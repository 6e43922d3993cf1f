pub mod backend;
pub mod cli;
pub mod collection;
pub mod config;
pub mod errors;
pub mod logger;
pub mod orders;
pub mod query;
pub mod timestamp;

use crate::backend::{BackendKind, DocumentDriver, Driver, TableDriver, TableStore};
use crate::collection::Collection;
use crate::config::StoreConfig;
use crate::errors::DbError;
use crate::orders::{ORDER_INDEXES, OrderService};
use std::sync::Arc;

/// The main store handle: one driver, chosen when the store opens.
#[derive(Clone)]
pub struct Store {
    driver: Arc<dyn Driver>,
    orders_collection: String,
}

impl Store {
    /// Opens the backend named by `cfg`, persisting under `cfg.data_dir` when set.
    ///
    /// Logging is configured from `cfg.log` when a log directory is given; a logger that is already
    /// installed is left in place.
    ///
    /// # Errors
    /// Returns `DbError::Io` when the data directory cannot be created.
    pub fn open(cfg: &StoreConfig) -> Result<Self, DbError> {
        if let Some(dir) = &cfg.log.dir
            && let Err(e) = logger::configure_logging(Some(dir), Some(&cfg.log.level), Some(cfg.log.retention))
        {
            eprintln!("logging not configured: {e}");
        }
        if let Some(dir) = &cfg.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        let kind = cfg.backend_kind();
        let driver: Arc<dyn Driver> = match (kind, &cfg.data_dir) {
            (BackendKind::Document, Some(dir)) => Arc::new(DocumentDriver::persistent(dir)),
            (BackendKind::Document, None) => Arc::new(DocumentDriver::in_memory()),
            (BackendKind::Table, dir) => {
                let store = dir.as_ref().map_or_else(TableStore::in_memory, TableStore::persistent);
                Arc::new(TableDriver::new(Arc::new(store), cfg.table_prefix.as_str(), cfg.scan_page_size))
            }
        };
        log::info!("store opened: backend={kind} environment={} data_dir={:?}", cfg.environment, cfg.data_dir);
        Ok(Self { driver, orders_collection: cfg.orders_collection.clone() })
    }

    /// An in-memory document store with default settings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { driver: Arc::new(DocumentDriver::in_memory()), orders_collection: "orders".into() }
    }

    #[must_use]
    pub fn with_driver(driver: Arc<dyn Driver>) -> Self {
        Self { driver, orders_collection: "orders".into() }
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.driver.kind()
    }

    /// Collections are created implicitly on first write.
    #[must_use]
    pub fn get_collection(&self, name: &str) -> Collection {
        Collection::new(name, self.driver.clone())
    }

    #[must_use]
    pub fn orders(&self) -> OrderService {
        OrderService::new(self.get_collection(&self.orders_collection))
    }

    /// Create the indexes the orders collection relies on; returns how many are in place.
    pub fn ensure_indexes(&self) -> usize {
        let n = self.get_collection(&self.orders_collection).ensure_indexes(&ORDER_INDEXES);
        if n < ORDER_INDEXES.len() {
            log::warn!("only {n} of {} order indexes in place", ORDER_INDEXES.len());
        }
        n
    }
}
