//! Process-wide registry of connections.
//!
//! A host calls [`init`] once at startup and [`Runtime::shutdown`] once before
//! exit. Connections started through the runtime are tracked weakly, so
//! dropping every handle still tears a connection down on its own.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Shared};
use crate::engine::lua::LuaBackend;
use crate::engine::ScriptBackend;
use crate::error::StartError;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, OnceLock, Weak};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the process-wide runtime. Later calls return the same instance.
pub fn init() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "Spindle runtime initialized");
        Runtime::new()
    })
}

/// Tracks the connections of a process so they can be torn down together.
pub struct Runtime {
    inner: Mutex<Registry>,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    shut_down: bool,
    connections: Vec<Weak<Shared>>,
}

impl Runtime {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            started_at: Utc::now(),
        }
    }

    /// Start a Lua-backed connection and register it.
    pub fn start(&self, config: ConnectionConfig) -> Result<Connection, StartError> {
        let engine_config = config.clone();
        self.start_with(config, move || LuaBackend::from_config(&engine_config))
    }

    /// Start a connection over a custom backend and register it.
    pub fn start_with<B, F>(&self, config: ConnectionConfig, factory: F) -> Result<Connection, StartError>
    where
        B: ScriptBackend,
        F: FnOnce() -> B + Send + 'static,
    {
        let mut registry = self.lock();
        if registry.shut_down {
            return Err(StartError::RuntimeShutDown);
        }

        let connection = Connection::start_with(config, factory)?;
        registry.connections.retain(|weak| weak.strong_count() > 0);
        registry.connections.push(connection.downgrade());
        Ok(connection)
    }

    /// Handles to every registered connection that is still alive.
    pub fn live_connections(&self) -> Vec<Connection> {
        self.lock()
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .map(Connection::from_shared)
            .collect()
    }

    /// Tear down every live connection and refuse further starts.
    ///
    /// Blocks until every worker has exited. Returns the number of connections
    /// this call tore down.
    pub fn shutdown(&self) -> usize {
        let connections: Vec<Connection> = {
            let mut registry = self.lock();
            registry.shut_down = true;
            registry
                .connections
                .drain(..)
                .filter_map(|weak| weak.upgrade())
                .map(Connection::from_shared)
                .collect()
        };

        tracing::info!(connections = connections.len(), "Shutting down runtime");

        let mut torn_down = 0;
        for connection in &connections {
            if connection.teardown().performed {
                torn_down += 1;
            }
        }

        tracing::info!(torn_down, "Runtime shut down");
        torn_down
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("Runtime")
            .field("shut_down", &registry.shut_down)
            .field("registered", &registry.connections.len())
            .field("started_at", &self.started_at)
            .finish()
    }
}
