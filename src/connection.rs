//! The connection: the explicit top-level handle passed to every entry
//! point.  Owns the page arena, the cache, the session table, the list
//! of open btree handles and the eviction server's lifecycle.  There is
//! no ambient global state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::btree::{Btree, OpenMode};
use crate::cache::{evict, Cache};
use crate::config::{BtreeConfig, ConnectionConfig};
use crate::error::{Error, Result};
use crate::hazard::{Session, SessionTable};
use crate::page::PageArena;

pub struct Connection {
    pub config: ConnectionConfig,
    cache: Arc<Cache>,
    arena: Arc<PageArena>,
    sessions: Arc<SessionTable>,

    /// Open handles; the lock is taken only while mutating the list.
    btrees: Mutex<Vec<Arc<Btree>>>,

    server_run: AtomicBool,
    evict_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Connection {
    /// Open a connection and start its eviction server.
    pub fn open(config: ConnectionConfig) -> Result<Arc<Connection>> {
        let config = config.validated()?;
        let cache = Arc::new(Cache::new(
            config.cache_size,
            config.eviction_target,
            config.eviction_trigger,
            config.session_max,
        ));
        let sessions = Arc::new(SessionTable::new(config.session_max, config.hazard_max));

        let conn = Arc::new(Connection {
            config,
            cache,
            arena: Arc::new(PageArena::new()),
            sessions,
            btrees: Mutex::new(Vec::new()),
            server_run: AtomicBool::new(true),
            evict_thread: Mutex::new(None),
        });

        let server_conn = Arc::clone(&conn);
        let handle = thread::Builder::new()
            .name("evict-server".to_string())
            .spawn(move || evict::evict_server(server_conn))
            .map_err(Error::Io)?;
        *conn.evict_thread.lock() = Some(handle);
        conn.cache.set_server_active(true);

        Ok(conn)
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub(crate) fn server_running(&self) -> bool {
        self.server_run.load(Ordering::Acquire)
    }

    pub(crate) fn open_btrees(&self) -> Vec<Arc<Btree>> {
        self.btrees.lock().clone()
    }

    pub fn open_session(&self) -> Result<Arc<Session>> {
        self.sessions.open_session()
    }

    pub fn close_session(&self, session: &Session) {
        self.sessions.close_session(session)
    }

    /// Create a btree file.
    pub fn create_btree(&self, path: &Path, config: &BtreeConfig) -> Result<()> {
        Btree::create(path, config)
    }

    /// Open a btree file and add it to the handle list.
    pub fn open_btree(
        self: &Arc<Self>,
        name: &str,
        path: &Path,
        config: BtreeConfig,
    ) -> Result<Arc<Btree>> {
        self.open_btree_mode(name, path, config, OpenMode::Normal)
    }

    pub fn open_btree_mode(
        self: &Arc<Self>,
        name: &str,
        path: &Path,
        config: BtreeConfig,
        mode: OpenMode,
    ) -> Result<Arc<Btree>> {
        let btree = Btree::open(
            name,
            path,
            config,
            Arc::clone(&self.arena),
            Arc::clone(&self.cache),
            Arc::clone(&self.sessions),
            mode,
        )?;
        self.btrees.lock().push(Arc::clone(&btree));
        Ok(btree)
    }

    /// Close a btree: full-tree eviction, block-manager close, handle
    /// removal.
    pub fn close_btree(self: &Arc<Self>, btree: &Arc<Btree>) -> Result<()> {
        let result = btree.close();
        self.btrees.lock().retain(|b| !Arc::ptr_eq(b, btree));
        result
    }

    /// Shut the connection down: close remaining handles, then stop the
    /// eviction server.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        debug!(target: "fileops", "connection close");
        let open: Vec<Arc<Btree>> = std::mem::take(&mut *self.btrees.lock());
        let mut first_err = None;
        for btree in &open {
            if let Err(e) = btree.close() {
                first_err.get_or_insert(e);
            }
        }

        self.server_run.store(false, Ordering::Release);
        self.cache.set_server_active(false);
        self.cache.server_wake();
        if let Some(handle) = self.evict_thread.lock().take() {
            let _ = handle.join();
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_lifecycle() {
        let conn = Connection::open(ConnectionConfig::default()).unwrap();
        let session = conn.open_session().unwrap();
        conn.close_session(&session);
        conn.close().unwrap();
        assert_eq!(conn.cache().bytes_inuse(), 0);
    }

    #[test]
    fn test_session_limit_respected() {
        let config = ConnectionConfig {
            session_max: 2,
            ..Default::default()
        };
        let conn = Connection::open(config).unwrap();
        let _a = conn.open_session().unwrap();
        let _b = conn.open_session().unwrap();
        assert!(conn.open_session().is_err());
        conn.close().unwrap();
    }
}
