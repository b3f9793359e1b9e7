//! The server manager: owns servers keyed by dense handles and fronts the
//! administrative operations consumed by the management surface.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::server::{AbstractServer, Server};
use crate::session::Protocol;
use crate::stats::{ServerInfo, StatsSnapshot};

pub type ServerHandle = i32;

#[derive(Default)]
pub struct ServerManager {
    inner: Mutex<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    servers: BTreeMap<ServerHandle, Arc<dyn AbstractServer>>,
    next_handle: ServerHandle,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server speaking protocol `P` and start its accept loop.
    pub fn create_server<P: Protocol + Default>(&self, config: &Config) -> Result<ServerHandle> {
        let server = Server::<P>::create(config)?;
        server.dispatch();

        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.servers.insert(handle, server);
        info!(handle, "server created");
        Ok(handle)
    }

    fn get(&self, handle: ServerHandle) -> Result<Arc<dyn AbstractServer>> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidServerHandle(handle))
    }

    fn all(&self) -> Vec<(ServerHandle, Arc<dyn AbstractServer>)> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .iter()
            .map(|(h, s)| (*h, s.clone()))
            .collect()
    }

    pub fn stop(&self, handle: ServerHandle) -> Result<()> {
        self.get(handle)?.stop();
        Ok(())
    }

    pub fn stop_all(&self) {
        for (_, server) in self.all() {
            server.stop();
        }
    }

    /// Block until every server has been stopped.
    pub fn wait(&self) {
        for (_, server) in self.all() {
            server.wait();
        }
    }

    /// One snapshot per server, in handle order.
    pub fn get_stats(&self) -> Vec<StatsSnapshot> {
        self.all().iter().map(|(_, s)| s.snapshot()).collect()
    }

    pub fn get_servers_info(&self) -> Vec<ServerInfo> {
        self.all()
            .iter()
            .map(|(handle, server)| ServerInfo {
                server_id: *handle,
                contexts: server.contexts_info(),
            })
            .collect()
    }

    pub fn add_context(&self, handle: ServerHandle, threads: usize) -> Result<()> {
        self.get(handle)?.add_context(threads)
    }

    /// Returns the reactor's stop status: `0` on success, `EBUSY` when a
    /// dispatch hold raced the deactivation.
    pub fn deactivate_context(&self, handle: ServerHandle, context_index: usize) -> Result<i32> {
        self.get(handle)?.deactivate_context(context_index)
    }
}
