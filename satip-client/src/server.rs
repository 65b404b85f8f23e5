//! Upstream server bookkeeping.
//!
//! The tuner asks a [`ServerDirectory`] for an endpoint and marks it used
//! while a session is attached. [`StaticServerDirectory`] serves the servers
//! listed in the configuration file.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};

use satip_protocol::{parse_model, DeliverySystem, ServerQuirks};

use crate::config::ServerEntry;

/// Shared handle to a server.
pub type ServerRef = Arc<SatipServer>;

/// One SAT>IP server and its capabilities.
#[derive(Debug)]
pub struct SatipServer {
    address: String,
    port: u16,
    model: String,
    description: String,
    quirks: ServerQuirks,
    systems: Vec<(DeliverySystem, u32)>,
    use_count: AtomicU32,
}

impl SatipServer {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        model: impl Into<String>,
        description: impl Into<String>,
        quirks: ServerQuirks,
    ) -> Self {
        let model = model.into();
        Self {
            address: address.into(),
            port,
            systems: parse_model(&model),
            model,
            description: description.into(),
            quirks,
            use_count: AtomicU32::new(0),
        }
    }

    pub fn from_entry(entry: &ServerEntry) -> Self {
        Self::new(
            entry.address.clone(),
            entry.port,
            entry.model.clone(),
            entry.description.clone(),
            entry.quirks,
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn quirks(&self) -> ServerQuirks {
        self.quirks
    }

    pub fn supports(&self, system: DeliverySystem) -> bool {
        self.systems.iter().any(|(s, count)| *s == system && *count > 0)
    }

    /// Number of frontends for `system`.
    pub fn frontends(&self, system: DeliverySystem) -> u32 {
        self.systems
            .iter()
            .filter(|(s, _)| *s == system)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn is_used(&self) -> bool {
        self.use_count() > 0
    }
}

impl fmt::Display for SatipServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}", self.address, self.port, self.model)?;
        if !self.description.is_empty() {
            write!(f, " {}", self.description)?;
        }
        write!(f, ") quirks={}", self.quirks)
    }
}

/// Source of upstream servers.
pub trait ServerDirectory: Send + Sync {
    /// Pick a server accepted by `predicate`.
    fn get_server(&self, predicate: &dyn Fn(&SatipServer) -> bool) -> Option<ServerRef>;

    /// Attach or detach a tuner from `server`.
    fn use_server(&self, server: &ServerRef, in_use: bool);
}

/// Directory over a fixed list of servers.
#[derive(Debug, Default)]
pub struct StaticServerDirectory {
    servers: Vec<ServerRef>,
}

impl StaticServerDirectory {
    pub fn new(servers: Vec<SatipServer>) -> Self {
        for server in &servers {
            info!("Server: {}", server);
        }
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_entries(entries: &[ServerEntry]) -> Self {
        Self::new(entries.iter().map(SatipServer::from_entry).collect())
    }

    pub fn servers(&self) -> &[ServerRef] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl ServerDirectory for StaticServerDirectory {
    /// Prefers the first unused match; otherwise the last match.
    fn get_server(&self, predicate: &dyn Fn(&SatipServer) -> bool) -> Option<ServerRef> {
        let mut result = None;
        for server in &self.servers {
            if !predicate(server.as_ref()) {
                continue;
            }
            result = Some(Arc::clone(server));
            if !server.is_used() {
                break;
            }
        }
        result
    }

    fn use_server(&self, server: &ServerRef, in_use: bool) {
        if in_use {
            server.use_count.fetch_add(1, Ordering::AcqRel);
        } else {
            // Never underflow on an unbalanced detach.
            let _ = server
                .use_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        debug!(
            "Server {}:{} use count {}",
            server.address(),
            server.port(),
            server.use_count()
        );
    }
}

/// Predicate selecting servers able to tune `params`.
///
/// Parameters without `msys=` match every server.
pub fn supports_params(params: &str) -> impl Fn(&SatipServer) -> bool {
    let system = DeliverySystem::from_params(params);
    move |server: &SatipServer| system.map_or(true, |s| server.supports(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticServerDirectory {
        StaticServerDirectory::new(vec![
            SatipServer::new("10.0.0.1", 554, "DVBS2-2", "sat", ServerQuirks::default()),
            SatipServer::new("10.0.0.2", 554, "DVBT2-1,DVBC-1", "", ServerQuirks::default()),
            SatipServer::new("10.0.0.3", 8554, "DVBS2-4", "", ServerQuirks::default()),
        ])
    }

    #[test]
    fn test_get_server_prefers_unused() {
        let dir = directory();
        let sat = supports_params("src=1&msys=dvbs2&freq=11494");

        let first = dir.get_server(&sat).unwrap();
        assert_eq!(first.address(), "10.0.0.1");

        dir.use_server(&first, true);
        let second = dir.get_server(&sat).unwrap();
        assert_eq!(second.address(), "10.0.0.3");

        dir.use_server(&second, true);
        let fallback = dir.get_server(&sat).unwrap();
        assert_eq!(fallback.address(), "10.0.0.3");
    }

    #[test]
    fn test_get_server_by_system() {
        let dir = directory();
        let cable = dir.get_server(&supports_params("freq=346&msys=dvbc")).unwrap();
        assert_eq!(cable.address(), "10.0.0.2");
        assert!(dir.get_server(&supports_params("msys=dvbc2")).is_none());
    }

    #[test]
    fn test_use_count_does_not_underflow() {
        let dir = directory();
        let server = Arc::clone(&dir.servers()[0]);
        dir.use_server(&server, false);
        assert_eq!(server.use_count(), 0);
        dir.use_server(&server, true);
        dir.use_server(&server, true);
        dir.use_server(&server, false);
        assert_eq!(server.use_count(), 1);
    }

    #[test]
    fn test_frontends() {
        let dir = directory();
        assert_eq!(dir.servers()[1].frontends(DeliverySystem::DvbT2), 1);
        assert_eq!(dir.servers()[2].frontends(DeliverySystem::DvbS2), 4);
        assert_eq!(dir.servers()[0].frontends(DeliverySystem::DvbT), 0);
    }
}
