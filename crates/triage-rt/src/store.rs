//! The process store: exclusive owner of all process records.
//!
//! A stable map from [`ProcessId`] to [`ProcessRecord`] plus the LRU
//! sequence. Binding records live in slabs here as well, referenced by id
//! from both endpoints, so severing a binding or removing a process never
//! leaves a dangling reference -- only an id that fails to resolve.
//!
//! The LRU ordering is an input: a collaborator maintains it (under the
//! same lock as every other mutation) and the adjuster only reads it.

use rustc_hash::FxHashMap;

use triage_common::{BindFlags, CpuTimePropagation, Pid, Uid};

use crate::record::{
    ConnId, ConnectionRecord, ProcessId, ProcessRecord, ProvConnId, ProviderConnection,
    ProviderId, ProviderRecord, ServiceId, ServiceRecord,
};

/// Options for [`ProcessStore::add_connection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOpts {
    pub cpu_time_propagation: CpuTimePropagation,
    pub has_activity: bool,
    pub activity_visible: bool,
    pub attributed_client: Option<ProcessId>,
}

/// Owns every [`ProcessRecord`] and all binding records.
#[derive(Debug, Default)]
pub struct ProcessStore {
    procs: FxHashMap<ProcessId, ProcessRecord>,
    conns: FxHashMap<ConnId, ConnectionRecord>,
    prov_conns: FxHashMap<ProvConnId, ProviderConnection>,
    /// Least recently used first; most recently used last.
    lru: Vec<ProcessId>,
    by_pid: FxHashMap<Pid, ProcessId>,
    next_proc: u64,
    next_service: u64,
    next_provider: u64,
    next_conn: u64,
    next_prov_conn: u64,
}

impl ProcessStore {
    pub fn new() -> Self {
        ProcessStore::default()
    }

    // -- process lifecycle -------------------------------------------------

    /// Create a record for a newly started process and link it at the
    /// most-recently-used end of the LRU.
    pub fn insert(&mut self, pid: Pid, uid: Uid, user_id: u32, name: &str) -> ProcessId {
        self.next_proc += 1;
        let id = ProcessId(self.next_proc);
        self.procs
            .insert(id, ProcessRecord::new(id, pid, uid, user_id, name));
        self.by_pid.insert(pid, id);
        self.lru.push(id);
        id
    }

    /// Remove a dead process, severing every binding in both directions.
    pub fn remove(&mut self, id: ProcessId) -> Option<ProcessRecord> {
        let record = self.procs.remove(&id)?;
        self.by_pid.remove(&record.pid);
        self.lru.retain(|&p| p != id);

        // Outgoing service bindings: detach from the host's service.
        for conn_id in &record.service_bindings {
            if let Some(conn) = self.conns.remove(conn_id) {
                self.detach_conn_endpoints(&conn, id);
            }
        }
        // Incoming service bindings: detach from each client.
        for svc in &record.services {
            for conn_id in &svc.connections {
                if let Some(conn) = self.conns.remove(conn_id) {
                    self.detach_conn_endpoints(&conn, id);
                }
            }
        }
        // Provider bindings, both directions.
        for pc_id in &record.provider_bindings {
            if let Some(pc) = self.prov_conns.remove(pc_id) {
                self.detach_prov_conn_endpoints(&pc, id);
            }
        }
        for provider in &record.providers {
            for pc_id in &provider.connections {
                if let Some(pc) = self.prov_conns.remove(pc_id) {
                    self.detach_prov_conn_endpoints(&pc, id);
                }
            }
        }
        Some(record)
    }

    fn detach_conn_endpoints(&mut self, conn: &ConnectionRecord, removed: ProcessId) {
        for endpoint in [conn.client, conn.attributed_client.unwrap_or(conn.client)] {
            if endpoint == removed {
                continue;
            }
            if let Some(client) = self.procs.get_mut(&endpoint) {
                client.service_bindings.retain(|&c| c != conn.id);
            }
        }
        if conn.host != removed {
            if let Some(host) = self.procs.get_mut(&conn.host) {
                if let Some(svc) = host.find_service_mut(conn.service) {
                    svc.connections.retain(|&c| c != conn.id);
                }
            }
        }
    }

    fn detach_prov_conn_endpoints(&mut self, pc: &ProviderConnection, removed: ProcessId) {
        if pc.client != removed {
            if let Some(client) = self.procs.get_mut(&pc.client) {
                client.provider_bindings.retain(|&c| c != pc.id);
            }
        }
        if pc.host != removed {
            if let Some(host) = self.procs.get_mut(&pc.host) {
                if let Some(provider) = host.find_provider_mut(pc.provider) {
                    provider.connections.retain(|&c| c != pc.id);
                }
            }
        }
    }

    // -- lookup ------------------------------------------------------------

    pub fn get(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.procs.get(&id)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut ProcessRecord> {
        self.procs.get_mut(&id)
    }

    pub fn by_pid(&self, pid: Pid) -> Option<ProcessId> {
        self.by_pid.get(&pid).copied()
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.procs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.procs.keys().copied()
    }

    pub fn connection(&self, id: ConnId) -> Option<&ConnectionRecord> {
        self.conns.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut ConnectionRecord> {
        self.conns.get_mut(&id)
    }

    pub fn provider_connection(&self, id: ProvConnId) -> Option<&ProviderConnection> {
        self.prov_conns.get(&id)
    }

    // -- LRU ---------------------------------------------------------------

    /// Most-recently-used first, the traversal order of update passes.
    pub fn iter_lru(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.lru.iter().rev().copied()
    }

    /// Snapshot of the LRU in traversal order.
    pub fn lru_snapshot(&self) -> Vec<ProcessId> {
        self.lru.iter().rev().copied().collect()
    }

    /// Collaborator API: mark a process most recently used.
    pub fn touch(&mut self, id: ProcessId) {
        if let Some(pos) = self.lru.iter().position(|&p| p == id) {
            let id = self.lru.remove(pos);
            self.lru.push(id);
        }
    }

    // -- services ----------------------------------------------------------

    /// Publish a service on `host`. Returns `None` if the host is gone.
    pub fn add_service(
        &mut self,
        host: ProcessId,
        is_start_requested: bool,
        keep_warming: bool,
        now: u64,
    ) -> Option<ServiceId> {
        self.next_service += 1;
        let id = ServiceId(self.next_service);
        let record = self.procs.get_mut(&host)?;
        record.services.push(ServiceRecord {
            id,
            is_start_requested,
            last_activity_ms: now,
            keep_warming,
            connections: Vec::new(),
        });
        Some(id)
    }

    /// Drop a service, severing its incoming bindings.
    pub fn remove_service(&mut self, host: ProcessId, service: ServiceId) {
        let conn_ids = match self.procs.get_mut(&host) {
            Some(record) => {
                let Some(pos) = record.services.iter().position(|s| s.id == service) else {
                    return;
                };
                record.services.remove(pos).connections
            }
            None => return,
        };
        for conn_id in conn_ids {
            if let Some(conn) = self.conns.remove(&conn_id) {
                self.detach_conn_endpoints(&conn, conn.host);
            }
        }
    }

    // -- providers ---------------------------------------------------------

    pub fn add_provider(&mut self, host: ProcessId, has_external_handles: bool) -> Option<ProviderId> {
        self.next_provider += 1;
        let id = ProviderId(self.next_provider);
        let record = self.procs.get_mut(&host)?;
        record.providers.push(ProviderRecord {
            id,
            has_external_handles,
            connections: Vec::new(),
        });
        Some(id)
    }

    pub fn remove_provider(&mut self, host: ProcessId, provider: ProviderId) {
        let conn_ids = match self.procs.get_mut(&host) {
            Some(record) => {
                let Some(pos) = record.providers.iter().position(|p| p.id == provider) else {
                    return;
                };
                record.providers.remove(pos).connections
            }
            None => return,
        };
        for pc_id in conn_ids {
            if let Some(pc) = self.prov_conns.remove(&pc_id) {
                self.detach_prov_conn_endpoints(&pc, pc.host);
            }
        }
    }

    // -- bindings ----------------------------------------------------------

    /// Bind `client` to `service` on `host`. The connection is registered
    /// on the client's outgoing list (and the attributed client's, when
    /// present) and on the host service's incoming list.
    pub fn add_connection(
        &mut self,
        client: ProcessId,
        host: ProcessId,
        service: ServiceId,
        flags: BindFlags,
        opts: ConnectionOpts,
    ) -> Option<ConnId> {
        if !self.procs.contains_key(&client) || !self.procs.contains_key(&host) {
            return None;
        }
        self.next_conn += 1;
        let id = ConnId(self.next_conn);
        let conn = ConnectionRecord {
            id,
            client,
            host,
            service,
            flags,
            cpu_time_propagation: opts.cpu_time_propagation,
            has_activity: opts.has_activity,
            activity_visible: opts.activity_visible,
            attributed_client: opts.attributed_client,
            tracked_proc_state: None,
        };
        {
            let host_rec = self.procs.get_mut(&host)?;
            let svc = host_rec.find_service_mut(service)?;
            svc.connections.push(id);
        }
        self.procs
            .get_mut(&client)
            .expect("client checked above")
            .service_bindings
            .push(id);
        if let Some(attributed) = opts.attributed_client {
            if attributed != client {
                if let Some(rec) = self.procs.get_mut(&attributed) {
                    rec.service_bindings.push(id);
                }
            }
        }
        self.conns.insert(id, conn);
        Some(id)
    }

    pub fn remove_connection(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(&id) {
            // Pass an id that is not an endpoint so both sides detach.
            self.detach_conn_endpoints(&conn, ProcessId(u64::MAX));
        }
    }

    pub fn add_provider_connection(
        &mut self,
        client: ProcessId,
        host: ProcessId,
        provider: ProviderId,
    ) -> Option<ProvConnId> {
        if !self.procs.contains_key(&client) {
            return None;
        }
        self.next_prov_conn += 1;
        let id = ProvConnId(self.next_prov_conn);
        {
            let host_rec = self.procs.get_mut(&host)?;
            let prov = host_rec.find_provider_mut(provider)?;
            prov.connections.push(id);
        }
        self.procs
            .get_mut(&client)
            .expect("client checked above")
            .provider_bindings
            .push(id);
        self.prov_conns.insert(
            id,
            ProviderConnection {
                id,
                client,
                host,
                provider,
            },
        );
        Some(id)
    }

    pub fn remove_provider_connection(&mut self, id: ProvConnId) {
        if let Some(pc) = self.prov_conns.remove(&id) {
            self.detach_prov_conn_endpoints(&pc, ProcessId(u64::MAX));
        }
    }
}
