//! # Diagnostic Reports
//!
//! Point-in-time snapshots of the broker's tables, taken under the registry
//! lock and rendered afterwards.

use alloc::vec::Vec;
use core::fmt;

use crate::addresses::VirtualRange;
use crate::cache::CacheMaintenance;
use crate::host::HostMemory;
use crate::registry::{Guid, MapKey, Resource, ResourceInfo};
use crate::remote::{RemoteHandle, RemoteMemoryService};
use crate::session::ProcessId;
use crate::stats::{LifecycleStats, OpStats};
use crate::SharedMemory;

/// Which report to produce. `Some(pid)` narrows it to one process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReportRequest {
    Mappings(Option<ProcessId>),
    Allocations(Option<ProcessId>),
    Statistics(Option<ProcessId>),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MappingEntry {
    pub key: MapKey,
    pub resource: Guid,
    pub pid: ProcessId,
    pub remote_handle: Option<RemoteHandle>,
    pub region: VirtualRange,
    pub attachments: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Report {
    Mappings {
        pid: Option<ProcessId>,
        entries: Vec<MappingEntry>,
        lock_contention: u64,
    },
    Allocations {
        pid: Option<ProcessId>,
        resources: Vec<ResourceInfo>,
    },
    Statistics {
        pid: Option<ProcessId>,
        /// Counters of live resources.
        live: OpStats,
        live_resources: usize,
        open_sessions: usize,
        /// Counters of resources that are gone; only in the global report.
        lifecycle: Option<LifecycleStats>,
    },
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Shorthand for a [`ReportRequest::Statistics`] report.
    #[must_use]
    pub fn statistics(&self, pid: Option<ProcessId>) -> Report {
        self.report(ReportRequest::Statistics(pid))
    }

    #[must_use]
    pub fn report(&self, request: ReportRequest) -> Report {
        let matches = |pid: Option<ProcessId>, owner: ProcessId| pid.is_none_or(|p| p == owner);
        match request {
            ReportRequest::Mappings(pid) => {
                let entries = self.registry.with(|t| {
                    t.mappings
                        .iter()
                        .filter(|(_, m)| matches(pid, m.pid))
                        .map(|(key, m)| MappingEntry {
                            key: *key,
                            resource: m.resource,
                            pid: m.pid,
                            remote_handle: m.remote_handle,
                            region: m.region,
                            attachments: m.attachments,
                        })
                        .collect()
                });
                Report::Mappings {
                    pid,
                    entries,
                    lock_contention: self.registry.contention_count(),
                }
            }
            ReportRequest::Allocations(pid) => {
                let resources = self.registry.with(|t| {
                    t.resources
                        .values()
                        .filter(|r| matches(pid, r.owner))
                        .map(Resource::info)
                        .collect()
                });
                Report::Allocations { pid, resources }
            }
            ReportRequest::Statistics(pid) => {
                let (live, live_resources, open_sessions, lifecycle) = self.registry.with(|t| {
                    let mut live = OpStats::default();
                    let mut count = 0;
                    for resource in t.resources.values().filter(|r| matches(pid, r.owner)) {
                        live.absorb(&resource.stats);
                        count += 1;
                    }
                    let sessions = t.sessions.values().filter(|s| matches(pid, s.pid)).count();
                    (live, count, sessions, pid.is_none().then_some(t.lifecycle))
                });
                Report::Statistics {
                    pid,
                    live,
                    live_resources,
                    open_sessions,
                    lifecycle,
                }
            }
        }
    }
}

struct Scope(Option<ProcessId>);

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pid) => write!(f, "process {pid}"),
            None => f.write_str("all processes"),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mappings {
                pid,
                entries,
                lock_contention,
            } => {
                writeln!(
                    f,
                    "mappings of {}: {} (lock contended {lock_contention} times)",
                    Scope(*pid),
                    entries.len()
                )?;
                for e in entries {
                    writeln!(
                        f,
                        "  {} {} pid {} at {} +{:#x} remote {} x{}",
                        e.key,
                        e.resource,
                        e.pid,
                        e.region.start,
                        e.region.len,
                        e.remote_handle.map_or(0, RemoteHandle::as_u32),
                        e.attachments
                    )?;
                }
                Ok(())
            }
            Self::Allocations { pid, resources } => {
                writeln!(f, "allocations of {}: {}", Scope(*pid), resources.len())?;
                for r in resources {
                    writeln!(
                        f,
                        "  {} \"{}\" pid {} base {} size {} cache {} locks {} refs {} maps {}",
                        r.guid,
                        r.name,
                        r.owner,
                        r.base,
                        r.size,
                        r.cache,
                        r.lock_count,
                        r.ref_count,
                        r.map_count
                    )?;
                }
                Ok(())
            }
            Self::Statistics {
                pid,
                live,
                live_resources,
                open_sessions,
                lifecycle,
            } => {
                writeln!(
                    f,
                    "statistics of {}: {live_resources} live resources, {open_sessions} sessions",
                    Scope(*pid)
                )?;
                write!(f, "{live}")?;
                if let Some(lifecycle) = lifecycle {
                    write!(f, "{lifecycle}")?;
                }
                Ok(())
            }
        }
    }
}
