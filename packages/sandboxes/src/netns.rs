// ABOUTME: Network namespace allocation shared by every runner on the host
// ABOUTME: File-locked registry of /30 slots plus the host commands that build and remove namespaces

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::process::is_process_alive;

/// Namespace names are `stratus-ns-<slot>`
pub const NETNS_PREFIX: &str = "stratus-ns-";

/// Tap device every guest attaches to; identical in each namespace so snapshots restore anywhere
pub const GUEST_TAP_DEVICE: &str = "tap0";
pub const GUEST_TAP_ADDR: &str = "172.16.0.1/30";

/// One reserved network identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetNsEntry {
    pub name: String,
    pub slot: u32,
    /// Host side of the veth pair
    pub host_ip: Ipv4Addr,
    /// Namespace side of the veth pair; the proxy sees the VM under this address
    pub ns_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub owner_pid: u32,
    pub vm_id: String,
    pub created_at: DateTime<Utc>,
}

impl NetNsEntry {
    pub fn host_veth(&self) -> String {
        format!("stv{}h", self.slot)
    }

    pub fn ns_veth(&self) -> String {
        format!("stv{}n", self.slot)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: Vec<NetNsEntry>,
}

/// Allocator over a registry file shared across runner processes
#[derive(Debug, Clone)]
pub struct NetNsAllocator {
    path: PathBuf,
    lock_path: PathBuf,
    subnet: Ipv4Addr,
    max_slots: u32,
}

impl NetNsAllocator {
    pub fn new(path: impl Into<PathBuf>, subnet: Ipv4Addr, max_slots: u32) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            subnet,
            max_slots,
        }
    }

    /// Reserve the lowest free slot for `vm_id`. A VM never holds two slots.
    pub fn reserve(&self, vm_id: &str, owner_pid: u32) -> Result<NetNsEntry> {
        self.update(|registry| {
            if registry.entries.iter().any(|e| e.vm_id == vm_id) {
                return Err(SandboxError::Network(format!(
                    "VM {} already holds a namespace",
                    vm_id
                )));
            }

            let slot = (0..self.max_slots)
                .find(|slot| !registry.entries.iter().any(|e| e.slot == *slot))
                .ok_or(SandboxError::NetnsExhausted {
                    max_slots: self.max_slots,
                })?;

            let base = u32::from(self.subnet) + slot * 4;
            let entry = NetNsEntry {
                name: format!("{}{}", NETNS_PREFIX, slot),
                slot,
                host_ip: Ipv4Addr::from(base + 1),
                ns_ip: Ipv4Addr::from(base + 2),
                prefix_len: 30,
                owner_pid,
                vm_id: vm_id.to_string(),
                created_at: Utc::now(),
            };
            debug!("Reserved {} ({}) for VM {}", entry.name, entry.ns_ip, vm_id);
            registry.entries.push(entry.clone());
            Ok(entry)
        })
    }

    /// Release an entry. Returns false if it was already gone.
    pub fn release(&self, entry: &NetNsEntry) -> Result<bool> {
        self.update(|registry| {
            let before = registry.entries.len();
            registry
                .entries
                .retain(|e| !(e.name == entry.name && e.vm_id == entry.vm_id));
            Ok(registry.entries.len() != before)
        })
    }

    pub fn release_by_vm(&self, vm_id: &str) -> Result<Option<NetNsEntry>> {
        self.update(|registry| {
            let index = registry.entries.iter().position(|e| e.vm_id == vm_id);
            Ok(index.map(|i| registry.entries.remove(i)))
        })
    }

    /// Drop entries whose owning runner is gone and return them.
    pub fn reconcile_orphans(&self) -> Result<Vec<NetNsEntry>> {
        self.reconcile_orphans_with(is_process_alive)
    }

    pub fn reconcile_orphans_with<F>(&self, is_alive: F) -> Result<Vec<NetNsEntry>>
    where
        F: Fn(u32) -> bool,
    {
        let removed = self.remove_where(|e| !is_alive(e.owner_pid))?;
        if !removed.is_empty() {
            info!("Released {} orphaned namespace entries", removed.len());
        }
        Ok(removed)
    }

    /// Release everything owned by `pid`, used on graceful shutdown.
    pub fn release_owned_by(&self, pid: u32) -> Result<Vec<NetNsEntry>> {
        self.remove_where(|e| e.owner_pid == pid)
    }

    pub fn entries(&self) -> Result<Vec<NetNsEntry>> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        let result = self.load().map(|r| r.entries);
        let _ = FileExt::unlock(&lock);
        result
    }

    fn remove_where<F>(&self, doomed: F) -> Result<Vec<NetNsEntry>>
    where
        F: Fn(&NetNsEntry) -> bool,
    {
        self.update(|registry| {
            let (removed, kept): (Vec<_>, Vec<_>) =
                registry.entries.drain(..).partition(|e| doomed(e));
            registry.entries = kept;
            Ok(removed)
        })
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryFile) -> Result<T>,
    {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;
        let result = self.load().and_then(|mut registry| {
            let value = f(&mut registry)?;
            self.save(&registry)?;
            Ok(value)
        });
        let _ = FileExt::unlock(&lock);
        result
    }

    fn load(&self) -> Result<RegistryFile> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(RegistryFile::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, registry: &RegistryFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(registry)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Builds and removes the host side of a VM's network
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create the namespace, veth pair, tap device and egress rules
    async fn setup(&self, entry: &NetNsEntry, proxy_port: u16) -> Result<()>;

    /// Remove everything `setup` created. Must tolerate partial state.
    async fn teardown(&self, entry: &NetNsEntry) -> Result<()>;
}

/// `HostNetwork` backed by `ip` and `iptables`
#[derive(Debug, Default, Clone)]
pub struct IpCommandNetwork;

impl IpCommandNetwork {
    pub fn new() -> Self {
        Self
    }
}

async fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SandboxError::Network(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

async fn in_netns(ns: &str, args: &[&str]) -> Result<()> {
    let mut full = vec!["netns", "exec", ns];
    full.extend_from_slice(args);
    run_cmd("ip", &full).await
}

#[async_trait]
impl HostNetwork for IpCommandNetwork {
    async fn setup(&self, entry: &NetNsEntry, proxy_port: u16) -> Result<()> {
        let ns = entry.name.as_str();
        let host_veth = entry.host_veth();
        let ns_veth = entry.ns_veth();
        let host_cidr = format!("{}/{}", entry.host_ip, entry.prefix_len);
        let ns_cidr = format!("{}/{}", entry.ns_ip, entry.prefix_len);
        let host_ip = entry.host_ip.to_string();
        let port = proxy_port.to_string();

        let result: Result<()> = async {
            run_cmd("ip", &["netns", "add", ns]).await?;
            run_cmd(
                "ip",
                &["link", "add", &host_veth, "type", "veth", "peer", "name", &ns_veth],
            )
            .await?;
            run_cmd("ip", &["link", "set", &ns_veth, "netns", ns]).await?;
            run_cmd("ip", &["addr", "add", &host_cidr, "dev", &host_veth]).await?;
            run_cmd("ip", &["link", "set", &host_veth, "up"]).await?;

            in_netns(ns, &["ip", "link", "set", "lo", "up"]).await?;
            in_netns(ns, &["ip", "addr", "add", &ns_cidr, "dev", &ns_veth]).await?;
            in_netns(ns, &["ip", "link", "set", &ns_veth, "up"]).await?;
            in_netns(ns, &["ip", "route", "add", "default", "via", &host_ip]).await?;
            in_netns(
                ns,
                &["ip", "tuntap", "add", "dev", GUEST_TAP_DEVICE, "mode", "tap"],
            )
            .await?;
            in_netns(ns, &["ip", "addr", "add", GUEST_TAP_ADDR, "dev", GUEST_TAP_DEVICE]).await?;
            in_netns(ns, &["ip", "link", "set", GUEST_TAP_DEVICE, "up"]).await?;
            in_netns(ns, &["sysctl", "-q", "-w", "net.ipv4.ip_forward=1"]).await?;

            // Guest traffic may only reach the proxy on the host veth address
            in_netns(ns, &["iptables", "-P", "FORWARD", "DROP"]).await?;
            in_netns(
                ns,
                &[
                    "iptables", "-A", "FORWARD", "-i", GUEST_TAP_DEVICE, "-o", &ns_veth, "-p",
                    "tcp", "-d", &host_ip, "--dport", &port, "-j", "ACCEPT",
                ],
            )
            .await?;
            in_netns(
                ns,
                &[
                    "iptables", "-A", "FORWARD", "-i", &ns_veth, "-o", GUEST_TAP_DEVICE, "-m",
                    "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT",
                ],
            )
            .await?;
            in_netns(
                ns,
                &[
                    "iptables", "-t", "nat", "-A", "POSTROUTING", "-o", &ns_veth, "-j",
                    "MASQUERADE",
                ],
            )
            .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!("Network setup for {} failed, rolling back: {}", ns, e);
            if let Err(cleanup) = self.teardown(entry).await {
                debug!("Rollback of {} incomplete: {}", ns, cleanup);
            }
            return Err(e);
        }
        info!("Namespace {} ready ({} -> {})", ns, entry.ns_ip, entry.host_ip);
        Ok(())
    }

    async fn teardown(&self, entry: &NetNsEntry) -> Result<()> {
        // Deleting the namespace destroys the tap and the inner veth, which takes its peer with it
        let ns_result = run_cmd("ip", &["netns", "del", &entry.name]).await;
        let _ = run_cmd("ip", &["link", "del", &entry.host_veth()]).await;
        match ns_result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such file") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::Path;

    fn allocator(dir: &Path, max_slots: u32) -> NetNsAllocator {
        NetNsAllocator::new(
            dir.join("netns-registry.json"),
            Ipv4Addr::new(10, 200, 0, 0),
            max_slots,
        )
    }

    #[test]
    fn test_reserve_assigns_slot_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 8);

        let first = alloc.reserve("vm-a", 100).unwrap();
        let second = alloc.reserve("vm-b", 100).unwrap();

        assert_eq!(first.name, "stratus-ns-0");
        assert_eq!(first.host_ip, Ipv4Addr::new(10, 200, 0, 1));
        assert_eq!(first.ns_ip, Ipv4Addr::new(10, 200, 0, 2));
        assert_eq!(second.name, "stratus-ns-1");
        assert_eq!(second.ns_ip, Ipv4Addr::new(10, 200, 0, 6));
        assert_eq!(second.host_veth(), "stv1h");
        assert_eq!(second.ns_veth(), "stv1n");
    }

    #[test]
    fn test_vm_cannot_reserve_twice() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 8);
        alloc.reserve("vm-a", 100).unwrap();
        assert!(matches!(
            alloc.reserve("vm-a", 100),
            Err(SandboxError::Network(_))
        ));
    }

    #[test]
    fn test_exhaustion_and_slot_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 2);
        let a = alloc.reserve("vm-a", 1).unwrap();
        alloc.reserve("vm-b", 1).unwrap();
        assert!(matches!(
            alloc.reserve("vm-c", 1),
            Err(SandboxError::NetnsExhausted { max_slots: 2 })
        ));

        assert!(alloc.release(&a).unwrap());
        assert!(!alloc.release(&a).unwrap());
        assert_eq!(alloc.reserve("vm-c", 1).unwrap().slot, a.slot);
    }

    #[test]
    fn test_concurrent_reservations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    // Separate handles, as separate runner processes would have
                    allocator(&path, 64)
                        .reserve(&format!("vm-{}", i), 1)
                        .unwrap()
                })
            })
            .collect();
        let entries: Vec<NetNsEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let names: HashSet<_> = entries.iter().map(|e| e.name.clone()).collect();
        let ips: HashSet<_> = entries.iter().map(|e| e.ns_ip).collect();
        assert_eq!(names.len(), 24);
        assert_eq!(ips.len(), 24);
        assert_eq!(allocator(&path, 64).entries().unwrap().len(), 24);
    }

    #[test]
    fn test_orphans_from_dead_pids_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 8);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        alloc.reserve("vm-live", std::process::id()).unwrap();
        let orphan = alloc.reserve("vm-orphan", dead_pid).unwrap();

        let removed = alloc.reconcile_orphans().unwrap();
        assert_eq!(removed, vec![orphan.clone()]);

        let remaining = alloc.entries().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].vm_id, "vm-live");

        // The orphan's slot is handed out again, to a new VM
        let next = alloc.reserve("vm-new", std::process::id()).unwrap();
        assert_eq!(next.slot, orphan.slot);
        assert_eq!(next.vm_id, "vm-new");
    }

    #[test]
    fn test_release_owned_by() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 8);
        alloc.reserve("vm-a", 10).unwrap();
        alloc.reserve("vm-b", 11).unwrap();
        alloc.reserve("vm-c", 10).unwrap();

        let released = alloc.release_owned_by(10).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(alloc.entries().unwrap().len(), 1);
        assert!(alloc.release_by_vm("vm-b").unwrap().is_some());
        assert!(alloc.release_by_vm("vm-b").unwrap().is_none());
    }
}
