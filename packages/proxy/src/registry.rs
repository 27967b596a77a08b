// ABOUTME: Registry mapping VM network identities to their proxy context
// ABOUTME: JSON file shared between the orchestrator and the proxy, mutated under an exclusive file lock

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use stratus_core::FirewallPolicy;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// What the proxy needs to know about one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyVmEntry {
    pub vm_id: String,
    pub run_id: String,
    /// Address the VM's traffic arrives from
    pub source_ip: Ipv4Addr,
    /// `None` means no firewall: everything is allowed and logged
    pub firewall: Option<FirewallPolicy>,
    pub network_log_path: PathBuf,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    vms: HashMap<String, ProxyVmEntry>,
}

/// File-backed registry keyed by VM ID
#[derive(Debug, Clone)]
pub struct ProxyVmRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ProxyVmRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a VM. A second live VM claiming the same source address is rejected.
    pub fn register(&self, entry: ProxyVmEntry) -> Result<()> {
        self.update(|registry| {
            if let Some(existing) = registry
                .vms
                .values()
                .find(|e| e.source_ip == entry.source_ip && e.vm_id != entry.vm_id)
            {
                return Err(ProxyError::Registry(format!(
                    "Source address {} already belongs to VM {}",
                    entry.source_ip, existing.vm_id
                )));
            }
            debug!("Registering VM {} at {}", entry.vm_id, entry.source_ip);
            registry.vms.insert(entry.vm_id.clone(), entry);
            Ok(())
        })
    }

    /// Remove a VM. Returns false if it was not registered.
    pub fn unregister(&self, vm_id: &str) -> Result<bool> {
        self.update(|registry| Ok(registry.vms.remove(vm_id).is_some()))
    }

    pub fn lookup_by_ip(&self, ip: IpAddr) -> Result<Option<ProxyVmEntry>> {
        let IpAddr::V4(ip) = ip else {
            return Ok(None);
        };
        let registry = self.read()?;
        Ok(registry.vms.into_values().find(|e| e.source_ip == ip))
    }

    pub fn get(&self, vm_id: &str) -> Result<Option<ProxyVmEntry>> {
        Ok(self.read()?.vms.remove(vm_id))
    }

    pub fn entries(&self) -> Result<Vec<ProxyVmEntry>> {
        Ok(self.read()?.vms.into_values().collect())
    }

    /// Drop every entry for which `keep` returns false and return the removed ones.
    pub fn retain<F>(&self, mut keep: F) -> Result<Vec<ProxyVmEntry>>
    where
        F: FnMut(&ProxyVmEntry) -> bool,
    {
        self.update(|registry| {
            let doomed: Vec<String> = registry
                .vms
                .values()
                .filter(|e| !keep(e))
                .map(|e| e.vm_id.clone())
                .collect();
            Ok(doomed
                .iter()
                .filter_map(|id| registry.vms.remove(id))
                .collect())
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

    fn read(&self) -> Result<RegistryFile> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        let result = self.load();
        let _ = FileExt::unlock(&lock);
        result
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
