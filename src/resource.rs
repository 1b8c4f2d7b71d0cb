use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::contract::{OrchestrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u32);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub size_bytes: usize,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, size_bytes: usize) -> Self {
        Self {
            name: name.into(),
            size_bytes,
        }
    }
}

/// Byte location inside a resource, as seen by the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuAddress {
    pub resource: ResourceHandle,
    pub offset: u32,
}

impl GpuAddress {
    pub fn new(resource: ResourceHandle, offset: u32) -> Self {
        Self { resource, offset }
    }

    #[must_use]
    pub fn add(self, bytes: u32) -> Self {
        Self {
            resource: self.resource,
            offset: self.offset + bytes,
        }
    }
}

impl fmt::Display for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.resource, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// OS memory collaborator. Locks copy the resource out; a write unlock copies
/// the edited bytes back.
pub trait MemoryServices: Send + Sync {
    fn allocate(&self, spec: &ResourceSpec) -> Result<ResourceHandle>;

    fn lock(&self, handle: ResourceHandle, mode: LockMode) -> Result<Vec<u8>>;

    fn unlock(&self, handle: ResourceHandle, written: Option<&[u8]>) -> Result<()>;

    /// Returns a resource to the allocator. The handle is invalid afterwards.
    fn free(&self, handle: ResourceHandle) -> Result<()>;
}

/// CPU mapping of a resource that is always unlocked when it goes out of
/// scope. Writes only land when `commit` is called.
pub struct ScopedLock<'a> {
    memory: &'a dyn MemoryServices,
    handle: ResourceHandle,
    mode: LockMode,
    data: Vec<u8>,
    released: bool,
}

impl<'a> ScopedLock<'a> {
    pub fn acquire(
        memory: &'a dyn MemoryServices,
        handle: ResourceHandle,
        mode: LockMode,
    ) -> Result<Self> {
        let data = memory.lock(handle, mode)?;
        Ok(Self {
            memory,
            handle,
            mode,
            data,
            released: false,
        })
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.data.get(offset..offset + 4).ok_or_else(|| {
            OrchestrationError::Collaborator(format!(
                "read at {offset:#x} outside {}",
                self.handle
            ))
        })?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        if self.mode != LockMode::Write {
            return Err(OrchestrationError::Collaborator(format!(
                "{} is locked read-only",
                self.handle
            )));
        }
        let handle = self.handle;
        let slot = self.data.get_mut(offset..offset + 4).ok_or_else(|| {
            OrchestrationError::Collaborator(format!("write at {offset:#x} outside {handle}"))
        })?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_words(&mut self, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            self.write_u32(i * 4, *word)?;
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.released = true;
        let written = (self.mode == LockMode::Write).then_some(self.data.as_slice());
        self.memory.unlock(self.handle, written)
    }
}

impl Deref for ScopedLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ScopedLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.memory.unlock(self.handle, None) {
            warn!(handle = %self.handle, %err, "unlock on drop failed");
        }
    }
}

#[derive(Debug)]
struct Region {
    name: String,
    data: Vec<u8>,
    locked: Option<LockMode>,
}

/// Process-local memory shared between the controller and the simulated
/// engine.
#[derive(Debug, Default)]
pub struct HostMemory {
    regions: Mutex<HashMap<ResourceHandle, Region>>,
    next_handle: AtomicU32,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_region<T>(
        &self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut Region) -> Result<T>,
    ) -> Result<T> {
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("host memory poisoned".to_string()))?;
        let region = regions.get_mut(&handle).ok_or_else(|| {
            OrchestrationError::Collaborator(format!("unknown resource {handle}"))
        })?;
        f(region)
    }

    pub fn read_u32(&self, addr: GpuAddress) -> Result<u32> {
        self.with_region(addr.resource, |region| {
            let at = addr.offset as usize;
            let bytes = region.data.get(at..at + 4).ok_or_else(|| {
                OrchestrationError::Collaborator(format!(
                    "read {addr} outside {} ({} bytes)",
                    region.name,
                    region.data.len()
                ))
            })?;
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        })
    }

    pub fn write_u32(&self, addr: GpuAddress, value: u32) -> Result<()> {
        self.update_u32(addr, |_| value).map(|_| ())
    }

    /// Read-modify-write under the memory lock; returns the previous value.
    pub fn update_u32(&self, addr: GpuAddress, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        self.with_region(addr.resource, |region| {
            let at = addr.offset as usize;
            let name = &region.name;
            let len = region.data.len();
            let bytes = region.data.get_mut(at..at + 4).ok_or_else(|| {
                OrchestrationError::Collaborator(format!(
                    "write {addr} outside {name} ({len} bytes)"
                ))
            })?;
            let old = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            bytes.copy_from_slice(&f(old).to_le_bytes());
            Ok(old)
        })
    }

    pub fn locked_count(&self) -> usize {
        self.regions
            .lock()
            .map(|regions| regions.values().filter(|r| r.locked.is_some()).count())
            .unwrap_or(0)
    }

    pub fn resource_count(&self) -> usize {
        self.regions.lock().map(|regions| regions.len()).unwrap_or(0)
    }
}

impl MemoryServices for HostMemory {
    fn allocate(&self, spec: &ResourceSpec) -> Result<ResourceHandle> {
        if spec.size_bytes == 0 {
            return Err(OrchestrationError::Collaborator(format!(
                "zero-sized allocation for {}",
                spec.name
            )));
        }
        let handle = ResourceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("host memory poisoned".to_string()))?;
        regions.insert(
            handle,
            Region {
                name: spec.name.clone(),
                data: vec![0; spec.size_bytes],
                locked: None,
            },
        );
        Ok(handle)
    }

    fn lock(&self, handle: ResourceHandle, mode: LockMode) -> Result<Vec<u8>> {
        self.with_region(handle, |region| {
            if region.locked.is_some() {
                return Err(OrchestrationError::Collaborator(format!(
                    "{} already locked",
                    region.name
                )));
            }
            region.locked = Some(mode);
            Ok(region.data.clone())
        })
    }

    fn unlock(&self, handle: ResourceHandle, written: Option<&[u8]>) -> Result<()> {
        self.with_region(handle, |region| {
            let Some(mode) = region.locked.take() else {
                return Err(OrchestrationError::Collaborator(format!(
                    "{} is not locked",
                    region.name
                )));
            };
            if let Some(bytes) = written {
                if mode != LockMode::Write || bytes.len() != region.data.len() {
                    return Err(OrchestrationError::Collaborator(format!(
                        "invalid write-back to {}",
                        region.name
                    )));
                }
                region.data.copy_from_slice(bytes);
            }
            Ok(())
        })
    }

    fn free(&self, handle: ResourceHandle) -> Result<()> {
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("host memory poisoned".to_string()))?;
        match regions.get(&handle) {
            None => Err(OrchestrationError::Collaborator(format!(
                "unknown resource {handle}"
            ))),
            Some(region) if region.locked.is_some() => Err(OrchestrationError::Collaborator(
                format!("{} freed while locked", region.name),
            )),
            Some(_) => {
                regions.remove(&handle);
                Ok(())
            }
        }
    }
}
