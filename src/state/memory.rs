//! Guest memory provider interface.
//!
//! The translator never owns guest memory. It reads instructions and performs guest loads
//! and stores through a [`MemoryManager`], and learns about writes to translated code and
//! about unmapped ranges through [`MemoryEvent`] notifications. [`FlatMemory`] is a simple
//! region-based provider used by the runner binary and the tests.

use crate::core::error::MemoryError;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Guest page size used for code tracking.
pub const PAGE_SIZE: u64 = 0x1000;

/// Notifications emitted by a memory provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    /// A range was unmapped; translations inside it are stale.
    Unmapped { address: u64, size: u64 },
    /// A tracked code range was written.
    CodeWritten { address: u64, size: u64 },
}

/// Receiver of [`MemoryEvent`]s.
pub trait MemoryEventHandler: Send + Sync {
    fn on_memory_event(&self, event: MemoryEvent);
}

/// Guest memory as seen by the translator and by generated code.
pub trait MemoryManager: Send + Sync {
    /// Read `buf.len()` bytes starting at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Write `data` starting at `address`.
    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Validate an access before it is performed by generated code.
    fn signal_memory_tracking(
        &self,
        _address: u64,
        _size: u64,
        _write: bool,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Request [`MemoryEvent::CodeWritten`] notifications for writes into this range.
    fn track_code(&self, address: u64, size: u64);

    /// Register a handler for memory events.
    fn subscribe(&self, handler: Arc<dyn MemoryEventHandler>);
}

/// Typed access helpers for any [`MemoryManager`].
pub trait MemoryManagerExt {
    fn read_guest<T: bytemuck::Pod>(&self, address: u64) -> Result<T, MemoryError>;
    fn write_guest<T: bytemuck::Pod>(&self, address: u64, value: T) -> Result<(), MemoryError>;
}

impl<M: MemoryManager + ?Sized> MemoryManagerExt for M {
    fn read_guest<T: bytemuck::Pod>(&self, address: u64) -> Result<T, MemoryError> {
        let mut value = T::zeroed();
        self.read(address, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    fn write_guest<T: bytemuck::Pod>(&self, address: u64, value: T) -> Result<(), MemoryError> {
        self.write(address, bytemuck::bytes_of(&value))
    }
}

struct Region {
    base: u64,
    data: Vec<u8>,
    writable: bool,
}

impl Region {
    fn contains(&self, address: u64, size: usize) -> bool {
        address >= self.base
            && address
                .checked_add(size as u64)
                .is_some_and(|end| end <= self.base + self.data.len() as u64)
    }
}

/// A simple guest address space made of disjoint, contiguous regions.
pub struct FlatMemory {
    regions: RwLock<Vec<Region>>,
    tracked_pages: RwLock<BTreeSet<u64>>,
    handlers: RwLock<Vec<Arc<dyn MemoryEventHandler>>>,
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(Vec::new()),
            tracked_pages: RwLock::new(BTreeSet::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Map a zero-filled region.
    pub fn map(&self, base: u64, size: usize, writable: bool) {
        self.map_region(base, vec![0; size], writable);
    }

    /// Map a region initialised with `bytes`.
    pub fn map_with(&self, base: u64, bytes: &[u8], writable: bool) {
        self.map_region(base, bytes.to_vec(), writable);
    }

    fn map_region(&self, base: u64, data: Vec<u8>, writable: bool) {
        let end = base + data.len() as u64;
        let mut regions = self.regions.write();
        regions.retain(|r| r.base + r.data.len() as u64 <= base || r.base >= end);
        regions.push(Region {
            base,
            data,
            writable,
        });
        regions.sort_by_key(|r| r.base);
    }

    /// Remove the region starting at `base` and notify subscribers.
    pub fn unmap(&self, base: u64) -> bool {
        let removed = {
            let mut regions = self.regions.write();
            regions
                .iter()
                .position(|r| r.base == base)
                .map(|i| regions.remove(i))
        };
        let Some(region) = removed else {
            return false;
        };
        self.notify(MemoryEvent::Unmapped {
            address: region.base,
            size: region.data.len() as u64,
        });
        true
    }

    fn notify(&self, event: MemoryEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.on_memory_event(event);
        }
    }

    fn touches_tracked_code(&self, address: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let first = address / PAGE_SIZE;
        let last = (address + size - 1) / PAGE_SIZE;
        self.tracked_pages.read().range(first..=last).next().is_some()
    }
}

impl MemoryManager for FlatMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let regions = self.regions.read();
        let region = regions
            .iter()
            .find(|r| r.contains(address, buf.len()))
            .ok_or(MemoryError::Unmapped {
                address,
                size: buf.len(),
            })?;
        let start = (address - region.base) as usize;
        buf.copy_from_slice(&region.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        {
            let mut regions = self.regions.write();
            let region = regions
                .iter_mut()
                .find(|r| r.contains(address, data.len()))
                .ok_or(MemoryError::Unmapped {
                    address,
                    size: data.len(),
                })?;
            if !region.writable {
                return Err(MemoryError::ReadOnly {
                    address,
                    size: data.len(),
                });
            }
            let start = (address - region.base) as usize;
            region.data[start..start + data.len()].copy_from_slice(data);
        }

        let size = data.len() as u64;
        if self.touches_tracked_code(address, size) {
            self.notify(MemoryEvent::CodeWritten { address, size });
        }
        Ok(())
    }

    fn track_code(&self, address: u64, size: u64) {
        if size == 0 {
            return;
        }
        let first = address / PAGE_SIZE;
        let last = (address + size - 1) / PAGE_SIZE;
        self.tracked_pages.write().extend(first..=last);
    }

    fn subscribe(&self, handler: Arc<dyn MemoryEventHandler>) {
        self.handlers.write().push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MemoryEvent>>);

    impl MemoryEventHandler for Recorder {
        fn on_memory_event(&self, event: MemoryEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_typed_round_trip() {
        let memory = FlatMemory::new();
        memory.map(0x1000, 0x100, true);

        memory.write_guest::<u32>(0x1010, 0xdead_beef).unwrap();
        assert_eq!(memory.read_guest::<u32>(0x1010).unwrap(), 0xdead_beef);
        assert_eq!(memory.read_guest::<u8>(0x1010).unwrap(), 0xef);
    }

    #[test]
    fn test_faults() {
        let memory = FlatMemory::new();
        memory.map(0x1000, 0x10, false);

        assert_eq!(
            memory.read_guest::<u64>(0x100c),
            Err(MemoryError::Unmapped {
                address: 0x100c,
                size: 8
            })
        );
        assert_eq!(
            memory.write_guest::<u8>(0x1000, 1),
            Err(MemoryError::ReadOnly {
                address: 0x1000,
                size: 1
            })
        );
    }

    #[test]
    fn test_code_tracking_and_unmap_events() {
        let memory = FlatMemory::new();
        let recorder = Arc::new(Recorder::default());
        memory.subscribe(recorder.clone());
        memory.map(0x1000, 0x2000, true);

        memory.write_guest::<u32>(0x1004, 1).unwrap();
        assert!(recorder.0.lock().is_empty());

        memory.track_code(0x1000, 8);
        memory.write_guest::<u32>(0x1ff0, 2).unwrap();
        memory.write_guest::<u32>(0x2000, 3).unwrap();
        assert!(memory.unmap(0x1000));

        assert_eq!(
            *recorder.0.lock(),
            vec![
                MemoryEvent::CodeWritten {
                    address: 0x1ff0,
                    size: 4
                },
                MemoryEvent::Unmapped {
                    address: 0x1000,
                    size: 0x2000
                },
            ]
        );
    }
}
