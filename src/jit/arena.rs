// The executable arena is one anonymous RWX mapping reserved up front and carved into code
// ranges with a first-fit free list. Freed ranges are merged with their neighbours so the
// list stays short and large functions can reuse space left by many small ones. Allocations
// are handed out as CodeAllocation values that own their range and return it on drop; a
// TranslatedFunction owns exactly one, so dropping the last Arc to a function (after it has
// left the cache and the deferred-deletion queue) is what releases its code.

//! Executable memory arena.

use crate::core::error::{JitError, JitResult};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of every allocation.
pub const CODE_ALIGNMENT: usize = 16;

#[derive(Debug, Default)]
struct ArenaState {
    /// Free `(offset, size)` ranges, sorted by offset and never adjacent.
    free: Vec<(usize, usize)>,
    live_allocations: usize,
    live_bytes: usize,
}

/// A fixed-size RWX mapping for generated code.
pub struct ExecutableArena {
    base: NonNull<u8>,
    capacity: usize,
    state: Mutex<ArenaState>,
}

// The mapping is only written under the state lock, to ranges owned by a single allocation.
unsafe impl Send for ExecutableArena {}
unsafe impl Sync for ExecutableArena {}

impl ExecutableArena {
    /// Reserve `capacity` bytes (rounded up to the page size) of RWX memory.
    pub fn new(capacity: usize) -> JitResult<Arc<Self>> {
        let page = page_size();
        let capacity = capacity.max(page).div_ceil(page) * page;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::ExecutableMapping(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| JitError::ExecutableMapping(std::io::Error::last_os_error()))?;
        log::debug!("Reserved {capacity} bytes of executable memory at {:p}", base);

        Ok(Arc::new(Self {
            base,
            capacity,
            state: Mutex::new(ArenaState {
                free: vec![(0, capacity)],
                ..ArenaState::default()
            }),
        }))
    }

    /// Copy `code` into a fresh range.
    pub fn allocate(self: &Arc<Self>, code: &[u8]) -> JitResult<CodeAllocation> {
        let size = code.len().max(1).div_ceil(CODE_ALIGNMENT) * CODE_ALIGNMENT;
        let mut state = self.state.lock();

        let Some(index) = state.free.iter().position(|&(_, len)| len >= size) else {
            let available = state.free.iter().map(|&(_, len)| len).max().unwrap_or(0);
            return Err(JitError::ArenaExhausted {
                requested: size,
                available,
            });
        };

        let (offset, len) = state.free[index];
        if len == size {
            state.free.remove(index);
        } else {
            state.free[index] = (offset + size, len - size);
        }
        state.live_allocations += 1;
        state.live_bytes += size;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.base.as_ptr().add(offset), code.len());
        }
        drop(state);

        Ok(CodeAllocation {
            arena: self.clone(),
            offset,
            size,
        })
    }

    fn release(&self, offset: usize, size: usize) {
        let mut state = self.state.lock();
        let index = state.free.partition_point(|&(start, _)| start < offset);
        state.free.insert(index, (offset, size));

        // Merge with the following range, then with the preceding one.
        if index + 1 < state.free.len() {
            let (next_start, next_len) = state.free[index + 1];
            if offset + size == next_start {
                state.free[index].1 += next_len;
                state.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = state.free[index - 1];
            if prev_start + prev_len == offset {
                state.free[index - 1].1 += state.free[index].1;
                state.free.remove(index);
            }
        }

        state.live_allocations -= 1;
        state.live_bytes -= size;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base_address(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live_allocations
    }

    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    /// Number of disjoint free ranges.
    pub fn free_ranges(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn largest_free(&self) -> usize {
        let state = self.state.lock();
        state.free.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }
}

impl Drop for ExecutableArena {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity) };
        if rc != 0 {
            log::error!(
                "munmap of executable arena failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl std::fmt::Debug for ExecutableArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableArena")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A range of the arena holding one piece of generated code. Returned to the free list on drop.
#[derive(Debug)]
pub struct CodeAllocation {
    arena: Arc<ExecutableArena>,
    offset: usize,
    size: usize,
}

impl CodeAllocation {
    pub fn host_address(&self) -> u64 {
        self.arena.base_address() + self.offset as u64
    }

    /// Size of the range, including alignment padding.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.host_address() as *const u8, self.size) }
    }
}

impl Drop for CodeAllocation {
    fn drop(&mut self) {
        self.arena.release(self.offset, self.size);
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
