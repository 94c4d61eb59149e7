//! Allocator registry: which allocator produced which child object.
//!
//! Some native calls that release objects (`vkFreeCommandBuffers`, for one)
//! take no `pAllocator`, yet the shim-side wrappers they release were
//! allocated through the caller's callbacks. The registry remembers those
//! callbacks per handle. Entries are themselves allocated through the
//! allocator they record, so the bookkeeping shows up in the caller's own
//! accounting under the scope of the object.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use ash::vk;
use tracing::warn;

use crate::allocator::Allocator;
use crate::error::ShimError;

struct Entry {
    allocator: Allocator,
    refcount: u32,
}

/// An entry allocated ahead of its handle. It must be handed to
/// [`AllocatorRegistry::insert`] or [`AllocatorRegistry::discard`].
#[must_use]
pub struct PendingEntry {
    entry: NonNull<Entry>,
}

impl PendingEntry {
    /// The snapshot record. Its address stays fixed until the entry is freed.
    pub fn allocator(&self) -> &Allocator {
        // SAFETY: the entry is alive until inserted or discarded.
        unsafe { &self.entry.as_ref().allocator }
    }
}

/// Refcounted map from raw handle value to allocator snapshot.
///
/// Not synchronized: callers follow Vulkan's external synchronization rules
/// for the owning device.
#[derive(Default)]
pub struct AllocatorRegistry {
    entries: BTreeMap<u64, NonNull<Entry>>,
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Allocate an entry through `allocator` itself and snapshot it, before
    /// the handle it will be keyed by exists.
    ///
    /// # Safety
    /// Custom callbacks in `allocator` must be valid to invoke.
    pub unsafe fn prepare(
        &self,
        allocator: &Allocator,
        scope: vk::SystemAllocationScope,
    ) -> Result<PendingEntry, ShimError> {
        let entry = allocator.create(
            Entry {
                allocator: *allocator,
                refcount: 0,
            },
            scope,
        )?;
        Ok(PendingEntry { entry })
    }

    /// Key a prepared entry by `handle`. If the handle is already known the
    /// prepared entry is freed and the existing one gains a reference.
    ///
    /// # Safety
    /// `pending` must come from this registry's [`AllocatorRegistry::prepare`].
    pub unsafe fn insert(&mut self, handle: u64, pending: PendingEntry) {
        match self.entries.get(&handle) {
            Some(existing) => {
                (*existing.as_ptr()).refcount += 1;
                self.discard(pending);
            }
            None => {
                (*pending.entry.as_ptr()).refcount = 1;
                self.entries.insert(handle, pending.entry);
            }
        }
    }

    /// Free a prepared entry that never got a handle.
    ///
    /// # Safety
    /// `pending` must come from this registry's [`AllocatorRegistry::prepare`].
    pub unsafe fn discard(&self, pending: PendingEntry) {
        free_entry(pending.entry);
    }

    /// Record `allocator` for `handle`, or add a reference if the handle is
    /// already registered.
    ///
    /// On failure nothing is recorded; the caller must undo the native
    /// creation it was pairing this with.
    ///
    /// # Safety
    /// Custom callbacks in `allocator` must be valid to invoke.
    pub unsafe fn register(
        &mut self,
        handle: u64,
        allocator: &Allocator,
        scope: vk::SystemAllocationScope,
    ) -> Result<(), ShimError> {
        if let Some(existing) = self.entries.get(&handle) {
            (*existing.as_ptr()).refcount += 1;
            return Ok(());
        }
        let pending = self.prepare(allocator, scope)?;
        self.insert(handle, pending);
        Ok(())
    }

    /// Drop one reference; the last one frees the entry with the allocator
    /// recorded at registration.
    ///
    /// Every `release` must pair with an earlier `register`.
    ///
    /// # Safety
    /// The recorded allocator's callbacks must still be valid to invoke.
    pub unsafe fn release(&mut self, handle: u64) {
        let entry = self.entries.get(&handle).copied();
        debug_assert!(entry.is_some(), "release of unregistered handle {handle:#x}");
        let Some(entry) = entry else {
            warn!("release of unregistered handle {:#x}", handle);
            return;
        };

        let refcount = &mut (*entry.as_ptr()).refcount;
        *refcount -= 1;
        if *refcount == 0 {
            self.entries.remove(&handle);
            free_entry(entry);
        }
    }

    pub fn get(&self, handle: u64) -> Option<&Allocator> {
        // SAFETY: entries in the map are alive.
        self.entries
            .get(&handle)
            .map(|entry| unsafe { &entry.as_ref().allocator })
    }

    pub fn refcount(&self, handle: u64) -> Option<u32> {
        // SAFETY: entries in the map are alive.
        self.entries
            .get(&handle)
            .map(|entry| unsafe { entry.as_ref().refcount })
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for AllocatorRegistry {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(count = self.entries.len(), "freeing leaked allocator registry entries");
        }
        for (_, entry) in std::mem::take(&mut self.entries) {
            // SAFETY: the recorded allocators outlive the owning device.
            unsafe { free_entry(entry) };
        }
    }
}

unsafe fn free_entry(entry: NonNull<Entry>) {
    let allocator = (*entry.as_ptr()).allocator;
    allocator.destroy(entry);
}
