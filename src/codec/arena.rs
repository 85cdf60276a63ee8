//! Boundary Arena
//!
//! Besitzt den Speicher, in den Host-Daten vor einem Foreign Call kopiert
//! werden. Jede ausgehende Operation marshalt in einen eigenen
//! [`MarshalFrame`], der alle Allokationen bis nach dem Foreign Call am
//! Leben hält.

use super::marshal::CodecError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

// ============================================================================
// POLICY
// ============================================================================

/// Was mit dem Speicher eines Frames passiert, wenn er gedroppt wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArenaPolicy {
    /// Speicher wird nach dem Foreign Call freigegeben
    #[default]
    Release,
    /// Speicher bleibt bis zum Shutdown in der Arena
    Retain,
}

// ============================================================================
// ALLOCATION
// ============================================================================

struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Die Allokation gehört exklusiv dem Frame bzw. der Arena
unsafe impl Send for Allocation {}

impl Drop for Allocation {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// ============================================================================
// ARENA
// ============================================================================

#[derive(Default)]
struct ArenaInner {
    live_bytes: usize,
    retained: Vec<Allocation>,
    retained_bytes: usize,
}

struct ArenaShared {
    policy: ArenaPolicy,
    limit: Option<usize>,
    inner: Mutex<ArenaInner>,
}

/// Scoped Memory Arena der Engine
#[derive(Clone)]
pub struct BoundaryArena {
    shared: Arc<ArenaShared>,
}

impl BoundaryArena {
    /// Erstellt eine neue Arena mit optionalem Byte-Limit
    pub fn new(policy: ArenaPolicy, limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(ArenaShared {
                policy,
                limit,
                inner: Mutex::new(ArenaInner::default()),
            }),
        }
    }

    /// Öffnet einen neuen Frame für eine einzelne Operation
    pub fn frame(&self) -> MarshalFrame {
        MarshalFrame {
            shared: Arc::clone(&self.shared),
            allocations: Vec::new(),
            bytes: 0,
        }
    }

    pub fn policy(&self) -> ArenaPolicy {
        self.shared.policy
    }

    /// Bytes, die aktuell von Frames oder der Arena gehalten werden
    pub fn live_bytes(&self) -> usize {
        self.shared.inner.lock().live_bytes
    }

    /// Bytes, die bis zum Shutdown zurückgehalten werden
    pub fn retained_bytes(&self) -> usize {
        self.shared.inner.lock().retained_bytes
    }

    /// Gibt alle zurückgehaltenen Allokationen frei
    ///
    /// Gibt die Anzahl freigegebener Bytes zurück.
    pub fn release_retained(&self) -> usize {
        let released = {
            let mut inner = self.shared.inner.lock();
            let bytes = inner.retained_bytes;
            inner.live_bytes -= bytes;
            inner.retained_bytes = 0;
            std::mem::take(&mut inner.retained)
        };
        let bytes: usize = released.iter().map(|a| a.layout.size()).sum();
        drop(released);
        bytes
    }
}

impl std::fmt::Debug for BoundaryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("BoundaryArena")
            .field("policy", &self.shared.policy)
            .field("limit", &self.shared.limit)
            .field("live_bytes", &inner.live_bytes)
            .field("retained_bytes", &inner.retained_bytes)
            .finish()
    }
}

// ============================================================================
// MARSHAL FRAME
// ============================================================================

/// Allokationen einer einzelnen Operation
///
/// Muss mindestens bis zur Rückkehr des Foreign Calls leben.
pub struct MarshalFrame {
    shared: Arc<ArenaShared>,
    allocations: Vec<Allocation>,
    bytes: usize,
}

impl MarshalFrame {
    /// Alloziert `size` genullte Bytes mit dem angegebenen Alignment
    pub fn alloc_zeroed(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, CodecError> {
        if size == 0 {
            return Ok(NonNull::dangling());
        }

        let layout = Layout::from_size_align(size, align).map_err(|e| {
            CodecError::AllocationFailure {
                requested: size,
                reason: e.to_string(),
            }
        })?;

        self.reserve(size)?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.unreserve(size);
            return Err(CodecError::AllocationFailure {
                requested: size,
                reason: "system allocator returned null".to_string(),
            });
        };

        self.allocations.push(Allocation { ptr, layout });
        self.bytes += size;
        Ok(ptr)
    }

    /// Kopiert `bytes` in boundary-owned Memory
    ///
    /// Leere Buffer ergeben einen null pointer.
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> Result<*const u8, CodecError> {
        if bytes.is_empty() {
            return Ok(std::ptr::null());
        }
        let ptr = self.alloc_zeroed(bytes.len(), 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        Ok(ptr.as_ptr() as *const u8)
    }

    /// Anzahl der in diesem Frame allozierten Bytes
    pub fn allocated_bytes(&self) -> usize {
        self.bytes
    }

    fn reserve(&self, size: usize) -> Result<(), CodecError> {
        let mut inner = self.shared.inner.lock();
        let next = inner.live_bytes.checked_add(size).ok_or_else(|| {
            CodecError::AllocationFailure {
                requested: size,
                reason: "arena size overflow".to_string(),
            }
        })?;
        if let Some(limit) = self.shared.limit {
            if next > limit {
                return Err(CodecError::AllocationFailure {
                    requested: size,
                    reason: format!("arena limit of {} bytes exceeded", limit),
                });
            }
        }
        inner.live_bytes = next;
        Ok(())
    }

    fn unreserve(&self, size: usize) {
        self.shared.inner.lock().live_bytes -= size;
    }
}

impl Drop for MarshalFrame {
    fn drop(&mut self) {
        if self.allocations.is_empty() {
            return;
        }
        let allocations = std::mem::take(&mut self.allocations);
        match self.shared.policy {
            ArenaPolicy::Release => {
                self.shared.inner.lock().live_bytes -= self.bytes;
                drop(allocations);
            }
            ArenaPolicy::Retain => {
                let mut inner = self.shared.inner.lock();
                inner.retained_bytes += self.bytes;
                inner.retained.extend(allocations);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
