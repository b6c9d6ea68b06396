//! Lifecycle hooks around watched process operations.
//!
//! The registry owns the installed hooks. Each wrapper runs the real operation
//! first (except `exit`, which notifies before delegating) and hands the
//! outcome back unchanged; hooks only ever observe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

use crate::process::MappedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedOp {
    Fork,
    Vfork,
    Clone,
    Execve,
    Mmap,
    OldMmap,
    InitModule,
    Exit,
}

impl WatchedOp {
    pub const ALL: [WatchedOp; 8] = [
        WatchedOp::Fork,
        WatchedOp::Vfork,
        WatchedOp::Clone,
        WatchedOp::Execve,
        WatchedOp::Mmap,
        WatchedOp::OldMmap,
        WatchedOp::InitModule,
        WatchedOp::Exit,
    ];

    pub const fn creates_process(self) -> bool {
        matches!(self, WatchedOp::Fork | WatchedOp::Vfork | WatchedOp::Clone)
    }

    pub const fn maps_memory(self) -> bool {
        matches!(self, WatchedOp::Mmap | WatchedOp::OldMmap)
    }
}

/// Arguments of a memory-map call that matter to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapRequest {
    pub len: u64,
    /// `PROT_*` bits.
    pub prot: i32,
    pub offset: u64,
    pub file: Option<MappedFile>,
}

impl MmapRequest {
    pub fn is_executable(&self) -> bool {
        self.prot & libc::PROT_EXEC != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a> {
    Created {
        op: WatchedOp,
        parent: u32,
        child: u32,
    },
    Replaced {
        pid: u32,
    },
    Mapped {
        op: WatchedOp,
        pid: u32,
        addr: u64,
        request: &'a MmapRequest,
    },
    ModuleLoaded,
    Exiting {
        pid: u32,
        code: i32,
    },
}

impl LifecycleEvent<'_> {
    pub fn op(&self) -> WatchedOp {
        match self {
            LifecycleEvent::Created { op, .. } | LifecycleEvent::Mapped { op, .. } => *op,
            LifecycleEvent::Replaced { .. } => WatchedOp::Execve,
            LifecycleEvent::ModuleLoaded => WatchedOp::InitModule,
            LifecycleEvent::Exiting { .. } => WatchedOp::Exit,
        }
    }
}

pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_event(&self, event: &LifecycleEvent<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Installed {
    id: HookId,
    ops: Vec<WatchedOp>,
    hook: Arc<dyn LifecycleHook>,
}

pub struct HookRegistry {
    hooks: RwLock<Vec<Installed>>,
    next_id: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn install(&self, hook: Arc<dyn LifecycleHook>, ops: &[WatchedOp]) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("installing hook '{}' on {:?}", hook.name(), ops);
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Installed {
                id,
                ops: ops.to_vec(),
                hook,
            });
        id
    }

    pub fn install_all(&self, hook: Arc<dyn LifecycleHook>) -> HookId {
        self.install(hook, &WatchedOp::ALL)
    }

    /// Returns false if `id` was not installed.
    pub fn uninstall(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|h| {
            if h.id == id {
                info!("uninstalling hook '{}'", h.hook.name());
            }
            h.id != id
        });
        hooks.len() != before
    }

    pub fn is_watched(&self, op: WatchedOp) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|h| h.ops.contains(&op))
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: &LifecycleEvent<'_>) {
        let op = event.op();
        let targets: Vec<Arc<dyn LifecycleHook>> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.ops.contains(&op))
            .map(|h| Arc::clone(&h.hook))
            .collect();
        for hook in targets {
            hook.on_event(event);
        }
    }

    /// Process creation. Hooks see the event only when `create` succeeds with
    /// a nonzero child id.
    pub fn fork<E>(
        &self,
        op: WatchedOp,
        caller: u32,
        create: impl FnOnce() -> Result<u32, E>,
    ) -> Result<u32, E> {
        debug_assert!(op.creates_process(), "{op:?} does not create a process");
        let result = create();
        if let Ok(child) = &result
            && *child != 0
        {
            self.notify(&LifecycleEvent::Created {
                op,
                parent: caller,
                child: *child,
            });
        }
        result
    }

    pub fn execve<T, E>(&self, pid: u32, exec: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let result = exec();
        if result.is_ok() {
            self.notify(&LifecycleEvent::Replaced { pid });
        }
        result
    }

    /// Memory map. Hooks see only successful mappings with executable
    /// protection.
    pub fn mmap<E>(
        &self,
        op: WatchedOp,
        pid: u32,
        request: &MmapRequest,
        map: impl FnOnce() -> Result<u64, E>,
    ) -> Result<u64, E> {
        debug_assert!(op.maps_memory(), "{op:?} does not map memory");
        let result = map();
        if let Ok(addr) = &result
            && request.is_executable()
        {
            self.notify(&LifecycleEvent::Mapped {
                op,
                pid,
                addr: *addr,
                request,
            });
        }
        result
    }

    pub fn init_module<T, E>(&self, load: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let result = load();
        if result.is_ok() {
            self.notify(&LifecycleEvent::ModuleLoaded);
        }
        result
    }

    /// Process exit. Hooks run before `exit` is delegated to, since it may not
    /// return.
    pub fn exit<R>(&self, pid: u32, code: i32, exit: impl FnOnce(i32) -> R) -> R {
        self.notify(&LifecycleEvent::Exiting { pid, code });
        exit(code)
    }
}
