//! # Hook Lifecycle
//!
//! Attaches every hook of a descriptor set through an [`Instrumentation`]
//! backend and tears them down again.
//!
//! - `install` is fail-fast: the first error detaches the hooks attached so
//!   far (reverse order) and is returned as-is. There is no retry.
//! - `close` is idempotent and works on a partially populated set. Each slot
//!   only holds a link while attached, so nothing is detached twice.
//! - `release` drops the loaded programs and maps, once.

use log::{debug, info, warn};

use super::hooks::HookDescriptor;
use crate::domain::TracerError;

/// Loads and binds programs to kernel hook points
pub trait Instrumentation {
    /// Handle for one live attachment
    type Link;

    /// Load (if needed) and attach the program named by `hook`
    ///
    /// # Errors
    /// `ProgramLoad` when the program is missing or rejected by the verifier,
    /// `Attach` when the hook point cannot be bound.
    fn attach(&mut self, hook: &HookDescriptor) -> Result<Self::Link, TracerError>;

    /// Detach a link previously returned by [`Instrumentation::attach`]
    ///
    /// # Errors
    /// Returns an error if the kernel refuses the detach
    fn detach(&mut self, hook: &HookDescriptor, link: Self::Link) -> Result<(), TracerError>;

    /// Drop loaded programs and maps
    fn release(&mut self);
}

struct Slot<L> {
    hook: HookDescriptor,
    link: Option<L>,
}

/// Owns the attachments of one tracer instance
pub struct HookManager<I: Instrumentation> {
    backend: I,
    slots: Vec<Slot<I::Link>>,
    released: bool,
}

impl<I: Instrumentation> HookManager<I> {
    /// Attach all `hooks` in order.
    ///
    /// # Errors
    /// Returns the first load/attach error after rolling back the hooks that
    /// were already attached.
    pub fn install(backend: I, hooks: &[HookDescriptor]) -> Result<Self, TracerError> {
        let mut manager = Self {
            backend,
            slots: hooks.iter().map(|&hook| Slot { hook, link: None }).collect(),
            released: false,
        };

        for idx in 0..manager.slots.len() {
            let hook = manager.slots[idx].hook;
            match manager.backend.attach(&hook) {
                Ok(link) => {
                    manager.slots[idx].link = Some(link);
                    info!("✓ Attached {hook}");
                }
                Err(e) => {
                    warn!("Failed to attach {hook}, rolling back {idx} hooks: {e}");
                    manager.close();
                    return Err(e);
                }
            }
        }

        Ok(manager)
    }

    /// Number of live attachments
    pub fn attached(&self) -> usize {
        self.slots.iter().filter(|slot| slot.link.is_some()).count()
    }

    pub fn backend_mut(&mut self) -> &mut I {
        &mut self.backend
    }

    /// Detach every live attachment, newest first
    pub fn close(&mut self) {
        for slot in self.slots.iter_mut().rev() {
            let Some(link) = slot.link.take() else {
                continue;
            };
            match self.backend.detach(&slot.hook, link) {
                Ok(()) => debug!("Detached {}", slot.hook),
                Err(e) => warn!("Failed to detach {}: {e}", slot.hook),
            }
        }
    }

    /// Drop programs and maps; call after `close` and after the ring buffer is gone
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.backend.release();
        }
    }
}

impl<I: Instrumentation> Drop for HookManager<I> {
    fn drop(&mut self) {
        self.close();
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracer::hooks::{BIOLATENCY_HOOKS, BIOSNOOP_HOOKS};
    use std::sync::{Arc, Mutex};

    /// Records every backend call; optionally fails attaching one program
    #[derive(Clone, Default)]
    pub(crate) struct FakeInstrumentation {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<&'static str>,
    }

    impl FakeInstrumentation {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Instrumentation for FakeInstrumentation {
        type Link = &'static str;

        fn attach(&mut self, hook: &HookDescriptor) -> Result<Self::Link, TracerError> {
            if self.fail_on == Some(hook.program) {
                return Err(TracerError::Attach {
                    program: hook.program.to_string(),
                    hook: hook.point.to_string(),
                    error: "No such file or directory".to_string(),
                });
            }
            self.calls.lock().unwrap().push(format!("attach:{}", hook.program));
            Ok(hook.program)
        }

        fn detach(&mut self, _hook: &HookDescriptor, link: Self::Link) -> Result<(), TracerError> {
            self.calls.lock().unwrap().push(format!("detach:{link}"));
            Ok(())
        }

        fn release(&mut self) {
            self.calls.lock().unwrap().push("release".to_string());
        }
    }

    #[test]
    fn test_install_attaches_in_order() {
        let backend = FakeInstrumentation::default();
        let manager = HookManager::install(backend.clone(), BIOLATENCY_HOOKS).unwrap();
        assert_eq!(manager.attached(), 3);
        assert_eq!(
            backend.calls(),
            ["attach:block_rq_insert", "attach:block_rq_issue", "attach:block_rq_complete"]
        );
    }

    #[test]
    fn test_install_rolls_back_on_failure() {
        let backend =
            FakeInstrumentation { fail_on: Some("block_rq_complete"), ..Default::default() };
        let result = HookManager::install(backend.clone(), BIOSNOOP_HOOKS);
        assert!(matches!(result, Err(TracerError::Attach { .. })));
        assert_eq!(
            backend.calls(),
            [
                "attach:blk_account_io_merge_bio",
                "attach:blk_account_io_start",
                "detach:blk_account_io_start",
                "detach:blk_account_io_merge_bio",
                "release",
            ]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = FakeInstrumentation::default();
        let mut manager = HookManager::install(backend.clone(), BIOLATENCY_HOOKS).unwrap();
        manager.close();
        manager.close();
        manager.release();
        manager.release();
        assert_eq!(manager.attached(), 0);
        drop(manager);

        let calls = backend.calls();
        let detaches = calls.iter().filter(|c| c.starts_with("detach:")).count();
        let releases = calls.iter().filter(|c| *c == "release").count();
        assert_eq!(detaches, 3);
        assert_eq!(releases, 1);
        assert_eq!(calls[3], "detach:block_rq_complete");
    }

    #[test]
    fn test_drop_tears_down() {
        let backend = FakeInstrumentation::default();
        drop(HookManager::install(backend.clone(), BIOLATENCY_HOOKS).unwrap());
        assert_eq!(backend.calls().last().map(String::as_str), Some("release"));
        assert_eq!(backend.calls().len(), 7);
    }
}
