//! Process-wide, reference-counted NDI library lifetime.
//!
//! The first acquired runtime loads the SDK and calls
//! `NDIlib_initialize`; the last one dropped calls `NDIlib_destroy` and
//! unloads. Everything in between shares the resolved entry point table.

use std::sync::{Arc, Mutex};

use crate::ffi::NdiLib;
use crate::NdiError;

struct Registry {
    count: usize,
    lib: Option<Arc<NdiLib>>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    count: 0,
    lib: None,
});

/// A live reference to the initialized NDI runtime.
pub struct NdiRuntime {
    lib: Arc<NdiLib>,
}

impl NdiRuntime {
    /// Acquire the shared runtime, loading and initializing the SDK on
    /// the first call.
    pub fn acquire() -> Result<Self, NdiError> {
        let mut registry = REGISTRY.lock().unwrap();
        if let Some(lib) = registry.lib.clone() {
            registry.count += 1;
            return Ok(Self { lib });
        }

        let lib = Arc::new(NdiLib::load().map_err(NdiError::NotAvailable)?);
        // SAFETY: resolved entry points; initialize is the documented
        // first call into the SDK.
        unsafe {
            if !(lib.is_supported_cpu)() {
                return Err(NdiError::CpuUnsupported);
            }
            if !(lib.initialize)() {
                return Err(NdiError::InitFailed);
            }
        }
        tracing::info!("NDI runtime initialized, version: {}", version_of(&lib));

        registry.lib = Some(Arc::clone(&lib));
        registry.count = 1;
        Ok(Self { lib })
    }

    pub(crate) fn lib(&self) -> &NdiLib {
        &self.lib
    }

    /// SDK version string.
    #[must_use]
    pub fn version(&self) -> String {
        version_of(&self.lib)
    }
}

fn version_of(lib: &NdiLib) -> String {
    // SAFETY: version() returns a static NUL-terminated string.
    unsafe {
        let ptr = (lib.version)();
        if ptr.is_null() {
            return "unknown".into();
        }
        std::ffi::CStr::from_ptr(ptr)
            .to_string_lossy()
            .into_owned()
    }
}

impl Clone for NdiRuntime {
    fn clone(&self) -> Self {
        let mut registry = REGISTRY.lock().unwrap();
        registry.count += 1;
        Self {
            lib: Arc::clone(&self.lib),
        }
    }
}

impl Drop for NdiRuntime {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().unwrap();
        registry.count -= 1;
        if registry.count == 0 {
            // SAFETY: last reference; no instances remain.
            unsafe { (self.lib.destroy)() };
            registry.lib = None;
            tracing::info!("NDI runtime destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reports_missing_runtime_cleanly() {
        // With the SDK installed this hands back a live runtime; without
        // it the error must be NotAvailable, never a panic.
        match NdiRuntime::acquire() {
            Ok(runtime) => assert!(!runtime.version().is_empty()),
            Err(NdiError::NotAvailable(message)) => {
                assert!(message.contains("NDI"));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
