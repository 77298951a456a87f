//! NDI source discovery.

use std::ffi::CStr;

use crate::ffi::{NDIlib_find_create_t, NDIlib_find_instance_t, NDIlib_source_t};
use crate::{NdiError, NdiRuntime};

/// One discovered NDI source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdiSource {
    /// Full name, `MACHINE (source)` form.
    pub name: String,
    pub url: String,
    /// Host extracted from the URL, for display.
    pub ip: String,
}

/// Network source finder. Receivers are created against the raw source
/// list this finder holds, so it must outlive receiver creation.
pub struct NdiFinder {
    runtime: NdiRuntime,
    instance: NDIlib_find_instance_t,
}

// SAFETY: the finder instance is only used behind &self / &mut self from
// one thread at a time.
unsafe impl Send for NdiFinder {}

impl NdiFinder {
    pub fn new(runtime: NdiRuntime) -> Result<Self, NdiError> {
        let create = NDIlib_find_create_t::default();
        // SAFETY: create struct outlives the call.
        let instance = unsafe { (runtime.lib().find_create_v2)(&create) };
        if instance.is_null() {
            return Err(NdiError::CreateFailed("finder"));
        }
        Ok(Self { runtime, instance })
    }

    /// Wait up to `timeout_ms` for the source list to settle, then
    /// return a snapshot of the current sources.
    pub fn wait_for_sources(&self, timeout_ms: u32) -> Vec<NdiSource> {
        // SAFETY: valid instance; the returned array stays valid until
        // the next SDK call on this finder, and is copied out here.
        unsafe {
            (self.runtime.lib().find_wait_for_sources)(self.instance, timeout_ms);
            let mut count = 0u32;
            let sources =
                (self.runtime.lib().find_get_current_sources)(self.instance, &mut count);
            (0..count as usize)
                .map(|i| NdiSource::from_raw(&*sources.add(i)))
                .collect()
        }
    }

    /// Look up the raw descriptor for `name` in the finder's current
    /// list. The pointer members stay valid while the finder lives and
    /// no other finder call is made; `crate::NdiReceiver::connect` copies
    /// what it needs within that window.
    pub(crate) fn raw_source(&self, name: &str) -> Option<NDIlib_source_t> {
        // SAFETY: as in wait_for_sources.
        unsafe {
            let mut count = 0u32;
            let sources =
                (self.runtime.lib().find_get_current_sources)(self.instance, &mut count);
            for i in 0..count as usize {
                let source = &*sources.add(i);
                if !source.p_ndi_name.is_null()
                    && CStr::from_ptr(source.p_ndi_name).to_string_lossy() == name
                {
                    return Some(*source);
                }
            }
            None
        }
    }
}

impl NdiSource {
    pub(crate) unsafe fn from_raw(raw: &NDIlib_source_t) -> Self {
        let name = if raw.p_ndi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(raw.p_ndi_name).to_string_lossy().into_owned()
        };
        let url = if raw.p_url_address.is_null() {
            String::new()
        } else {
            CStr::from_ptr(raw.p_url_address)
                .to_string_lossy()
                .into_owned()
        };
        let ip = extract_host(&url);
        Self { name, url, ip }
    }
}

/// Pull the host out of `scheme://host:port/...` style URLs.
fn extract_host(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split([':', '/'])
        .next()
        .unwrap_or_default()
        .to_string()
}

impl Drop for NdiFinder {
    fn drop(&mut self) {
        // SAFETY: instance created in new(), destroyed exactly once.
        unsafe { (self.runtime.lib().find_destroy)(self.instance) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("http://10.0.0.5:5961/"), "10.0.0.5");
        assert_eq!(extract_host("10.0.0.5:5961"), "10.0.0.5");
        assert_eq!(extract_host(""), "");
    }
}
