//! liblxc backed engine implementation.
//!
//! All calls go through the method table of `struct lxc_container`; the
//! handle owns one reference obtained from `lxc_container_new` and gives
//! it back in `release`.

use std::ffi::{CStr, CString};
use std::path::Path;

use super::{Engine, EngineError, EngineHandle, EngineState, EngineVersion};

pub struct LxcEngine;

impl LxcEngine {
    pub fn new() -> Self {
        LxcEngine
    }
}

impl Default for LxcEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn cstring(s: &str) -> CString {
    // Keys, values and paths never contain interior NUL bytes; they come
    // from validated UTF-8 configuration.
    CString::new(s).unwrap_or_default()
}

fn path_cstring(path: &Path) -> CString {
    cstring(&path.to_string_lossy())
}

impl Engine for LxcEngine {
    fn version(&self) -> Result<EngineVersion, EngineError> {
        let raw = unsafe { lxc_sys::lxc_get_version() };
        if raw.is_null() {
            return Err(EngineError::InvalidVersion {
                version: String::new(),
            });
        }
        let version = unsafe { CStr::from_ptr(raw) }.to_string_lossy();
        version.parse()
    }

    fn supports_config_item(&self, key: &str) -> bool {
        let key = cstring(key);
        unsafe { lxc_sys::lxc_config_item_is_supported(key.as_ptr()) }
    }

    fn new_handle(&self, name: &str, lxcpath: &Path) -> Result<Box<dyn EngineHandle>, EngineError> {
        let c_name = cstring(name);
        let c_path = path_cstring(lxcpath);
        let raw = unsafe { lxc_sys::lxc_container_new(c_name.as_ptr(), c_path.as_ptr()) };
        if raw.is_null() {
            return Err(EngineError::NewContainer {
                name: name.to_string(),
            });
        }
        Ok(Box::new(LxcHandle { raw }))
    }
}

pub struct LxcHandle {
    raw: *mut lxc_sys::lxc_container,
}

// The handle is only used from one thread at a time; liblxc containers
// may be moved between threads.
unsafe impl Send for LxcHandle {}

impl std::fmt::Debug for LxcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LxcHandle").field("raw", &self.raw).finish()
    }
}

impl LxcHandle {
    fn with_container<T>(&self, f: impl FnOnce(&lxc_sys::lxc_container) -> T) -> T {
        f(unsafe { &*self.raw })
    }
}

impl EngineHandle for LxcHandle {
    fn set_config_item(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        let c_key = cstring(key);
        let c_value = cstring(value);
        let ok = self.with_container(|c| {
            let set = c.set_config_item.expect("liblxc without set_config_item");
            unsafe { set(self.raw, c_key.as_ptr(), c_value.as_ptr()) }
        });
        if ok {
            Ok(())
        } else {
            Err(EngineError::SetConfigItem {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }

    fn get_config_item(&self, key: &str) -> Option<String> {
        let c_key = cstring(key);
        self.with_container(|c| {
            let get = c.get_config_item?;
            let len = unsafe { get(self.raw, c_key.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return None;
            }
            let mut buf = vec![0u8; len as usize + 1];
            let written =
                unsafe { get(self.raw, c_key.as_ptr(), buf.as_mut_ptr().cast(), len + 1) };
            if written < 0 {
                return None;
            }
            buf.truncate(written as usize);
            let value = String::from_utf8_lossy(&buf).into_owned();
            // unset values surface as "(null)" for some keys
            if value.is_empty() || value == "(null)" {
                None
            } else {
                Some(value)
            }
        })
    }

    fn save_config(&mut self, path: &Path) -> Result<(), EngineError> {
        let c_path = path_cstring(path);
        let ok = self.with_container(|c| {
            let save = c.save_config.expect("liblxc without save_config");
            unsafe { save(self.raw, c_path.as_ptr()) }
        });
        if ok {
            Ok(())
        } else {
            Err(EngineError::SaveConfig {
                path: path.to_path_buf(),
            })
        }
    }

    fn load_config(&mut self, path: &Path) -> Result<(), EngineError> {
        let c_path = path_cstring(path);
        let ok = self.with_container(|c| {
            let load = c.load_config.expect("liblxc without load_config");
            unsafe { load(self.raw, c_path.as_ptr()) }
        });
        if ok {
            Ok(())
        } else {
            Err(EngineError::LoadConfig {
                path: path.to_path_buf(),
            })
        }
    }

    fn state(&self) -> Result<EngineState, EngineError> {
        let raw_state = self.with_container(|c| {
            let state = c.state.expect("liblxc without state");
            unsafe { state(self.raw) }
        });
        if raw_state.is_null() {
            return Err(EngineError::UnsupportedState {
                state: String::new(),
            });
        }
        unsafe { CStr::from_ptr(raw_state) }
            .to_string_lossy()
            .parse()
    }

    fn init_pid(&self) -> Option<i32> {
        let pid = self.with_container(|c| {
            let init_pid = c.init_pid?;
            Some(unsafe { init_pid(self.raw) })
        })?;
        (pid > 0).then_some(pid)
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        let ok = self.with_container(|c| {
            let destroy = c.destroy.expect("liblxc without destroy");
            unsafe { destroy(self.raw) }
        });
        if ok {
            Ok(())
        } else {
            Err(EngineError::Destroy)
        }
    }

    fn release(self: Box<Self>) -> Result<(), EngineError> {
        unsafe { lxc_sys::lxc_container_put(self.raw) };
        Ok(())
    }
}
