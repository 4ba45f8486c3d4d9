//! A scriptable engine used by the test suite.
//!
//! The engine records every emitted config item and serves states and
//! init PIDs scripted by the test. `save_config` writes the recorded
//! items in the engine's `key = value` file format so that tests can
//! inspect the produced configuration.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{Engine, EngineError, EngineHandle, EngineState, EngineVersion};

#[derive(Debug, Default)]
struct Shared {
    state: Option<EngineState>,
    init_pid: Option<i32>,
    items: Vec<(String, String)>,
    unsupported_items: Vec<String>,
    reject_items: Vec<String>,
    released: bool,
    destroyed: bool,
}

/// Cloneable so a test can keep scripting the engine after handing it to
/// the runtime.
#[derive(Debug, Clone, Default)]
pub struct TestEngine {
    version: Option<EngineVersion>,
    shared: Arc<Mutex<Shared>>,
}

impl TestEngine {
    pub fn new() -> Self {
        TestEngine {
            version: Some(EngineVersion::new(4, 0, 12)),
            shared: Arc::default(),
        }
    }

    pub fn with_version(version: EngineVersion) -> Self {
        TestEngine {
            version: Some(version),
            ..TestEngine::new()
        }
    }

    pub fn set_state(&self, state: EngineState) {
        self.shared.lock().unwrap().state = Some(state);
    }

    pub fn set_init_pid(&self, pid: Option<i32>) {
        self.shared.lock().unwrap().init_pid = pid;
    }

    /// Marks a config key as unknown to the engine.
    pub fn mark_unsupported(&self, key: &str) {
        self.shared
            .lock()
            .unwrap()
            .unsupported_items
            .push(key.to_string());
    }

    /// Makes `set_config_item` fail for the given key.
    pub fn reject_item(&self, key: &str) {
        self.shared
            .lock()
            .unwrap()
            .reject_items
            .push(key.to_string());
    }

    pub fn items(&self) -> Vec<(String, String)> {
        self.shared.lock().unwrap().items.clone()
    }

    pub fn item(&self, key: &str) -> Option<String> {
        self.shared
            .lock()
            .unwrap()
            .items
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn released(&self) -> bool {
        self.shared.lock().unwrap().released
    }

    pub fn destroyed(&self) -> bool {
        self.shared.lock().unwrap().destroyed
    }
}

impl Engine for TestEngine {
    fn version(&self) -> Result<EngineVersion, EngineError> {
        self.version.ok_or(EngineError::InvalidVersion {
            version: "unscripted".to_string(),
        })
    }

    fn supports_config_item(&self, key: &str) -> bool {
        !self
            .shared
            .lock()
            .unwrap()
            .unsupported_items
            .iter()
            .any(|k| k == key)
    }

    fn new_handle(&self, _name: &str, _lxcpath: &Path) -> Result<Box<dyn EngineHandle>, EngineError> {
        Ok(Box::new(TestHandle {
            shared: self.shared.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct TestHandle {
    shared: Arc<Mutex<Shared>>,
}

impl EngineHandle for TestHandle {
    fn set_config_item(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.reject_items.iter().any(|k| k == key) {
            return Err(EngineError::SetConfigItem {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        shared.items.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn get_config_item(&self, key: &str) -> Option<String> {
        self.shared
            .lock()
            .unwrap()
            .items
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn save_config(&mut self, path: &Path) -> Result<(), EngineError> {
        let shared = self.shared.lock().unwrap();
        let mut file = std::fs::File::create(path).map_err(|_| EngineError::SaveConfig {
            path: path.to_path_buf(),
        })?;
        for (key, value) in &shared.items {
            writeln!(file, "{key} = {value}").map_err(|_| EngineError::SaveConfig {
                path: path.to_path_buf(),
            })?;
        }
        Ok(())
    }

    fn load_config(&mut self, path: &Path) -> Result<(), EngineError> {
        let content = std::fs::read_to_string(path).map_err(|_| EngineError::LoadConfig {
            path: path.to_path_buf(),
        })?;
        let mut shared = self.shared.lock().unwrap();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once('=') {
                shared
                    .items
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<EngineState, EngineError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .ok_or(EngineError::UnsupportedState {
                state: "unscripted".to_string(),
            })
    }

    fn init_pid(&self) -> Option<i32> {
        self.shared.lock().unwrap().init_pid
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        self.shared.lock().unwrap().destroyed = true;
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), EngineError> {
        self.shared.lock().unwrap().released = true;
        Ok(())
    }
}
