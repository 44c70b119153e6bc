//! Scratch space shared by the steps of one build.

use crate::cancel::CancellationToken;
use crate::component::{BuildContext, Cache, Communicator, Hook, Ui};
use crate::{PluginError, Result};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Well-known state bag keys.
pub mod keys {
    pub const CONFIG: &str = "config";
    pub const UI: &str = "ui";
    pub const HOOK: &str = "hook";
    pub const CACHE: &str = "cache";
    pub const CANCEL: &str = "cancel";
    pub const INSTANCE: &str = "instance";
    pub const COMMUNICATOR: &str = "communicator";
    pub const GENERATED_DATA: &str = "generated_data";
    pub const ERROR: &str = "error";
}

/// String-keyed values of any type, with typed accessors that fail with
/// [`PluginError::State`] instead of panicking on a wrong type.
#[derive(Default)]
pub struct StateBag {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    cancelled: bool,
    halted: bool,
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("StateBag")
            .field("keys", &keys)
            .field("cancelled", &self.cancelled)
            .field("halted", &self.halted)
            .finish()
    }
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag holding the Ui, Hook, Cache and cancellation token of a run.
    pub fn from_context(ctx: &BuildContext) -> Self {
        let mut state = Self::new();
        state.put(keys::UI, ctx.ui.clone());
        state.put(keys::HOOK, ctx.hook.clone());
        state.put(keys::CACHE, ctx.cache.clone());
        state.put(keys::CANCEL, ctx.cancel.clone());
        state
    }

    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// The value under `key`, if present and of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut()
    }

    /// Like [`get`](Self::get), but say what is wrong when it fails.
    pub fn require<T: Any>(&self, key: &str) -> Result<&T> {
        match self.values.get(key) {
            None => Err(PluginError::State {
                key: key.to_string(),
                message: "missing".to_string(),
            }),
            Some(value) => value.downcast_ref().ok_or_else(|| PluginError::State {
                key: key.to_string(),
                message: format!("is not a {}", type_name::<T>()),
            }),
        }
    }

    /// Remove and return the value under `key` if it has type `T`; a value
    /// of another type stays in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key)?.is::<T>() {
            return None;
        }
        let value = self.values.remove(key)?;
        value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn ui(&self) -> Result<Arc<dyn Ui>> {
        self.require::<Arc<dyn Ui>>(keys::UI).cloned()
    }

    pub fn hook(&self) -> Result<Arc<dyn Hook>> {
        self.require::<Arc<dyn Hook>>(keys::HOOK).cloned()
    }

    pub fn cache(&self) -> Result<Arc<dyn Cache>> {
        self.require::<Arc<dyn Cache>>(keys::CACHE).cloned()
    }

    pub fn communicator(&self) -> Option<Arc<dyn Communicator>> {
        self.get::<Arc<dyn Communicator>>(keys::COMMUNICATOR).cloned()
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.get::<CancellationToken>(keys::CANCEL).cloned()
    }

    /// Record the error that halted the build.
    pub fn set_error(&mut self, error: PluginError) {
        self.put(keys::ERROR, error);
    }

    pub fn error(&self) -> Option<&PluginError> {
        self.get(keys::ERROR)
    }

    pub fn take_error(&mut self) -> Option<PluginError> {
        self.remove(keys::ERROR)
    }

    /// Whether the run stopped because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether a step returned `Halt`.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub(crate) fn mark_halted(&mut self) {
        self.halted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RecordingUi;

    #[derive(Debug, PartialEq)]
    struct Instance {
        id: String,
    }

    #[test]
    fn test_typed_access() {
        let mut state = StateBag::new();
        state.put(keys::INSTANCE, Instance { id: "i-123".into() });

        assert_eq!(state.get::<Instance>(keys::INSTANCE).unwrap().id, "i-123");
        assert!(state.get::<String>(keys::INSTANCE).is_none());
        assert!(state.get::<Instance>("other").is_none());

        state.get_mut::<Instance>(keys::INSTANCE).unwrap().id = "i-456".into();
        assert_eq!(state.require::<Instance>(keys::INSTANCE).unwrap().id, "i-456");
    }

    #[test]
    fn test_require_explains_failures() {
        let mut state = StateBag::new();
        state.put("count", 3u32);

        match state.require::<String>("count") {
            Err(PluginError::State { key, message }) => {
                assert_eq!(key, "count");
                assert!(message.contains("String"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match state.require::<u32>("missing") {
            Err(PluginError::State { message, .. }) => assert_eq!(message, "missing"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_remove_keeps_wrong_type() {
        let mut state = StateBag::new();
        state.put("count", 3u32);
        assert_eq!(state.remove::<String>("count"), None);
        assert!(state.contains("count"));
        assert_eq!(state.remove::<u32>("count"), Some(3));
        assert!(!state.contains("count"));
    }

    #[test]
    fn test_error_and_ui_helpers() {
        let mut state = StateBag::new();
        assert!(state.ui().is_err());
        state.put(keys::UI, Arc::new(RecordingUi::new()) as Arc<dyn Ui>);
        assert!(state.ui().is_ok());

        assert!(state.error().is_none());
        state.set_error(PluginError::Other("boom".into()));
        assert_eq!(state.error().unwrap().to_string(), "boom");
        assert!(state.take_error().is_some());
        assert!(state.error().is_none());
    }
}
