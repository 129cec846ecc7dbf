//! Process-wide map from VM identity to its translator
//!
//! Native trampolines only carry the VM identity; they find the translator
//! that owns the VM here when the VM calls back into the host.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moonbridge_vm::VmId;
use once_cell::sync::Lazy;

use super::Translator;
use crate::error::{Error, Result};

static TRANSLATORS: Lazy<DashMap<VmId, Arc<Translator>>> = Lazy::new(DashMap::new);

/// Registry of live translators
pub struct TranslatorRegistry;

impl TranslatorRegistry {
    /// Register `translator` under its VM identity
    ///
    /// Fails with [`Error::AlreadyAttached`] if the identity is taken.
    pub fn register(translator: Arc<Translator>) -> Result<()> {
        let id = translator.id();
        match TRANSLATORS.entry(id) {
            Entry::Occupied(_) => Err(Error::AlreadyAttached(id)),
            Entry::Vacant(slot) => {
                slot.insert(translator);
                tracing::debug!(vm = %id, "translator registered");
                Ok(())
            }
        }
    }

    /// Translator registered for `id`
    pub fn find(id: VmId) -> Option<Arc<Translator>> {
        TRANSLATORS.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove and return the translator for `id`
    pub fn remove(id: VmId) -> Option<Arc<Translator>> {
        let removed = TRANSLATORS.remove(&id).map(|(_, t)| t);
        if removed.is_some() {
            tracing::debug!(vm = %id, "translator removed");
        }
        removed
    }

    /// Whether a translator is registered for `id`
    pub fn contains(id: VmId) -> bool {
        TRANSLATORS.contains_key(&id)
    }

    /// Number of registered translators
    pub fn len() -> usize {
        TRANSLATORS.len()
    }

    /// Whether no translator is registered
    pub fn is_empty() -> bool {
        TRANSLATORS.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use moonbridge_vm::VmState;

    #[test]
    fn test_register_find_remove() {
        let vm = VmState::new();
        let t = Translator::new(vm.clone(), Options::default());
        TranslatorRegistry::register(t.clone()).unwrap();
        assert!(TranslatorRegistry::contains(vm.id()));
        assert!(TranslatorRegistry::len() >= 1);

        let found = TranslatorRegistry::find(vm.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &t));

        assert!(TranslatorRegistry::remove(vm.id()).is_some());
        assert!(TranslatorRegistry::find(vm.id()).is_none());
        assert!(TranslatorRegistry::remove(vm.id()).is_none());
    }

    #[test]
    fn test_second_registration_fails() {
        let vm = VmState::new();
        let first = Translator::new(vm.clone(), Options::default());
        let second = Translator::new(vm.clone(), Options::default());
        TranslatorRegistry::register(first).unwrap();

        let err = TranslatorRegistry::register(second).unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(id) if id == vm.id()));
        TranslatorRegistry::remove(vm.id());
    }

    #[test]
    fn test_threads_share_identity() {
        let vm = VmState::new();
        let thread = vm.new_thread().unwrap();
        let t = Translator::new(vm.clone(), Options::default());
        TranslatorRegistry::register(t).unwrap();
        assert!(TranslatorRegistry::find(thread.id()).is_some());
        TranslatorRegistry::remove(vm.id());
    }
}
