//! Full userdata: an opaque host payload with its own metatable

use std::any::Any;
use std::fmt;

use parking_lot::Mutex;

use crate::table::TableHandle;

/// Host payload stored inside the VM
pub struct UserData {
    payload: Box<dyn Any + Send + Sync>,
    metatable: Mutex<Option<TableHandle>>,
}

impl UserData {
    /// Wrap a payload
    pub fn new(payload: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            payload,
            metatable: Mutex::new(None),
        }
    }

    /// The payload
    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        self.payload.as_ref()
    }

    /// Typed view of the payload
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Metatable, if any
    pub fn metatable(&self) -> Option<TableHandle> {
        self.metatable.lock().clone()
    }

    /// Replace the metatable
    pub fn set_metatable(&self, mt: Option<TableHandle>) {
        *self.metatable.lock() = mt;
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("has_metatable", &self.metatable.lock().is_some())
            .finish()
    }
}
