//! Userdata proxies

use std::any::Any;
use std::fmt;

use moonbridge_vm::Value;

use crate::error::Result;
use crate::reference::{RefKind, Reference};
use crate::table::TableRef;
use crate::value::{HostValue, IntoHost};

/// Handle to a full userdata living in the VM
#[derive(Clone, PartialEq)]
pub struct UserDataRef(Reference);

impl UserDataRef {
    pub(crate) fn from_reference(reference: Reference) -> Self {
        UserDataRef(reference)
    }

    /// Underlying reference
    pub fn reference(&self) -> &Reference {
        &self.0
    }

    /// Whether the userdata can still be reached
    pub fn is_available(&self) -> bool {
        self.0.is_available()
    }

    /// Release the userdata now
    pub fn dispose(&self) {
        self.0.dispose()
    }

    /// Run `f` on the payload if it is a `T`
    pub fn with_payload<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0
            .with_pushed(|vm, index| {
                Ok(vm
                    .to_userdata(index)
                    .and_then(|ud| ud.downcast_ref::<T>().map(f)))
            })
            .and_then(|r| r.ok())
            .flatten()
    }

    /// `u[key]` through the `__index` metamethod
    pub fn get(&self, key: impl IntoHost) -> Result<HostValue> {
        let key = key.into_host();
        let translator = self.0.translator();
        self.0
            .with_pushed(|vm, index| {
                translator.push(vm, &key)?;
                vm.get_table(index)?;
                translator.get(vm, -1)
            })
            .unwrap_or(Ok(HostValue::Nil))
    }

    /// `u[key] = value` through the `__newindex` metamethod
    pub fn set(&self, key: impl IntoHost, value: impl IntoHost) -> Result<()> {
        let (key, value) = (key.into_host(), value.into_host());
        let translator = self.0.translator();
        self.0
            .with_pushed(|vm, index| {
                translator.push(vm, &key)?;
                translator.push(vm, &value)?;
                vm.set_table(index)?;
                Ok(())
            })
            .unwrap_or(Ok(()))
    }

    /// The userdata's metatable
    pub fn metatable(&self) -> Result<Option<TableRef>> {
        let translator = self.0.translator();
        self.0
            .with_pushed(|vm, index| {
                if !vm.get_metatable(index)? {
                    return Ok(None);
                }
                let r = translator.acquire(vm, -1, RefKind::Table)?;
                Ok(Some(TableRef::from_reference(r)))
            })
            .unwrap_or(Ok(None))
    }

    /// Replace (or with `None`, remove) the metatable
    pub fn set_metatable(&self, metatable: Option<&TableRef>) -> Result<()> {
        self.0
            .with_pushed(|vm, index| {
                match metatable {
                    Some(mt) => mt.reference().push(vm)?,
                    None => vm.push_nil()?,
                }
                vm.set_metatable(index)?;
                Ok(())
            })
            .unwrap_or(Ok(()))
    }

    /// The VM's string form of the userdata
    pub fn to_display_string(&self) -> String {
        self.0.to_display_string()
    }
}

impl fmt::Debug for UserDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserDataRef({})", self.0.slot())
    }
}

impl fmt::Display for UserDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

/// Handle to a light userdata token
#[derive(Clone, PartialEq)]
pub struct LightUserDataRef(Reference);

impl LightUserDataRef {
    pub(crate) fn from_reference(reference: Reference) -> Self {
        LightUserDataRef(reference)
    }

    /// Underlying reference
    pub fn reference(&self) -> &Reference {
        &self.0
    }

    /// Whether the token can still be read
    pub fn is_available(&self) -> bool {
        self.0.is_available()
    }

    /// Release the slot now
    pub fn dispose(&self) {
        self.0.dispose()
    }

    /// Token value
    pub fn token(&self) -> Option<usize> {
        self.0
            .with_pushed(|vm, index| {
                Ok(match vm.value_at(index) {
                    Value::LightUserData(p) => Some(p),
                    _ => None,
                })
            })
            .and_then(|r| r.ok())
            .flatten()
    }

    /// The VM's string form of the token
    pub fn to_display_string(&self) -> String {
        self.0.to_display_string()
    }
}

impl fmt::Debug for LightUserDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LightUserDataRef({})", self.0.slot())
    }
}

impl fmt::Display for LightUserDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}
