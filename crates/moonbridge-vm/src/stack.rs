//! Stack and call frame management
//!
//! One value stack per thread. Every call pushes a [`CallFrame`] whose base
//! marks where the callee's arguments start; stack indices seen by the
//! callee are relative to that base.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ result / temporaries (top)          │  ← index -1
//! │ arg₂                                │  ← index 2
//! │ arg₁                                │  ← index 1 (frame base)
//! ├─────────────────────────────────────┤
//! │ callee function                     │  ← frame func_pos
//! │ caller temporaries                  │
//! │   ...                               │
//! └─────────────────────────────────────┘
//! ```

use std::sync::Arc;

use crate::value::Value;
use crate::{VmError, VmResult};

/// Default maximum stack size (in slots)
pub const DEFAULT_MAX_STACK_SIZE: usize = 1_000_000;

/// Default maximum call depth
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Call frame for one native function activation
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Absolute slot of the called function
    pub func_pos: usize,

    /// Absolute slot of the first argument
    pub base: usize,

    /// Function name for tracebacks
    pub name: Option<Arc<str>>,
}

/// Value stack with call frames and the message handler chain
pub struct Stack {
    slots: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<Option<Value>>,
    max_size: usize,
    max_depth: usize,
}

impl Stack {
    /// Create a stack with default limits
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_STACK_SIZE, DEFAULT_MAX_CALL_DEPTH)
    }

    /// Create a stack with specific limits
    pub fn with_limits(max_size: usize, max_depth: usize) -> Self {
        Self {
            slots: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            handlers: Vec::new(),
            max_size,
            max_depth,
        }
    }

    // ========================================================================
    // Slot Operations
    // ========================================================================

    /// Push a value
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackOverflow` if the stack is full.
    #[inline]
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.slots.len() >= self.max_size {
            return Err(VmError::StackOverflow);
        }
        self.slots.push(value);
        Ok(())
    }

    /// Pop the top value of the current frame (nil when the frame is empty)
    #[inline]
    pub fn pop(&mut self) -> Value {
        if self.slots.len() > self.base() {
            self.slots.pop().unwrap_or_default()
        } else {
            Value::Nil
        }
    }

    /// Absolute slot of the current frame base
    #[inline]
    pub fn base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Total number of slots in use
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is in use
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether `extra` more slots fit
    #[inline]
    pub fn has_room(&self, extra: usize) -> bool {
        self.slots.len().saturating_add(extra) <= self.max_size
    }

    /// Number of values in the current frame
    #[inline]
    pub fn top(&self) -> usize {
        self.slots.len().saturating_sub(self.base())
    }

    /// Translate a frame-relative index into an absolute slot
    pub fn slot_of(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        let len = self.slots.len();
        if idx > 0 {
            let abs = base + (idx as usize - 1);
            (abs < len).then_some(abs)
        } else if idx < 0 {
            let back = idx.unsigned_abs() as usize;
            (back <= len.saturating_sub(base)).then(|| len - back)
        } else {
            None
        }
    }

    /// Value at a frame-relative index
    pub fn get(&self, idx: i32) -> Option<&Value> {
        self.slot_of(idx).map(|s| &self.slots[s])
    }

    /// Value at an absolute slot
    pub fn get_abs(&self, slot: usize) -> Option<&Value> {
        self.slots.get(slot)
    }

    /// Overwrite a frame-relative index
    pub fn set(&mut self, idx: i32, value: Value) -> bool {
        match self.slot_of(idx) {
            Some(s) => {
                self.slots[s] = value;
                true
            }
            None => false,
        }
    }

    /// Overwrite an absolute slot
    pub fn set_abs(&mut self, slot: usize, value: Value) -> bool {
        match self.slots.get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }

    /// Set the number of values in the current frame
    pub fn set_top(&mut self, idx: i32) -> VmResult<()> {
        let base = self.base();
        let new_len = if idx >= 0 {
            base + idx as usize
        } else {
            let back = (idx.unsigned_abs() as usize).saturating_sub(1);
            self.slots.len().saturating_sub(back).max(base)
        };
        if new_len > self.max_size {
            return Err(VmError::StackOverflow);
        }
        self.slots.resize(new_len, Value::Nil);
        Ok(())
    }

    /// Move the top value into `idx`, shifting up the values above it
    pub fn insert(&mut self, idx: i32) {
        if let Some(s) = self.slot_of(idx) {
            if let Some(v) = self.slots.pop() {
                self.slots.insert(s, v);
            }
        }
    }

    /// Insert a value at an absolute slot
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackOverflow` if the stack is full.
    pub fn insert_abs(&mut self, slot: usize, value: Value) -> VmResult<()> {
        if self.slots.len() >= self.max_size {
            return Err(VmError::StackOverflow);
        }
        let slot = slot.min(self.slots.len());
        self.slots.insert(slot, value);
        Ok(())
    }

    /// Remove the value at `idx`, shifting down the values above it
    pub fn remove(&mut self, idx: i32) -> Value {
        match self.slot_of(idx) {
            Some(s) => self.slots.remove(s),
            None => Value::Nil,
        }
    }

    /// Drop every slot at or above `abs`
    pub fn truncate(&mut self, abs: usize) {
        self.slots.truncate(abs);
    }

    /// Remove and return the slots at or above `abs`
    pub fn split_off(&mut self, abs: usize) -> Vec<Value> {
        let abs = abs.min(self.slots.len());
        self.slots.split_off(abs)
    }

    // ========================================================================
    // Call Frame Management
    // ========================================================================

    /// Push a call frame
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackOverflow` when the call depth limit is hit.
    pub fn push_frame(&mut self, frame: CallFrame) -> VmResult<()> {
        if self.frames.len() >= self.max_depth {
            return Err(VmError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the current call frame
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    /// Number of active frames
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Drop frames above `depth`
    pub fn truncate_frames(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    /// Active frames, innermost last
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    // ========================================================================
    // Message Handlers
    // ========================================================================

    pub(crate) fn push_handler(&mut self, handler: Option<Value>) {
        self.handlers.push(handler);
    }

    pub(crate) fn pop_handler(&mut self) {
        self.handlers.pop();
    }

    pub(crate) fn truncate_handlers(&mut self, depth: usize) {
        self.handlers.truncate(depth);
    }

    pub(crate) fn handler_depth(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn current_handler(&self) -> Option<Value> {
        self.handlers.last().cloned().flatten()
    }

    /// Release everything
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.frames.clear();
        self.handlers.clear();
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_indices() {
        let mut stack = Stack::new();
        stack.push(Value::Integer(1)).unwrap();
        stack.push(Value::Integer(2)).unwrap();
        stack.push(Value::Integer(3)).unwrap();

        assert!(stack.get(1).unwrap().raw_equals(&Value::Integer(1)));
        assert!(stack.get(-1).unwrap().raw_equals(&Value::Integer(3)));
        assert!(stack.get(4).is_none());
        assert!(stack.get(-4).is_none());
        assert!(stack.get(0).is_none());
    }

    #[test]
    fn test_frame_base() {
        let mut stack = Stack::new();
        stack.push(Value::Integer(10)).unwrap();
        stack.push(Value::Integer(20)).unwrap();
        stack
            .push_frame(CallFrame {
                func_pos: 0,
                base: 1,
                name: None,
            })
            .unwrap();

        assert_eq!(stack.top(), 1);
        assert!(stack.get(1).unwrap().raw_equals(&Value::Integer(20)));
        assert!(stack.get(-2).is_none());

        stack.pop_frame();
        assert_eq!(stack.top(), 2);
    }

    #[test]
    fn test_set_top() {
        let mut stack = Stack::new();
        stack.set_top(3).unwrap();
        assert_eq!(stack.top(), 3);
        assert!(stack.get(3).unwrap().is_nil());
        stack.set_top(-2).unwrap();
        assert_eq!(stack.top(), 2);
        stack.set_top(0).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_insert_remove() {
        let mut stack = Stack::new();
        for i in 1..=3 {
            stack.push(Value::Integer(i)).unwrap();
        }
        stack.insert(1);
        assert!(stack.get(1).unwrap().raw_equals(&Value::Integer(3)));
        let removed = stack.remove(1);
        assert!(removed.raw_equals(&Value::Integer(3)));
        assert!(stack.get(-1).unwrap().raw_equals(&Value::Integer(2)));
    }

    #[test]
    fn test_overflow() {
        let mut stack = Stack::with_limits(2, 1);
        stack.push(Value::Nil).unwrap();
        stack.push(Value::Nil).unwrap();
        assert!(matches!(stack.push(Value::Nil), Err(VmError::StackOverflow)));

        let frame = CallFrame {
            func_pos: 0,
            base: 1,
            name: None,
        };
        stack.push_frame(frame.clone()).unwrap();
        assert!(matches!(stack.push_frame(frame), Err(VmError::StackOverflow)));
    }
}
