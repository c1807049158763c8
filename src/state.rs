//! Shared-state helpers: parking_lot mutexes behind Arc. Locks are never
//! held across an await.

use parking_lot::Mutex;
use std::sync::Arc;

/// Cheaply clonable handle to state mutated from several tasks.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
