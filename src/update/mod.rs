//! Update queues and the triggers that flush them.
//!
//! Writers call [`UpdateQueue::set_data`] from any thread; the queue keeps
//! only the latest color per [`UpdateKey`] and hands the batch to its
//! [`UpdateWriter`] whenever its [`UpdateTrigger`] fires.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod device_trigger;
pub mod key;
pub mod manual_trigger;
pub mod queue;
pub mod timer_trigger;
pub mod trigger;

pub use device_trigger::DeviceUpdateTrigger;
pub use key::{UpdateKey, VendorKey};
pub use manual_trigger::ManualUpdateTrigger;
pub use queue::{UpdateQueue, UpdateWriter};
pub use timer_trigger::TimerUpdateTrigger;
pub use trigger::{SubscriptionId, UpdateSubscriber, UpdateTrigger};

/// Locks a mutex whose data stays valid even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
