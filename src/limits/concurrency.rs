//! Per-actor in-flight request cap
//!
//! Process-local. A multi-instance deployment needs the counter promoted to
//! a shared store; everything else in the limiter already aggregates over
//! the usage store.

use crate::ids::ActorId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const DEFAULT_MAX_CONCURRENT: u32 = 3;

#[derive(Debug, Default)]
struct Slots {
    in_flight: HashMap<ActorId, u32>,
}

impl Slots {
    fn release(&mut self, actor: &ActorId) {
        if let Some(count) = self.in_flight.get_mut(actor) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(actor);
            }
        }
    }
}

/// Issues at most `max` live [`ConcurrencyPermit`]s per actor
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    max: u32,
    slots: Arc<Mutex<Slots>>,
}

impl ConcurrencyLimiter {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Take a slot, or return the current in-flight count when full
    pub fn try_acquire(&self, actor: &ActorId) -> Result<ConcurrencyPermit, u32> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let count = slots.in_flight.entry(actor.clone()).or_insert(0);
        if *count >= self.max {
            return Err(*count);
        }
        *count += 1;
        Ok(ConcurrencyPermit {
            actor: actor.clone(),
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn in_flight(&self, actor: &ActorId) -> u32 {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.in_flight.get(actor).copied().unwrap_or(0)
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// A held concurrency slot, returned on drop
///
/// Dropping covers every exit path: success, error, panic unwinding, and a
/// streaming response whose consumer went away.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConcurrencyPermit {
    actor: ActorId,
    slots: Arc<Mutex<Slots>>,
}

impl ConcurrencyPermit {
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Release explicitly; same as dropping
    pub fn release(self) {}
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.release(&self.actor);
    }
}
