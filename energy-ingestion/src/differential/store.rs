use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use energy_client::domain::MeterReading;

use super::CoreError;

/// Last observed reading per configured location.
///
/// The key set is fixed when the store is initialized; each location owns its
/// own lock so updates for different locations never contend.
#[derive(Debug, Default)]
pub struct CounterStore {
    slots: HashMap<String, Mutex<Option<MeterReading>>>,
}

impl CounterStore {
    pub fn new<I, S>(locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self::default();
        store.initialize(locations);
        store
    }

    /// Replace all state with an empty baseline for each location.
    pub fn initialize<I, S>(&mut self, locations: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slots = locations
            .into_iter()
            .map(|l| (l.into(), Mutex::new(None)))
            .collect();
    }

    pub fn get_previous(&self, location: &str) -> Result<Option<MeterReading>, CoreError> {
        Ok(self.lock(location)?.clone())
    }

    pub fn set_previous(&self, location: &str, reading: MeterReading) -> Result<(), CoreError> {
        *self.lock(location)? = Some(reading);
        Ok(())
    }

    pub fn contains(&self, location: &str) -> bool {
        self.slots.contains_key(location)
    }

    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Exclusive access to one location's baseline for a read-modify-write.
    pub(crate) fn lock(
        &self,
        location: &str,
    ) -> Result<MutexGuard<'_, Option<MeterReading>>, CoreError> {
        let slot = self
            .slots
            .get(location)
            .ok_or_else(|| CoreError::UnknownLocation(location.to_string()))?;
        // A panic while holding the guard cannot leave a half-written reading.
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
