//! Per-resource bookkeeping of occupied job slots.
//!
//! The real per-user job limit of a scheduler is unknown in advance. The controller is
//! optimistic until the scheduler refuses a job because of the limit, from then on the
//! number of jobs accepted at that moment is used as the ceiling.

use serde::{Deserialize, Serialize};

use crate::{Map, ResourceId};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct AdmissionState {
    /// Jobs of the resource which are queued, held or running.
    pub slots_in_use: u32,
    /// Learned limit of concurrently accepted jobs, `None` until the first rejection.
    pub slot_ceiling: Option<u32>,
    /// Slots handed out to submissions which have not finished yet.
    #[serde(skip)]
    pub reserved: u32,
}

impl AdmissionState {
    fn has_free_slot(&self) -> bool {
        match self.slot_ceiling {
            Some(ceiling) => self.slots_in_use + self.reserved < ceiling,
            None => true,
        }
    }
}

#[derive(Default, Debug)]
pub struct AdmissionController {
    states: Map<ResourceId, AdmissionState>,
}

impl AdmissionController {
    pub fn from_states(states: impl IntoIterator<Item = (ResourceId, AdmissionState)>) -> Self {
        Self {
            states: states.into_iter().collect(),
        }
    }

    fn get_state_mut(&mut self, resource: &str) -> &mut AdmissionState {
        self.states.entry(resource.to_string()).or_default()
    }

    pub fn state(&self, resource: &str) -> Option<&AdmissionState> {
        self.states.get(resource)
    }

    pub fn states(&self) -> impl Iterator<Item = (&ResourceId, &AdmissionState)> {
        self.states.iter()
    }

    /// Returns true (and reserves a slot) if a submission to the resource may proceed now.
    pub fn try_reserve_slot(&mut self, resource: &str) -> bool {
        let state = self.get_state_mut(resource);
        if state.has_free_slot() {
            state.reserved += 1;
            true
        } else {
            false
        }
    }

    /// The scheduler accepted a job submitted with a reserved slot.
    pub fn record_acceptance(&mut self, resource: &str) {
        let state = self.get_state_mut(resource);
        state.reserved = state.reserved.saturating_sub(1);
        state.slots_in_use += 1;
        if let Some(ceiling) = state.slot_ceiling {
            if state.slots_in_use > ceiling {
                log::debug!(
                    "Raising job slot ceiling of resource `{resource}` to {}",
                    state.slots_in_use
                );
                state.slot_ceiling = Some(state.slots_in_use);
            }
        }
    }

    /// The scheduler refused a job submitted with a reserved slot because of a job limit.
    ///
    /// Only the first rejection with occupied slots sets the ceiling. Returns the number
    /// of slots in use.
    pub fn record_rejection(&mut self, resource: &str) -> u32 {
        let state = self.get_state_mut(resource);
        state.reserved = state.reserved.saturating_sub(1);
        if state.slot_ceiling.is_none() && state.slots_in_use > 0 {
            log::info!(
                "Resource `{resource}` refused a job with {} job(s) in its queue, limiting it to {} job(s)",
                state.slots_in_use,
                state.slots_in_use
            );
            state.slot_ceiling = Some(state.slots_in_use);
        }
        state.slots_in_use
    }

    /// A reserved slot was not used, e.g. because the submission failed.
    pub fn cancel_reservation(&mut self, resource: &str) {
        let state = self.get_state_mut(resource);
        state.reserved = state.reserved.saturating_sub(1);
    }

    /// A job of the resource left the queue.
    pub fn release(&mut self, resource: &str) {
        let state = self.get_state_mut(resource);
        state.slots_in_use = state.slots_in_use.saturating_sub(1);
    }

    /// Sets the number of occupied slots, used when resuming from a snapshot.
    pub fn set_slots_in_use(&mut self, resource: &str, slots: u32) {
        let state = self.get_state_mut(resource);
        state.slots_in_use = slots;
        state.reserved = 0;
    }
}
