//! Generational registry of GpuBuffers.
//!
//! Ids stay unique across reuse of a slot: removing a buffer bumps the
//! slot's generation, so stale ids resolve to nothing.

use crate::api::buffer::GpuBuffer;

/// Generation counter for id validation.
type Generation = u32;

/// Stable id of a registered [`GpuBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    index: u32,
    generation: Generation,
}

impl BufferId {
    /// Get the raw index (for debugging).
    pub fn raw_index(&self) -> u32 {
        self.index
    }

    /// Get the generation (for debugging).
    pub fn raw_generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    generation: Generation,
    buffer: Option<GpuBuffer>,
}

/// Owns every live GpuBuffer.
#[derive(Default)]
pub struct BufferRegistry {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    len: usize,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer.
    pub fn insert(&mut self, buffer: GpuBuffer) -> BufferId {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.buffer = Some(buffer);
            return BufferId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            buffer: Some(buffer),
        });
        BufferId { index, generation: 0 }
    }

    /// Unregister a buffer, returning it. Stale ids return `None`.
    pub fn remove(&mut self, id: BufferId) -> Option<GpuBuffer> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let buffer = slot.buffer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        self.len -= 1;
        Some(buffer)
    }

    pub fn get(&self, id: BufferId) -> Option<&GpuBuffer> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.buffer.as_ref())
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut GpuBuffer> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.buffer.as_mut())
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_some()
    }

    /// Live buffers with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &GpuBuffer)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.buffer.as_ref().map(|buffer| {
                (
                    BufferId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    buffer,
                )
            })
        })
    }

    /// Ids of buffers with staged data awaiting flush.
    pub fn pending_ids(&self) -> Vec<BufferId> {
        self.iter()
            .filter(|(_, buffer)| buffer.has_pending_data())
            .map(|(id, _)| id)
            .collect()
    }

    /// Ids of buffers with an upload batch still open.
    pub fn open_batch_ids(&self) -> Vec<BufferId> {
        self.iter()
            .filter(|(_, buffer)| buffer.has_open_batch())
            .map(|(id, _)| id)
            .collect()
    }

    /// Live buffers with their ids, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BufferId, &mut GpuBuffer)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.buffer.as_mut().map(|buffer| {
                (
                    BufferId {
                        index: index as u32,
                        generation,
                    },
                    buffer,
                )
            })
        })
    }

    /// Remove every buffer.
    pub fn drain(&mut self) -> Vec<GpuBuffer> {
        let ids: Vec<BufferId> = self.iter().map(|(id, _)| id).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
