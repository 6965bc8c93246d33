use std::{collections::VecDeque, sync::Arc};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::loom::{
    layout::LayoutDesc,
    memory::{Chunk, Memory},
};

/// Scratch allocator of a stream.
///
/// Chunks handed out during a batch stay live until [`Allocator::release`]; released chunks
/// that nobody else holds are kept on a free list keyed by size and reused by later
/// batches.
#[derive(Debug, Default)]
pub struct Allocator {
    live: Vec<Arc<Chunk>>,
    free: HashMap<usize, VecDeque<Arc<Chunk>>>,
}

impl Allocator {
    /// Allocates zeroed scratch memory for `desc`, reusing a free chunk of the same size.
    pub fn alloc(&mut self, desc: LayoutDesc) -> Memory {
        let size = desc.size();
        let chunk = match self.free.get_mut(&size).and_then(|free| free.pop_front()) {
            Some(chunk) => {
                chunk.clear();
                chunk
            }
            None => Arc::new(Chunk::new(size)),
        };
        self.live.push(chunk.clone());
        Memory::from_chunk(chunk, 0, desc)
    }

    /// Ends the lifetime of every live chunk.
    pub fn release(&mut self) {
        for chunk in self.live.drain(..) {
            // still referenced by some caller; forget it
            if Arc::strong_count(&chunk) > 1 {
                continue;
            }
            self.free.entry(chunk.len()).or_default().push_back(chunk);
        }
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.values().map(VecDeque::len).sum()
    }

    /// Prints the allocator's state in a human-readable format.
    pub fn print_pretty(&self) -> String {
        let live = self
            .live
            .iter()
            .map(|chunk| format!("live\t{}\t: {} bytes", chunk.id(), chunk.len()));
        let free = self
            .free
            .iter()
            .sorted_by_key(|(size, _)| **size)
            .flat_map(|(size, chunks)| chunks.iter().map(move |chunk| (size, chunk)))
            .map(|(size, chunk)| format!("free\t{}\t: {size} bytes", chunk.id()));
        live.chain(free).join("\n")
    }
}

impl std::fmt::Display for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print_pretty())
    }
}
