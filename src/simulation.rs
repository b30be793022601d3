//! The simulation engine the rollback machinery drives.
//!
//! Nothing here is implemented by this crate. A host wraps its emulator core in
//! [`Simulation`] and describes where the game keeps its inputs with
//! [`GameLayout`]; the [`Fastforwarder`](crate::Fastforwarder) does the rest.

use crate::{PlayerIndex, Tick};

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryWidth {
    /// 8 bits.
    U8,
    /// 16 bits.
    U16,
    /// 32 bits.
    U32,
}

/// Register and memory access handed to intercept handlers while the simulation
/// is paused at an intercepted address.
pub trait Cpu {
    /// Reads general-purpose register `index`.
    fn register(&self, index: usize) -> u32;
    /// Writes general-purpose register `index`.
    fn set_register(&mut self, index: usize, value: u32);
    /// Reads `width` bits at `address`, zero-extended.
    fn read_memory(&self, address: u32, width: MemoryWidth) -> u32;
    /// Writes the low `width` bits of `value` at `address`.
    fn write_memory(&mut self, address: u32, width: MemoryWidth, value: u32);
}

/// Called when execution reaches a registered intercept address.
pub trait InterceptHandler {
    /// Handles the intercept at `address`. `cpu` is only valid for the duration of the call.
    fn on_intercept(&mut self, address: u32, cpu: &mut dyn Cpu);
}

/// A deterministic, frame-stepped simulation that can snapshot itself.
///
/// Given the same state and the same injected inputs, two instances must
/// produce bit-identical states.
pub trait Simulation {
    /// An opaque snapshot.
    type State: Clone;

    /// Snapshots the current state, or `None` if the simulation cannot.
    fn save_state(&mut self) -> Option<Self::State>;

    /// Restores a snapshot, returning `false` if it was rejected.
    fn load_state(&mut self, state: &Self::State) -> bool;

    /// Arranges for `handler` to be called whenever execution reaches `address`.
    fn register_intercept(&mut self, address: u32);

    /// Runs one frame, calling `handler` for every intercept hit along the way.
    fn run_frame(&mut self, handler: &mut dyn InterceptHandler);
}

/// Where a particular game keeps the values the rollback engine reads and writes.
pub trait GameLayout {
    /// The address at which the game reads the frame's joypad input. Inputs are
    /// injected when execution reaches it.
    fn input_commit_address(&self) -> u32;

    /// Addresses at which the game asks "am I player 2?". Each is answered with
    /// the local player index.
    fn side_query_addresses(&self) -> &[u32] {
        &[]
    }

    /// The simulation's own tick counter.
    fn tick(&self, cpu: &dyn Cpu) -> Tick;

    /// The game RNG state recorded in each replay record.
    fn rng_state(&self, cpu: &dyn Cpu) -> u32;

    /// Injects one player's joypad flags and aux state.
    fn write_input(&self, cpu: &mut dyn Cpu, player: PlayerIndex, joyflags: u16, aux_state: u8);

    /// Applies a player's turn blob.
    fn write_turn(&self, cpu: &mut dyn Cpu, player: PlayerIndex, turn: &[u8]);

    /// Answers a side query. The default puts the local player index in register 0.
    fn answer_side_query(&self, cpu: &mut dyn Cpu, local_player: PlayerIndex) {
        cpu.set_register(0, u32::from(local_player.as_u8()));
    }
}
