//! A deterministic stand-in for an emulator core.
//!
//! Each frame the stub fires its registered intercepts (side query first, then
//! input commit), folds the joypad words of both players into a running digest,
//! steps a tiny LCG as its "game RNG", and advances its tick counter.

use std::collections::BTreeMap;

use rollback_link::{Cpu, GameLayout, InterceptHandler, MemoryWidth, PlayerIndex, Simulation, Tick};

pub const COMMIT_ADDRESS: u32 = 0x0800_1000;
pub const SIDE_QUERY_ADDRESS: u32 = 0x0800_2000;

const TICK_ADDRESS: u32 = 0x0200_0000;
const RNG_ADDRESS: u32 = 0x0200_0004;
const JOYFLAGS_ADDRESS: [u32; 2] = [0x0200_0010, 0x0200_0020];
const AUX_ADDRESS: [u32; 2] = [0x0200_0012, 0x0200_0022];
const TURN_SUM_ADDRESS: [u32; 2] = [0x0200_0100, 0x0200_0200];
const TURN_COUNT_ADDRESS: [u32; 2] = [0x0200_0104, 0x0200_0204];

/// Memory and registers of the stub; also its save state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubState {
    pub memory: BTreeMap<u32, u32>,
    pub registers: [u32; 16],
    pub digest: u64,
    pub frames: u64,
}

impl StubState {
    #[allow(dead_code)]
    #[must_use]
    pub fn tick(&self) -> u32 {
        self.read_memory(TICK_ADDRESS, MemoryWidth::U32)
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn turns_seen(&self, player: PlayerIndex) -> u32 {
        self.read_memory(TURN_COUNT_ADDRESS[player.as_usize()], MemoryWidth::U32)
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn turn_sum(&self, player: PlayerIndex) -> u32 {
        self.read_memory(TURN_SUM_ADDRESS[player.as_usize()], MemoryWidth::U32)
    }

    fn step(&mut self) {
        for player in PlayerIndex::ALL {
            let joyflags = self.read_memory(JOYFLAGS_ADDRESS[player.as_usize()], MemoryWidth::U16);
            let aux = self.read_memory(AUX_ADDRESS[player.as_usize()], MemoryWidth::U8);
            self.digest = self
                .digest
                .wrapping_mul(0x100_0000_01b3)
                .wrapping_add(u64::from(joyflags) << 8 | u64::from(aux));
        }
        let rng = self.read_memory(RNG_ADDRESS, MemoryWidth::U32);
        self.write_memory(
            RNG_ADDRESS,
            MemoryWidth::U32,
            rng.wrapping_mul(1_103_515_245).wrapping_add(12_345),
        );
        let tick = self.tick();
        self.write_memory(TICK_ADDRESS, MemoryWidth::U32, tick.wrapping_add(1));
        self.frames += 1;
    }
}

fn mask(width: MemoryWidth) -> u32 {
    match width {
        MemoryWidth::U8 => 0xff,
        MemoryWidth::U16 => 0xffff,
        MemoryWidth::U32 => u32::MAX,
    }
}

impl Cpu for StubState {
    fn register(&self, index: usize) -> u32 {
        self.registers[index]
    }

    fn set_register(&mut self, index: usize, value: u32) {
        self.registers[index] = value;
    }

    fn read_memory(&self, address: u32, width: MemoryWidth) -> u32 {
        self.memory.get(&address).copied().unwrap_or(0) & mask(width)
    }

    fn write_memory(&mut self, address: u32, width: MemoryWidth, value: u32) {
        self.memory.insert(address, value & mask(width));
    }
}

/// The offline simulation handed to a `Fastforwarder`.
#[derive(Debug, Default)]
pub struct StubSimulation {
    pub state: StubState,
    pub intercepts: Vec<u32>,
    /// Frames before the input-commit intercept fires again; 0 fires every frame.
    pub commit_every: u64,
    /// Suppresses the input-commit intercept entirely.
    pub starve: bool,
    pub fail_load: bool,
    pub fail_save: bool,
    pub loads: usize,
    pub saves: usize,
}

impl StubSimulation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Simulation for StubSimulation {
    type State = StubState;

    fn save_state(&mut self) -> Option<StubState> {
        self.saves += 1;
        (!self.fail_save).then(|| self.state.clone())
    }

    fn load_state(&mut self, state: &StubState) -> bool {
        self.loads += 1;
        if self.fail_load {
            return false;
        }
        self.state = state.clone();
        true
    }

    fn register_intercept(&mut self, address: u32) {
        self.intercepts.push(address);
    }

    fn run_frame(&mut self, handler: &mut dyn InterceptHandler) {
        if self.intercepts.contains(&SIDE_QUERY_ADDRESS) {
            handler.on_intercept(SIDE_QUERY_ADDRESS, &mut self.state);
        }
        let commits_now = self.commit_every == 0 || self.state.frames % self.commit_every == 0;
        if !self.starve && commits_now && self.intercepts.contains(&COMMIT_ADDRESS) {
            handler.on_intercept(COMMIT_ADDRESS, &mut self.state);
            self.state.step();
        } else {
            // A frame without an input commit still burns time, not ticks.
            self.state.frames += 1;
        }
    }
}

/// Addresses and accessors for the stub.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubLayout;

impl GameLayout for StubLayout {
    fn input_commit_address(&self) -> u32 {
        COMMIT_ADDRESS
    }

    fn side_query_addresses(&self) -> &[u32] {
        &[SIDE_QUERY_ADDRESS]
    }

    fn tick(&self, cpu: &dyn Cpu) -> Tick {
        Tick::new(cpu.read_memory(TICK_ADDRESS, MemoryWidth::U32))
    }

    fn rng_state(&self, cpu: &dyn Cpu) -> u32 {
        cpu.read_memory(RNG_ADDRESS, MemoryWidth::U32)
    }

    fn write_input(&self, cpu: &mut dyn Cpu, player: PlayerIndex, joyflags: u16, aux_state: u8) {
        cpu.write_memory(
            JOYFLAGS_ADDRESS[player.as_usize()],
            MemoryWidth::U16,
            u32::from(joyflags),
        );
        cpu.write_memory(
            AUX_ADDRESS[player.as_usize()],
            MemoryWidth::U8,
            u32::from(aux_state),
        );
    }

    fn write_turn(&self, cpu: &mut dyn Cpu, player: PlayerIndex, turn: &[u8]) {
        let sum = turn.iter().map(|&byte| u32::from(byte)).sum();
        cpu.write_memory(TURN_SUM_ADDRESS[player.as_usize()], MemoryWidth::U32, sum);
        let count = cpu.read_memory(TURN_COUNT_ADDRESS[player.as_usize()], MemoryWidth::U32);
        cpu.write_memory(
            TURN_COUNT_ADDRESS[player.as_usize()],
            MemoryWidth::U32,
            count + 1,
        );
    }
}
