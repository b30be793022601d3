//! Fuzz target for InputQueue operation sequences.
//!
//! # Safety Properties Tested
//! - No panics or deadlocks: adds never exceed capacity, so nothing blocks
//! - Pairs come out tick-aligned and in order
//! - `lag` mirrors the buffered counts

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rollback_link::{CancellationToken, Input, InputQueue, PlayerIndex, Tick};

#[derive(Debug, Arbitrary)]
enum QueueOp {
    AddLocal { joyflags: u16 },
    AddRemote { joyflags: u16 },
    Consume,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    capacity: u8,
    delay: u8,
    local_is_p2: bool,
    operations: Vec<QueueOp>,
}

fuzz_target!(|fuzz_input: FuzzInput| {
    let capacity = usize::from(fuzz_input.capacity.clamp(1, 64));
    let delay = usize::from(fuzz_input.delay) % capacity;
    let local = if fuzz_input.local_is_p2 {
        PlayerIndex::P2
    } else {
        PlayerIndex::P1
    };
    let remote = local.opponent();
    let Ok(queue) = InputQueue::new(capacity, local, delay) else {
        return;
    };
    let token = CancellationToken::new();
    let mut next_tick = [0u32; 2];
    let mut last_paired: Option<Tick> = None;

    for op in fuzz_input.operations {
        match op {
            QueueOp::AddLocal { joyflags } | QueueOp::AddRemote { joyflags } => {
                let player = if matches!(op, QueueOp::AddLocal { .. }) {
                    local
                } else {
                    remote
                };
                if queue.queue_length(player) >= capacity {
                    continue;
                }
                let tick = &mut next_tick[player.as_usize()];
                let input = Input::new(Tick::new(*tick), Tick::ZERO, joyflags, 0);
                *tick += 1;
                queue.add_input(player, input, &token).expect("add below capacity");
            },
            QueueOp::Consume => {
                let (pairs, backlog) = queue.consume_and_peek_local();
                for pair in pairs {
                    let tick = pair.check_aligned().expect("paired inputs share a tick");
                    if let Some(previous) = last_paired {
                        assert_eq!(tick, previous.next());
                    }
                    last_paired = Some(tick);
                }
                assert!(backlog.len() <= queue.queue_length(local));
            },
        }
        let (l, r) = (queue.queue_length(local) as isize, queue.queue_length(remote) as isize);
        assert_eq!(queue.lag(remote), l - r);
    }
});
