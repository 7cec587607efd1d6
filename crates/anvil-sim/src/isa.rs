//! # Reference Command Set
//!
//! The small instruction set the reference device understands. Every
//! instruction starts with a header word: opcode in bits 31:23 and the
//! instruction length minus two in bits 7:0.
//!
//! | opcode | instruction       | payload                               |
//! |--------|-------------------|---------------------------------------|
//! | 0x00   | NOOP              | (single word, all zero)               |
//! | 0x0A   | BATCH_END         | (single word)                         |
//! | 0x1C   | SEMAPHORE_WAIT    | value, addr lo, addr hi               |
//! | 0x20   | STORE_DWORD_IMM   | addr lo, addr hi, value               |
//! | 0x20   | STORE_QWORD_IMM   | addr lo, addr hi, value lo, value hi  |
//! | 0x2E   | COPY_MEM          | dst lo, dst hi, src lo, src hi, words |
//! | 0x3F   | DELAY             | microseconds                          |

use anvil_core::{GpuAddr, RejectReason};

const OP_SHIFT: u32 = 23;

const OP_NOOP: u32 = 0x00;
const OP_BATCH_END: u32 = 0x0A;
const OP_SEMAPHORE_WAIT: u32 = 0x1C;
const OP_STORE_IMM: u32 = 0x20;
const OP_COPY_MEM: u32 = 0x2E;
const OP_DELAY: u32 = 0x3F;

/// End-of-batch word
pub const BATCH_END: u32 = OP_BATCH_END << OP_SHIFT;
/// No-op word
pub const NOOP: u32 = OP_NOOP;

const fn header(opcode: u32, len: u32) -> u32 {
    (opcode << OP_SHIFT) | (len - 2)
}

// =============================================================================
// ENCODERS
// =============================================================================

/// Write `value` to `addr`
pub fn store_dword(addr: GpuAddr, value: u32) -> [u32; 4] {
    [header(OP_STORE_IMM, 4), addr.lower(), addr.upper(), value]
}

/// Write a 64-bit `value` to `addr`
pub fn store_qword(addr: GpuAddr, value: u64) -> [u32; 5] {
    [
        header(OP_STORE_IMM, 5),
        addr.lower(),
        addr.upper(),
        value as u32,
        (value >> 32) as u32,
    ]
}

/// Copy `words` dwords from `src` to `dst`
pub fn copy_mem(dst: GpuAddr, src: GpuAddr, words: u32) -> [u32; 6] {
    [
        header(OP_COPY_MEM, 6),
        dst.lower(),
        dst.upper(),
        src.lower(),
        src.upper(),
        words,
    ]
}

/// Stall the engine until the dword at `addr` equals `value`
pub fn semaphore_wait(addr: GpuAddr, value: u32) -> [u32; 4] {
    [header(OP_SEMAPHORE_WAIT, 4), value, addr.lower(), addr.upper()]
}

/// Stall the engine for `micros` microseconds
pub fn delay(micros: u32) -> [u32; 2] {
    [header(OP_DELAY, 2), micros]
}

/// Header of a STORE_QWORD_IMM whose address words follow
///
/// Useful when the address is emitted separately as a relocation.
pub const STORE_QWORD_HEADER: u32 = header(OP_STORE_IMM, 5);
/// Header of a STORE_DWORD_IMM whose address words follow
pub const STORE_DWORD_HEADER: u32 = header(OP_STORE_IMM, 4);
/// Header of a COPY_MEM whose address words follow
pub const COPY_MEM_HEADER: u32 = header(OP_COPY_MEM, 6);

// =============================================================================
// DECODER
// =============================================================================

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// 32-bit store
    StoreDword {
        /// Destination
        addr: GpuAddr,
        /// Value
        value: u32,
    },
    /// 64-bit store
    StoreQword {
        /// Destination
        addr: GpuAddr,
        /// Value
        value: u64,
    },
    /// Memory to memory copy
    Copy {
        /// Destination
        dst: GpuAddr,
        /// Source
        src: GpuAddr,
        /// Dwords to copy
        words: u32,
    },
    /// Poll until memory equals a value
    SemaphoreWait {
        /// Polled address
        addr: GpuAddr,
        /// Expected value
        value: u32,
    },
    /// Fixed stall
    Delay {
        /// Microseconds
        micros: u32,
    },
}

/// Decode a stream up to and including its end marker
pub fn decode(words: &[u32]) -> Result<Vec<Op>, RejectReason> {
    let mut ops = Vec::new();
    let mut i = 0;

    while i < words.len() {
        let head = words[i];
        let opcode = head >> OP_SHIFT;
        match opcode {
            OP_NOOP if head == NOOP => {
                i += 1;
                continue;
            }
            OP_BATCH_END => return Ok(ops),
            _ => {}
        }

        let len = (head & 0xff) as usize + 2;
        let body = words.get(i + 1..i + len).ok_or(RejectReason::MalformedStream)?;
        let op = match (opcode, len) {
            (OP_STORE_IMM, 4) => Op::StoreDword {
                addr: GpuAddr::from_words(body[0], body[1]),
                value: body[2],
            },
            (OP_STORE_IMM, 5) => Op::StoreQword {
                addr: GpuAddr::from_words(body[0], body[1]),
                value: ((body[3] as u64) << 32) | body[2] as u64,
            },
            (OP_COPY_MEM, 6) => Op::Copy {
                dst: GpuAddr::from_words(body[0], body[1]),
                src: GpuAddr::from_words(body[2], body[3]),
                words: body[4],
            },
            (OP_SEMAPHORE_WAIT, 4) => Op::SemaphoreWait {
                value: body[0],
                addr: GpuAddr::from_words(body[1], body[2]),
            },
            (OP_DELAY, 2) => Op::Delay { micros: body[0] },
            _ => {
                log::warn!("sim: bad instruction header {:#010x} at word {}", head, i);
                return Err(RejectReason::MalformedStream);
            }
        };
        ops.push(op);
        i += len;
    }

    Err(RejectReason::MissingEndMarker)
}
