//! Relocatable trampoline code blocks
//!
//! A vector can only name an address, but a handler needs to know which
//! entry it belongs to. Each registration therefore gets a few bytes of
//! code in locked memory that reserve two stack slots for a far chain,
//! save the scratch registers, load a data pointer and jump to a shared
//! entry stub. The block is written once and never mutated.

use alloc::sync::Arc;
use core::mem::size_of;

use pmrt_api::Result;
use pmrt_memory::{LockedBox, LockedHeap};

#[cfg(target_pointer_width = "32")]
mod layout {
    /// sub esp, 8; push eax; push ecx; mov eax, imm32; mov ecx, imm32; jmp ecx
    pub const TEMPLATE: [u8; 17] = [
        0x83, 0xec, 0x08, 0x50, 0x51, 0xb8, 0, 0, 0, 0, 0xb9, 0, 0, 0, 0, 0xff, 0xe1,
    ];
    pub const DATA_OFFSET: usize = 6;
    pub const ENTRY_OFFSET: usize = 11;
}

#[cfg(target_pointer_width = "64")]
mod layout {
    /// sub rsp, 16; push rax; push rcx; mov rax, imm64; mov rcx, imm64; jmp rcx
    pub const TEMPLATE: [u8; 28] = [
        0x48, 0x83, 0xec, 0x10, 0x50, 0x51, 0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0x48, 0xb9, 0, 0, 0, 0, 0, 0, 0,
        0, 0xff, 0xe1,
    ];
    pub const DATA_OFFSET: usize = 8;
    pub const ENTRY_OFFSET: usize = 18;
}

pub use layout::{DATA_OFFSET, ENTRY_OFFSET, TEMPLATE};

/// Size of one code block
pub const CODE_SIZE: usize = TEMPLATE.len();

static_assertions::const_assert!(DATA_OFFSET + size_of::<usize>() <= ENTRY_OFFSET);
static_assertions::const_assert!(ENTRY_OFFSET + size_of::<usize>() < CODE_SIZE);

#[repr(C, align(16))]
struct Code([u8; CODE_SIZE]);

/// A code block passing `data` to `entry`
pub struct Trampoline {
    code: LockedBox<Code>,
}

impl Trampoline {
    pub fn new(heap: &Arc<LockedHeap>, data: usize, entry: usize) -> Result<Self> {
        let mut bytes = TEMPLATE;
        bytes[DATA_OFFSET..DATA_OFFSET + size_of::<usize>()].copy_from_slice(&data.to_le_bytes());
        bytes[ENTRY_OFFSET..ENTRY_OFFSET + size_of::<usize>()].copy_from_slice(&entry.to_le_bytes());
        Ok(Self { code: LockedBox::new(heap, Code(bytes))? })
    }

    /// Linear address of the first instruction
    pub fn address(&self) -> usize {
        LockedBox::as_ptr(&self.code) as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code.0
    }

    /// Reads back `(data, entry)` from the block at `address`, or `None`
    /// if the bytes there are not a trampoline.
    ///
    /// # Safety
    ///
    /// `address` must point to at least [`CODE_SIZE`] readable bytes.
    pub unsafe fn decode(address: usize) -> Option<(usize, usize)> {
        let bytes = unsafe { core::slice::from_raw_parts(address as *const u8, CODE_SIZE) };
        let matches = bytes.iter().zip(TEMPLATE.iter()).enumerate().all(|(i, (b, t))| {
            let in_data = (DATA_OFFSET..DATA_OFFSET + size_of::<usize>()).contains(&i);
            let in_entry = (ENTRY_OFFSET..ENTRY_OFFSET + size_of::<usize>()).contains(&i);
            in_data || in_entry || b == t
        });
        if !matches {
            return None;
        }
        let word = |offset: usize| {
            let mut raw = [0u8; size_of::<usize>()];
            raw.copy_from_slice(&bytes[offset..offset + size_of::<usize>()]);
            usize::from_le_bytes(raw)
        };
        Some((word(DATA_OFFSET), word(ENTRY_OFFSET)))
    }
}
