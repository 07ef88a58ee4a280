//! Inline hot-patcher for registry entry points.
//!
//! Overwrites the first bytes of a target export with an absolute jump to a
//! detour and builds an RWX "trampoline" containing the displaced prologue
//! instructions followed by a jump back into the function body. The detour
//! calls the real implementation through the trampoline.
//!
//! Relocation is conservative: a small length decoder walks the prologue to
//! find an instruction boundary covering the patch, and refuses anything
//! position-dependent (relative branches, RIP-relative operands). Entry
//! points it cannot patch are skipped by the manager rather than failing the
//! whole install.

use std::ffi::c_void;
use std::{ptr, slice};

use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Threading::GetCurrentProcess;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    VirtualAlloc, VirtualFree, VirtualProtect,
};

/// `jmp [rip+0]` + absolute destination on x64; `push imm32; ret` on x86.
/// Neither form clobbers a register.
#[cfg(target_pointer_width = "64")]
pub const PATCH_LEN: usize = 14;
#[cfg(target_pointer_width = "32")]
pub const PATCH_LEN: usize = 6;

/// How far into the prologue we are willing to look for a patch boundary.
const MAX_SCAN: usize = 64;

/// SAFETY: `Hook` holds raw pointers into executable pages plus POD state; it
/// owns no non-`'static` data, so moving it between threads is sound.
unsafe impl Send for Hook {}
unsafe impl Sync for Hook {}

/// One patchable entry point.
///
/// Preparation and activation are separate steps: [`Hook::prepare`] builds
/// the trampoline without touching the target, so the manager can publish
/// every original-function pointer before [`Hook::enable`] flips the first
/// entry live. A detour can therefore never observe a missing original.
pub struct Hook {
    /// First byte of the patched function.
    target: *mut u8,
    /// Detour the patch jumps to.
    detour: *const u8,
    /// Bytes displaced by the patch (a whole number of instructions).
    saved: [u8; MAX_SCAN],
    saved_len: usize,
    /// RWX buffer re-hosting the displaced prologue.
    trampoline: *mut u8,
    enabled: bool,
}

struct Insn {
    len: usize,
    /// False for anything that cannot be copied verbatim to another address.
    relocatable: bool,
}

/// Decodes one instruction's length. Covers the encodings that occur at the
/// top of Win32 API exports; anything unrecognized aborts the scan.
fn insn_len(code: &[u8]) -> Option<Insn> {
    let mut i = 0usize;
    let mut operand16 = false;

    // Legacy prefixes.
    while i < code.len() {
        match code[i] {
            0x66 => {
                operand16 = true;
                i += 1;
            }
            0x67 | 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => i += 1,
            _ => break,
        }
    }

    #[cfg(target_pointer_width = "64")]
    let mut rex_w = false;
    #[cfg(target_pointer_width = "64")]
    {
        if i < code.len() && (0x40..=0x4F).contains(&code[i]) {
            rex_w = code[i] & 0x08 != 0;
            i += 1;
        }
    }
    #[cfg(target_pointer_width = "32")]
    let rex_w = false;

    let op = *code.get(i)?;
    i += 1;

    let imm32 = if operand16 { 2 } else { 4 };
    let done = |len: usize, relocatable: bool| {
        if len <= code.len() {
            Some(Insn { len, relocatable })
        } else {
            None
        }
    };

    if op == 0x0F {
        let op2 = *code.get(i)?;
        i += 1;
        return match op2 {
            // jcc rel32
            0x80..=0x8F => done(i + 4, false),
            // movzx/movsx, imul, multi-byte nop, setcc, common SSE moves
            0xB6 | 0xB7 | 0xBE | 0xBF | 0xAF | 0x1F | 0x90..=0x9F | 0x10 | 0x11 | 0x28 | 0x29
            | 0x57 | 0x6E | 0x7E | 0xEF => {
                let (m, rip) = modrm_len(&code[i..])?;
                done(i + m, !rip)
            }
            _ => None,
        };
    }

    match op {
        // Single-byte ALU block: add/or/adc/sbb/and/sub/xor/cmp.
        0x00..=0x3F => match op & 0x07 {
            0..=3 => {
                let (m, rip) = modrm_len(&code[i..])?;
                done(i + m, !rip)
            }
            4 => done(i + 1, true),
            5 => done(i + imm32, true),
            _ => None,
        },
        0x50..=0x5F | 0x90 | 0xC3 | 0xCC => done(i, true),
        0x63 | 0x84..=0x8B | 0x8D | 0x8F => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m, !rip)
        }
        0x68 => done(i + 4, true),
        0x6A => done(i + 1, true),
        0x69 => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m + imm32, !rip)
        }
        0x6B => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m + 1, !rip)
        }
        // Short conditional jumps.
        0x70..=0x7F | 0xEB => done(i + 1, false),
        0x80 | 0x82 | 0x83 | 0xC0 | 0xC1 | 0xC6 => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m + 1, !rip)
        }
        0x81 | 0xC7 => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m + imm32, !rip)
        }
        0xA8 => done(i + 1, true),
        0xA9 => done(i + imm32, true),
        0xB0..=0xB7 => done(i + 1, true),
        0xB8..=0xBF => {
            let imm = if rex_w { 8 } else { imm32 };
            done(i + imm, true)
        }
        0xC2 => done(i + 2, true),
        // call/jmp rel32
        0xE8 | 0xE9 => done(i + 4, false),
        0xF6 => {
            let reg = (code.get(i)? >> 3) & 0x07;
            let (m, rip) = modrm_len(&code[i..])?;
            let imm = if reg <= 1 { 1 } else { 0 };
            done(i + m + imm, !rip)
        }
        0xF7 => {
            let reg = (code.get(i)? >> 3) & 0x07;
            let (m, rip) = modrm_len(&code[i..])?;
            let imm = if reg <= 1 { imm32 } else { 0 };
            done(i + m + imm, !rip)
        }
        0xFE | 0xFF => {
            let (m, rip) = modrm_len(&code[i..])?;
            done(i + m, !rip)
        }
        _ => None,
    }
}

/// ModRM (+ SIB + displacement) byte count, and whether the operand is
/// RIP-relative (64-bit `mod=00 rm=101`).
fn modrm_len(code: &[u8]) -> Option<(usize, bool)> {
    let modrm = *code.first()?;
    let md = modrm >> 6;
    let rm = modrm & 0x07;
    let mut len = 1usize;
    let mut rip_relative = false;

    if md != 3 {
        if rm == 4 {
            let sib = *code.get(len)?;
            len += 1;
            if md == 0 && (sib & 0x07) == 5 {
                len += 4;
            }
        }
        match md {
            0 => {
                if rm == 5 {
                    len += 4;
                    rip_relative = cfg!(target_pointer_width = "64");
                }
            }
            1 => len += 1,
            2 => len += 4,
            _ => {}
        }
    }
    Some((len, rip_relative))
}

/// Finds the instruction boundary at or past `PATCH_LEN`.
fn patch_boundary(code: &[u8]) -> Result<usize, String> {
    let mut off = 0usize;
    while off < PATCH_LEN {
        let insn = insn_len(&code[off..])
            .ok_or_else(|| format!("unsupported instruction at prologue offset {off}"))?;
        if !insn.relocatable {
            return Err(format!("position-dependent instruction at prologue offset {off}"));
        }
        off += insn.len;
    }
    Ok(off)
}

fn write_abs_jump(buf: &mut [u8], dest: usize) -> usize {
    #[cfg(target_pointer_width = "64")]
    {
        buf[0] = 0xFF;
        buf[1] = 0x25;
        buf[2..6].fill(0);
        buf[6..14].copy_from_slice(&(dest as u64).to_le_bytes());
        14
    }
    #[cfg(target_pointer_width = "32")]
    {
        buf[0] = 0x68;
        buf[1..5].copy_from_slice(&(dest as u32).to_le_bytes());
        buf[5] = 0xC3;
        6
    }
}

fn wide_cstring(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Address of `func` inside an already-loaded `module`, or `None` when the
/// module is absent or does not export it (normal on older systems).
pub fn resolve_export(module: &str, func: &str) -> Option<*mut u8> {
    let module_w = wide_cstring(module);
    let func_c = std::ffi::CString::new(func).ok()?;
    unsafe {
        let hmod = GetModuleHandleW(module_w.as_ptr());
        if hmod.is_null() {
            return None;
        }
        let proc = GetProcAddress(hmod, func_c.as_ptr() as *const u8)?;
        Some(proc as *mut u8)
    }
}

impl Hook {
    /// Builds the trampoline for `target` without modifying it.
    ///
    /// # Safety
    /// `target` must be the entry of a function at least `MAX_SCAN` bytes
    /// long, and `detour` must share its exact ABI.
    pub unsafe fn prepare(target: *mut u8, detour: *const u8) -> Result<Self, String> {
        unsafe {
            let prologue = slice::from_raw_parts(target, MAX_SCAN);
            let boundary = patch_boundary(prologue)?;

            // Trampoline: displaced instructions + jump to the remainder.
            let trampoline = VirtualAlloc(
                ptr::null(),
                boundary + PATCH_LEN,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            ) as *mut u8;
            if trampoline.is_null() {
                return Err("VirtualAlloc failed for trampoline".to_string());
            }
            ptr::copy_nonoverlapping(target, trampoline, boundary);
            let back = slice::from_raw_parts_mut(trampoline.add(boundary), PATCH_LEN);
            write_abs_jump(back, target as usize + boundary);

            let mut saved = [0u8; MAX_SCAN];
            saved[..boundary].copy_from_slice(&prologue[..boundary]);

            Ok(Self {
                target,
                detour,
                saved,
                saved_len: boundary,
                trampoline,
                enabled: false,
            })
        }
    }

    /// Writes the entry patch. Idempotent.
    ///
    /// # Safety
    /// The same address must not be patched by anyone else.
    pub unsafe fn enable(&mut self) -> Result<(), String> {
        if self.enabled {
            return Ok(());
        }
        unsafe {
            let mut old = PAGE_PROTECTION_FLAGS::default();
            if VirtualProtect(
                self.target as _,
                self.saved_len,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            ) == 0
            {
                return Err("VirtualProtect failed for target".to_string());
            }

            let mut patch = [0u8; MAX_SCAN];
            let jump_len = write_abs_jump(&mut patch, self.detour as usize);
            // Pad the displaced tail with int3 so a stale mid-patch return
            // address faults loudly instead of executing garbage.
            patch[jump_len..self.saved_len].fill(0xCC);
            ptr::copy_nonoverlapping(patch.as_ptr(), self.target, self.saved_len);

            let mut tmp = PAGE_PROTECTION_FLAGS::default();
            VirtualProtect(self.target as _, self.saved_len, old, &mut tmp);
            FlushInstructionCache(GetCurrentProcess(), self.target as _, self.saved_len);
        }
        self.enabled = true;
        Ok(())
    }

    /// Restores the displaced bytes. Idempotent.
    ///
    /// # Safety
    /// Threads already past the entry keep running through the trampoline,
    /// which stays allocated until [`Hook::release`].
    pub unsafe fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        unsafe {
            let mut old = PAGE_PROTECTION_FLAGS::default();
            if VirtualProtect(
                self.target as _,
                self.saved_len,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            ) != 0
            {
                ptr::copy_nonoverlapping(self.saved.as_ptr(), self.target, self.saved_len);
                let mut tmp = PAGE_PROTECTION_FLAGS::default();
                VirtualProtect(self.target as _, self.saved_len, old, &mut tmp);
                FlushInstructionCache(GetCurrentProcess(), self.target as _, self.saved_len);
            }
        }
        self.enabled = false;
    }

    /// Frees the trampoline.
    ///
    /// # Safety
    /// The hook must be disabled and no thread may still be executing inside
    /// the trampoline.
    pub unsafe fn release(mut self) {
        unsafe {
            self.disable();
            VirtualFree(self.trampoline as _, 0, MEM_RELEASE);
        }
    }

    /// Entry point of the displaced prologue: the way to call the original
    /// function while the patch is active.
    pub fn original(&self) -> *const c_void {
        self.trampoline as *const c_void
    }
}
