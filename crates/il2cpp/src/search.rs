//! Instruction-signature search for the `il2cpp_codegen_register` call site
//!
//! The runtime hands both registrations to the registration routine as its
//! first two arguments, so the call site materialises their addresses right
//! before the call.

use crate::section_helper::SectionHelper;
use ilrecover_core::Architecture;
use tracing::debug;

/// `lea rcx, [rip+disp32]`
const LEA_RCX: [u8; 3] = [0x48, 0x8D, 0x0D];
/// `lea rdx, [rip+disp32]`
const LEA_RDX: [u8; 3] = [0x48, 0x8D, 0x15];
const LEA_LEN: usize = 7;
/// Farthest distance between the two `lea` instructions
const LEA_WINDOW: usize = 50;

const PUSH_IMM32: u8 = 0x68;
const CALL_REL32: u8 = 0xE8;

/// Instructions followed after an `adrp x0`
const ARM64_WINDOW: usize = 6;

/// Search the executable ranges for a registration call site.
///
/// Returns `(code_registration, metadata_registration)` for the first
/// candidate whose targets are plausible.
pub fn find_registrations(helper: &SectionHelper<'_>) -> Option<(u64, u64)> {
    let found = match helper.file().architecture() {
        Architecture::X64 => search_x64(helper),
        Architecture::X86 => search_x86(helper),
        Architecture::Arm64 => search_arm64(helper),
        arch => {
            debug!("No call-site signature for {:?}", arch);
            None
        }
    };
    if let Some((code, meta)) = found {
        debug!("Signature match: code {:#x}, metadata {:#x}", code, meta);
    }
    found
}

fn accept(helper: &SectionHelper<'_>, code: u64, meta: u64) -> bool {
    helper.in_data(code) && helper.in_data(meta) && helper.is_metadata_registration(meta)
}

fn exec_ranges<'a>(helper: &SectionHelper<'a>) -> Vec<(u64, &'a [u8])> {
    let data = helper.file().data();
    helper
        .exec()
        .iter()
        .filter_map(|s| {
            let bytes = data.get(s.offset as usize..s.offset_end as usize)?;
            Some((s.address, bytes))
        })
        .collect()
}

fn disp32(bytes: &[u8], at: usize) -> i64 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as i64
}

fn search_x64(helper: &SectionHelper<'_>) -> Option<(u64, u64)> {
    for (base, bytes) in exec_ranges(helper) {
        if bytes.len() < LEA_LEN * 2 {
            continue;
        }
        for i in 0..=bytes.len() - LEA_LEN * 2 {
            if !bytes[i..].starts_with(&LEA_RCX) {
                continue;
            }
            let code = (base + (i + LEA_LEN) as u64).wrapping_add_signed(disp32(bytes, i + 3));

            let last = (i + LEA_WINDOW).min(bytes.len() - LEA_LEN);
            for j in i + LEA_LEN..=last {
                if !bytes[j..].starts_with(&LEA_RDX) {
                    continue;
                }
                let meta =
                    (base + (j + LEA_LEN) as u64).wrapping_add_signed(disp32(bytes, j + 3));
                if accept(helper, code, meta) {
                    return Some((code, meta));
                }
            }
        }
    }
    None
}

/// `push options; push metadata; push code; call`
fn search_x86(helper: &SectionHelper<'_>) -> Option<(u64, u64)> {
    const LEN: usize = 16;
    for (_, bytes) in exec_ranges(helper) {
        if bytes.len() < LEN {
            continue;
        }
        for i in 0..=bytes.len() - LEN {
            let window = &bytes[i..i + LEN];
            if window[0] != PUSH_IMM32
                || window[5] != PUSH_IMM32
                || window[10] != PUSH_IMM32
                || window[15] != CALL_REL32
            {
                continue;
            }
            let meta = u32::from_le_bytes([window[6], window[7], window[8], window[9]]) as u64;
            let code = u32::from_le_bytes([window[11], window[12], window[13], window[14]]) as u64;
            if accept(helper, code, meta) {
                return Some((code, meta));
            }
        }
    }
    None
}

fn is_adrp(insn: u32) -> bool {
    insn & 0x9F00_0000 == 0x9000_0000
}

fn is_add_imm64(insn: u32) -> bool {
    insn & 0xFF80_0000 == 0x9100_0000
}

/// `add xD, xN, #imm12{, lsl #12}` immediate
fn add_imm(insn: u32) -> u64 {
    let imm12 = ((insn >> 10) & 0xFFF) as u64;
    if insn & (1 << 22) != 0 {
        imm12 << 12
    } else {
        imm12
    }
}

fn adrp_target(insn: u32, pc: u64) -> u64 {
    let immlo = ((insn >> 29) & 0x3) as i64;
    let immhi = ((insn >> 5) & 0x7FFFF) as i64;
    let imm = (immhi << 2) | immlo;
    // sign-extend 21 bits
    let imm = (imm << 43) >> 43;
    (pc & !0xFFF).wrapping_add_signed(imm << 12)
}

/// `adrp x0; add x0` and `adrp x1; add x1`, in any interleaving
fn search_arm64(helper: &SectionHelper<'_>) -> Option<(u64, u64)> {
    for (base, bytes) in exec_ranges(helper) {
        let insns: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        for (i, &first) in insns.iter().enumerate() {
            if !is_adrp(first) || first & 0x1F != 0 {
                continue;
            }

            let mut regs = [None::<u64>; 32];
            for (k, &insn) in insns[i..].iter().take(ARM64_WINDOW).enumerate() {
                let pc = base + ((i + k) * 4) as u64;
                let rd = (insn & 0x1F) as usize;
                if is_adrp(insn) {
                    regs[rd] = Some(adrp_target(insn, pc));
                } else if is_add_imm64(insn) {
                    let rn = ((insn >> 5) & 0x1F) as usize;
                    regs[rd] = regs[rn].and_then(|v| v.checked_add(add_imm(insn)));
                }
            }

            if let (Some(code), Some(meta)) = (regs[0], regs[1]) {
                if accept(helper, code, meta) {
                    return Some((code, meta));
                }
            }
        }
    }
    None
}
