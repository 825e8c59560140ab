//! Exit-function linking
//!
//! A block's linkable exit initially calls the exit-linker thunk through its
//! link record. On first execution the linker resolves the guest target in
//! the lookup cache: a hit either rewrites the call site into a direct
//! branch (when the displacement fits the host's direct-branch range) or
//! patches the record's host slot so future calls skip resolution. Every
//! patch registers an undo closure with the cache that restores the call
//! site byte-for-byte when the target is invalidated.

use crate::arch::aarch64 as a64;
use crate::arch::riscv as rv;
use crate::arch::HostIsa;
use crate::codebuf::flush_icache;
use crate::lookup::LookupCache;

/// Offset from the link record back to the patchable call site
fn site_from_record(isa: HostIsa, record: u64) -> u64 {
    match isa {
        HostIsa::Aarch64 => record - 8,
        HostIsa::Riscv64 => record - 16,
    }
}

/// Write one instruction word into live code and keep I-cache coherent.
///
/// # Safety
/// `addr` must point into a writable+executable code buffer.
unsafe fn write_insn(addr: u64, word: u32) {
    (addr as *mut u32).write_volatile(word);
}

/// Restore the canonical unlinked call-site shape at `site`.
///
/// # Safety
/// `site`/`record` must be a call site emitted by the matching backend.
unsafe fn write_indirect_form(isa: HostIsa, site: u64, record: u64, linker_address: u64) {
    match isa {
        HostIsa::Aarch64 => {
            write_insn(site, a64::encode_ldr_literal(a64::X0, 8));
            write_insn(site + 4, a64::encode_blr(a64::X0));
            (record as *mut u64).write_volatile(linker_address);
            flush_icache(site, 8);
        }
        HostIsa::Riscv64 => {
            for (i, word) in super::riscv::indirect_exit_words().iter().enumerate() {
                write_insn(site + (i as u64) * 4, *word);
            }
            (record as *mut u64).write_volatile(linker_address);
            flush_icache(site, 16);
        }
    }
}

/// Whether a direct branch from `site` to `target` fits the ISA's
/// PC-relative direct-branch immediate.
fn direct_branch_fits(isa: HostIsa, site: u64, target: u64) -> bool {
    match isa {
        HostIsa::Aarch64 => a64::branch_offset_fits(site, target),
        HostIsa::Riscv64 => rv::jump_offset_fits(site, target),
    }
}

/// Outcome of one linker invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkResult {
    /// Target not compiled yet; caller sets guest RIP and re-enters the
    /// dispatcher loop
    Missing { guest_target: u64 },
    /// Target resolved; continue executing at this host address
    Linked { host_code: u64 },
}

/// Resolve the exit behind `record` and patch the call site.
///
/// # Safety
/// `record` must point at a live 16-byte link record emitted by the
/// matching backend, inside a code buffer registered with `cache`.
pub unsafe fn exit_function_link(
    cache: &mut LookupCache,
    isa: HostIsa,
    record: u64,
    linker_address: u64,
) -> LinkResult {
    let record_ptr = record as *mut u64;
    let guest_target = record_ptr.add(1).read_volatile();

    let host_code = cache.find_block(guest_target);
    if host_code == 0 {
        return LinkResult::Missing { guest_target };
    }

    let site = site_from_record(isa, record);
    if direct_branch_fits(isa, site, host_code) {
        // Optimal case: rewrite the call into a direct branch. The record's
        // host slot tracks the resolved target as well.
        record_ptr.write_volatile(host_code);
        match isa {
            HostIsa::Aarch64 => {
                write_insn(site, a64::encode_b(host_code as i64 - site as i64));
                flush_icache(site, 4);
            }
            HostIsa::Riscv64 => {
                write_insn(site, rv::encode_j(host_code as i64 - site as i64));
                flush_icache(site, 4);
            }
        }
        cache.add_block_link(guest_target, site, move || {
            write_indirect_form(isa, site, record, linker_address);
        });
    } else {
        // Soft link: future calls through the record skip resolution
        record_ptr.write_volatile(host_code);
        cache.add_block_link(guest_target, site, move || {
            (record as *mut u64).write_volatile(linker_address);
        });
    }

    LinkResult::Linked { host_code }
}
