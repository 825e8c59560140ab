//! Front-end interface and reference decoder
//!
//! The production front-end (full decoder, optimizer, register allocator)
//! lives outside the core; `BlockSource` is the contract the dispatcher
//! compiles through. `MiniDecoder` is a reference implementation covering a
//! small x86-64 subset, enough to drive the runner and the end-to-end tests
//! with hand-coded guest images.

use crate::ir::{IrBlock, IrBlockBuilder, IrInst, Node};
use crate::ra::{PhysReg, RegAllocData, RegClass};
use crate::state::CpuStateFrame;

/// Produces the IR and allocation decisions for one guest basic block.
pub trait BlockSource: Send {
    fn compile_ir(&mut self, frame: &CpuStateFrame, guest_rip: u64) -> (IrBlock, RegAllocData);
}

/// Reference front-end: decodes a small x86-64 subset directly from guest
/// memory (guest addresses are host addresses in this process model).
///
/// Supported: `mov r32, imm32`, `mov r64, imm64` (REX.W), `add eax, imm32`,
/// `add/xor r32, r32`, `jmp rel8/rel32`, `syscall`, `ret`, `nop`, `hlt`.
pub struct MiniDecoder {
    /// Guest RIP of the sigreturn trampoline; decodes to a `SignalReturn` op
    pub signal_return_address: u64,
}

impl MiniDecoder {
    pub fn new(signal_return_address: u64) -> Self {
        MiniDecoder { signal_return_address }
    }
}

/// Round-robin allocator over the dynamic GPR class, small enough for the
/// reference decoder's short blocks.
struct MiniAlloc {
    regs: Vec<(Node, PhysReg)>,
    next: u8,
}

const DYNAMIC_REGS: u8 = 6;

impl MiniAlloc {
    fn new() -> Self {
        MiniAlloc { regs: Vec::new(), next: 0 }
    }

    fn assign(&mut self, node: Node) -> Node {
        let reg = PhysReg { class: RegClass::Gpr, index: self.next };
        self.next = (self.next + 1) % DYNAMIC_REGS;
        self.regs.push((node, reg));
        node
    }

    fn finish(self, ssa_count: u32) -> RegAllocData {
        let mut ra = RegAllocData::new(ssa_count, 0);
        for (node, reg) in self.regs {
            ra.set_register(node, reg);
        }
        ra
    }
}

unsafe fn fetch(rip: u64, offset: u64) -> u8 {
    ((rip + offset) as *const u8).read()
}

unsafe fn fetch_u32(rip: u64, offset: u64) -> u32 {
    ((rip + offset) as *const u32).read_unaligned()
}

unsafe fn fetch_u64(rip: u64, offset: u64) -> u64 {
    ((rip + offset) as *const u64).read_unaligned()
}

impl BlockSource for MiniDecoder {
    fn compile_ir(&mut self, _frame: &CpuStateFrame, guest_rip: u64) -> (IrBlock, RegAllocData) {
        let mut b = IrBlockBuilder::new(guest_rip);
        let mut alloc = MiniAlloc::new();
        b.begin_block();

        if guest_rip == self.signal_return_address {
            b.push(IrInst::SignalReturn);
            let ir = b.finish();
            let ra = alloc.finish(ir.ssa_count);
            return (ir, ra);
        }

        let mut offset = 0u64;
        loop {
            // Safety: the caller guarantees guest_rip points at mapped guest
            // code; the decoder stops at the first control transfer.
            let opcode = unsafe { fetch(guest_rip, offset) };
            match opcode {
                0x90 => {
                    // nop
                    offset += 1;
                }
                0xB8..=0xBF => {
                    // mov r32, imm32
                    let imm = unsafe { fetch_u32(guest_rip, offset + 1) };
                    let dest = alloc.assign(b.alloc_node());
                    b.push(IrInst::Constant { dest, value: imm as u64 });
                    b.push(IrInst::StoreRegister {
                        value: dest,
                        reg: modrm_reg_to_guest(opcode - 0xB8),
                    });
                    offset += 5;
                }
                0x48 => {
                    let op2 = unsafe { fetch(guest_rip, offset + 1) };
                    match op2 {
                        0xB8..=0xBF => {
                            // mov r64, imm64
                            let imm = unsafe { fetch_u64(guest_rip, offset + 2) };
                            let dest = alloc.assign(b.alloc_node());
                            b.push(IrInst::Constant { dest, value: imm });
                            b.push(IrInst::StoreRegister {
                                value: dest,
                                reg: modrm_reg_to_guest(op2 - 0xB8),
                            });
                            offset += 10;
                        }
                        _ => {
                            b.push(IrInst::Break);
                            break;
                        }
                    }
                }
                0x05 => {
                    // add eax, imm32
                    let imm = unsafe { fetch_u32(guest_rip, offset + 1) };
                    let a = alloc.assign(b.alloc_node());
                    b.push(IrInst::LoadRegister { dest: a, reg: 0 });
                    let c = b.inline_constant(imm as u64);
                    let sum = alloc.assign(b.alloc_node());
                    b.push(IrInst::Add { dest: sum, size: 4, a, b: c });
                    b.push(IrInst::StoreRegister { value: sum, reg: 0 });
                    offset += 5;
                }
                0x01 | 0x31 => {
                    // add/xor r/m32, r32 (register form only)
                    let modrm = unsafe { fetch(guest_rip, offset + 1) };
                    if modrm >> 6 != 0b11 {
                        b.push(IrInst::Break);
                        break;
                    }
                    let src_reg = modrm_reg_to_guest((modrm >> 3) & 7);
                    let dst_reg = modrm_reg_to_guest(modrm & 7);
                    let a = alloc.assign(b.alloc_node());
                    b.push(IrInst::LoadRegister { dest: a, reg: dst_reg });
                    let rhs = alloc.assign(b.alloc_node());
                    b.push(IrInst::LoadRegister { dest: rhs, reg: src_reg });
                    let result = alloc.assign(b.alloc_node());
                    if opcode == 0x01 {
                        b.push(IrInst::Add { dest: result, size: 4, a, b: rhs });
                    } else {
                        b.push(IrInst::Xor { dest: result, a, b: rhs });
                    }
                    b.push(IrInst::StoreRegister { value: result, reg: dst_reg });
                    offset += 2;
                }
                0xEB => {
                    // jmp rel8
                    let rel = unsafe { fetch(guest_rip, offset + 1) } as i8;
                    let target_off = (offset + 2).wrapping_add(rel as u64);
                    let t = b.alloc_node();
                    b.push(IrInst::InlineEntrypointOffset {
                        dest: t,
                        offset: target_off as i64,
                        size: 8,
                    });
                    b.push(IrInst::ExitFunction { new_rip: t });
                    break;
                }
                0xE9 => {
                    // jmp rel32
                    let rel = unsafe { fetch_u32(guest_rip, offset + 1) } as i32;
                    let target_off = (offset + 5).wrapping_add(rel as i64 as u64);
                    let t = b.alloc_node();
                    b.push(IrInst::InlineEntrypointOffset {
                        dest: t,
                        offset: target_off as i64,
                        size: 8,
                    });
                    b.push(IrInst::ExitFunction { new_rip: t });
                    break;
                }
                0x0F => {
                    let op2 = unsafe { fetch(guest_rip, offset + 1) };
                    if op2 == 0x05 {
                        // syscall
                        b.push(IrInst::Syscall);
                        let t = b.alloc_node();
                        b.push(IrInst::InlineEntrypointOffset {
                            dest: t,
                            offset: (offset + 2) as i64,
                            size: 8,
                        });
                        b.push(IrInst::ExitFunction { new_rip: t });
                    } else {
                        b.push(IrInst::Break);
                    }
                    break;
                }
                0xC3 => {
                    // ret: pop the return address and leave indirectly
                    let rsp = alloc.assign(b.alloc_node());
                    b.push(IrInst::LoadRegister { dest: rsp, reg: 7 });
                    let target = alloc.assign(b.alloc_node());
                    b.push(IrInst::LoadMem { dest: target, addr: rsp, size: 8, tso: false });
                    let eight = b.inline_constant(8);
                    let new_rsp = alloc.assign(b.alloc_node());
                    b.push(IrInst::Add { dest: new_rsp, size: 8, a: rsp, b: eight });
                    b.push(IrInst::StoreRegister { value: new_rsp, reg: 7 });
                    b.push(IrInst::ExitFunction { new_rip: target });
                    break;
                }
                0xF4 => {
                    // hlt: privileged in user mode, becomes a guest fault
                    b.push(IrInst::Break);
                    break;
                }
                _ => {
                    b.push(IrInst::Break);
                    break;
                }
            }
        }

        let ir = b.finish();
        let ra = alloc.finish(ir.ssa_count);
        (ir, ra)
    }
}

/// Map a 3-bit x86 register encoding to the guest register file index
fn modrm_reg_to_guest(encoded: u8) -> u8 {
    // Encoding order: eax, ecx, edx, ebx, esp, ebp, esi, edi
    const MAP: [u8; 8] = [0, 2, 3, 1, 7, 6, 4, 5];
    MAP[encoded as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Reg;

    fn decode(code: &[u8]) -> (IrBlock, RegAllocData) {
        let mut decoder = MiniDecoder::new(u64::MAX);
        let frame = CpuStateFrame::new();
        decoder.compile_ir(&frame, code.as_ptr() as u64)
    }

    #[test]
    fn test_decode_mov_add_jmp() {
        // mov eax, 3 ; add eax, 4 ; jmp +0
        let code = [0xB8, 3, 0, 0, 0, 0x05, 4, 0, 0, 0, 0xEB, 0x00];
        let (ir, _ra) = decode(&code);
        let insts = &ir.blocks[0].insts;
        assert!(matches!(insts[0], IrInst::Constant { value: 3, .. }));
        assert!(matches!(
            insts[1],
            IrInst::StoreRegister { reg, .. } if reg == Reg::Rax as u8
        ));
        assert!(matches!(insts[4], IrInst::Add { size: 4, .. }));
        assert!(matches!(insts.last(), Some(IrInst::ExitFunction { .. })));
    }

    #[test]
    fn test_decode_jmp_target_offset() {
        // jmp rel32 to +0x100 from instruction end
        let mut code = vec![0xE9];
        code.extend_from_slice(&0xFBu32.to_le_bytes());
        let (ir, _) = decode(&code);
        let IrInst::InlineEntrypointOffset { offset, .. } = ir.blocks[0].insts[0] else {
            panic!("expected entrypoint-offset carrier");
        };
        assert_eq!(offset, 0x100);
    }

    #[test]
    fn test_decode_register_forms() {
        // add ebx, eax (01 C3) ; xor ecx, ecx (31 C9) ; hlt
        let code = [0x01, 0xC3, 0x31, 0xC9, 0xF4];
        let (ir, _) = decode(&code);
        let insts = &ir.blocks[0].insts;
        assert!(matches!(
            insts[2],
            IrInst::Add { size: 4, .. }
        ));
        assert!(insts.iter().any(|i| matches!(i, IrInst::Xor { .. })));
        assert!(matches!(insts.last(), Some(IrInst::Break)));
    }

    #[test]
    fn test_decode_syscall_exits_block() {
        // mov eax, 60 ; syscall
        let code = [0xB8, 60, 0, 0, 0, 0x0F, 0x05];
        let (ir, _) = decode(&code);
        let insts = &ir.blocks[0].insts;
        assert!(insts.iter().any(|i| matches!(i, IrInst::Syscall)));
        assert!(matches!(insts.last(), Some(IrInst::ExitFunction { .. })));
    }

    #[test]
    fn test_signal_return_address_decodes_to_signal_return() {
        let mut decoder = MiniDecoder::new(0x9000);
        let frame = CpuStateFrame::new();
        let (ir, _) = decoder.compile_ir(&frame, 0x9000);
        assert!(matches!(ir.blocks[0].insts[0], IrInst::SignalReturn));
    }

    #[test]
    fn test_decode_ret() {
        let code = [0xC3];
        let (ir, _) = decode(&code);
        let insts = &ir.blocks[0].insts;
        assert!(matches!(insts[1], IrInst::LoadMem { size: 8, .. }));
        assert!(matches!(insts.last(), Some(IrInst::ExitFunction { .. })));
    }
}
