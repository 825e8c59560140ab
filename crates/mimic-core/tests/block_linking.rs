//! Direct-branch linking through the whole thread-level path: decode two
//! guest blocks with the reference front-end, link A's exit to B, then undo
//! through cache invalidation and a full clear.

use mimic_core::arch::aarch64::encode_b;
use mimic_core::config::EngineConfig;
use mimic_core::frontend::MiniDecoder;
use mimic_core::hooks::{DefaultCpuid, DenySyscalls};
use mimic_core::jit::linker::{exit_function_link, LinkResult};
use mimic_core::thread::{Engine, ThreadState};
use mimic_core::{HostIsa, Reg};

fn test_thread() -> Box<ThreadState> {
    let engine = Engine::new(EngineConfig::default(), HostIsa::Aarch64);
    ThreadState::new(
        engine,
        Box::new(MiniDecoder::new(0x9000)),
        Box::new(DefaultCpuid),
        Box::new(DenySyscalls),
        0x9000,
    )
    .unwrap()
}

/// Guest image: block A at +0 is `jmp +0x100`; block B at +0x100 is
/// `mov eax, 42 ; jmp self`.
fn guest_image() -> Vec<u8> {
    let mut image = vec![0x90u8; 0x110];
    image[0] = 0xE9;
    image[1..5].copy_from_slice(&0xFBu32.to_le_bytes());
    image[0x100] = 0xB8;
    image[0x101..0x105].copy_from_slice(&42u32.to_le_bytes());
    image[0x105] = 0xEB;
    image[0x106] = 0xFE; // jmp self
    image
}

unsafe fn read_u32(addr: u64) -> u32 {
    (addr as *const u32).read()
}

unsafe fn read_u64(addr: u64) -> u64 {
    (addr as *const u64).read()
}

#[test]
fn test_link_patch_and_unlink_round_trip() {
    let mut thread = test_thread();
    let image = guest_image();
    let entry_a = image.as_ptr() as u64;
    let entry_b = entry_a + 0x100;

    let a = thread.compile_block_debug(entry_a);
    let b_host = thread.compile_block(entry_b);

    // compile followed by find returns the compile result
    assert_eq!(thread.lookup_cache.find_block(entry_a), a.host_entry);
    assert_eq!(thread.lookup_cache.find_block(entry_b), b_host);

    let site = a.exit_sites[0];
    assert_eq!(site.guest_target, entry_b);
    let original: Vec<u8> = unsafe {
        std::slice::from_raw_parts(site.site as *const u8, 24).to_vec()
    };

    // First execution of the exit resolves and patches the site
    let isa = HostIsa::Aarch64;
    let linker = thread.dispatcher.exit_function_linker;
    let result = unsafe {
        exit_function_link(&mut thread.lookup_cache, isa, site.record, linker)
    };
    assert_eq!(result, LinkResult::Linked { host_code: b_host });

    unsafe {
        // Call site now decodes as a 26-bit PC-relative branch to B
        assert_eq!(
            read_u32(site.site),
            encode_b(b_host as i64 - site.site as i64)
        );
        // Record slot 0 tracks B's host entry, slot 1 the guest target
        assert_eq!(read_u64(site.record), b_host);
        assert_eq!(read_u64(site.record + 8), entry_b);
    }

    // A full clear runs the undo closure: the site is byte-identical to its
    // pre-patch form.
    assert!(thread.clear_cache());
    let restored: Vec<u8> = unsafe {
        std::slice::from_raw_parts(site.site as *const u8, 24).to_vec()
    };
    assert_eq!(original, restored);
    assert_eq!(thread.lookup_cache.find_block(entry_a), 0);
}

#[test]
fn test_invalidate_target_restores_indirect_form() {
    let mut thread = test_thread();
    let image = guest_image();
    let entry_a = image.as_ptr() as u64;
    let entry_b = entry_a + 0x100;

    let a = thread.compile_block_debug(entry_a);
    let b_host = thread.compile_block(entry_b);
    let site = a.exit_sites[0];
    let original: Vec<u8> = unsafe {
        std::slice::from_raw_parts(site.site as *const u8, 24).to_vec()
    };

    let linker = thread.dispatcher.exit_function_linker;
    unsafe {
        let result =
            exit_function_link(&mut thread.lookup_cache, HostIsa::Aarch64, site.record, linker);
        assert_eq!(result, LinkResult::Linked { host_code: b_host });
    }

    // Guest unmaps B's page: every predecessor branch must fall back to the
    // linker, and B must vanish from the cache.
    thread.lookup_cache.invalidate_range(entry_b, entry_b + 0x1000);
    let restored: Vec<u8> = unsafe {
        std::slice::from_raw_parts(site.site as *const u8, 24).to_vec()
    };
    assert_eq!(original, restored);
    assert_eq!(thread.lookup_cache.find_block(entry_b), 0);
    // A itself is still translated
    assert_eq!(thread.lookup_cache.find_block(entry_a), a.host_entry);

    // A relink after recompiling B works again
    let b_host2 = thread.compile_block(entry_b);
    unsafe {
        let result =
            exit_function_link(&mut thread.lookup_cache, HostIsa::Aarch64, site.record, linker);
        assert_eq!(result, LinkResult::Linked { host_code: b_host2 });
    }
}

#[test]
fn test_link_miss_sets_rip_path() {
    let mut thread = test_thread();
    let image = guest_image();
    let entry_a = image.as_ptr() as u64;

    let a = thread.compile_block_debug(entry_a);
    let site = a.exit_sites[0];
    let linker = thread.dispatcher.exit_function_linker;

    // B not compiled yet: the linker reports the miss with the guest target
    let result = unsafe {
        exit_function_link(&mut thread.lookup_cache, HostIsa::Aarch64, site.record, linker)
    };
    assert_eq!(
        result,
        LinkResult::Missing { guest_target: entry_a + 0x100 }
    );
}

#[test]
fn test_register_state_survives_compile() {
    // Compiling must not disturb the architectural frame
    let mut thread = test_thread();
    let image = guest_image();
    thread.frame.state.gregs[Reg::Rax as usize] = 0xABCD;
    thread.compile_block(image.as_ptr() as u64);
    assert_eq!(thread.frame.state.gregs[Reg::Rax as usize], 0xABCD);
}
