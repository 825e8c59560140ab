//! Block lookup cache
//!
//! Maps guest RIP to host entry addresses with two levels: a small
//! direct-mapped L1 probed from the dispatcher loop, and a page-structured
//! L2 that resolves aliasing by storing the full guest RIP alongside the
//! host address. Reverse block links record every patched direct branch so
//! invalidation can rewrite call sites back through the exit linker.
//!
//! The cache is private to one guest thread; nothing here takes a lock.

use rustc_hash::FxHashMap;

/// One `{host, guest}` pair; layout shared with generated lookup code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct LookupEntry {
    pub host_code: u64,
    pub guest_code: u64,
}

impl LookupEntry {
    const EMPTY: LookupEntry = LookupEntry { host_code: 0, guest_code: 0 };
}

/// Number of direct-mapped L1 entries (power of two)
pub const L1_ENTRIES: usize = 8192;
pub const L1_ENTRIES_MASK: u64 = (L1_ENTRIES as u64) - 1;

const PAGE_SHIFT: u64 = 12;
const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;
const ENTRIES_PER_PAGE: usize = 1 << PAGE_SHIFT;

/// Undo closure plus the call site it restores
pub struct BlockLink {
    pub site: u64,
    undo: Box<dyn FnMut() + Send>,
}

/// Two-level guest-RIP to host-code cache with reverse link tracking
pub struct LookupCache {
    l1: Box<[LookupEntry]>,
    /// Page directory: one slot per guest page, pointing at a lazily
    /// allocated array of `ENTRIES_PER_PAGE` entries.
    page_dir: Vec<Option<Box<[LookupEntry]>>>,
    virtual_memory_size: u64,
    /// Full guest → host map, for range enumeration during invalidation
    block_list: FxHashMap<u64, u64>,
    /// Guest RIP → direct branches that currently bypass the linker
    block_links: FxHashMap<u64, Vec<BlockLink>>,
}

impl LookupCache {
    pub fn new(virtual_memory_size: u64) -> Self {
        assert!(virtual_memory_size.is_power_of_two());
        let dir_entries = (virtual_memory_size >> PAGE_SHIFT) as usize;
        let mut page_dir = Vec::new();
        page_dir.resize_with(dir_entries, || None);
        LookupCache {
            l1: vec![LookupEntry::EMPTY; L1_ENTRIES].into_boxed_slice(),
            page_dir,
            virtual_memory_size,
            block_list: FxHashMap::default(),
            block_links: FxHashMap::default(),
        }
    }

    /// Base address of the L1 table, published in the thread pointer table.
    pub fn l1_pointer(&self) -> u64 {
        self.l1.as_ptr() as u64
    }

    pub fn virtual_memory_size(&self) -> u64 {
        self.virtual_memory_size
    }

    fn page_indices(&self, guest_rip: u64) -> (usize, usize) {
        let masked = guest_rip & (self.virtual_memory_size - 1);
        ((masked >> PAGE_SHIFT) as usize, (masked & PAGE_MASK) as usize)
    }

    /// Fast-path probe: L1 first, then the full table. Returns 0 on miss.
    pub fn find_block(&mut self, guest_rip: u64) -> u64 {
        let l1 = &mut self.l1[(guest_rip & L1_ENTRIES_MASK) as usize];
        if l1.guest_code == guest_rip && l1.host_code != 0 {
            return l1.host_code;
        }

        let (page, offset) = self.page_indices(guest_rip);
        let Some(entries) = self.page_dir[page].as_ref() else {
            return 0;
        };
        let entry = entries[offset];
        // Aliasing check: the masked index can collide across the virtual
        // memory window, so the stored guest RIP must match exactly.
        if entry.guest_code != guest_rip {
            return 0;
        }
        entry.host_code
    }

    /// Refresh the direct-mapped slot after a full lookup or compile.
    pub fn refresh_l1(&mut self, guest_rip: u64, host_code: u64) {
        self.l1[(guest_rip & L1_ENTRIES_MASK) as usize] =
            LookupEntry { host_code, guest_code: guest_rip };
    }

    /// Record a translation. L1 is left alone; the dispatcher refreshes it
    /// on the next miss.
    pub fn insert(&mut self, guest_rip: u64, host_code: u64) {
        let (page, offset) = self.page_indices(guest_rip);
        let entries = self.page_dir[page]
            .get_or_insert_with(|| vec![LookupEntry::EMPTY; ENTRIES_PER_PAGE].into_boxed_slice());
        entries[offset] = LookupEntry { host_code, guest_code: guest_rip };
        self.block_list.insert(guest_rip, host_code);
    }

    /// Record a reverse dependency: `site` was patched to branch directly to
    /// the translation of `guest_rip`, and `undo` restores the indirect form.
    pub fn add_block_link(
        &mut self,
        guest_rip: u64,
        site: u64,
        undo: impl FnMut() + Send + 'static,
    ) {
        self.block_links
            .entry(guest_rip)
            .or_default()
            .push(BlockLink { site, undo: Box::new(undo) });
    }

    fn delink(&mut self, guest_rip: u64) {
        if let Some(mut links) = self.block_links.remove(&guest_rip) {
            for link in &mut links {
                (link.undo)();
            }
        }
    }

    fn erase(&mut self, guest_rip: u64) {
        self.delink(guest_rip);
        self.block_list.remove(&guest_rip);

        let (page, offset) = self.page_indices(guest_rip);
        if let Some(entries) = self.page_dir[page].as_mut() {
            if entries[offset].guest_code == guest_rip {
                entries[offset] = LookupEntry::EMPTY;
            }
        }

        let l1 = &mut self.l1[(guest_rip & L1_ENTRIES_MASK) as usize];
        if l1.guest_code == guest_rip {
            *l1 = LookupEntry::EMPTY;
        }
    }

    /// Drop every translation whose guest RIP falls in `[start, end)`,
    /// running undo closures so no direct branch bypasses the linker.
    /// Returns how many blocks were invalidated.
    pub fn invalidate_range(&mut self, start: u64, end: u64) -> usize {
        let victims: Vec<u64> = self
            .block_list
            .keys()
            .copied()
            .filter(|&rip| rip >= start && rip < end)
            .collect();
        for rip in &victims {
            self.erase(*rip);
        }
        victims.len()
    }

    /// Wholesale clear, used when the code buffer is recycled. Undo
    /// closures still run first: the buffers are only reset afterwards, and
    /// no direct branch may outlive its target's translation.
    pub fn clear(&mut self) {
        let targets: Vec<u64> = self.block_links.keys().copied().collect();
        for rip in targets {
            self.delink(rip);
        }
        self.l1.fill(LookupEntry::EMPTY);
        for page in self.page_dir.iter_mut() {
            *page = None;
        }
        self.block_list.clear();
    }

    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cache() -> LookupCache {
        LookupCache::new(1 << 32)
    }

    #[test]
    fn test_insert_then_find() {
        let mut c = cache();
        assert_eq!(c.find_block(0x40_0000), 0);
        c.insert(0x40_0000, 0x7000_0000);
        assert_eq!(c.find_block(0x40_0000), 0x7000_0000);
        assert_eq!(c.block_count(), 1);
    }

    #[test]
    fn test_aliasing_is_rejected() {
        let mut c = cache();
        // Two guest RIPs that collide in the masked window
        let a = 0x40_0000u64;
        let b = a + (1 << 32);
        c.insert(a, 0x7000_0000);
        assert_eq!(c.find_block(b), 0, "aliased RIP must not hit");
        assert_eq!(c.find_block(a), 0x7000_0000);
    }

    #[test]
    fn test_l1_mirrors_l2() {
        let mut c = cache();
        c.insert(0x1234, 0x9000);
        c.refresh_l1(0x1234, 0x9000);
        // An L1 hit and the full walk must agree
        assert_eq!(c.find_block(0x1234), 0x9000);

        // L1 slot collision: a different RIP mapping to the same slot
        // overwrites it, and the full walk still resolves the original.
        let collider = 0x1234 + L1_ENTRIES as u64;
        c.insert(collider, 0xA000);
        c.refresh_l1(collider, 0xA000);
        assert_eq!(c.find_block(0x1234), 0x9000);
    }

    #[test]
    fn test_invalidate_range_runs_undo_closures() {
        let mut c = cache();
        c.insert(0x40_0000, 0x9000);
        c.insert(0x40_1000, 0x9100);
        c.insert(0x50_0000, 0x9200);

        let undone = Arc::new(AtomicUsize::new(0));
        let u1 = undone.clone();
        c.add_block_link(0x40_0000, 0x8000, move || {
            u1.fetch_add(1, Ordering::Relaxed);
        });
        let u2 = undone.clone();
        c.add_block_link(0x40_1000, 0x8010, move || {
            u2.fetch_add(1, Ordering::Relaxed);
        });

        let count = c.invalidate_range(0x40_0000, 0x41_0000);
        assert_eq!(count, 2);
        assert_eq!(undone.load(Ordering::Relaxed), 2);
        assert_eq!(c.find_block(0x40_0000), 0);
        assert_eq!(c.find_block(0x40_1000), 0);
        // Out-of-range block survives
        assert_eq!(c.find_block(0x50_0000), 0x9200);
    }

    #[test]
    fn test_invalidate_clears_stale_l1() {
        let mut c = cache();
        c.insert(0x2000, 0x9000);
        c.refresh_l1(0x2000, 0x9000);
        c.invalidate_range(0x2000, 0x2001);
        assert_eq!(c.find_block(0x2000), 0, "stale L1 entry after invalidate");
    }

    #[test]
    fn test_clear_drops_everything_and_delinks() {
        let mut c = cache();
        c.insert(0x1000, 0x9000);
        c.insert(0x2000, 0x9100);
        c.refresh_l1(0x1000, 0x9000);
        let undone = Arc::new(AtomicUsize::new(0));
        let u = undone.clone();
        c.add_block_link(0x1000, 0x8000, move || {
            u.fetch_add(1, Ordering::Relaxed);
        });
        c.clear();
        assert_eq!(undone.load(Ordering::Relaxed), 1);
        assert_eq!(c.block_count(), 0);
        assert_eq!(c.find_block(0x1000), 0);
        assert_eq!(c.find_block(0x2000), 0);
    }

    #[test]
    fn test_compile_then_find_contract() {
        // compile_block(pc) followed by find(pc) returns the same host PC
        let mut c = cache();
        c.insert(0xdead_0000, 0x1234_5678);
        assert_eq!(c.find_block(0xdead_0000), 0x1234_5678);
    }
}
