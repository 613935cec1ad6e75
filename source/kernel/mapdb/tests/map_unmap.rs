// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end tests for flexpage map/grant/unmap over the mapping database
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 16 integration tests
//!
//! TEST_SCOPE:
//!   - Derivation chains built by mem_map and torn down by fpage_unmap
//!   - Grant semantics (slot reuse, sender loses access, sigma0 roots stay put)
//!   - Superpages and base pages carved out of them
//!   - Send and receive windows of different sizes
//!   - Write revocation, access-bit reporting, restricted unmap
//!   - Out-of-memory while growing a mapping tree
//!
//! TEST_SCENARIOS:
//!   - map_from_sigma0_creates_first_level_mapping(): depth 1 below the root
//!   - unmap_without_me_too_revokes_whole_chain(): sigma0 -> A -> B -> C, unmap at A
//!   - unmap_with_me_too_also_drops_own_entry(): unmap at B removes B and C only
//!   - grant_reuses_slot_and_evicts_sender(): B grants to C in place
//!   - sigma0_root_cannot_be_granted(): grant is rolled back
//!   - remap_upgrades_rights_in_place(): read-only mapping becomes writable
//!   - superpage_map_and_carved_base_page(): 4 MiB send, 4 KiB carved page
//!   - partial_superpage_grant_becomes_map(): sender keeps its superpage
//!   - larger_send_window_is_clamped_to_receive_window(): offset picks the send chunk
//!   - offset_selects_chunk_of_larger_receive_window(): 4 KiB lands inside 16 KiB
//!   - whole_space_send_maps_a_single_page(): transfer stops at the receive window
//!   - revoke_write_keeps_mappings(): derived entries lose WRITABLE only
//!   - unmap_reports_access_bits(): referenced/dirty bits are harvested
//!   - restricted_unmap_spares_other_tags(): tag and window restrictions
//!   - frames_outside_ram_bypass_mapdb(): device memory only touches page tables
//!   - failed_tree_growth_rolls_back_map(): failpoint-driven out-of-memory
//!
//! DEPENDENCIES:
//!   - neuron_mapdb::{mem_map, fpage_unmap, mem_fpage_unmap}: operations under test
//!   - neuron_mapdb::mem_space::{SoftMemSpace, SpaceTable}: software page tables
//!
//! ADR: docs/adr/0001-mapping-database.md

use neuron_mapdb::mem_space::{SoftMemSpace, SpaceTable};
use neuron_mapdb::{
    fpage_unmap, mem_fpage_unmap, mem_map, FlushMode, Fpage, FpageRights, IpcError, Mapdb,
    MapdbConfig, MapdbError, MemSpace, PageAttribs, PhysAddr, Restriction, SpaceDirectory,
    SpaceId, Tag, VirtAddr, PAGE_SIZE,
};

const SIGMA0: SpaceId = SpaceId::SIGMA0;
const A: SpaceId = SpaceId::from_raw(10);
const B: SpaceId = SpaceId::from_raw(11);
const C: SpaceId = SpaceId::from_raw(12);
const D: SpaceId = SpaceId::from_raw(13);

const RAM_END: usize = 0x100_0000;

fn setup_with(cfg: MapdbConfig) -> (Mapdb, SpaceTable) {
    let mut spaces = SpaceTable::new();
    for id in [A, B, C, D] {
        spaces.insert(SoftMemSpace::new(id, cfg.superpage_shift));
    }
    (Mapdb::new(cfg).unwrap(), spaces)
}

fn setup() -> (Mapdb, SpaceTable) {
    setup_with(MapdbConfig::ia32(PhysAddr::new(0)..PhysAddr::new(RAM_END)))
}

fn page(va: usize, rights: FpageRights) -> Fpage {
    Fpage::mem(VirtAddr::new(va), 12, rights)
}

fn rw(va: usize) -> Fpage {
    page(va, FpageRights::WRITE)
}

fn map(db: &Mapdb, spaces: &mut SpaceTable, from: (SpaceId, usize), to: (SpaceId, usize), tag: Tag) {
    let out = mem_map(db, spaces, from.0, rw(from.1), to.0, rw(to.1), 0, tag).unwrap();
    assert_eq!(out.pages, 1, "map {:?} -> {:?}", from, to);
}

fn pte(spaces: &SpaceTable, space: SpaceId, va: usize) -> Option<neuron_mapdb::PageEntry> {
    spaces.get(space).unwrap().v_lookup(VirtAddr::new(va))
}

fn depth_of(db: &Mapdb, space: SpaceId, va: usize, phys: usize) -> Result<u8, MapdbError> {
    let (r, guard) = db.lookup(space, VirtAddr::new(va), PhysAddr::new(phys))?;
    let depth = guard.get(r)?.depth();
    db.free(guard);
    Ok(depth)
}

/// sigma0 (phys 0x5000) -> A@0x1000 -> B@0x2000 -> C@0x3000
fn chain(db: &Mapdb, spaces: &mut SpaceTable) {
    map(db, spaces, (SIGMA0, 0x5000), (A, 0x1000), Tag::NONE);
    map(db, spaces, (A, 0x1000), (B, 0x2000), Tag::NONE);
    map(db, spaces, (B, 0x2000), (C, 0x3000), Tag::NONE);
}

#[test]
fn map_from_sigma0_creates_first_level_mapping() {
    let (db, mut spaces) = setup();
    map(&db, &mut spaces, (SIGMA0, 0x5000), (A, 0x1000), Tag::NONE);

    let e = pte(&spaces, A, 0x1000).unwrap();
    assert_eq!(e.phys, PhysAddr::new(0x5000));
    assert_eq!(e.size, PAGE_SIZE);
    assert!(e.attribs.contains(PageAttribs::WRITABLE));
    assert_eq!(depth_of(&db, A, 0x1000, 0x5000), Ok(1));
    assert!(db.check_integrity().is_ok());
}

#[test]
fn unmap_without_me_too_revokes_whole_chain() {
    let (db, mut spaces) = setup();
    chain(&db, &mut spaces);
    assert_eq!(depth_of(&db, C, 0x3000, 0x5000), Ok(3));

    fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, FlushMode::Unmap).unwrap();

    assert!(pte(&spaces, B, 0x2000).is_none());
    assert!(pte(&spaces, C, 0x3000).is_none());
    assert_eq!(depth_of(&db, B, 0x2000, 0x5000), Err(MapdbError::NotFound));
    assert_eq!(depth_of(&db, C, 0x3000, 0x5000), Err(MapdbError::NotFound));
    assert!(pte(&spaces, A, 0x1000).is_some());
    assert_eq!(depth_of(&db, A, 0x1000, 0x5000), Ok(1));
    assert_eq!(spaces.tlb_flushes(B), 1);
    assert_eq!(spaces.tlb_flushes(C), 1);
    assert_eq!(spaces.tlb_flushes(A), 0);
}

#[test]
fn unmap_with_me_too_also_drops_own_entry() {
    let (db, mut spaces) = setup();
    chain(&db, &mut spaces);

    fpage_unmap(&db, &mut spaces, B, rw(0x2000), true, FlushMode::Unmap).unwrap();

    assert!(pte(&spaces, B, 0x2000).is_none());
    assert!(pte(&spaces, C, 0x3000).is_none());
    assert_eq!(depth_of(&db, B, 0x2000, 0x5000), Err(MapdbError::NotFound));
    assert_eq!(depth_of(&db, A, 0x1000, 0x5000), Ok(1));
}

#[test]
fn grant_reuses_slot_and_evicts_sender() {
    let (db, mut spaces) = setup();
    map(&db, &mut spaces, (SIGMA0, 0x5000), (A, 0x1000), Tag::NONE);
    map(&db, &mut spaces, (A, 0x1000), (B, 0x2000), Tag::NONE);
    let (before, guard) = db.lookup(B, VirtAddr::new(0x2000), PhysAddr::new(0x5000)).unwrap();
    db.free(guard);

    let grant = page(0x2000, FpageRights::GRANT | FpageRights::WRITE);
    let out = mem_map(&db, &mut spaces, B, grant, C, rw(0x3000), 0, Tag::NONE).unwrap();
    assert!(out.received);

    let (after, guard) = db.lookup(C, VirtAddr::new(0x3000), PhysAddr::new(0x5000)).unwrap();
    assert_eq!(after.slot(), before.slot());
    assert_eq!(guard.get(after).unwrap().depth(), 2);
    db.free(guard);
    assert_eq!(depth_of(&db, B, 0x2000, 0x5000), Err(MapdbError::NotFound));
    assert!(pte(&spaces, B, 0x2000).is_none());
    assert_eq!(pte(&spaces, C, 0x3000).unwrap().phys, PhysAddr::new(0x5000));
    assert_eq!(spaces.tlb_flushes(B), 1);

    // The granted mapping is still revoked through A.
    fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, FlushMode::Unmap).unwrap();
    assert!(pte(&spaces, C, 0x3000).is_none());
}

#[test]
fn sigma0_root_cannot_be_granted() {
    let cfg = MapdbConfig::ia32(PhysAddr::new(0)..PhysAddr::new(RAM_END)).without_superpages();
    let (db, mut spaces) = setup_with(cfg);
    let grant = page(0x5000, FpageRights::GRANT | FpageRights::WRITE);

    let out = mem_map(&db, &mut spaces, SIGMA0, grant, A, rw(0x1000), 0, Tag::NONE);

    assert_eq!(out, Err(IpcError::RemapFailed));
    assert!(pte(&spaces, A, 0x1000).is_none());
    let (root, guard) = db.lookup(SIGMA0, VirtAddr::new(0x5000), PhysAddr::new(0x5000)).unwrap();
    assert!(guard.get(root).unwrap().is_root());
    assert_eq!(guard.children(root).unwrap().count(), 0);
}

#[test]
fn remap_upgrades_rights_in_place() {
    let (db, mut spaces) = setup();
    let ro = page(0x5000, FpageRights::empty());
    mem_map(&db, &mut spaces, SIGMA0, ro, A, rw(0x1000), 0, Tag::NONE).unwrap();
    assert!(!pte(&spaces, A, 0x1000).unwrap().attribs.contains(PageAttribs::WRITABLE));

    let out = mem_map(&db, &mut spaces, SIGMA0, rw(0x5000), A, rw(0x1000), 0, Tag::NONE).unwrap();

    assert_eq!(out.pages, 1);
    assert!(pte(&spaces, A, 0x1000).unwrap().attribs.contains(PageAttribs::WRITABLE));
    let (root, guard) = db.lookup(SIGMA0, VirtAddr::new(0x5000), PhysAddr::new(0x5000)).unwrap();
    assert_eq!(guard.children(root).unwrap().count(), 1);
}

#[test]
fn superpage_map_and_carved_base_page() {
    let (db, mut spaces) = setup();
    let sp = |va| Fpage::mem(VirtAddr::new(va), 22, FpageRights::WRITE);
    let out = mem_map(&db, &mut spaces, SIGMA0, sp(0x40_0000), A, sp(0x80_0000), 0, Tag::NONE).unwrap();
    assert_eq!(out.pages, 1);
    let e = pte(&spaces, A, 0x80_3000).unwrap();
    assert_eq!((e.phys, e.size), (PhysAddr::new(0x40_0000), 0x40_0000));
    assert_eq!(depth_of(&db, A, 0x80_0000, 0x40_0000), Ok(1));

    // A base page at a nonzero offset derives from the root of its own frame.
    map(&db, &mut spaces, (A, 0x80_3000), (B, 0x1000), Tag::NONE);
    assert_eq!(pte(&spaces, B, 0x1000).unwrap().phys, PhysAddr::new(0x40_3000));
    assert_eq!(depth_of(&db, B, 0x1000, 0x40_3000), Ok(1));

    // Unmapping the superpage's derivations also reaches the carved page.
    let whole = Fpage::mem(VirtAddr::new(0x80_0000), 22, FpageRights::WRITE);
    fpage_unmap(&db, &mut spaces, A, whole, false, FlushMode::Unmap).unwrap();
    assert!(pte(&spaces, B, 0x1000).is_none());
    assert_eq!(depth_of(&db, B, 0x1000, 0x40_3000), Err(MapdbError::NotFound));
    assert!(pte(&spaces, A, 0x80_0000).is_some());
}

#[test]
fn partial_superpage_grant_becomes_map() {
    let (db, mut spaces) = setup();
    let sp = |va| Fpage::mem(VirtAddr::new(va), 22, FpageRights::WRITE);
    mem_map(&db, &mut spaces, SIGMA0, sp(0x40_0000), A, sp(0x80_0000), 0, Tag::NONE).unwrap();

    let grant = page(0x80_0000, FpageRights::GRANT | FpageRights::WRITE);
    let out = mem_map(&db, &mut spaces, A, grant, B, rw(0x1000), 0, Tag::NONE).unwrap();

    assert_eq!(out.pages, 1);
    assert_eq!(pte(&spaces, A, 0x80_0000).unwrap().size, 0x40_0000);
    assert_eq!(pte(&spaces, B, 0x1000).unwrap().phys, PhysAddr::new(0x40_0000));
    assert_eq!(depth_of(&db, A, 0x80_0000, 0x40_0000), Ok(1));
    assert_eq!(depth_of(&db, B, 0x1000, 0x40_0000), Ok(2));
}

#[test]
fn larger_send_window_is_clamped_to_receive_window() {
    let (db, mut spaces) = setup();
    // A holds only the upper page of its 8 KiB send window.
    map(&db, &mut spaces, (SIGMA0, 0x7000), (A, 0x11000), Tag::NONE);
    let snd = Fpage::mem(VirtAddr::new(0x1_0000), 13, FpageRights::WRITE);

    let out = mem_map(&db, &mut spaces, A, snd, B, rw(0x1000), 0, Tag::NONE).unwrap();
    assert_eq!(out.pages, 0);
    assert!(spaces.get(B).unwrap().is_empty());

    let out = mem_map(&db, &mut spaces, A, snd, B, rw(0x1000), 0x1000, Tag::NONE).unwrap();
    assert_eq!(out.pages, 1);
    assert_eq!(pte(&spaces, B, 0x1000).unwrap().phys, PhysAddr::new(0x7000));
    assert!(pte(&spaces, B, 0x2000).is_none());
    assert_eq!(depth_of(&db, B, 0x1000, 0x7000), Ok(2));
}

#[test]
fn offset_selects_chunk_of_larger_receive_window() {
    let (db, mut spaces) = setup();
    let rcv = Fpage::mem(VirtAddr::new(0), 14, FpageRights::WRITE);

    let out = mem_map(&db, &mut spaces, SIGMA0, rw(0x5000), B, rcv, 0x2000, Tag::NONE).unwrap();

    assert_eq!(out.pages, 1);
    assert_eq!(pte(&spaces, B, 0x2000).unwrap().phys, PhysAddr::new(0x5000));
    for va in [0x0, 0x1000, 0x3000] {
        assert!(pte(&spaces, B, va).is_none());
    }
    assert_eq!(depth_of(&db, B, 0x2000, 0x5000), Ok(1));
}

#[test]
fn whole_space_send_maps_a_single_page() {
    let cfg = MapdbConfig::ia32(PhysAddr::new(0)..PhysAddr::new(RAM_END)).without_superpages();
    let (db, mut spaces) = setup_with(cfg);
    let everything = Fpage::whole_space(FpageRights::WRITE);

    let out = mem_map(&db, &mut spaces, SIGMA0, everything, A, rw(0x1000), 0x5000, Tag::NONE).unwrap();

    assert_eq!(out.pages, 1);
    assert_eq!(pte(&spaces, A, 0x1000).unwrap().phys, PhysAddr::new(0x5000));
    assert!(pte(&spaces, A, 0x2000).is_none());
}

#[test]
fn revoke_write_keeps_mappings() {
    let (db, mut spaces) = setup();
    chain(&db, &mut spaces);

    fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, FlushMode::RevokeWrite).unwrap();

    assert!(pte(&spaces, A, 0x1000).unwrap().attribs.contains(PageAttribs::WRITABLE));
    for (space, va) in [(B, 0x2000), (C, 0x3000)] {
        let e = pte(&spaces, space, va).unwrap();
        assert!(!e.attribs.contains(PageAttribs::WRITABLE));
        assert!(e.attribs.contains(PageAttribs::USER));
    }
    assert_eq!(depth_of(&db, C, 0x3000, 0x5000), Ok(3));
}

#[test]
fn unmap_reports_access_bits() {
    let (db, mut spaces) = setup();
    chain(&db, &mut spaces);
    assert!(spaces.get_mut(C).unwrap().touch(VirtAddr::new(0x3000), true));
    assert!(spaces.get_mut(B).unwrap().touch(VirtAddr::new(0x2000), false));

    let bits = fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, FlushMode::Unmap).unwrap();

    assert_eq!(bits, PageAttribs::REFERENCED | PageAttribs::DIRTY);
}

#[test]
fn restricted_unmap_spares_other_tags() {
    let (db, mut spaces) = setup();
    map(&db, &mut spaces, (SIGMA0, 0x5000), (A, 0x1000), Tag::NONE);
    map(&db, &mut spaces, (A, 0x1000), (B, 0x2000), Tag::new(1));
    map(&db, &mut spaces, (A, 0x1000), (C, 0x3000), Tag::new(2));

    let elsewhere = Restriction::all().within(VirtAddr::new(0x8000), VirtAddr::new(0x9000));
    mem_fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, Some(&elsewhere), FlushMode::Unmap).unwrap();
    assert!(pte(&spaces, B, 0x2000).is_some());
    assert!(pte(&spaces, C, 0x3000).is_some());

    let tagged = Restriction::tag(Tag::new(1));
    mem_fpage_unmap(&db, &mut spaces, A, rw(0x1000), false, Some(&tagged), FlushMode::Unmap).unwrap();
    assert!(pte(&spaces, B, 0x2000).is_none());
    assert_eq!(depth_of(&db, B, 0x2000, 0x5000), Err(MapdbError::NotFound));
    assert!(pte(&spaces, C, 0x3000).is_some());
    assert_eq!(depth_of(&db, C, 0x3000, 0x5000), Ok(2));
}

#[test]
fn frames_outside_ram_bypass_mapdb() {
    let (db, mut spaces) = setup();
    let device = 0x200_0000;
    map(&db, &mut spaces, (SIGMA0, device), (A, 0x1000), Tag::NONE);
    assert_eq!(pte(&spaces, A, 0x1000).unwrap().phys, PhysAddr::new(device));
    assert_eq!(depth_of(&db, A, 0x1000, device), Err(MapdbError::OutOfRange));

    fpage_unmap(&db, &mut spaces, A, rw(0x1000), true, FlushMode::Unmap).unwrap();
    assert!(spaces.get(A).unwrap().is_empty());
}

#[cfg(feature = "failpoints")]
#[test]
fn failed_tree_growth_rolls_back_map() {
    let (db, mut spaces) = setup();
    // The root plus three children fill the smallest tree; packing after the
    // third insert has to grow it.
    map(&db, &mut spaces, (SIGMA0, 0x9000), (A, 0x1000), Tag::NONE);
    map(&db, &mut spaces, (SIGMA0, 0x9000), (B, 0x1000), Tag::NONE);
    neuron_mapdb::failpoints::deny_next_alloc(0x9);
    map(&db, &mut spaces, (SIGMA0, 0x9000), (C, 0x1000), Tag::NONE);
    assert_eq!(db.stats().exhausted, 1);

    let out = mem_map(&db, &mut spaces, SIGMA0, rw(0x9000), D, rw(0x1000), 0, Tag::NONE);
    assert_eq!(out, Err(IpcError::RemapFailed));
    assert!(spaces.get(D).unwrap().is_empty());

    // The failed cycle grew the tree on release; the retry fits.
    map(&db, &mut spaces, (SIGMA0, 0x9000), (D, 0x1000), Tag::NONE);
    assert_eq!(depth_of(&db, D, 0x1000, 0x9000), Ok(1));
    assert!(db.check_integrity().is_ok());
}
