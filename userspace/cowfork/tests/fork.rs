// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for copy-on-write fork on the simulated kernel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 12 integration tests
//!
//! TEST_SCOPE:
//!   - Write isolation between parent and child after fork
//!   - Frame sharing and privatization accounting
//!   - Fault interceptor fatal paths
//!   - Cleanup of partially built children
//!
//! TEST_SCENARIOS:
//!   - test_parent_child_write_sequence(): 5 inherited, parent writes 9, child writes 7
//!   - test_read_only_pages_are_shared_not_copied(): text is mapped, never copied
//!   - test_exception_stacks_are_private(): each side owns its exception stack frame
//!   - test_child_resolves_own_identity(): thisenv is rewritten in the child only
//!   - test_write_to_plain_read_only_page_is_fatal(): non-COW write kills the writer
//!   - test_fault_resolution_oom_kills_writer(): no frame for the copy kills the writer
//!   - test_failed_fork_reclaims_child(): every primitive failure leaves no child behind
//!   - test_failed_reclaim_leaves_child_parked(): an orphaned shell is never runnable
//!   - test_grandchild_fork_isolation(): forking a child re-shares COW pages safely
//!   - test_exit_releases_every_frame(): frame accounting returns to zero
//!   - test_sfork_is_unsupported(): shared fork always fails
//!   - prop_random_writes_stay_isolated(): arbitrary interleaved writes match a model
//!
//! DEPENDENCIES:
//!   - cowfork::fork: orchestrator under test
//!   - cowfork_sim::Machine: deterministic kernel
//!   - proptest: write sequences

use std::collections::BTreeMap;

use cowfork::runtime;
use cowfork::{fork, pgfault_upcall, set_pgfault_handler, sfork, ForkError};
use cowfork_abi::layout::{PGSIZE, THISENV_VA, UTEXT, UXSTACKTOP};
use cowfork_abi::{AbiError, EnvId, EnvStatus, PteFlags, Syscalls, UserMemory, CURENV};
use cowfork_sim::{FailPoint, Machine, SimConfig, SimEnv, Syscall};
use proptest::prelude::*;

const RW: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE).union(PteFlags::USER);
const RO: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);
const TEXT: usize = UTEXT;
const DATA: usize = UTEXT + PGSIZE;
const XSTACK: usize = UXSTACKTOP - PGSIZE;

fn machine() -> Machine {
    Machine::new(SimConfig { frames: 64, max_envs: 8, fault_retry_limit: 4 }).unwrap()
}

/// Boots a process with a read-only text page and a writable data page
/// holding 5, with its runtime and fault handler already set up.
fn boot(machine: &Machine) -> SimEnv {
    let env = machine.boot().unwrap();
    runtime::init(&env).unwrap();
    set_pgfault_handler(&env, pgfault_upcall).unwrap();
    env.page_alloc(CURENV, TEXT, RW).unwrap();
    env.store(TEXT, b"text").unwrap();
    env.page_map(CURENV, TEXT, CURENV, TEXT, RO).unwrap();
    env.page_alloc(CURENV, DATA, RW).unwrap();
    env.store(DATA, &[5]).unwrap();
    env
}

fn read(env: &SimEnv, va: usize) -> u8 {
    let mut byte = [0u8; 1];
    env.load(va, &mut byte).unwrap();
    byte[0]
}

fn fork_and_run(machine: &Machine, parent: &SimEnv) -> SimEnv {
    let child = fork(parent).unwrap();
    machine.schedule(child).unwrap()
}

/// No frame is writable through one mapping while visible through another,
/// and no mapping is both writable and COW.
fn assert_no_shared_writable(machine: &Machine) {
    let mut per_frame: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for mapping in machine.mappings() {
        assert!(
            !(mapping.flags.contains(PteFlags::WRITABLE) && mapping.flags.contains(PteFlags::COW)),
            "{mapping:?} is writable and COW"
        );
        let entry = per_frame.entry(mapping.frame).or_default();
        entry.0 += 1;
        if mapping.flags.contains(PteFlags::WRITABLE) {
            entry.1 += 1;
        }
    }
    for (frame, (total, writable)) in per_frame {
        assert!(writable == 0 || total == 1, "frame {frame} writable while shared");
    }
}

#[test]
fn test_parent_child_write_sequence() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork_and_run(&machine, &parent);

    assert_eq!(read(&child, DATA), 5);
    parent.store(DATA, &[9]).unwrap();
    assert_eq!(read(&parent, DATA), 9);
    assert_eq!(read(&child, DATA), 5);
    child.store(DATA, &[7]).unwrap();
    assert_eq!(read(&child, DATA), 7);
    assert_eq!(read(&parent, DATA), 9);

    let mut text = [0u8; 4];
    child.load(TEXT, &mut text).unwrap();
    assert_eq!(&text, b"text");
    assert_no_shared_writable(&machine);
}

#[test]
fn test_read_only_pages_are_shared_not_copied() {
    let machine = machine();
    let parent = boot(&machine);
    let allocations = machine.frame_allocations();

    let child = fork(&parent).unwrap();
    assert_eq!(machine.frame_allocations(), allocations + 1);

    let mine = machine.lookup(parent.id(), TEXT).unwrap();
    let theirs = machine.lookup(child, TEXT).unwrap();
    assert_eq!(mine.frame(), theirs.frame());
    assert_eq!(theirs.flags(), RO);
    assert_eq!(mine.flags(), RO);

    let child = machine.schedule(child).unwrap();
    let before_read = machine.frame_allocations();
    assert_eq!(read(&child, TEXT), b't');
    assert_eq!(machine.frame_allocations(), before_read);
    assert_eq!(machine.frame_refs(mine.frame()), 2);
}

#[test]
fn test_exception_stacks_are_private() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork(&parent).unwrap();

    let mine = machine.lookup(parent.id(), XSTACK).unwrap();
    let theirs = machine.lookup(child, XSTACK).unwrap();
    assert_ne!(mine.frame(), theirs.frame());
    assert_eq!(mine.flags(), RW);
    assert_eq!(theirs.flags(), RW);
    assert_eq!(machine.frame_refs(theirs.frame()), 1);
}

#[test]
fn test_child_resolves_own_identity() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork(&parent).unwrap();

    assert_eq!(runtime::thisenv(&machine.env(child)), Ok(parent.id()));
    let child = machine.schedule(child).unwrap();
    assert_eq!(runtime::thisenv(&child), Ok(child.id()));
    assert_eq!(runtime::thisenv(&parent), Ok(parent.id()));

    let slot = machine.lookup(child.id(), THISENV_VA).unwrap();
    assert_eq!(slot.flags(), RW);
}

#[test]
fn test_write_to_plain_read_only_page_is_fatal() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork_and_run(&machine, &parent);

    assert!(parent.store(TEXT, &[0]).is_err());
    assert!(!machine.is_alive(parent.id()));
    assert_eq!(read(&child, TEXT), b't');
    assert_eq!(read(&child, DATA), 5);
}

#[test]
fn test_fault_resolution_oom_kills_writer() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork_and_run(&machine, &parent);

    machine.arm_failpoint(FailPoint::next(Syscall::PageAlloc, AbiError::NoMem));
    assert!(parent.store(DATA, &[9]).is_err());
    assert!(!machine.is_alive(parent.id()));

    assert_eq!(read(&child, DATA), 5);
    child.store(DATA, &[7]).unwrap();
    assert_eq!(read(&child, DATA), 7);
}

#[test]
fn test_failed_fork_reclaims_child() {
    let cases: [(FailPoint, fn(&ForkError) -> bool); 7] = [
        (FailPoint::next(Syscall::EnvSetPgfaultUpcall, AbiError::Inval), |err| {
            matches!(err, ForkError::HandlerInstall(AbiError::Inval))
        }),
        (FailPoint::next(Syscall::Exofork, AbiError::NoFreeEnv), |err| {
            matches!(err, ForkError::Exofork(AbiError::NoFreeEnv))
        }),
        (FailPoint::next(Syscall::PageMap, AbiError::NoMem), |err| {
            matches!(err, ForkError::Duplicate { va: THISENV_VA, source: AbiError::NoMem })
        }),
        (FailPoint { syscall: Syscall::PageMap, skip: 3, error: AbiError::NoMem }, |err| {
            matches!(err, ForkError::Duplicate { va: DATA, .. })
        }),
        (FailPoint::next(Syscall::PageAlloc, AbiError::NoMem), |err| {
            matches!(err, ForkError::ExceptionStack(AbiError::NoMem))
        }),
        (FailPoint { syscall: Syscall::EnvSetPgfaultUpcall, skip: 1, error: AbiError::BadEnv }, |err| {
            matches!(err, ForkError::Upcall(AbiError::BadEnv))
        }),
        (FailPoint::next(Syscall::EnvSetStatus, AbiError::BadEnv), |err| {
            matches!(err, ForkError::Status(AbiError::BadEnv))
        }),
    ];

    for (point, expected) in cases {
        let machine = machine();
        let parent = boot(&machine);
        let frames = machine.frames_in_use();
        machine.arm_failpoint(point);

        let err = fork(&parent).unwrap_err();
        assert!(expected(&err), "{point:?} produced {err:?}");
        assert_eq!(machine.live_envs(), vec![parent.id()], "{point:?}");
        assert_eq!(machine.frames_in_use(), frames, "{point:?}");

        machine.clear_failpoints();
        parent.store(DATA, &[6]).unwrap();
        assert_eq!(read(&parent, DATA), 6);
        assert_no_shared_writable(&machine);
    }
}

#[test]
fn test_failed_reclaim_leaves_child_parked() {
    let machine = machine();
    let parent = boot(&machine);
    machine.arm_failpoint(FailPoint::next(Syscall::EnvSetStatus, AbiError::BadEnv));
    machine.arm_failpoint(FailPoint::next(Syscall::EnvDestroy, AbiError::BadEnv));

    assert_eq!(fork(&parent), Err(ForkError::Status(AbiError::BadEnv)));
    let orphan: Vec<EnvId> =
        machine.live_envs().into_iter().filter(|id| *id != parent.id()).collect();
    assert_eq!(orphan.len(), 1);
    assert_eq!(machine.status(orphan[0]), Some(EnvStatus::NotRunnable));
}

#[test]
fn test_grandchild_fork_isolation() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork_and_run(&machine, &parent);
    let grandchild = fork_and_run(&machine, &child);

    assert_eq!(runtime::thisenv(&grandchild), Ok(grandchild.id()));
    assert_eq!(read(&grandchild, DATA), 5);
    grandchild.store(DATA, &[3]).unwrap();
    child.store(DATA, &[7]).unwrap();
    parent.store(DATA, &[9]).unwrap();

    assert_eq!(read(&grandchild, DATA), 3);
    assert_eq!(read(&child, DATA), 7);
    assert_eq!(read(&parent, DATA), 9);
    let text = machine.lookup(parent.id(), TEXT).unwrap().frame();
    assert_eq!(machine.frame_refs(text), 3);
    assert_no_shared_writable(&machine);
}

#[test]
fn test_exit_releases_every_frame() {
    let machine = machine();
    let parent = boot(&machine);
    let child = fork_and_run(&machine, &parent);
    let grandchild = fork_and_run(&machine, &child);
    child.store(DATA, &[1]).unwrap();
    grandchild.store(DATA, &[2]).unwrap();

    child.env_destroy(grandchild.id()).unwrap();
    parent.env_destroy(child.id()).unwrap();
    parent.env_destroy(CURENV).unwrap();
    assert!(machine.live_envs().is_empty());
    assert_eq!(machine.frames_in_use(), 0);
}

#[test]
fn test_sfork_is_unsupported() {
    let machine = machine();
    let parent = boot(&machine);
    assert_eq!(sfork(&parent), Err(ForkError::Unsupported));
    assert_eq!(machine.live_envs(), vec![parent.id()]);
    assert_eq!(machine.frame_allocations(), 4);
}

const SLOTS: usize = 4;

fn slot(index: usize) -> usize {
    DATA + PGSIZE + index * PGSIZE
}

proptest! {
    #[test]
    fn prop_random_writes_stay_isolated(
        writes in proptest::collection::vec((any::<bool>(), 0..SLOTS, any::<u8>()), 0..24)
    ) {
        let machine = machine();
        let parent = boot(&machine);
        for index in 0..SLOTS {
            parent.page_alloc(CURENV, slot(index), RW).unwrap();
            parent.store(slot(index), &[index as u8]).unwrap();
        }
        let child = fork_and_run(&machine, &parent);

        let mut model = [[0u8; SLOTS]; 2];
        for index in 0..SLOTS {
            model[0][index] = index as u8;
            model[1][index] = index as u8;
        }
        for (in_child, index, value) in writes {
            let env = if in_child { &child } else { &parent };
            env.store(slot(index), &[value]).unwrap();
            model[usize::from(in_child)][index] = value;
        }

        for index in 0..SLOTS {
            prop_assert_eq!(read(&parent, slot(index)), model[0][index]);
            prop_assert_eq!(read(&child, slot(index)), model[1][index]);
        }
        assert_no_shared_writable(&machine);
    }
}
