// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space layout for 32-bit two-level paging.
//!
//! ```text
//!   UTOP, UXSTACKTOP -> +------------------------------+ 0xeec00000
//!                       |  exception stack (1 page)    |
//!                       +------------------------------+ 0xeebff000
//!                       |  empty guard page            |
//!   USTACKTOP --------> +------------------------------+ 0xeebfe000
//!                       |  normal user stack, heap,    |
//!                       |  program data and text       |
//!   UTEXT ------------> +------------------------------+ 0x00800000
//!   PFTEMP -----------> |  fault-resolution scratch    | 0x007ff000
//!   UTEMP ------------> +------------------------------+ 0x00400000
//!   URUNTIME ---------> |  runtime slot page           | 0x003ff000
//!                       +------------------------------+ 0x00000000
//! ```

/// Size of a page in bytes.
pub const PGSIZE: usize = 4096;
/// log2 of [`PGSIZE`].
pub const PGSHIFT: usize = 12;
/// Page-table entries per page table (and page-directory entries per directory).
pub const NPTENTRIES: usize = 1024;
/// Bytes mapped by one page-directory entry.
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;
/// Shift extracting the page-directory index from a virtual address.
pub const PDXSHIFT: usize = 22;

/// Start of the temporary-mapping region.
pub const UTEMP: usize = PTSIZE;
/// Scratch page used while a copy-on-write fault is being resolved.
pub const PFTEMP: usize = UTEMP + PTSIZE - PGSIZE;
/// Where user programs are linked.
pub const UTEXT: usize = 2 * PTSIZE;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = 0xeec0_0000;
/// Top of the normal user stack; one guard page sits between it and the exception stack.
pub const USTACKTOP: usize = UXSTACKTOP - 2 * PGSIZE;
/// Upper bound of the user-controlled part of the address space.
pub const UTOP: usize = UXSTACKTOP;

/// Page holding process-local runtime state.
pub const URUNTIME: usize = UTEMP - PGSIZE;
/// Address of the process-local `thisenv` slot inside [`URUNTIME`].
pub const THISENV_VA: usize = URUNTIME;

/// Page number containing `va`.
pub const fn pgnum(va: usize) -> usize {
    va >> PGSHIFT
}

/// Page-directory index of `va`.
pub const fn pdx(va: usize) -> usize {
    va >> PDXSHIFT
}

/// Base address of page number `pn`.
pub const fn pgaddr(pn: usize) -> usize {
    pn << PGSHIFT
}

/// Offset of `va` inside its page.
pub const fn pgoff(va: usize) -> usize {
    va & (PGSIZE - 1)
}

/// Rounds `va` down to a multiple of `align` (a power of two).
pub const fn round_down(va: usize, align: usize) -> usize {
    va & !(align - 1)
}

/// Returns `true` when `va` is page aligned.
pub const fn is_page_aligned(va: usize) -> bool {
    pgoff(va) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_do_not_overlap() {
        assert!(URUNTIME + PGSIZE <= UTEMP);
        assert!(PFTEMP + PGSIZE <= UTEXT);
        assert!(USTACKTOP < UXSTACKTOP - PGSIZE);
        assert_eq!(UTOP, UXSTACKTOP);
    }

    #[test]
    fn exception_stack_is_outside_fork_range() {
        let xstack = UXSTACKTOP - PGSIZE;
        assert!(pgnum(xstack) >= pgnum(USTACKTOP));
    }

    #[test]
    fn index_helpers_agree() {
        let va = 0x0080_1234;
        assert_eq!(pgaddr(pgnum(va)), round_down(va, PGSIZE));
        assert_eq!(pdx(va), pgnum(va) / NPTENTRIES);
        assert_eq!(pgoff(va), 0x234);
        assert!(!is_page_aligned(va));
        assert!(is_page_aligned(PFTEMP));
    }
}
