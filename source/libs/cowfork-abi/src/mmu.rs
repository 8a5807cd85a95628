// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entry encoding.

use bitflags::bitflags;

use crate::layout::PGSHIFT;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Permission and status bits stored in the low 12 bits of an entry.
    pub struct PteFlags: u32 {
        /// Mapping is valid.
        const PRESENT = 1 << 0;
        /// Mapping permits stores.
        const WRITABLE = 1 << 1;
        /// Mapping is reachable from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on store.
        const DIRTY = 1 << 6;
        /// Large page (directory entries only).
        const LARGE = 1 << 7;
        /// Translation is global.
        const GLOBAL = 1 << 8;
        /// Bits reserved for software; neither hardware nor kernel interprets them.
        const AVAIL = 0xe00;
        /// Copy-on-write marker. Lives in [`PteFlags::AVAIL`] and is private to
        /// the user-space fork runtime.
        const COW = 1 << 11;
    }
}

impl PteFlags {
    /// Bits user space may pass to mapping syscalls.
    pub const SYSCALL: Self = Self::AVAIL.union(Self::PRESENT).union(Self::WRITABLE).union(Self::USER);

    /// Returns `true` when `self` is acceptable as a syscall permission:
    /// present and user are set and nothing outside [`PteFlags::SYSCALL`] is.
    pub const fn is_valid_syscall_perm(self) -> bool {
        self.contains(Self::PRESENT.union(Self::USER)) && Self::SYSCALL.contains(self)
    }
}

/// Raw page-table (or page-directory) entry: frame number above bit 12, flags below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pte(u32);

/// Page-directory entries share the entry encoding.
pub type Pde = Pte;

impl Pte {
    /// Entry with no mapping.
    pub const EMPTY: Self = Self(0);

    /// Encodes an entry for `frame` with `flags`.
    pub const fn new(frame: usize, flags: PteFlags) -> Self {
        Self(((frame as u32) << PGSHIFT) | flags.bits())
    }

    /// Wraps a raw entry value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw entry value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Physical frame number referenced by the entry.
    pub const fn frame(self) -> usize {
        (self.0 >> PGSHIFT) as usize
    }

    /// Permission and status bits.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & ((1 << PGSHIFT) - 1))
    }

    /// Returns `true` when the entry maps something.
    pub const fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Returns `true` when the entry carries the copy-on-write marker.
    pub const fn is_cow(self) -> bool {
        self.flags().contains(PteFlags::COW)
    }

    /// Returns `true` when hardware would allow a user-mode store.
    pub const fn is_user_writable(self) -> bool {
        self.flags().contains(PteFlags::PRESENT.union(PteFlags::USER).union(PteFlags::WRITABLE))
    }
}
