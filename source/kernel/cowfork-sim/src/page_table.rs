// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level user page table, kept sparse.

use std::collections::BTreeMap;

use cowfork_abi::layout::{is_page_aligned, pgaddr, pgnum, NPTENTRIES, UTOP};
use cowfork_abi::{Pde, Pte, PteFlags};

/// Error returned by mapping operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MapError {
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address lies at or above `UTOP`.
    OutOfRange,
}

/// Page table of one process. Directory entries are derived: a directory
/// slot is present while any page in its 4 MiB span is mapped.
#[derive(Debug, Default)]
pub(crate) struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs `pte` at `va`, returning the entry it replaced.
    pub(crate) fn insert(&mut self, va: usize, pte: Pte) -> Result<Option<Pte>, MapError> {
        check_user_va(va)?;
        Ok(self.entries.insert(pgnum(va), pte))
    }

    /// Removes the entry at `va`.
    pub(crate) fn remove(&mut self, va: usize) -> Result<Option<Pte>, MapError> {
        check_user_va(va)?;
        Ok(self.entries.remove(&pgnum(va)))
    }

    pub(crate) fn lookup(&self, va: usize) -> Option<Pte> {
        self.entries.get(&pgnum(va)).copied()
    }

    pub(crate) fn entry(&self, pn: usize) -> Pte {
        self.entries.get(&pn).copied().unwrap_or(Pte::EMPTY)
    }

    pub(crate) fn directory_entry(&self, pdx: usize) -> Pde {
        let first = pdx.saturating_mul(NPTENTRIES);
        let last = first.saturating_add(NPTENTRIES);
        if self.entries.range(first..last).next().is_some() {
            Pde::new(0, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
        } else {
            Pde::EMPTY
        }
    }

    /// Iterates `(va, pte)` pairs in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries.iter().map(|(pn, pte)| (pgaddr(*pn), *pte))
    }

    /// Empties the table, returning every entry it held.
    pub(crate) fn drain(&mut self) -> Vec<Pte> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

fn check_user_va(va: usize) -> Result<(), MapError> {
    if !is_page_aligned(va) {
        return Err(MapError::Unaligned);
    }
    if va >= UTOP {
        return Err(MapError::OutOfRange);
    }
    Ok(())
}
