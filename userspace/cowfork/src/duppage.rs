// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page duplication rule used while cloning an address space.

use cowfork_abi::layout::pgaddr;
use cowfork_abi::{Env, EnvId, PteFlags, SysResult, CURENV};

const SHARED_RO: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);
const COW: PteFlags = SHARED_RO.union(PteFlags::COW);

/// Which rule [`duppage`] applied to a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DupKind {
    /// Writable page: both sides now map it copy-on-write.
    CowBoth,
    /// Page was already copy-on-write: only the child mapping was added.
    CowChildOnly,
    /// Read-only page shared as is.
    ReadOnly,
}

/// Mirrors page `pn` of the calling process into `child`.
///
/// The child mapping is installed before the parent is re-marked, so the
/// parent never loses write access to a page the child does not yet share.
/// The page must be present in the caller.
pub fn duppage(env: &dyn Env, child: EnvId, pn: usize) -> SysResult<DupKind> {
    let va = pgaddr(pn);
    let pte = env.uvpt(pn);
    if pte.is_cow() {
        env.page_map(CURENV, va, child, va, COW)?;
        return Ok(DupKind::CowChildOnly);
    }
    if pte.flags().contains(PteFlags::WRITABLE) {
        env.page_map(CURENV, va, child, va, COW)?;
        env.page_map(CURENV, va, CURENV, va, COW)?;
        return Ok(DupKind::CowBoth);
    }
    env.page_map(CURENV, va, child, va, SHARED_RO)?;
    Ok(DupKind::ReadOnly)
}
