//! Raw hypercall bindings
//!
//! The microkernel's syscall ABI for bare-metal x86-64 builds. The
//! hypercall number lives in the low byte of the first word; the
//! selector the call operates on is shifted into the upper bits.
//! Status comes back in the first word, auxiliary values in the next
//! two.

use aegis_cap::{CapSel, Error, Result};

use crate::abi::Qpd;

const IPC_CALL: u64 = 0;
const CREATE_PD: u64 = 2;
const CREATE_EC: u64 = 3;
const CREATE_SC: u64 = 4;
const CREATE_PT: u64 = 5;
const CREATE_SM: u64 = 6;
const REVOKE: u64 = 7;
const LOOKUP: u64 = 8;
const PT_CTRL: u64 = 11;
const SM_CTRL: u64 = 12;
const ASSIGN_GSI: u64 = 14;

const FLAG0: u64 = 1 << 4;
const FLAG1: u64 = 1 << 5;

/// Local thread (portal handler) vs. schedulable thread.
const EC_GLOBAL: u64 = CREATE_EC | FLAG0;

const SM_OP_UP: u64 = 0;
const SM_OP_DOWN: u64 = FLAG0;
const SM_OP_ZERO: u64 = FLAG0 | FLAG1;

/// Revoke from the calling domain as well, not only from children.
const REVOKE_SELF: u64 = REVOKE | FLAG0;

#[inline]
fn pack(sel: CapSel, op: u64) -> u64 {
    sel << 8 | op
}

/// One hypercall; returns (status, out1, out2).
#[inline]
fn syscall(w0: u64, w1: u64, w2: u64, w3: u64, w4: u64) -> (u64, u64, u64) {
    let status: u64;
    let out1: u64;
    let out2: u64;
    // SAFETY: the syscall instruction transfers to the kernel; all
    // argument registers are declared, rcx/r11 are clobbered by the
    // instruction itself.
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rdi") w0 => status,
            inlateout("rsi") w1 => out1,
            inlateout("rdx") w2 => out2,
            in("rax") w3,
            in("r8") w4,
            out("rcx") _,
            out("r11") _,
            options(nostack)
        );
    }
    (status, out1, out2)
}

#[inline]
fn check(status: u64) -> Result<()> {
    match Error::from_code(status) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Call the portal `pt`; the message is taken from the current
/// thread's communication area.
#[inline]
pub fn call(pt: CapSel) -> Result<()> {
    check(syscall(pack(pt, IPC_CALL), 0, 0, 0, 0).0)
}

/// Create a protection domain with an initial capability range
/// described by `crd`.
pub fn create_pd(pd: CapSel, crd: u64, dstpd: CapSel) -> Result<()> {
    check(syscall(pack(pd, CREATE_PD), dstpd, crd, 0, 0).0)
}

/// Create a local or global thread in `dstpd`, pinned to `cpu`.
pub fn create_ec(
    ec: CapSel,
    utcb: u64,
    sp: u64,
    cpu: u64,
    event_base: u64,
    global: bool,
    dstpd: CapSel,
) -> Result<()> {
    let op = if global { EC_GLOBAL } else { CREATE_EC };
    check(syscall(pack(ec, op), dstpd, utcb | cpu, sp, event_base).0)
}

/// Create a scheduling context bound to `ec`.
pub fn create_sc(sc: CapSel, ec: CapSel, qpd: Qpd, dstpd: CapSel) -> Result<()> {
    check(syscall(pack(sc, CREATE_SC), dstpd, ec, qpd.raw(), 0).0)
}

/// Create a portal bound to `ec` with the given entry address and
/// transfer mask.
pub fn create_pt(pt: CapSel, ec: CapSel, addr: u64, mtd: u64, dstpd: CapSel) -> Result<()> {
    check(syscall(pack(pt, CREATE_PT), dstpd, ec, mtd, addr).0)
}

/// Create a counting semaphore.
pub fn create_sm(sm: CapSel, initial: u64, dstpd: CapSel) -> Result<()> {
    check(syscall(pack(sm, CREATE_SM), dstpd, initial, 0, 0).0)
}

/// Set the opaque id delivered to the portal's entry.
pub fn pt_ctrl(pt: CapSel, id: u64) -> Result<()> {
    check(syscall(pack(pt, PT_CTRL), id, 0, 0, 0).0)
}

pub fn sm_up(sm: CapSel) -> Result<()> {
    check(syscall(pack(sm, SM_CTRL | SM_OP_UP), 0, 0, 0, 0).0)
}

pub fn sm_down(sm: CapSel) -> Result<()> {
    check(syscall(pack(sm, SM_CTRL | SM_OP_DOWN), 0, 0, 0, 0).0)
}

pub fn sm_zero(sm: CapSel) -> Result<()> {
    check(syscall(pack(sm, SM_CTRL | SM_OP_ZERO), 0, 0, 0, 0).0)
}

/// Route the GSI behind `sm` to `cpu`; for MSIs `pci_cfg` names the
/// device's configuration space. Returns the MSI address/value pair.
pub fn assign_gsi(sm: CapSel, cpu: u64, pci_cfg: u64) -> Result<(u64, u64)> {
    let (status, out1, out2) = syscall(pack(sm, ASSIGN_GSI), pci_cfg, cpu, 0, 0);
    check(status)?;
    Ok((out1, out2))
}

/// Revoke the capability range described by `crd`.
pub fn revoke(crd: u64, include_self: bool) -> Result<()> {
    let op = if include_self { REVOKE_SELF } else { REVOKE };
    check(syscall(op, crd, 0, 0, 0).0)
}

/// Look up a capability range in the calling domain; returns the
/// kernel-filled descriptor, zero if nothing is mapped.
pub fn lookup(crd: u64) -> u64 {
    syscall(LOOKUP, crd, 0, 0, 0).1
}
