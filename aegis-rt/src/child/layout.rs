//! Child capability layout
//!
//! Every child gets one aligned selector block per CPU holding its
//! complete portal table: the CPU exception portals at their vector
//! positions, the startup and init-caps portals, and the five broker
//! portals. The block stride is fixed so both sides can compute any
//! portal's position from (cpu, offset).

use aegis_cap::CapSel;
use aegis_sys::cpu;

/// Selectors reserved per CPU for one child.
pub const PER_CPU_CAPS: u64 = 0x40;

// exception vectors (selector offset == vector number)
pub(crate) const EV_DIVIDE: u64 = 0x00;
pub(crate) const EV_DEBUG: u64 = 0x01;
pub(crate) const EV_BREAKPOINT: u64 = 0x03;
pub(crate) const EV_OVERFLOW: u64 = 0x04;
pub(crate) const EV_BOUNDRANGE: u64 = 0x05;
pub(crate) const EV_UNDEFOP: u64 = 0x06;
pub(crate) const EV_NOMATHPROC: u64 = 0x07;
pub(crate) const EV_DBLFAULT: u64 = 0x08;
pub(crate) const EV_TSS: u64 = 0x0A;
pub(crate) const EV_INVSEG: u64 = 0x0B;
pub(crate) const EV_STACK: u64 = 0x0C;
pub(crate) const EV_GENPROT: u64 = 0x0D;
pub(crate) const EV_PAGEFAULT: u64 = 0x0E;
pub(crate) const EV_MATHFAULT: u64 = 0x10;
pub(crate) const EV_ALIGNCHK: u64 = 0x11;
pub(crate) const EV_MACHCHK: u64 = 0x12;
pub(crate) const EV_SIMD: u64 = 0x13;

/// Startup event of a freshly created thread.
pub(crate) const EV_STARTUP: u64 = 0x1E;

// broker portals
pub const SRV_INIT: u64 = 0x20;
pub const SRV_SERVICE: u64 = 0x21;
pub const SRV_IO: u64 = 0x22;
pub const SRV_SC: u64 = 0x23;
pub const SRV_GSI: u64 = 0x24;
pub const SRV_DS: u64 = 0x25;

/// Portal selector for `(cpu, offset)` as seen from inside the child.
#[inline]
#[must_use]
pub fn portal_sel(cpu: usize, offset: u64) -> CapSel {
    cpu as u64 * PER_CPU_CAPS + offset
}

/// Size of a child's whole portal table, rounded to a power of two so
/// the block can be allocated aligned.
#[must_use]
pub fn per_child_caps() -> u64 {
    (PER_CPU_CAPS * cpu::count() as u64).next_power_of_two()
}
