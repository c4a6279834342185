//! Limine boot protocol requests and accessors.
//!
//! Everything the kernel consumes from the bootloader goes through here:
//! the higher-half direct map offset, the memory map, the SMP descriptors,
//! the kernel load address and the RSDP pointer.

use lazy_static::lazy_static;
use limine::BaseRevision;
use limine::request::{
    ExecutableAddressRequest, HhdmRequest, MemoryMapRequest, MpRequest, RsdpRequest,
};
use limine::response::{ExecutableAddressResponse, MemoryMapResponse, MpResponse};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(2);

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MP_REQUEST: MpRequest = MpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static KERNEL_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

lazy_static! {
    /// Higher-half direct map offset, the base of the kernel's direct map.
    pub static ref HHDM: usize = HHDM_REQUEST
        .get_response()
        .expect("no Limine HHDM response")
        .offset() as usize;
    pub static ref MP_RESPONSE: &'static MpResponse =
        MP_REQUEST.get_response().expect("no Limine MP response");
}

pub fn mmap_response() -> &'static MemoryMapResponse {
    MMAP_REQUEST
        .get_response()
        .expect("no Limine memory map response")
}

#[allow(unused)]
pub fn kernel_address() -> &'static ExecutableAddressResponse {
    KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("no Limine executable address response")
}

#[allow(unused)]
pub fn rsdp_addr() -> usize {
    RSDP_REQUEST.get_response().unwrap().address() as usize
}

/// Returns the number of detected CPUs.
#[inline]
pub fn cpu_count() -> usize {
    MP_RESPONSE.cpus().len()
}
