use core::ptr::NonNull;

use acpi::{AcpiHandler, PhysicalMapping};
use x86_64::PhysAddr;

use crate::paging;

/// ACPI tables are reachable through the physical window, so "mapping" a
/// region is plain address arithmetic.
#[derive(Clone, Copy)]
pub struct Handler;

impl AcpiHandler for Handler {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> acpi::PhysicalMapping<Self, T> {
        unsafe {
            PhysicalMapping::new(
                physical_address,
                NonNull::new(
                    paging::phys_to_virt(PhysAddr::new(physical_address as u64)).as_mut_ptr(),
                )
                .unwrap(),
                size,
                size,
                *self,
            )
        }
    }

    fn unmap_physical_region<T>(_region: &acpi::PhysicalMapping<Self, T>) {}
}
