use core::marker::PhantomData;
use core::ptr::NonNull;
use acpi::{AcpiTables, Handle, PciAddress, PhysicalMapping};
use acpi::aml::AmlError;
use limine::response::RsdpResponse;

use crate::memory::hhdm_offset::hhdm_offset;

#[derive(Debug, Clone)]
struct KernelAcpiHandler {
    phantom: PhantomData<NonNull<()>>,
}

impl acpi::Handler for KernelAcpiHandler {
    /// The kernel's page table keeps the bootloader's higher-half direct
    /// map (HHDM) intact (`memory::build_new_kernel_table` copies every
    /// upper-half entry), so every physical address is already reachable —
    /// no new mapping is needed, just the HHDM-relative virtual address.
    unsafe fn map_physical_region<T>(&self, physical_address: usize, size: usize) -> PhysicalMapping<Self, T> {
        let hhdm: u64 = hhdm_offset().into();
        let virtual_start = hhdm + physical_address as u64;
        PhysicalMapping {
            physical_start: physical_address,
            virtual_start: NonNull::new(virtual_start as *mut T).unwrap(),
            region_length: size,
            mapped_length: size,
            handler: self.clone(),
        }
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {
        // HHDM mappings are permanent; nothing to tear down.
    }

    fn read_u8(&self, address: usize) -> u8 {
        todo!()
    }

    fn read_u16(&self, address: usize) -> u16 {
        todo!()
    }

    fn read_u32(&self, address: usize) -> u32 {
        todo!()
    }

    fn read_u64(&self, address: usize) -> u64 {
        todo!()
    }

    fn write_u8(&self, address: usize, value: u8) {
        todo!()
    }

    fn write_u16(&self, address: usize, value: u16) {
        todo!()
    }

    fn write_u32(&self, address: usize, value: u32) {
        todo!()
    }

    fn write_u64(&self, address: usize, value: u64) {
        todo!()
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        todo!()
    }

    fn read_io_u16(&self, port: u16) -> u16 {
        todo!()
    }

    fn read_io_u32(&self, port: u16) -> u32 {
        todo!()
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        todo!()
    }

    fn write_io_u16(&self, port: u16, value: u16) {
        todo!()
    }

    fn write_io_u32(&self, port: u16, value: u32) {
        todo!()
    }

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8 {
        todo!()
    }

    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16 {
        todo!()
    }

    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32 {
        todo!()
    }

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8) {
        todo!()
    }

    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16) {
        todo!()
    }

    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32) {
        todo!()
    }

    fn nanos_since_boot(&self) -> u64 {
        todo!()
    }

    fn stall(&self, microseconds: u64) {
        todo!()
    }

    fn sleep(&self, milliseconds: u64) {
        todo!()
    }

    fn create_mutex(&self) -> Handle {
        todo!()
    }

    fn acquire(&self, mutex: Handle, timeout: u16) -> Result<(), AmlError> {
        todo!()
    }

    fn release(&self, mutex: Handle) {
        todo!()
    }
}

pub fn parse(rsdp: &RsdpResponse) -> AcpiTables<impl acpi::Handler> {
    let address = rsdp.address();
    unsafe {
        AcpiTables::from_rsdp(
            KernelAcpiHandler {
                phantom: PhantomData,
            },
            address,
        )
    }.unwrap()
}