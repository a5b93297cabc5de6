// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic PCI bus infrastructure.
//!
//! [`PciBus`] is a [`ChipsetDevice`] implementing legacy port-IO based PCI
//! configuration space access: the guest programs CONFIG_ADDRESS, and
//! CONFIG_DATA accesses are routed to the connected [`PciBusDevice`] at the
//! addressed bus/device/function.
//!
//! [`ConfigSpaceType0Emulator`] emulates the standard type 0 configuration
//! header for such a device, including BAR probing and remapping of the
//! device's MMIO intercept regions when the guest moves a BAR or toggles the
//! command register's memory enable bit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use bitfield_struct::bitfield;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::ControlMmioIntercept;
use chipset_device::pci::PciConfigSpace;
use chipset_device::pio::ControlPortIoIntercept;
use chipset_device::pio::PortIoIntercept;
use chipset_device::pio::RegisterPortIoIntercept;
use chipset_device::ChipsetDevice;
use open_enum::open_enum;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Standard x86 IO ports associated with PCI
#[expect(missing_docs)] // self explanatory constants
pub mod standard_x86_io_ports {
    pub const ADDR_START: u16 = 0xCF8;
    pub const DATA_START: u16 = 0xCFC;
}

/// An abstract interface for a PCI device accessed via the [`PciBus`].
///
/// This trait is nearly identical to [`chipset_device::pci::PciConfigSpace`],
/// except for the fact that the return values are wrapped in an `Option`,
/// where `None` indicates that the backing device is no longer responding to
/// accesses. Any [`PciConfigSpace`] implementation can sit on the bus
/// directly.
pub trait PciBusDevice: 'static + Send {
    /// Dispatch a PCI config space read to the device with the given address.
    fn cfg_read(&mut self, offset: u16, value: &mut u32) -> Option<IoResult>;

    /// Dispatch a PCI config space write to the device with the given
    /// address.
    fn cfg_write(&mut self, offset: u16, value: u32) -> Option<IoResult>;
}

impl<T: PciConfigSpace> PciBusDevice for T {
    fn cfg_read(&mut self, offset: u16, value: &mut u32) -> Option<IoResult> {
        Some(self.pci_cfg_read(offset, value))
    }

    fn cfg_write(&mut self, offset: u16, value: u32) -> Option<IoResult> {
        Some(self.pci_cfg_write(offset, value))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PciAddr {
    bus: u8,
    device: u8,
    function: u8,
}

impl std::fmt::Display for PciAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Use standard-ish BDF notation (bb:dd.f).
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus, self.device, self.function
        )
    }
}

#[rustfmt::skip]
#[bitfield(u32)]
struct AddressRegister {
    #[bits(8)] register: u8,
    #[bits(3)] function: u8,
    #[bits(5)] device: u8,
    #[bits(8)] bus: u8,
    #[bits(7)] reserved: u8,
    #[bits(1)] enabled: bool,
}

impl AddressRegister {
    fn address(&self) -> PciAddr {
        PciAddr {
            bus: self.bus(),
            device: self.device(),
            function: self.function(),
        }
    }

    /// Set all reserved / zero bits to zero
    fn fixup(&mut self) {
        // the register accessed is always DWORD aligned
        // (the low two bits are hard-coded to 0)
        self.set_register(self.register() & !0b11);
        self.set_reserved(0);
    }
}

impl std::fmt::Display for AddressRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:04x}", self.address(), self.register())
    }
}

/// A generic PCI bus routing legacy configuration space accesses.
pub struct PciBus {
    // Runtime glue
    pio_addr: Box<dyn ControlPortIoIntercept>,
    pio_data: Box<dyn ControlPortIoIntercept>,
    pci_devices: BTreeMap<PciAddr, (Arc<str>, Box<dyn PciBusDevice>)>,

    // Volatile state
    pio_addr_reg: AddressRegister,
}

impl PciBus {
    /// Create a new [`PciBus`] with the specified (4-byte) IO ports.
    pub fn new(
        register_pio: &mut dyn RegisterPortIoIntercept,
        pio_addr: u16,
        pio_data: u16,
    ) -> PciBus {
        let mut addr_control = register_pio.new_io_region("addr", 4);
        let mut data_control = register_pio.new_io_region("data", 4);
        addr_control.map(pio_addr);
        data_control.map(pio_data);
        PciBus {
            pio_addr: addr_control,
            pio_data: data_control,
            pci_devices: BTreeMap::new(),
            pio_addr_reg: AddressRegister::new(),
        }
    }

    /// Try to add a PCI device, returning (device, existing_device_name) if
    /// the slot is already occupied.
    pub fn add_pci_device<D: PciBusDevice>(
        &mut self,
        bus: u8,
        device: u8,
        function: u8,
        name: impl AsRef<str>,
        dev: D,
    ) -> Result<(), (D, Arc<str>)> {
        let key = PciAddr {
            bus,
            device,
            function,
        };

        if let Some((name, _)) = self.pci_devices.get(&key) {
            return Err((dev, name.clone()));
        }

        self.pci_devices
            .insert(key, (name.as_ref().into(), Box::new(dev)));
        Ok(())
    }

    /// Resets the address register.
    pub fn reset(&mut self) {
        self.pio_addr_reg = AddressRegister::new();
    }

    fn handle_addr_read(&self, value: &mut u32) -> IoResult {
        *value = self.pio_addr_reg.0;
        IoResult::Ok
    }

    fn handle_addr_write(&mut self, addr: u32) -> IoResult {
        let mut addr = AddressRegister(addr);
        addr.fixup();
        self.pio_addr_reg = addr;
        IoResult::Ok
    }

    fn handle_data_read(&mut self, value: &mut u32) -> IoResult {
        tracing::trace!(%self.pio_addr_reg, "data read");

        if !self.pio_addr_reg.enabled() {
            tracing::warn!("addr enable bit is set to disabled");
            *value = !0;
            return IoResult::Ok;
        }

        let address = self.pio_addr_reg.address();
        match self.pci_devices.get_mut(&address) {
            Some((name, device)) => {
                let offset = self.pio_addr_reg.register().into();
                if let Some(result) = device.cfg_read(offset, value) {
                    result
                } else {
                    tracing::warn!(
                        device = &**name,
                        %address,
                        offset,
                        "cfg space read failed, device went away"
                    );
                    *value = !0;
                    IoResult::Ok
                }
            }
            None => {
                tracing::trace!(%address, "no device found - returning F's");
                *value = !0;
                IoResult::Ok
            }
        }
    }

    fn handle_data_write(&mut self, data: u32) -> IoResult {
        tracing::trace!(%self.pio_addr_reg, "data write");

        if !self.pio_addr_reg.enabled() {
            tracing::warn!("addr enable bit is set to disabled");
            return IoResult::Ok;
        }

        let address = self.pio_addr_reg.address();
        match self.pci_devices.get_mut(&address) {
            Some((name, device)) => {
                let offset = self.pio_addr_reg.register().into();
                if let Some(result) = device.cfg_write(offset, data) {
                    result
                } else {
                    tracing::warn!(
                        device = &**name,
                        %address,
                        offset,
                        "cfg space write failed, device went away"
                    );
                    IoResult::Ok
                }
            }
            None => {
                tracing::debug!(%address, "no device found");
                IoResult::Ok
            }
        }
    }

    fn trace_error(&self, e: IoError, operation: &'static str) {
        let error = match e {
            IoError::InvalidRegister => "offset not supported",
            IoError::InvalidAccessSize => "invalid access size",
            IoError::UnalignedAccess => "unaligned access",
        };
        tracing::warn!(
            address = %self.pio_addr_reg.address(),
            "pci config space {} operation error: {}",
            operation,
            error
        );
    }
}

impl ChipsetDevice for PciBus {
    fn supports_pio(&mut self) -> Option<&mut dyn PortIoIntercept> {
        Some(self)
    }
}

fn shift_read_value(io_port: u16, len: usize, value: u32) -> u32 {
    let shift = (io_port & 0x3) * 8;
    match len {
        4 => value,
        2 => value >> shift & 0xFFFF,
        1 => value >> shift & 0xFF,
        _ => unreachable!(),
    }
}

fn combine_old_new_values(io_port: u16, old_value: u32, new_value: u32, len: usize) -> u32 {
    let shift = (io_port & 0x3) * 8;
    let mask: u32 = match len {
        4 => !0,
        2 => 0xFFFF,
        1 => 0xFF,
        _ => unreachable!(),
    };
    (old_value & !(mask << shift)) | ((new_value & mask) << shift)
}

impl PortIoIntercept for PciBus {
    fn io_read(&mut self, io_port: u16, data: &mut [u8]) -> IoResult {
        if !matches!(data.len(), 1 | 2 | 4) {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        if !(data.len() == 4 && io_port & 3 == 0
            || data.len() == 2 && io_port & 1 == 0
            || data.len() == 1)
        {
            return IoResult::Err(IoError::UnalignedAccess);
        }

        let mut value = 0;
        let res = match io_port {
            _ if self.pio_addr.offset_of(io_port).is_some() => self.handle_addr_read(&mut value),
            _ if self.pio_data.offset_of(io_port).is_some() => self.handle_data_read(&mut value),
            _ => return IoResult::Err(IoError::InvalidRegister),
        };

        match res {
            IoResult::Ok => {
                let value = shift_read_value(io_port, data.len(), value);
                data.copy_from_slice(&value.to_ne_bytes()[..data.len()]);
                IoResult::Ok
            }
            IoResult::Err(e) => {
                self.trace_error(e, "read");
                // Config space errors are not surfaced to the guest; it just
                // reads zeros.
                data.fill(0);
                IoResult::Ok
            }
        }
    }

    fn io_write(&mut self, io_port: u16, data: &[u8]) -> IoResult {
        if !matches!(data.len(), 1 | 2 | 4) {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        let new_value = {
            let mut bytes = [0; 4];
            bytes[..data.len()].copy_from_slice(data);
            u32::from_ne_bytes(bytes)
        };

        match io_port {
            _ if self.pio_addr.offset_of(io_port).is_some() => {
                // In theory, only 4-byte accesses are valid here, but some
                // guests modify the bottom byte of the configuration address
                // with a 1-byte access.
                let v = if data.len() == 4 {
                    new_value
                } else {
                    let mut old_value = 0;
                    self.handle_addr_read(&mut old_value).unwrap();
                    combine_old_new_values(io_port, old_value, new_value, data.len())
                };

                self.handle_addr_write(v)
            }
            _ if self.pio_data.offset_of(io_port).is_some() => {
                let merged_value = if data.len() == 4 {
                    new_value
                } else {
                    // If the access isn't a double word, read in the old data
                    // to form a full word. Reading may have side effects in
                    // principle, but not for the devices on this bus.
                    let mut old_value = 0;
                    match self.handle_data_read(&mut old_value) {
                        IoResult::Ok => {
                            combine_old_new_values(io_port, old_value, new_value, data.len())
                        }
                        IoResult::Err(e) => {
                            self.trace_error(e, "read for undersized write");
                            0
                        }
                    }
                };

                match self.handle_data_write(merged_value) {
                    IoResult::Err(e) => {
                        self.trace_error(e, "write");
                        IoResult::Ok
                    }
                    IoResult::Ok => IoResult::Ok,
                }
            }
            _ => IoResult::Err(IoError::InvalidRegister),
        }
    }
}

open_enum! {
    /// Dword registers of the standard type 0 configuration header.
    enum HeaderType00: u16 {
        DEVICE_VENDOR = 0x00,
        STATUS_COMMAND = 0x04,
        CLASS_REVISION = 0x08,
        BIST_HEADER = 0x0C,
        BAR0 = 0x10,
        BAR1 = 0x14,
        BAR2 = 0x18,
        BAR3 = 0x1C,
        BAR4 = 0x20,
        BAR5 = 0x24,
        CARDBUS_CIS_PTR = 0x28,
        SUBSYSTEM_ID = 0x2C,
        EXPANSION_ROM_BASE = 0x30,
        RESERVED_CAP_PTR = 0x34,
        RESERVED = 0x38,
        LATENCY_INTERRUPT = 0x3C,
    }
}

#[rustfmt::skip]
#[bitfield(u16)]
struct Command {
    pub pio_enabled: bool,
    pub mmio_enabled: bool,
    pub bus_master: bool,
    pub special_cycles: bool,
    pub mwi_enable: bool,
    pub vga_palette_snoop: bool,
    pub parity_error_response: bool,
    _rsvd: bool,
    pub serr_enable: bool,
    pub fast_back_to_back: bool,
    pub intx_disable: bool,
    #[bits(5)] _rsvd2: u8,
}

const SUPPORTED_COMMAND_BITS: u16 = Command::new()
    .with_pio_enabled(true)
    .with_mmio_enabled(true)
    .with_bus_master(true)
    .with_intx_disable(true)
    .0;

/// The hardwired identification registers of a PCI device.
#[derive(Debug, Copy, Clone)]
#[expect(missing_docs)] // self explanatory fields
pub struct HardwareIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub prog_if: u8,
    pub sub_class: u8,
    pub base_class: u8,
    pub type0_sub_vendor_id: u16,
    pub type0_sub_system_id: u16,
}

/// Container type that describes a device's memory BARs.
///
/// 32-bit memory BARs only; lengths are rounded up to a power of two of at
/// least one page.
pub struct DeviceBars {
    bars: [Option<(u64, Box<dyn ControlMmioIntercept>)>; 6],
}

impl DeviceBars {
    /// Create a new instance of [`DeviceBars`].
    pub fn new() -> DeviceBars {
        DeviceBars {
            bars: Default::default(),
        }
    }

    /// Set the BAR at `index`, backed by the given MMIO intercept region.
    pub fn bar(mut self, index: usize, len: u64, region: Box<dyn ControlMmioIntercept>) -> Self {
        self.bars[index] = Some((len, region));
        self
    }
}

impl Default for DeviceBars {
    fn default() -> Self {
        Self::new()
    }
}

/// Emulator for the standard type 0 PCI configuration space header.
pub struct ConfigSpaceType0Emulator {
    // Fixed configuration
    bar_masks: [u32; 6],
    hardware_ids: HardwareIds,

    // Runtime glue
    mapped_memory: [Option<Box<dyn ControlMmioIntercept>>; 6],

    // Volatile state
    command: Command,
    base_addresses: [u32; 6],
    interrupt_line: u8,
    latency_timer: u8,
}

impl std::fmt::Debug for ConfigSpaceType0Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpaceType0Emulator")
            .field("bar_masks", &self.bar_masks)
            .field("hardware_ids", &self.hardware_ids)
            .field(
                "mapped_memory",
                &self.mapped_memory.each_ref().map(|m| m.is_some()),
            )
            .field("command", &self.command)
            .field("base_addresses", &self.base_addresses)
            .field("interrupt_line", &self.interrupt_line)
            .field("latency_timer", &self.latency_timer)
            .finish()
    }
}

impl ConfigSpaceType0Emulator {
    /// Create a new [`ConfigSpaceType0Emulator`].
    pub fn new(hardware_ids: HardwareIds, bars: DeviceBars) -> Self {
        let mut bar_masks = [0; 6];
        let mut mapped_memory = {
            const NONE: Option<Box<dyn ControlMmioIntercept>> = None;
            [NONE; 6]
        };
        for (bar_index, bar) in bars.bars.into_iter().enumerate() {
            let (len, region) = match bar {
                Some(bar) => bar,
                None => continue,
            };
            // Round up regions to a power of 2, as required by PCI (and
            // inherently required by the BAR representation). Round up to at
            // least one page to avoid various problems in guest OSes.
            const MIN_BAR_SIZE: u64 = 4096;
            let len = std::cmp::max(len.next_power_of_two(), MIN_BAR_SIZE);
            bar_masks[bar_index] = !(len - 1) as u32;
            mapped_memory[bar_index] = Some(region);
        }

        Self {
            bar_masks,
            hardware_ids,
            mapped_memory,
            command: Command::new(),
            base_addresses: [0; 6],
            interrupt_line: 0,
            latency_timer: 0,
        }
    }

    /// Resets the configuration space state, unmapping any mapped BARs.
    pub fn reset(&mut self) {
        self.command = Command::new();
        self.base_addresses = [0; 6];
        self.interrupt_line = 0;
        self.latency_timer = 0;
        self.update_mmio_enabled();
    }

    fn update_mmio_enabled(&mut self) {
        for (bar_index, region) in self.mapped_memory.iter_mut().enumerate() {
            if let Some(region) = region {
                region.unmap();
                if self.command.mmio_enabled() {
                    region.map(self.base_addresses[bar_index].into());
                }
            }
        }
    }

    /// Finds the BAR and offset containing `address`, if the device's memory
    /// is enabled and mapped there.
    pub fn find_bar(&self, address: u64) -> Option<(u8, u16)> {
        if !self.command.mmio_enabled() {
            return None;
        }
        for (bar_index, mask) in self.bar_masks.iter().enumerate() {
            if *mask == 0 {
                continue;
            }
            let base: u64 = self.base_addresses[bar_index].into();
            let len = !u64::from(*mask) + 1;
            if address >= base && address < base + len {
                return Some((bar_index as u8, (address - base) as u16));
            }
        }
        None
    }

    /// Read a dword from the config space header.
    pub fn read_u32(&self, offset: u16, value: &mut u32) -> IoResult {
        *value = match HeaderType00(offset & !0x3) {
            HeaderType00::DEVICE_VENDOR => {
                (self.hardware_ids.device_id as u32) << 16 | self.hardware_ids.vendor_id as u32
            }
            HeaderType00::STATUS_COMMAND => self.command.0 as u32,
            HeaderType00::CLASS_REVISION => {
                (self.hardware_ids.base_class as u32) << 24
                    | (self.hardware_ids.sub_class as u32) << 16
                    | (self.hardware_ids.prog_if as u32) << 8
                    | self.hardware_ids.revision_id as u32
            }
            HeaderType00::BIST_HEADER => (self.latency_timer as u32) << 8,
            reg if (HeaderType00::BAR0..=HeaderType00::BAR5).contains(&reg) => {
                self.base_addresses[(reg.0 - HeaderType00::BAR0.0) as usize / 4]
            }
            HeaderType00::CARDBUS_CIS_PTR => 0,
            HeaderType00::SUBSYSTEM_ID => {
                (self.hardware_ids.type0_sub_system_id as u32) << 16
                    | self.hardware_ids.type0_sub_vendor_id as u32
            }
            HeaderType00::EXPANSION_ROM_BASE => 0,
            HeaderType00::RESERVED_CAP_PTR => 0,
            HeaderType00::RESERVED => 0,
            HeaderType00::LATENCY_INTERRUPT => self.interrupt_line as u32,
            _ => {
                tracing::warn!(offset, "unexpected config space read");
                return IoResult::Err(IoError::InvalidRegister);
            }
        };

        IoResult::Ok
    }

    /// Write a dword to the config space header.
    pub fn write_u32(&mut self, offset: u16, val: u32) -> IoResult {
        match HeaderType00(offset & !0x3) {
            HeaderType00::STATUS_COMMAND => {
                let mut command = Command(val as u16);
                if command.0 & !SUPPORTED_COMMAND_BITS != 0 {
                    tracing::warn!(offset, val, "setting invalid command bits");
                    // still do our best
                    command = Command(command.0 & SUPPORTED_COMMAND_BITS);
                }

                let mmio_toggled = self.command.mmio_enabled() != command.mmio_enabled();
                self.command = command;
                if mmio_toggled {
                    self.update_mmio_enabled();
                }
            }
            HeaderType00::BIST_HEADER => {
                // allow writes to the latency timer
                self.latency_timer = (val >> 8) as u8;
            }
            reg if (HeaderType00::BAR0..=HeaderType00::BAR5).contains(&reg) => {
                // BARs are reprogrammed only while the device's memory is
                // disabled.
                if !self.command.mmio_enabled() {
                    let bar_index = (reg.0 - HeaderType00::BAR0.0) as usize / 4;
                    self.base_addresses[bar_index] = val & self.bar_masks[bar_index];
                }
            }
            HeaderType00::LATENCY_INTERRUPT => {
                self.interrupt_line = val as u8;
            }
            // all other header registers are noops
            reg if reg.0 < 0x40 => (),
            _ => {
                tracing::warn!(offset, val, "unexpected config space write");
                return IoResult::Err(IoError::InvalidRegister);
            }
        }

        IoResult::Ok
    }
}
