// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! APIC-related definitions, xAPIC (MMIO) mode only.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use open_enum::open_enum;

/// The APIC base MSR number (IA32_APIC_BASE).
pub const APIC_BASE_MSR: u32 = 0x0000_001b;

/// The physical address of the APIC register bank at reset.
pub const APIC_BASE_ADDRESS: u64 = 0xfee0_0000;

/// The size of the APIC register bank.
pub const APIC_MMIO_SIZE: u64 = 0x1000;

/// The APIC base MSR.
#[bitfield(u64)]
pub struct ApicBase {
    _reserved: u8,
    /// True if this processor is the bootstrap processor.
    pub bsp: bool,
    #[bits(2)]
    _reserved2: u8,
    /// True if the APIC decodes its register bank.
    pub enable: bool,
    /// The 4KB page number of the register bank.
    #[bits(40)]
    pub base_page: u64,
    #[bits(12)]
    _reserved3: u16,
}

impl ApicBase {
    /// Returns the physical base address of the register bank.
    pub const fn base_address(&self) -> u64 {
        self.base_page() << 12
    }
}

/// Local vector table entry.
#[bitfield(u32)]
pub struct Lvt {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: u8,
    _rsvd: bool,
    pub delivery_status: bool,
    pub input_pin_polarity: bool,
    pub remote_irr: bool,
    pub trigger_mode_level: bool,
    pub masked: bool,
    pub timer_periodic: bool,
    #[bits(14)]
    _rsvd2: u32,
}

/// Timer divide configuration register. The divider is encoded in bits 0, 1,
/// and 3.
#[bitfield(u32)]
pub struct Dcr {
    #[bits(2)]
    pub value_low: u8,
    _rsvd: bool,
    #[bits(1)]
    pub value_high: u8,
    #[bits(28)]
    _rsvd2: u32,
}

/// Interrupt command register.
#[bitfield(u64)]
pub struct Icr {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: u8,
    pub destination_mode_logical: bool,
    pub delivery_pending: bool,
    _reserved: bool,
    pub level_assert: bool,
    pub trigger_mode_level: bool,
    #[bits(2)]
    pub remote_read_status: u8,
    #[bits(2)]
    pub destination_shorthand: u8,
    #[bits(36)]
    _reserved2: u64,
    /// The message destination address (top byte of the high half).
    pub destination: u8,
}

open_enum! {
    pub enum DeliveryMode: u8 {
        FIXED = 0,
        LOWEST_PRIORITY = 1,
        SMI = 2,
        RESERVED = 3,
        NMI = 4,
        INIT = 5,
        SIPI = 6,
        EXTINT = 7,
    }
}

open_enum! {
    pub enum DestinationShorthand: u8 {
        NONE = 0,
        SELF = 1,
        ALL_INCLUDING_SELF = 2,
        ALL_EXCLUDING_SELF = 3,
    }
}

open_enum! {
    /// Destination format model, DFR bits 31:28.
    pub enum DfrModel: u8 {
        CLUSTER = 0x0,
        FLAT = 0xf,
    }
}

open_enum! {
    /// Register bank cells, identified by byte offset divided by the 0x10
    /// stride. Only the first dword of each cell is architecturally defined.
    pub enum ApicRegister: u8 {
        ID = 0x02,              // RW
        VERSION = 0x03,         // RO
        TPR = 0x08,             // RW
        APR = 0x09,             // RO
        PPR = 0x0a,             // RO
        EOI = 0x0b,             // WO
        RRD = 0x0c,             // RO
        LDR = 0x0d,             // RW
        DFR = 0x0e,             // RW
        SVR = 0x0f,             // RW
        ISR0 = 0x10,            // RO
        ISR7 = 0x17,
        TMR0 = 0x18,            // RO
        TMR7 = 0x1f,
        IRR0 = 0x20,            // RO
        IRR7 = 0x27,
        ESR = 0x28,             // RW
        ICR0 = 0x30,            // RW, write triggers routing
        ICR1 = 0x31,            // RW
        LVT_TIMER = 0x32,       // RW
        LVT_THERMAL = 0x33,     // RW
        LVT_PMC = 0x34,         // RW
        LVT_LINT0 = 0x35,       // RW
        LVT_LINT1 = 0x36,       // RW
        LVT_ERROR = 0x37,       // RW
        TIMER_ICR = 0x38,       // RW
        TIMER_CCR = 0x39,       // RO
        TIMER_DCR = 0x3e,       // RW
        IER0 = 0x48,            // RW, extended-APIC interrupt enable window
        IER7 = 0x4f,
    }
}

impl ApicRegister {
    /// Returns the byte offset of the register within the bank.
    pub const fn offset(&self) -> u64 {
        (self.0 as u64) << 4
    }
}
