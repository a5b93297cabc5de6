// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local APIC emulator.
//!
//! This emulates the per-processor local APIC in xAPIC (MMIO) mode, as
//! documented by the Intel SDM: the 4KB register bank, the IRR/ISR/IER/TMR
//! vector bitmaps, the local interrupt sources and their vector table, the
//! one-shot/periodic timer, and inter-processor interrupt routing between the
//! processors of a partition, including the INIT/SIPI handshake used to start
//! application processors.
//!
//! Each processor owns a [`LocalApic`] and drives it from its run loop; the
//! [`ApicSet`] ties the per-processor APICs together for IPI routing. Vectors
//! raised by remote processors or devices pass through a per-APIC FIFO and
//! are folded into the owner's IRR the next time the owner checks for pending
//! interrupts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod queue;

use crate::queue::IrqQueue;
use apicdefs::ApicBase;
use apicdefs::ApicRegister;
use apicdefs::Dcr;
use apicdefs::DeliveryMode;
use apicdefs::DestinationShorthand;
use apicdefs::DfrModel;
use apicdefs::Icr;
use apicdefs::Lvt;
use apicdefs::APIC_BASE_ADDRESS;
use apicdefs::APIC_BASE_MSR;
use apicdefs::APIC_MMIO_SIZE;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::ControlMmioIntercept;
use chipset_device::mmio::MmioIntercept;
use chipset_device::mmio::RegisterMmioIntercept;
use chipset_device::ChipsetDevice;
use parking_lot::RwLock;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// P6-family version register value: version 0x10, six LVT entries.
const APIC_VERSION: u32 = 0x8005_0010;

fn bank_mask(vector: u8) -> (usize, u32) {
    (vector as usize / 32, 1 << (vector % 32))
}

/// Returns the highest vector set in a 256-bit bitmap, scanning the subwords
/// top down.
fn highest_vector(bits: &[u32; 8]) -> Option<u8> {
    for (bank, &word) in bits.iter().enumerate().rev() {
        if word != 0 {
            return Some((bank as u32 * 32 + (31 - word.leading_zeros())) as u8);
        }
    }
    None
}

fn dcr_divider_shift(dcr: Dcr) -> u8 {
    let value = dcr.value_low() | (dcr.value_high() << 2);
    value.wrapping_add(1) & 0b111
}

/// Errors produced by the local APIC emulator.
#[derive(Debug, Error)]
pub enum ApicError {
    /// A vector in the architecturally reserved 0..=15 range was raised.
    #[error("vector {0} is architecturally reserved")]
    InvalidVector(u32),
    /// The register bank was accessed while the APIC is hardware disabled.
    #[error("register bank access while the APIC is disabled")]
    DisabledApic,
    /// The guest wrote a read-only register.
    #[error("write to read-only register {0:?}")]
    ReadOnly(ApicRegister),
    /// The access named a register bank offset with nothing behind it.
    #[error("unhandled register bank offset {0:#x}")]
    Unhandled(u64),
    /// The access length is not supported at this offset.
    #[error("invalid {len}-byte access at offset {offset:#x}")]
    InvalidLength {
        /// Offset of the access within the register bank.
        offset: u64,
        /// Length of the access in bytes.
        len: usize,
    },
    /// A physical-mode IPI named an identity with no matching APIC.
    #[error("no local APIC has identity {0:#x}")]
    NoSuchDestination(u8),
    /// The destination format register selects neither flat nor cluster mode.
    #[error("destination format model {0:#x} is neither flat nor cluster")]
    BadDestinationFormat(u8),
    /// SMI, NMI, and reserved delivery modes are not emulated.
    #[error("unsupported delivery mode {0:?}")]
    UnsupportedDeliveryMode(DeliveryMode),
    /// A shorthand-self IPI was requested with no originating APIC.
    #[error("shorthand-self IPI without an originating APIC")]
    MissingSource,
}

impl ApicError {
    fn to_io_error(&self) -> IoError {
        match self {
            ApicError::InvalidLength { .. } => IoError::InvalidAccessSize,
            _ => IoError::InvalidRegister,
        }
    }
}

/// Errors accessing the APIC MSR surface.
#[derive(Debug, Error)]
pub enum MsrError {
    /// The MSR is not implemented by this device.
    #[error("unknown msr")]
    Unknown,
    /// The MSR exists but rejected the access.
    #[error("invalid msr access")]
    InvalidAccess,
}

/// Startup handshake phase of a processor, as driven by INIT and startup
/// IPIs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpiState {
    /// Waiting for an INIT IPI.
    Init = 0,
    /// INIT received, waiting for a startup IPI.
    Sipi = 1,
    /// Startup IPI received, the processor is running.
    Started = 2,
}

impl IpiState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Sipi,
            _ => Self::Started,
        }
    }
}

/// The local interrupt sources of an APIC, each with a local vector table
/// entry in the register bank.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LocalInterrupt {
    /// The APIC timer.
    Timer,
    /// The thermal sensor.
    Thermal,
    /// The performance monitoring counters.
    Performance,
    /// The LINT0 pin.
    Lint0,
    /// The LINT1 pin.
    Lint1,
    /// The internal error interrupt.
    Error,
}

/// The host's view of the processors backing the partition.
///
/// Installed once when the [`ApicSet`] is built; called from whichever thread
/// routes an IPI.
pub trait CpuBackend: Send + Sync {
    /// Forces the processor out of guest execution so that it reevaluates its
    /// pending interrupts.
    ///
    /// May be a no-op when `vp_index` is the calling processor; the caller
    /// does not wait for an acknowledgement.
    fn kick_vp(&self, vp_index: u32);

    /// Resets the processor to real-mode startup at the segment derived from
    /// `sipi_vector` and marks it runnable.
    ///
    /// This is the only path that may take the VM barrier lock; the APIC
    /// never calls it while holding one of its own locks.
    fn start_vp(&self, vp_index: u32, sipi_vector: u8);
}

/// An IPI issued on behalf of a virtual device rather than a processor, with
/// the same fields a processor would program into the ICR.
#[derive(Debug, Copy, Clone)]
pub struct IpiRequest {
    /// The vector to deliver.
    pub vector: u8,
    /// The delivery mode.
    pub delivery_mode: DeliveryMode,
    /// True for logical destination mode, false for physical.
    pub logical_destination_mode: bool,
    /// True for level trigger mode.
    pub trigger_mode_level: bool,
    /// The destination shorthand. Shorthand-self is rejected, since there is
    /// no originating APIC.
    pub destination_shorthand: DestinationShorthand,
    /// The destination (physical identity or message destination address).
    pub destination: u8,
}

/// State shared between the owning processor and remote producers.
#[derive(Debug)]
struct SharedState {
    vp_index: u32,
    queue: IrqQueue,
    ipi_state: AtomicU8,
}

impl SharedState {
    /// Queues a vector for the owning processor, rejecting the reserved
    /// range.
    fn post_vector(&self, vector: u32) -> Result<(), ApicError> {
        if vector <= 15 {
            return Err(ApicError::InvalidVector(vector));
        }
        self.queue.enqueue(vector);
        Ok(())
    }
}

/// The addressability fields of one APIC, mirrored behind the device state
/// lock so that the router can evaluate destinations while the owner runs.
#[derive(Debug, Default)]
struct ApicSlot {
    id: u32,
    logical_id: u8,
    dfr_model: u8,
    task_priority: u32,
    shared: Option<Arc<SharedState>>,
}

impl ApicSlot {
    /// Logical-mode match predicate for a message destination address.
    fn matches_logical(&self, mda: u8) -> Result<bool, ApicError> {
        if mda == 0xff {
            // Broadcast always matches.
            return Ok(true);
        }
        match DfrModel(self.dfr_model) {
            DfrModel::FLAT => Ok(self.logical_id & mda != 0),
            DfrModel::CLUSTER => {
                // In the cluster: the high nibbles agree. In the set: the low
                // nibbles intersect.
                Ok((self.logical_id & 0xf0) == (mda & 0xf0) && self.logical_id & mda & 0x0f != 0)
            }
            model => Err(ApicError::BadDestinationFormat(model.0)),
        }
    }
}

#[derive(Debug)]
struct MutableGlobalState {
    slots: Vec<ApicSlot>,
}

impl MutableGlobalState {
    fn find_physical_apic(&self, dst: u8) -> Result<Arc<SharedState>, ApicError> {
        // The destination is usually at the index matching its identity.
        let idx = dst as usize;
        if idx < self.slots.len() && self.slots[idx].id == dst as u32 {
            if let Some(shared) = &self.slots[idx].shared {
                return Ok(shared.clone());
            }
        }
        self.slots
            .iter()
            .find(|slot| slot.id == dst as u32)
            .and_then(|slot| slot.shared.clone())
            .ok_or(ApicError::NoSuchDestination(dst))
    }

    /// Resolves an ICR to the set of destination APICs. Runs entirely under
    /// the state lock; delivery happens after the lock is dropped.
    fn collect_targets(
        &self,
        source: Option<u32>,
        icr: Icr,
        delivery_mode: DeliveryMode,
    ) -> Result<Vec<Arc<SharedState>>, ApicError> {
        match DestinationShorthand(icr.destination_shorthand()) {
            DestinationShorthand::NONE => {
                if !icr.destination_mode_logical() {
                    Ok(vec![self.find_physical_apic(icr.destination())?])
                } else if delivery_mode == DeliveryMode::LOWEST_PRIORITY {
                    // Arbitrate among the matching APICs for the lowest task
                    // priority. Ties go to the first one encountered.
                    let mut best: Option<(u32, Arc<SharedState>)> = None;
                    for slot in &self.slots {
                        let Some(shared) = &slot.shared else { continue };
                        if slot.matches_logical(icr.destination())? {
                            match &best {
                                Some((priority, _)) if slot.task_priority >= *priority => {}
                                _ => best = Some((slot.task_priority, shared.clone())),
                            }
                        }
                    }
                    match best {
                        Some((_, shared)) => Ok(vec![shared]),
                        None => {
                            tracing::debug!(
                                mda = icr.destination(),
                                "lowest priority delivery with no matching destination"
                            );
                            Ok(Vec::new())
                        }
                    }
                } else {
                    let mut targets = Vec::new();
                    for slot in &self.slots {
                        let Some(shared) = &slot.shared else { continue };
                        if slot.matches_logical(icr.destination())? {
                            targets.push(shared.clone());
                        }
                    }
                    Ok(targets)
                }
            }
            DestinationShorthand::SELF => {
                // Logical self-IPIs take this path too; the destination is
                // the source either way.
                let source = source.ok_or(ApicError::MissingSource)?;
                Ok(self
                    .slots
                    .get(source as usize)
                    .and_then(|slot| slot.shared.clone())
                    .into_iter()
                    .collect())
            }
            shorthand @ (DestinationShorthand::ALL_INCLUDING_SELF
            | DestinationShorthand::ALL_EXCLUDING_SELF) => {
                // Physical versus logical does not matter for broadcasts.
                let skip = if shorthand == DestinationShorthand::ALL_EXCLUDING_SELF {
                    source
                } else {
                    None
                };
                Ok(self
                    .slots
                    .iter()
                    .filter_map(|slot| {
                        let shared = slot.shared.as_ref()?;
                        if skip == Some(shared.vp_index) {
                            return None;
                        }
                        Some(shared.clone())
                    })
                    .collect())
            }
            _ => unreachable!(),
        }
    }
}

struct GlobalState {
    cpus: Box<dyn CpuBackend>,
    enqueue_missed_timer_irqs: bool,
    mutable: RwLock<MutableGlobalState>,
}

impl GlobalState {
    /// Routes an ICR to its destinations. `source` is the VP index of the
    /// originating APIC, or `None` for IPIs synthesized by devices.
    fn route_ipi(&self, source: Option<u32>, icr: Icr) -> Result<(), ApicError> {
        tracing::trace!(?source, icr = u64::from(icr), "routing ipi");

        let targets = {
            let mutable = self.mutable.read();
            mutable.collect_targets(source, icr, DeliveryMode(icr.delivery_mode()))?
        };

        for target in &targets {
            self.deliver_ipi(source, target, icr.vector(), DeliveryMode(icr.delivery_mode()))?;
        }
        Ok(())
    }

    fn deliver_ipi(
        &self,
        source: Option<u32>,
        dst: &Arc<SharedState>,
        vector: u8,
        delivery_mode: DeliveryMode,
    ) -> Result<(), ApicError> {
        match delivery_mode {
            DeliveryMode::FIXED | DeliveryMode::LOWEST_PRIORITY => {
                dst.post_vector(vector.into())?;
                if source != Some(dst.vp_index) {
                    self.cpus.kick_vp(dst.vp_index);
                }
                Ok(())
            }
            DeliveryMode::INIT => {
                // INIT-INIT-SIPI sequences are common and the deassert half
                // is a no-op, so a redundant INIT is only worth a warning.
                if dst
                    .ipi_state
                    .compare_exchange(
                        IpiState::Init as u8,
                        IpiState::Sipi as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    tracing::warn!(
                        vp = dst.vp_index,
                        "INIT to a processor not waiting for INIT, dropped"
                    );
                }
                Ok(())
            }
            DeliveryMode::SIPI => {
                if dst
                    .ipi_state
                    .compare_exchange(
                        IpiState::Sipi as u8,
                        IpiState::Started as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.cpus.start_vp(dst.vp_index, vector);
                } else {
                    tracing::error!(
                        vp = dst.vp_index,
                        vector,
                        "startup IPI to a processor not waiting for startup, dropped"
                    );
                }
                Ok(())
            }
            // The external interrupt controller delivers these through its
            // own route.
            DeliveryMode::EXTINT => Ok(()),
            mode => Err(ApicError::UnsupportedDeliveryMode(mode)),
        }
    }
}

/// The interface to the local APICs of all processors.
pub struct ApicSet {
    global: Arc<GlobalState>,
}

/// Builder for [`ApicSet`].
pub struct ApicSetBuilder {
    enqueue_missed_timer_irqs: bool,
}

impl ApicSetBuilder {
    fn new() -> Self {
        Self {
            enqueue_missed_timer_irqs: false,
        }
    }

    /// Sets whether periodic timer ticks that expired while an interrupt was
    /// already pending are injected later, one per run-loop pass, instead of
    /// being dropped.
    pub fn enqueue_missed_timer_irqs(&mut self, enable: bool) -> &mut Self {
        self.enqueue_missed_timer_irqs = enable;
        self
    }

    /// Builds the set with `cpus` as the host processor backend.
    pub fn build(&self, cpus: Box<dyn CpuBackend>) -> ApicSet {
        ApicSet {
            global: Arc::new(GlobalState {
                cpus,
                enqueue_missed_timer_irqs: self.enqueue_missed_timer_irqs,
                mutable: RwLock::new(MutableGlobalState { slots: Vec::new() }),
            }),
        }
    }
}

impl ApicSet {
    /// Creates a new builder for an APIC set.
    pub fn builder() -> ApicSetBuilder {
        ApicSetBuilder::new()
    }

    /// Adds the APIC for the processor at `vp_index`, registering and mapping
    /// its 4KB register bank at the reset base address.
    ///
    /// Panics if an APIC was already added for this processor.
    pub fn add_apic(
        &self,
        vp_index: u32,
        register_mmio: &mut dyn RegisterMmioIntercept,
    ) -> LocalApic {
        let shared = Arc::new(SharedState {
            vp_index,
            queue: IrqQueue::new(),
            ipi_state: AtomicU8::new(IpiState::Init as u8),
        });

        {
            let mut mutable = self.global.mutable.write();
            if mutable.slots.len() <= vp_index as usize {
                mutable
                    .slots
                    .resize_with(vp_index as usize + 1, ApicSlot::default);
            }
            let slot = &mut mutable.slots[vp_index as usize];
            assert!(slot.shared.is_none());
            slot.shared = Some(shared.clone());
        }

        let mut apic = LocalApic {
            shared,
            global: self.global.clone(),
            mmio_region: register_mmio.new_io_region("lapic", APIC_MMIO_SIZE),
            stats: ApicStats::default(),
            apic_base: 0,
            id: 0,
            version: 0,
            task_priority: 0,
            arb_priority: 0,
            proc_priority: 0,
            remote_read: 0,
            log_dst: 0,
            dst_fmt: 0,
            svr: 0,
            esr: 0,
            icr: 0,
            lvt_timer: 0,
            lvt_thermal: 0,
            lvt_pmc: 0,
            lvt_lint: [0; 2],
            lvt_error: 0,
            irr: [0; 8],
            isr: [0; 8],
            ier: [0; 8],
            tmr: [0; 8],
            timer_icr: 0,
            timer_ccr: 0,
            timer_dcr: 0,
            missed_ints: 0,
        };
        apic.reset();
        apic
    }

    /// Sends an IPI on behalf of a virtual device, as if a processor had
    /// written the equivalent ICR.
    pub fn request_ipi(&self, request: IpiRequest) -> Result<(), ApicError> {
        let icr = Icr::new()
            .with_vector(request.vector)
            .with_delivery_mode(request.delivery_mode.0)
            .with_destination_mode_logical(request.logical_destination_mode)
            .with_trigger_mode_level(request.trigger_mode_level)
            .with_destination_shorthand(request.destination_shorthand.0)
            .with_destination(request.destination);
        self.global.route_ipi(None, icr)
    }

    /// Queues `vector` directly on the APIC of the processor at `vp_index`
    /// and kicks that processor.
    pub fn raise_vector(&self, vp_index: u32, vector: u32) -> Result<(), ApicError> {
        let shared = {
            let mutable = self.global.mutable.read();
            mutable
                .slots
                .get(vp_index as usize)
                .and_then(|slot| slot.shared.clone())
        };
        let Some(shared) = shared else {
            return Err(ApicError::NoSuchDestination(vp_index as u8));
        };
        shared.post_vector(vector)?;
        self.global.cpus.kick_vp(vp_index);
        Ok(())
    }
}

/// Diagnostic counters kept by each local APIC.
#[derive(Debug, Default, Clone)]
pub struct ApicStats {
    /// End-of-interrupt writes that retired an in-service vector.
    pub eoi: u64,
    /// End-of-interrupt writes with nothing in service.
    pub spurious_eoi: u64,
    /// Raises that found their vector already requested.
    pub coalesced: u64,
    /// Raises dropped by the interrupt enable mask.
    pub masked: u64,
    /// Vectors promoted from requested to in service.
    pub interrupt: u64,
    /// Timer expirations.
    pub timer: u64,
    /// Shorthand-self IPIs sent.
    pub self_ipi: u64,
    /// Broadcast-shorthand IPIs sent.
    pub broadcast_ipi: u64,
    /// Directed IPIs sent.
    pub other_ipi: u64,
}

/// An individual local APIC for a processor.
///
/// Owned and driven by the processor's run loop; remote processors reach it
/// only through the [`ApicSet`].
pub struct LocalApic {
    // Runtime glue
    shared: Arc<SharedState>,
    global: Arc<GlobalState>,
    mmio_region: Box<dyn ControlMmioIntercept>,

    // Runtime book-keeping
    stats: ApicStats,

    // Volatile state
    apic_base: u64,
    id: u32,
    version: u32,
    task_priority: u32,
    arb_priority: u32,
    proc_priority: u32,
    remote_read: u32,
    log_dst: u32,
    dst_fmt: u32,
    svr: u32,
    esr: u32,
    icr: u64,
    lvt_timer: u32,
    lvt_thermal: u32,
    lvt_pmc: u32,
    lvt_lint: [u32; 2],
    lvt_error: u32,
    irr: [u32; 8],
    isr: [u32; 8],
    ier: [u32; 8],
    tmr: [u32; 8],
    timer_icr: u32,
    timer_ccr: u32,
    timer_dcr: u32,
    missed_ints: u32,
}

impl LocalApic {
    /// Resets the APIC to its power-on state: bank at the reset base address,
    /// all vectors enabled, all local sources masked, waiting for INIT.
    pub fn reset(&mut self) {
        self.apic_base = ApicBase::new()
            .with_bsp(self.shared.vp_index == 0)
            .with_enable(true)
            .with_base_page(APIC_BASE_ADDRESS >> 12)
            .into();
        self.id = self.shared.vp_index;
        self.version = APIC_VERSION;
        self.task_priority = 0;
        self.arb_priority = 0;
        self.proc_priority = 0;
        self.remote_read = 0;
        self.log_dst = 0;
        self.dst_fmt = !0;
        self.svr = 0xff;
        self.esr = 0;
        self.icr = 0;
        for lvt in [
            &mut self.lvt_timer,
            &mut self.lvt_thermal,
            &mut self.lvt_pmc,
            &mut self.lvt_error,
        ]
        .into_iter()
        .chain(&mut self.lvt_lint)
        {
            *lvt = Lvt::new().with_masked(true).into();
        }
        self.irr = [0; 8];
        self.isr = [0; 8];
        self.ier = [!0; 8];
        self.tmr = [0; 8];
        self.timer_icr = 0;
        self.timer_ccr = 0;
        self.timer_dcr = 0;
        self.missed_ints = 0;
        self.shared.queue.clear();
        self.shared
            .ipi_state
            .store(IpiState::Init as u8, Ordering::SeqCst);
        self.update_slot();
        self.sync_mmio_region();
    }

    /// Returns the diagnostic counters.
    pub fn stats(&self) -> &ApicStats {
        &self.stats
    }

    /// Returns the startup handshake phase of this processor.
    pub fn ipi_state(&self) -> IpiState {
        IpiState::from_raw(self.shared.ipi_state.load(Ordering::SeqCst))
    }

    /// Returns the APIC base MSR value.
    pub fn apic_base(&self) -> u64 {
        self.apic_base
    }

    fn hardware_enabled(&self) -> bool {
        ApicBase::from(self.apic_base).enable()
    }

    /// Mirrors the fields the IPI router reads cross-processor into this
    /// APIC's slot, under the device state lock.
    fn update_slot(&self) {
        let mut mutable = self.global.mutable.write();
        let slot = &mut mutable.slots[self.shared.vp_index as usize];
        slot.id = self.id;
        slot.logical_id = (self.log_dst >> 24) as u8;
        slot.dfr_model = (self.dst_fmt >> 28) as u8;
        slot.task_priority = self.task_priority;
    }

    /// Keeps the register bank hooked at the current base address, and only
    /// while the APIC is hardware enabled.
    fn sync_mmio_region(&mut self) {
        self.mmio_region.unmap();
        let base = ApicBase::from(self.apic_base);
        if base.enable() {
            self.mmio_region.map(base.base_address());
        }
    }

    /// Reads the APIC base MSR.
    pub fn msr_read(&mut self, msr: u32) -> Result<u64, MsrError> {
        match msr {
            APIC_BASE_MSR => Ok(self.apic_base),
            _ => Err(MsrError::Unknown),
        }
    }

    /// Writes the APIC base MSR, re-hooking the register bank at the new
    /// base.
    pub fn msr_write(&mut self, msr: u32, value: u64) -> Result<(), MsrError> {
        match msr {
            APIC_BASE_MSR => {
                tracing::debug!(vp = self.shared.vp_index, value, "apic base update");
                self.apic_base = value;
                self.sync_mmio_region();
                Ok(())
            }
            _ => Err(MsrError::Unknown),
        }
    }

    /// Returns true if an interrupt should be injected: the highest requested
    /// vector outranks the highest in-service vector.
    ///
    /// Folds any queued vectors into the IRR first. Called by the processor
    /// run loop on every guest entry.
    pub fn interrupt_pending(&mut self) -> bool {
        self.drain_irq_queue();
        match (highest_vector(&self.irr), highest_vector(&self.isr)) {
            (Some(req), Some(svc)) => req > svc,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Returns the vector the host should inject, if any.
    pub fn interrupt_vector(&self) -> Option<u8> {
        let req = highest_vector(&self.irr)?;
        match highest_vector(&self.isr) {
            Some(svc) if svc >= req => None,
            _ => Some(req),
        }
    }

    /// Records that delivery of `vector` to the guest has begun, moving it
    /// from requested to in service.
    ///
    /// A begin for a vector this APIC never requested is ignored.
    pub fn begin_interrupt(&mut self, vector: u8) {
        let (bank, mask) = bank_mask(vector);
        if self.irr[bank] & mask != 0 {
            self.irr[bank] &= !mask;
            self.isr[bank] |= mask;
            self.stats.interrupt += 1;
        }
    }

    /// Raises one of the APIC's local interrupt sources through its local
    /// vector table entry.
    pub fn activate_local_interrupt(&mut self, source: LocalInterrupt) -> Result<(), ApicError> {
        let (lvt, delivery_mode) = match source {
            // The timer and error sources always use fixed delivery.
            LocalInterrupt::Timer => (Lvt::from(self.lvt_timer), DeliveryMode::FIXED),
            LocalInterrupt::Error => (Lvt::from(self.lvt_error), DeliveryMode::FIXED),
            LocalInterrupt::Thermal => {
                let lvt = Lvt::from(self.lvt_thermal);
                (lvt, DeliveryMode(lvt.delivery_mode()))
            }
            LocalInterrupt::Performance => {
                let lvt = Lvt::from(self.lvt_pmc);
                (lvt, DeliveryMode(lvt.delivery_mode()))
            }
            LocalInterrupt::Lint0 => {
                let lvt = Lvt::from(self.lvt_lint[0]);
                (lvt, DeliveryMode(lvt.delivery_mode()))
            }
            LocalInterrupt::Lint1 => {
                let lvt = Lvt::from(self.lvt_lint[1]);
                (lvt, DeliveryMode(lvt.delivery_mode()))
            }
        };

        if lvt.masked() {
            tracing::trace!(?source, "local interrupt masked");
            return Ok(());
        }

        match delivery_mode {
            DeliveryMode::FIXED => self.shared.post_vector(lvt.vector().into()),
            mode => Err(ApicError::UnsupportedDeliveryMode(mode)),
        }
    }

    /// Advances the APIC timer by `cpu_cycles` elapsed core clocks.
    ///
    /// Called from the processor run loop. The timer always delivers to this
    /// APIC, never cross-processor.
    pub fn update_timer(&mut self, cpu_cycles: u64, _cpu_freq: u64) {
        let lvt = Lvt::from(self.lvt_timer);
        if self.timer_icr == 0 || (!lvt.timer_periodic() && self.timer_ccr == 0) {
            return;
        }

        let mut ticks = cpu_cycles >> dcr_divider_shift(Dcr::from(self.timer_dcr));

        if ticks < self.timer_ccr as u64 {
            self.timer_ccr -= ticks as u32;
            if self.global.enqueue_missed_timer_irqs
                && self.missed_ints > 0
                && !self.interrupt_pending()
            {
                self.inject_timer_interrupt();
                self.missed_ints -= 1;
            }
        } else {
            ticks -= self.timer_ccr as u64;
            self.timer_ccr = 0;
            self.inject_timer_interrupt();
            if lvt.timer_periodic() {
                self.missed_ints += (ticks / self.timer_icr as u64) as u32;
                self.timer_ccr = self.timer_icr - (ticks % self.timer_icr as u64) as u32;
            }
        }
    }

    fn inject_timer_interrupt(&mut self) {
        self.stats.timer += 1;
        if let Err(err) = self.activate_local_interrupt(LocalInterrupt::Timer) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                vp = self.shared.vp_index,
                "could not raise timer interrupt"
            );
        }
    }

    /// Folds queued vectors into the IRR.
    fn drain_irq_queue(&mut self) {
        while let Some(vector) = self.shared.queue.dequeue() {
            self.activate_irq(vector as u8);
        }
    }

    /// Returns true if the vector was newly requested.
    fn activate_irq(&mut self, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        if self.ier[bank] & mask == 0 {
            tracing::trace!(vector, "interrupt not enabled, dropped");
            self.stats.masked += 1;
            return false;
        }
        if self.irr[bank] & mask != 0 {
            tracing::trace!(vector, "interrupt coalesced");
            self.stats.coalesced += 1;
            return false;
        }
        self.irr[bank] |= mask;
        true
    }

    fn end_of_interrupt(&mut self) {
        if let Some(vector) = highest_vector(&self.isr) {
            tracing::trace!(vector, "eoi");
            let (bank, mask) = bank_mask(vector);
            self.isr[bank] &= !mask;
            self.stats.eoi += 1;
        } else {
            // Spurious; some guests EOI more than they ack.
            self.stats.spurious_eoi += 1;
        }
    }

    fn send_ipi(&mut self, icr: Icr) {
        match DestinationShorthand(icr.destination_shorthand()) {
            DestinationShorthand::SELF => self.stats.self_ipi += 1,
            DestinationShorthand::ALL_INCLUDING_SELF
            | DestinationShorthand::ALL_EXCLUDING_SELF => self.stats.broadcast_ipi += 1,
            _ => self.stats.other_ipi += 1,
        }

        // The guest cannot observe routing failures through the ICR write, so
        // log and complete the store.
        if let Err(err) = self.global.route_ipi(Some(self.shared.vp_index), icr) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                vp = self.shared.vp_index,
                icr = u64::from(icr),
                "IPI routing failure"
            );
        }
    }

    fn reg_read(&mut self, address: u64, data: &mut [u8]) -> Result<(), ApicError> {
        if !self.hardware_enabled() {
            return Err(ApicError::DisabledApic);
        }

        let offset = address & (APIC_MMIO_SIZE - 1);
        if offset & 0xc != 0 {
            return Err(ApicError::Unhandled(offset));
        }

        let byte = (offset & 0x3) as usize;
        let len = data.len();
        let fits = match len {
            1 => true,
            2 => byte < 3,
            4 => byte == 0,
            _ => false,
        };
        if !fits {
            return Err(ApicError::InvalidLength { offset, len });
        }

        let value = self.read_register(ApicRegister((offset >> 4) as u8), offset)?;
        data.copy_from_slice(&value.to_ne_bytes()[byte..byte + len]);
        Ok(())
    }

    fn reg_write(&mut self, address: u64, data: &[u8]) -> Result<(), ApicError> {
        if !self.hardware_enabled() {
            return Err(ApicError::DisabledApic);
        }

        let offset = address & (APIC_MMIO_SIZE - 1);
        let Ok(data) = data.try_into() else {
            return Err(ApicError::InvalidLength {
                offset,
                len: data.len(),
            });
        };
        if offset & 0xf != 0 {
            return Err(ApicError::Unhandled(offset));
        }

        self.write_register(
            ApicRegister((offset >> 4) as u8),
            u32::from_ne_bytes(data),
            offset,
        )
    }

    fn read_register(&mut self, register: ApicRegister, offset: u64) -> Result<u32, ApicError> {
        let value = match register {
            ApicRegister::ID => self.id,
            ApicRegister::VERSION => self.version,
            ApicRegister::TPR => self.task_priority,
            ApicRegister::APR => self.arb_priority,
            ApicRegister::PPR => self.proc_priority,
            // Architecturally write-only, but guests read it anyway.
            ApicRegister::EOI => 0,
            ApicRegister::RRD => self.remote_read,
            ApicRegister::LDR => self.log_dst,
            ApicRegister::DFR => self.dst_fmt,
            ApicRegister::SVR => self.svr,
            reg if (ApicRegister::ISR0..=ApicRegister::ISR7).contains(&reg) => {
                self.isr[(reg.0 - ApicRegister::ISR0.0) as usize]
            }
            reg if (ApicRegister::TMR0..=ApicRegister::TMR7).contains(&reg) => {
                self.tmr[(reg.0 - ApicRegister::TMR0.0) as usize]
            }
            reg if (ApicRegister::IRR0..=ApicRegister::IRR7).contains(&reg) => {
                self.irr[(reg.0 - ApicRegister::IRR0.0) as usize]
            }
            reg if (ApicRegister::IER0..=ApicRegister::IER7).contains(&reg) => {
                self.ier[(reg.0 - ApicRegister::IER0.0) as usize]
            }
            ApicRegister::ESR => self.esr,
            ApicRegister::ICR0 => self.icr as u32,
            ApicRegister::ICR1 => (self.icr >> 32) as u32,
            ApicRegister::LVT_TIMER => self.lvt_timer,
            ApicRegister::LVT_THERMAL => self.lvt_thermal,
            ApicRegister::LVT_PMC => self.lvt_pmc,
            ApicRegister::LVT_LINT0 => self.lvt_lint[0],
            ApicRegister::LVT_LINT1 => self.lvt_lint[1],
            ApicRegister::LVT_ERROR => self.lvt_error,
            ApicRegister::TIMER_ICR => self.timer_icr,
            ApicRegister::TIMER_CCR => self.timer_ccr,
            ApicRegister::TIMER_DCR => self.timer_dcr,
            _ => {
                tracing::warn!(offset, "read from unhandled APIC register");
                return Err(ApicError::Unhandled(offset));
            }
        };
        Ok(value)
    }

    fn write_register(
        &mut self,
        register: ApicRegister,
        value: u32,
        offset: u64,
    ) -> Result<(), ApicError> {
        match register {
            ApicRegister::VERSION
            | ApicRegister::APR
            | ApicRegister::PPR
            | ApicRegister::RRD
            | ApicRegister::TIMER_CCR => return Err(ApicError::ReadOnly(register)),
            reg if (ApicRegister::ISR0..=ApicRegister::ISR7).contains(&reg)
                || (ApicRegister::TMR0..=ApicRegister::TMR7).contains(&reg)
                || (ApicRegister::IRR0..=ApicRegister::IRR7).contains(&reg) =>
            {
                return Err(ApicError::ReadOnly(reg))
            }
            ApicRegister::ID => {
                self.id = value;
                self.update_slot();
            }
            ApicRegister::TPR => {
                self.task_priority = value;
                self.update_slot();
            }
            ApicRegister::EOI => self.end_of_interrupt(),
            ApicRegister::LDR => {
                tracing::debug!(vp = self.shared.vp_index, value, "logical destination");
                self.log_dst = value;
                self.update_slot();
            }
            ApicRegister::DFR => {
                self.dst_fmt = value;
                self.update_slot();
            }
            ApicRegister::SVR => self.svr = value,
            ApicRegister::ESR => self.esr = value,
            ApicRegister::ICR0 => {
                self.icr = (self.icr & 0xffffffff_00000000) | value as u64;
                self.send_ipi(Icr::from(self.icr));
            }
            ApicRegister::ICR1 => {
                self.icr = ((value as u64) << 32) | (self.icr & 0xffffffff);
            }
            ApicRegister::LVT_TIMER => {
                self.lvt_timer = value
                    & u32::from(
                        Lvt::new()
                            .with_vector(0xff)
                            .with_masked(true)
                            .with_timer_periodic(true),
                    );
            }
            ApicRegister::LVT_THERMAL => {
                self.lvt_thermal = value
                    & u32::from(
                        Lvt::new()
                            .with_vector(0xff)
                            .with_delivery_mode(0b111)
                            .with_masked(true),
                    );
            }
            ApicRegister::LVT_PMC => {
                self.lvt_pmc = value
                    & u32::from(
                        Lvt::new()
                            .with_vector(0xff)
                            .with_delivery_mode(0b111)
                            .with_masked(true),
                    );
            }
            reg @ (ApicRegister::LVT_LINT0 | ApicRegister::LVT_LINT1) => {
                let index = if reg == ApicRegister::LVT_LINT0 { 0 } else { 1 };
                self.lvt_lint[index] = value
                    & u32::from(
                        Lvt::new()
                            .with_vector(0xff)
                            .with_delivery_mode(0b111)
                            .with_input_pin_polarity(true)
                            .with_trigger_mode_level(true)
                            .with_masked(true),
                    );
            }
            ApicRegister::LVT_ERROR => {
                self.lvt_error =
                    value & u32::from(Lvt::new().with_vector(0xff).with_masked(true));
            }
            ApicRegister::TIMER_ICR => {
                self.timer_icr = value;
                self.timer_ccr = value;
            }
            ApicRegister::TIMER_DCR => {
                self.timer_dcr =
                    value & u32::from(Dcr::new().with_value_low(0b11).with_value_high(0b1));
            }
            reg if (ApicRegister::IER0..=ApicRegister::IER7).contains(&reg) => {
                self.ier[(reg.0 - ApicRegister::IER0.0) as usize] = value;
            }
            _ => {
                tracing::warn!(offset, value, "write to unhandled APIC register");
                return Err(ApicError::Unhandled(offset));
            }
        }
        Ok(())
    }

    /// Returns a snapshot of the architectural state for a checkpoint,
    /// folding any queued vectors into the IRR first.
    pub fn save(&mut self) -> ApicSavedState {
        self.drain_irq_queue();
        ApicSavedState {
            apic_base: self.apic_base,
            id: self.id,
            version: self.version,
            task_priority: self.task_priority,
            log_dst: self.log_dst,
            dst_fmt: self.dst_fmt,
            svr: self.svr,
            esr: self.esr,
            icr: self.icr,
            lvt_timer: self.lvt_timer,
            lvt_thermal: self.lvt_thermal,
            lvt_pmc: self.lvt_pmc,
            lvt_lint: self.lvt_lint,
            lvt_error: self.lvt_error,
            irr: self.irr,
            isr: self.isr,
            ier: self.ier,
            tmr: self.tmr,
            timer_icr: self.timer_icr,
            timer_ccr: self.timer_ccr,
            timer_dcr: self.timer_dcr,
            missed_ints: self.missed_ints,
            ipi_state: self.ipi_state(),
        }
    }

    /// Restores a snapshot taken by [`Self::save`], re-hooking the register
    /// bank and republishing the routed fields.
    pub fn restore(&mut self, state: &ApicSavedState) {
        let ApicSavedState {
            apic_base,
            id,
            version,
            task_priority,
            log_dst,
            dst_fmt,
            svr,
            esr,
            icr,
            lvt_timer,
            lvt_thermal,
            lvt_pmc,
            lvt_lint,
            lvt_error,
            irr,
            isr,
            ier,
            tmr,
            timer_icr,
            timer_ccr,
            timer_dcr,
            missed_ints,
            ipi_state,
        } = *state;

        self.apic_base = apic_base;
        self.id = id;
        self.version = version;
        self.task_priority = task_priority;
        self.log_dst = log_dst;
        self.dst_fmt = dst_fmt;
        self.svr = svr;
        self.esr = esr;
        self.icr = icr;
        self.lvt_timer = lvt_timer;
        self.lvt_thermal = lvt_thermal;
        self.lvt_pmc = lvt_pmc;
        self.lvt_lint = lvt_lint;
        self.lvt_error = lvt_error;
        self.irr = irr;
        self.isr = isr;
        self.ier = ier;
        self.tmr = tmr;
        self.timer_icr = timer_icr;
        self.timer_ccr = timer_ccr;
        self.timer_dcr = timer_dcr;
        self.missed_ints = missed_ints;
        self.shared
            .ipi_state
            .store(ipi_state as u8, Ordering::SeqCst);
        self.update_slot();
        self.sync_mmio_region();
    }
}

/// A snapshot of the architectural state of a [`LocalApic`].
///
/// The byte layout of a checkpoint is the caller's concern; this is plain
/// owned data.
#[derive(Debug, Clone)]
pub struct ApicSavedState {
    /// APIC base MSR.
    pub apic_base: u64,
    /// Identity register.
    pub id: u32,
    /// Version register.
    pub version: u32,
    /// Task priority register.
    pub task_priority: u32,
    /// Logical destination register.
    pub log_dst: u32,
    /// Destination format register.
    pub dst_fmt: u32,
    /// Spurious interrupt vector register.
    pub svr: u32,
    /// Error status register.
    pub esr: u32,
    /// Interrupt command register.
    pub icr: u64,
    /// Timer local vector table entry.
    pub lvt_timer: u32,
    /// Thermal local vector table entry.
    pub lvt_thermal: u32,
    /// Performance counter local vector table entry.
    pub lvt_pmc: u32,
    /// LINT0/LINT1 local vector table entries.
    pub lvt_lint: [u32; 2],
    /// Error local vector table entry.
    pub lvt_error: u32,
    /// Interrupt request register.
    pub irr: [u32; 8],
    /// In-service register.
    pub isr: [u32; 8],
    /// Interrupt enable register.
    pub ier: [u32; 8],
    /// Trigger mode register.
    pub tmr: [u32; 8],
    /// Timer initial count.
    pub timer_icr: u32,
    /// Timer current count.
    pub timer_ccr: u32,
    /// Timer divide configuration.
    pub timer_dcr: u32,
    /// Periodic timer ticks that expired without being delivered.
    pub missed_ints: u32,
    /// Startup handshake phase.
    pub ipi_state: IpiState,
}

impl ChipsetDevice for LocalApic {
    fn supports_mmio(&mut self) -> Option<&mut dyn MmioIntercept> {
        Some(self)
    }
}

impl MmioIntercept for LocalApic {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        match self.reg_read(addr, data) {
            Ok(()) => IoResult::Ok,
            Err(err) => {
                tracing::warn!(
                    addr,
                    len = data.len(),
                    error = &err as &dyn std::error::Error,
                    "invalid apic read"
                );
                IoResult::Err(err.to_io_error())
            }
        }
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> IoResult {
        match self.reg_write(addr, data) {
            Ok(()) => IoResult::Ok,
            // Read-only and unknown registers are ignored with a diagnostic;
            // real guests poke both.
            Err(err @ (ApicError::ReadOnly(_) | ApicError::Unhandled(_))) => {
                tracing::warn!(
                    addr,
                    error = &err as &dyn std::error::Error,
                    "apic write ignored"
                );
                IoResult::Ok
            }
            Err(err) => {
                tracing::warn!(
                    addr,
                    len = data.len(),
                    error = &err as &dyn std::error::Error,
                    "invalid apic write"
                );
                IoResult::Err(err.to_io_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records kicks and startup resets issued through the backend.
    #[derive(Default)]
    struct FakeCpus {
        kicks: Mutex<Vec<u32>>,
        starts: Mutex<Vec<(u32, u8)>>,
    }

    impl CpuBackend for Arc<FakeCpus> {
        fn kick_vp(&self, vp_index: u32) {
            self.kicks.lock().push(vp_index);
        }

        fn start_vp(&self, vp_index: u32, sipi_vector: u8) {
            self.starts.lock().push((vp_index, sipi_vector));
        }
    }

    type RegionMap = Arc<Mutex<Vec<(String, Option<u64>)>>>;

    /// Region registry that records where each region is currently mapped.
    #[derive(Default)]
    struct FakeMemoryMap {
        regions: RegionMap,
    }

    struct FakeRegion {
        name: String,
        len: u64,
        index: usize,
        addr: Option<u64>,
        regions: RegionMap,
    }

    impl RegisterMmioIntercept for FakeMemoryMap {
        fn new_io_region(&mut self, region_name: &str, len: u64) -> Box<dyn ControlMmioIntercept> {
            let mut regions = self.regions.lock();
            let index = regions.len();
            regions.push((region_name.to_string(), None));
            Box::new(FakeRegion {
                name: region_name.to_string(),
                len,
                index,
                addr: None,
                regions: self.regions.clone(),
            })
        }
    }

    impl ControlMmioIntercept for FakeRegion {
        fn region_name(&self) -> &str {
            &self.name
        }

        fn map(&mut self, addr: u64) {
            self.addr = Some(addr);
            self.regions.lock()[self.index].1 = Some(addr);
        }

        fn unmap(&mut self) {
            self.addr = None;
            self.regions.lock()[self.index].1 = None;
        }

        fn addr(&self) -> Option<u64> {
            self.addr
        }

        fn len(&self) -> u64 {
            self.len
        }

        fn offset_of(&self, addr: u64) -> Option<u64> {
            let base = self.addr?;
            (addr >= base && addr < base + self.len).then(|| addr - base)
        }
    }

    struct TestVm {
        cpus: Arc<FakeCpus>,
        set: ApicSet,
        apics: Vec<LocalApic>,
        regions: RegionMap,
    }

    fn new_vm(count: u32) -> TestVm {
        new_vm_with(count, false)
    }

    fn new_vm_with(count: u32, enqueue_missed_timer_irqs: bool) -> TestVm {
        let cpus = Arc::new(FakeCpus::default());
        let set = ApicSet::builder()
            .enqueue_missed_timer_irqs(enqueue_missed_timer_irqs)
            .build(Box::new(cpus.clone()));
        let mut mapper = FakeMemoryMap::default();
        let apics = (0..count).map(|vp| set.add_apic(vp, &mut mapper)).collect();
        TestVm {
            cpus,
            set,
            apics,
            regions: mapper.regions,
        }
    }

    fn read_reg(apic: &mut LocalApic, register: ApicRegister) -> u32 {
        let mut data = [0; 4];
        apic.reg_read(APIC_BASE_ADDRESS + register.offset(), &mut data)
            .unwrap();
        u32::from_ne_bytes(data)
    }

    fn write_reg(apic: &mut LocalApic, register: ApicRegister, value: u32) {
        apic.reg_write(APIC_BASE_ADDRESS + register.offset(), &value.to_ne_bytes())
            .unwrap();
    }

    fn send_icr(apic: &mut LocalApic, icr: Icr) {
        let raw = u64::from(icr);
        write_reg(apic, ApicRegister::ICR1, (raw >> 32) as u32);
        write_reg(apic, ApicRegister::ICR0, raw as u32);
    }

    fn irr_bit(apic: &mut LocalApic, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        read_reg(apic, ApicRegister(ApicRegister::IRR0.0 + bank as u8)) & mask != 0
    }

    fn isr_bit(apic: &mut LocalApic, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        read_reg(apic, ApicRegister(ApicRegister::ISR0.0 + bank as u8)) & mask != 0
    }

    #[test]
    fn self_ipi_fixed_round_trip() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        send_icr(
            apic,
            Icr::new()
                .with_vector(0x40)
                .with_delivery_mode(DeliveryMode::FIXED.0)
                .with_destination_shorthand(DestinationShorthand::SELF.0),
        );

        assert!(apic.interrupt_pending());
        assert!(irr_bit(apic, 0x40));
        assert_eq!(apic.interrupt_vector(), Some(0x40));
        // Delivery to self never kicks.
        assert!(vm.cpus.kicks.lock().is_empty());

        apic.begin_interrupt(0x40);
        assert!(!irr_bit(apic, 0x40));
        assert!(isr_bit(apic, 0x40));
        assert!(!apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), None);

        write_reg(apic, ApicRegister::EOI, 0);
        assert!(!irr_bit(apic, 0x40));
        assert!(!isr_bit(apic, 0x40));
        assert_eq!(apic.stats().eoi, 1);
    }

    #[test]
    fn logical_self_ipi_matches_physical() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        send_icr(
            apic,
            Icr::new()
                .with_vector(0x41)
                .with_delivery_mode(DeliveryMode::FIXED.0)
                .with_destination_mode_logical(true)
                .with_destination_shorthand(DestinationShorthand::SELF.0),
        );

        assert!(apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), Some(0x41));
        assert_eq!(apic.stats().self_ipi, 1);
    }

    #[test]
    fn broadcast_flat_logical() {
        let mut vm = new_vm(4);

        for (i, apic) in vm.apics.iter_mut().enumerate() {
            write_reg(apic, ApicRegister::LDR, 1 << (24 + i));
        }

        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_vector(0x80)
                .with_delivery_mode(DeliveryMode::FIXED.0)
                .with_destination_mode_logical(true)
                .with_destination(0xff),
        );

        for apic in &mut vm.apics {
            assert!(apic.interrupt_pending());
            assert!(irr_bit(apic, 0x80));
        }
        // The source observed its own vector without a kick.
        assert_eq!(*vm.cpus.kicks.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn lowest_priority_tie_takes_first() {
        let mut vm = new_vm(2);

        for apic in &mut vm.apics {
            write_reg(apic, ApicRegister::LDR, 0x01 << 24);
        }

        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_vector(0x55)
                .with_delivery_mode(DeliveryMode::LOWEST_PRIORITY.0)
                .with_destination_mode_logical(true)
                .with_destination(0x01),
        );

        assert!(vm.apics[0].interrupt_pending());
        assert!(irr_bit(&mut vm.apics[0], 0x55));
        assert!(!vm.apics[1].interrupt_pending());
        assert!(!irr_bit(&mut vm.apics[1], 0x55));
    }

    #[test]
    fn lowest_priority_prefers_lower_task_priority() {
        let mut vm = new_vm(2);

        for apic in &mut vm.apics {
            write_reg(apic, ApicRegister::LDR, 0x01 << 24);
        }
        write_reg(&mut vm.apics[0], ApicRegister::TPR, 0x20);

        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_vector(0x55)
                .with_delivery_mode(DeliveryMode::LOWEST_PRIORITY.0)
                .with_destination_mode_logical(true)
                .with_destination(0x01),
        );

        assert!(!vm.apics[0].interrupt_pending());
        assert!(vm.apics[1].interrupt_pending());
        assert!(irr_bit(&mut vm.apics[1], 0x55));
    }

    #[test]
    fn init_sipi_handshake() {
        let mut vm = new_vm(2);

        assert_eq!(vm.apics[1].ipi_state(), IpiState::Init);

        let init = Icr::new()
            .with_delivery_mode(DeliveryMode::INIT.0)
            .with_destination(1);
        send_icr(&mut vm.apics[0], init);
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Sipi);

        // The second INIT of an INIT-INIT-SIPI sequence is dropped.
        send_icr(&mut vm.apics[0], init);
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Sipi);

        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_vector(0x12)
                .with_delivery_mode(DeliveryMode::SIPI.0)
                .with_destination(1),
        );
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Started);
        assert_eq!(*vm.cpus.starts.lock(), vec![(1, 0x12)]);

        // Started processors reject the whole sequence.
        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_vector(0x12)
                .with_delivery_mode(DeliveryMode::SIPI.0)
                .with_destination(1),
        );
        send_icr(&mut vm.apics[0], init);
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Started);
        assert_eq!(vm.cpus.starts.lock().len(), 1);
    }

    #[test]
    fn physical_destination_lookup() {
        let mut vm = new_vm(2);

        // Identity 0 is reachable through the indexed fast path.
        vm.set
            .request_ipi(IpiRequest {
                vector: 0x44,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: false,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0,
            })
            .unwrap();
        assert!(vm.apics[0].interrupt_pending());
        assert!(irr_bit(&mut vm.apics[0], 0x44));
        assert!(!vm.apics[1].interrupt_pending());

        // A guest can renumber its APIC; the linear scan still finds it.
        write_reg(&mut vm.apics[1], ApicRegister::ID, 9);
        vm.set
            .request_ipi(IpiRequest {
                vector: 0x45,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: false,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 9,
            })
            .unwrap();
        assert!(vm.apics[1].interrupt_pending());

        let err = vm
            .set
            .request_ipi(IpiRequest {
                vector: 0x46,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: false,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 7,
            })
            .unwrap_err();
        assert!(matches!(err, ApicError::NoSuchDestination(7)));
    }

    #[test]
    fn synthetic_self_ipi_is_rejected() {
        let vm = new_vm(1);
        let err = vm
            .set
            .request_ipi(IpiRequest {
                vector: 0x40,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: false,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::SELF,
                destination: 0,
            })
            .unwrap_err();
        assert!(matches!(err, ApicError::MissingSource));
    }

    #[test]
    fn all_but_me_skips_source() {
        let mut vm = new_vm(3);

        send_icr(
            &mut vm.apics[1],
            Icr::new()
                .with_vector(0x70)
                .with_delivery_mode(DeliveryMode::FIXED.0)
                .with_destination_shorthand(DestinationShorthand::ALL_EXCLUDING_SELF.0),
        );

        assert!(vm.apics[0].interrupt_pending());
        assert!(!vm.apics[1].interrupt_pending());
        assert!(vm.apics[2].interrupt_pending());
        assert_eq!(*vm.cpus.kicks.lock(), vec![0, 2]);
        assert_eq!(vm.apics[1].stats().broadcast_ipi, 1);
    }

    #[test]
    fn cluster_logical_match() {
        let mut vm = new_vm(2);

        for apic in &mut vm.apics {
            write_reg(apic, ApicRegister::DFR, DfrModel::CLUSTER.0 as u32);
        }
        // Cluster 1 set 1, cluster 2 set 1.
        write_reg(&mut vm.apics[0], ApicRegister::LDR, 0x11 << 24);
        write_reg(&mut vm.apics[1], ApicRegister::LDR, 0x21 << 24);

        vm.set
            .request_ipi(IpiRequest {
                vector: 0x90,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: true,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0x11,
            })
            .unwrap();
        assert!(vm.apics[0].interrupt_pending());
        assert!(!vm.apics[1].interrupt_pending());

        // Broadcast matches regardless of cluster.
        vm.set
            .request_ipi(IpiRequest {
                vector: 0x91,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: true,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0xff,
            })
            .unwrap();
        assert!(irr_bit(&mut vm.apics[0], 0x91));
        assert!(irr_bit(&mut vm.apics[1], 0x91));
    }

    #[test]
    fn bad_destination_format_model() {
        let mut vm = new_vm(1);

        write_reg(&mut vm.apics[0], ApicRegister::DFR, 0x3 << 28);
        let err = vm
            .set
            .request_ipi(IpiRequest {
                vector: 0x40,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: true,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0x01,
            })
            .unwrap_err();
        assert!(matches!(err, ApicError::BadDestinationFormat(0x3)));
    }

    #[test]
    fn unsupported_delivery_modes() {
        let mut vm = new_vm(1);
        for mode in [DeliveryMode::SMI, DeliveryMode::NMI, DeliveryMode::RESERVED] {
            let err = vm
                .set
                .request_ipi(IpiRequest {
                    vector: 0x40,
                    delivery_mode: mode,
                    logical_destination_mode: false,
                    trigger_mode_level: false,
                    destination_shorthand: DestinationShorthand::NONE,
                    destination: 0,
                })
                .unwrap_err();
            assert!(matches!(err, ApicError::UnsupportedDeliveryMode(m) if m == mode));
        }

        // ExtInt is acknowledged and otherwise ignored.
        vm.set
            .request_ipi(IpiRequest {
                vector: 0x40,
                delivery_mode: DeliveryMode::EXTINT,
                logical_destination_mode: false,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0,
            })
            .unwrap();
        assert!(!vm.apics[0].interrupt_pending());
    }

    #[test]
    fn raise_vector_coalesces() {
        let mut vm = new_vm(1);

        vm.set.raise_vector(0, 0x33).unwrap();
        vm.set.raise_vector(0, 0x33).unwrap();
        assert_eq!(vm.cpus.kicks.lock().len(), 2);

        let apic = &mut vm.apics[0];
        assert!(apic.interrupt_pending());
        assert!(irr_bit(apic, 0x33));
        assert_eq!(apic.stats().coalesced, 1);

        apic.begin_interrupt(0x33);
        write_reg(apic, ApicRegister::EOI, 0);
        assert!(!irr_bit(apic, 0x33));
        assert!(!isr_bit(apic, 0x33));
    }

    #[test]
    fn reserved_vectors_rejected() {
        let vm = new_vm(1);
        for vector in [0, 5, 15] {
            let err = vm.set.raise_vector(0, vector).unwrap_err();
            assert!(matches!(err, ApicError::InvalidVector(v) if v == vector));
        }
        assert!(vm.cpus.kicks.lock().is_empty());
    }

    #[test]
    fn ier_masks_raises() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // Vector 0x33 lives in the second enable subword.
        let ier1 = ApicRegister(ApicRegister::IER0.0 + 1);
        write_reg(apic, ier1, !(1 << (0x33 % 32)));
        assert_eq!(read_reg(apic, ier1), !(1 << (0x33 % 32)));

        vm.set.raise_vector(0, 0x33).unwrap();
        let apic = &mut vm.apics[0];
        assert!(!apic.interrupt_pending());
        assert!(!irr_bit(apic, 0x33));
        assert_eq!(apic.stats().masked, 1);

        write_reg(apic, ier1, !0);
        vm.set.raise_vector(0, 0x33).unwrap();
        assert!(vm.apics[0].interrupt_pending());
    }

    #[test]
    fn pending_honors_in_service_priority() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        vm.set.raise_vector(0, 0x30).unwrap();
        assert!(apic.interrupt_pending());
        apic.begin_interrupt(0x30);

        // A lower vector does not preempt the one in service.
        vm.set.raise_vector(0, 0x20).unwrap();
        assert!(!apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), None);

        // A higher one does.
        vm.set.raise_vector(0, 0x40).unwrap();
        assert!(apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), Some(0x40));
    }

    #[test]
    fn spurious_eoi_and_unowned_begin() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        write_reg(apic, ApicRegister::EOI, 0);
        assert_eq!(apic.stats().spurious_eoi, 1);

        apic.begin_interrupt(0x50);
        assert!(!isr_bit(apic, 0x50));
        assert_eq!(apic.stats().interrupt, 0);
    }

    #[test]
    fn timer_periodic_accrues_missed_ticks() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // Divide by 1.
        write_reg(apic, ApicRegister::TIMER_DCR, 0xb);
        write_reg(
            apic,
            ApicRegister::LVT_TIMER,
            Lvt::new()
                .with_vector(0x60)
                .with_timer_periodic(true)
                .into(),
        );
        write_reg(apic, ApicRegister::TIMER_ICR, 1000);
        assert_eq!(read_reg(apic, ApicRegister::TIMER_CCR), 1000);

        apic.update_timer(3500, 1_000_000_000);

        assert_eq!(read_reg(apic, ApicRegister::TIMER_CCR), 500);
        assert_eq!(apic.missed_ints, 2);
        assert_eq!(apic.stats().timer, 1);
        assert!(apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), Some(0x60));
    }

    #[test]
    fn timer_masked_still_counts_down() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        write_reg(apic, ApicRegister::TIMER_DCR, 0xb);
        write_reg(
            apic,
            ApicRegister::LVT_TIMER,
            Lvt::new().with_vector(0x60).with_masked(true).into(),
        );
        write_reg(apic, ApicRegister::TIMER_ICR, 1);

        apic.update_timer(100, 1_000_000_000);

        assert!(!apic.interrupt_pending());
        assert_eq!(read_reg(apic, ApicRegister::TIMER_CCR), 0);

        // One-shot and expired; later cycles are ignored.
        apic.update_timer(100, 1_000_000_000);
        assert!(!apic.interrupt_pending());
    }

    #[test]
    fn timer_divider_scales_ticks() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // Encoding 0b010 divides by 8.
        write_reg(apic, ApicRegister::TIMER_DCR, 0x2);
        write_reg(
            apic,
            ApicRegister::LVT_TIMER,
            Lvt::new().with_vector(0x60).into(),
        );
        write_reg(apic, ApicRegister::TIMER_ICR, 100);

        apic.update_timer(400, 1_000_000_000);
        assert_eq!(read_reg(apic, ApicRegister::TIMER_CCR), 50);
        assert!(!apic.interrupt_pending());
    }

    #[test]
    fn timer_missed_tick_catch_up() {
        let mut vm = new_vm_with(1, true);
        let apic = &mut vm.apics[0];

        write_reg(apic, ApicRegister::TIMER_DCR, 0xb);
        write_reg(
            apic,
            ApicRegister::LVT_TIMER,
            Lvt::new()
                .with_vector(0x60)
                .with_timer_periodic(true)
                .into(),
        );
        write_reg(apic, ApicRegister::TIMER_ICR, 100);

        apic.update_timer(250, 1_000_000_000);
        assert_eq!(apic.missed_ints, 1);
        assert!(apic.interrupt_pending());
        apic.begin_interrupt(0x60);
        write_reg(apic, ApicRegister::EOI, 0);

        // The backlogged tick is delivered once nothing is pending.
        apic.update_timer(10, 1_000_000_000);
        assert_eq!(apic.missed_ints, 0);
        assert!(apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), Some(0x60));
    }

    #[test]
    fn masked_local_sources() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // All LVTs reset masked; no source raises anything.
        for source in [
            LocalInterrupt::Timer,
            LocalInterrupt::Thermal,
            LocalInterrupt::Performance,
            LocalInterrupt::Lint0,
            LocalInterrupt::Lint1,
            LocalInterrupt::Error,
        ] {
            apic.activate_local_interrupt(source).unwrap();
        }
        assert!(!apic.interrupt_pending());

        write_reg(
            apic,
            ApicRegister::LVT_LINT0,
            Lvt::new().with_vector(0x77).into(),
        );
        apic.activate_local_interrupt(LocalInterrupt::Lint0).unwrap();
        assert!(apic.interrupt_pending());
        assert_eq!(apic.interrupt_vector(), Some(0x77));
    }

    #[test]
    fn local_source_delivery_mode_must_be_fixed() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        write_reg(
            apic,
            ApicRegister::LVT_LINT1,
            Lvt::new()
                .with_vector(0x78)
                .with_delivery_mode(DeliveryMode::NMI.0)
                .into(),
        );
        let err = apic
            .activate_local_interrupt(LocalInterrupt::Lint1)
            .unwrap_err();
        assert!(matches!(
            err,
            ApicError::UnsupportedDeliveryMode(DeliveryMode::NMI)
        ));
    }

    #[test]
    fn msr_write_rehooks_region() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        assert_eq!(vm.regions.lock()[0].1, Some(APIC_BASE_ADDRESS));

        let value = ApicBase::new()
            .with_bsp(true)
            .with_enable(true)
            .with_base_page(0xabcd0)
            .into();
        apic.msr_write(APIC_BASE_MSR, value).unwrap();
        assert_eq!(apic.msr_read(APIC_BASE_MSR).unwrap(), value);
        assert_eq!(vm.regions.lock()[0].1, Some(0xabcd0000));

        // Register access follows the bank to the new address.
        let mut data = [0; 4];
        apic.reg_read(0xabcd0000 + ApicRegister::VERSION.offset(), &mut data)
            .unwrap();
        assert_eq!(u32::from_ne_bytes(data), APIC_VERSION);
    }

    #[test]
    fn disabled_apic_rejects_access() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        let value = ApicBase::new()
            .with_bsp(true)
            .with_base_page(APIC_BASE_ADDRESS >> 12)
            .into();
        apic.msr_write(APIC_BASE_MSR, value).unwrap();
        assert_eq!(vm.regions.lock()[0].1, None);

        let mut data = [0; 4];
        let err = apic
            .reg_read(APIC_BASE_ADDRESS + ApicRegister::ID.offset(), &mut data)
            .unwrap_err();
        assert!(matches!(err, ApicError::DisabledApic));
    }

    #[test]
    fn unknown_msr() {
        let mut vm = new_vm(1);
        assert!(matches!(
            vm.apics[0].msr_read(0x999),
            Err(MsrError::Unknown)
        ));
        assert!(matches!(
            vm.apics[0].msr_write(0x999, 0),
            Err(MsrError::Unknown)
        ));
    }

    #[test]
    fn read_only_and_unhandled_registers() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        for register in [
            ApicRegister::VERSION,
            ApicRegister::APR,
            ApicRegister::PPR,
            ApicRegister::RRD,
            ApicRegister::ISR0,
            ApicRegister::TMR0,
            ApicRegister::IRR0,
            ApicRegister::TIMER_CCR,
        ] {
            let err = apic
                .reg_write(APIC_BASE_ADDRESS + register.offset(), &0u32.to_ne_bytes())
                .unwrap_err();
            assert!(matches!(err, ApicError::ReadOnly(r) if r == register), "{register:?}");
        }

        let mut data = [0; 4];
        let err = apic
            .reg_read(APIC_BASE_ADDRESS + 0x440, &mut data)
            .unwrap_err();
        assert!(matches!(err, ApicError::Unhandled(0x440)));
        let err = apic
            .reg_write(APIC_BASE_ADDRESS + 0x440, &0u32.to_ne_bytes())
            .unwrap_err();
        assert!(matches!(err, ApicError::Unhandled(0x440)));
    }

    #[test]
    fn access_length_rules() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // Sub-dword reads work within a subword.
        let mut byte = [0; 1];
        apic.reg_read(APIC_BASE_ADDRESS + ApicRegister::VERSION.offset(), &mut byte)
            .unwrap();
        assert_eq!(byte[0], APIC_VERSION.to_ne_bytes()[0]);
        let mut byte = [0; 1];
        apic.reg_read(
            APIC_BASE_ADDRESS + ApicRegister::VERSION.offset() + 3,
            &mut byte,
        )
        .unwrap();
        assert_eq!(byte[0], APIC_VERSION.to_ne_bytes()[3]);

        // A word read may not cross the subword.
        let mut word = [0; 2];
        let err = apic
            .reg_read(
                APIC_BASE_ADDRESS + ApicRegister::VERSION.offset() + 3,
                &mut word,
            )
            .unwrap_err();
        assert!(matches!(err, ApicError::InvalidLength { len: 2, .. }));

        // Writes are dword only.
        for bad in [&[0u8; 1][..], &[0u8; 2][..], &[0u8; 8][..]] {
            let err = apic
                .reg_write(APIC_BASE_ADDRESS + ApicRegister::TPR.offset(), bad)
                .unwrap_err();
            assert!(matches!(err, ApicError::InvalidLength { .. }));
        }

        // The reserved tail of each 16-byte cell decodes to nothing.
        let mut data = [0; 4];
        let err = apic
            .reg_read(APIC_BASE_ADDRESS + ApicRegister::ID.offset() + 8, &mut data)
            .unwrap_err();
        assert!(matches!(err, ApicError::Unhandled(_)));
    }

    #[test]
    fn mmio_intercept_masks_errors() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        // Read-only writes are swallowed at the intercept layer.
        MmioIntercept::mmio_write(
            apic,
            APIC_BASE_ADDRESS + ApicRegister::VERSION.offset(),
            &0u32.to_ne_bytes(),
        )
        .unwrap();

        // Length errors are not.
        assert!(matches!(
            MmioIntercept::mmio_write(apic, APIC_BASE_ADDRESS, &[0u8; 2]),
            IoResult::Err(IoError::InvalidAccessSize)
        ));
    }

    #[test]
    fn externally_managed_region_still_decodes() {
        // When the host manages the intercept region itself, the bank decode
        // works purely from the page offset.
        let cpus = Arc::new(FakeCpus::default());
        let set = ApicSet::builder().build(Box::new(cpus));
        let mut apic = set.add_apic(
            0,
            &mut chipset_device::mmio::ExternallyManagedMmioIntercepts,
        );

        let mut data = [0; 4];
        apic.reg_read(APIC_BASE_ADDRESS + ApicRegister::VERSION.offset(), &mut data)
            .unwrap();
        assert_eq!(u32::from_ne_bytes(data), APIC_VERSION);
    }

    #[test]
    fn timer_initial_count_loads_current() {
        let mut vm = new_vm(1);
        let apic = &mut vm.apics[0];

        write_reg(apic, ApicRegister::TIMER_ICR, 0x1234);
        assert_eq!(read_reg(apic, ApicRegister::TIMER_ICR), 0x1234);
        assert_eq!(read_reg(apic, ApicRegister::TIMER_CCR), 0x1234);
    }

    #[test]
    fn save_restore_round_trip() {
        let mut vm = new_vm(2);

        write_reg(&mut vm.apics[1], ApicRegister::LDR, 0x04 << 24);
        write_reg(&mut vm.apics[1], ApicRegister::TPR, 0x30);
        write_reg(&mut vm.apics[1], ApicRegister::TIMER_ICR, 500);
        vm.set.raise_vector(1, 0xa0).unwrap();

        send_icr(
            &mut vm.apics[0],
            Icr::new()
                .with_delivery_mode(DeliveryMode::INIT.0)
                .with_destination(1),
        );

        // A snapshot folds queued vectors into the IRR.
        let state = vm.apics[1].save();
        let (bank, mask) = bank_mask(0xa0);
        assert_eq!(state.irr[bank] & mask, mask);
        assert_eq!(state.ipi_state, IpiState::Sipi);

        vm.apics[1].reset();
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Init);
        assert!(!irr_bit(&mut vm.apics[1], 0xa0));

        vm.apics[1].restore(&state);
        assert_eq!(vm.apics[1].ipi_state(), IpiState::Sipi);
        assert!(irr_bit(&mut vm.apics[1], 0xa0));
        assert_eq!(read_reg(&mut vm.apics[1], ApicRegister::LDR), 0x04 << 24);
        assert_eq!(read_reg(&mut vm.apics[1], ApicRegister::TPR), 0x30);

        // The restored logical destination is visible to the router again.
        vm.set
            .request_ipi(IpiRequest {
                vector: 0xa1,
                delivery_mode: DeliveryMode::FIXED,
                logical_destination_mode: true,
                trigger_mode_level: false,
                destination_shorthand: DestinationShorthand::NONE,
                destination: 0x04,
            })
            .unwrap();
        assert!(irr_bit(&mut vm.apics[1], 0xa1));
    }
}
