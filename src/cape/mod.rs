//! Slot/probe registry of the ACME cape.
//!
//! Discovery queries the slot-info service once per slot and binds each
//! populated slot, in slot order, to the next enumerated device. The
//! device layer does not report which slot a device sits in, so the
//! binding is positional: the Kth populated slot gets the Kth device.
//! Discovery fails if the number of devices and populated slots differ.

pub mod discovery;
pub mod reachability;

pub use discovery::{
    parse_slot_info, ProbeDescriptor, SlotInfoSource, SlotStatus, XmlRpcDiscovery,
};
pub use reachability::is_reachable;

use crate::device::{Device, DeviceContext};
use crate::error::{CaptureError, DiscoveryError};
use crate::probe::Probe;
use tracing::{debug, info, warn};

/// Probes of an ACME cape, one entry per slot.
#[derive(Debug)]
pub struct Cape {
    slots: Vec<Option<Probe>>,
}

impl Cape {
    /// Discover the probes of a cape with `slot_count` slots.
    pub async fn discover<S: SlotInfoSource>(
        source: &S,
        context: Box<dyn DeviceContext>,
        slot_count: usize,
    ) -> Result<Self, CaptureError> {
        info!("Discovering probes on {}", context.description());

        let mut statuses = Vec::with_capacity(slot_count);
        for slot in 1..=slot_count {
            statuses.push(query_slot(source, slot).await?);
        }

        // A populated slot whose description is malformed still owns a device.
        let populated = statuses.iter().filter(|s| s.is_populated()).count();
        let devices = context.into_devices();
        if devices.len() != populated {
            return Err(CaptureError::DeviceCountMismatch {
                populated,
                devices: devices.len(),
            });
        }

        let mut devices = devices.into_iter();
        let slots = statuses
            .into_iter()
            .enumerate()
            .map(|(index, status)| bind(index + 1, status, &mut devices))
            .collect();

        let cape = Self { slots };
        info!(
            "Found {} probe(s) in {} slots",
            cape.populated_count(),
            cape.slot_count()
        );
        Ok(cape)
    }

    /// Build a registry from already bound slots.
    #[allow(dead_code)] // Bypasses discovery; used to assemble test capes
    pub fn from_slots(slots: Vec<Option<Probe>>) -> Self {
        Self { slots }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn populated_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Slot numbers holding a probe, ascending.
    pub fn populated_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn is_populated(&self, slot: usize) -> bool {
        self.probe(slot).is_ok()
    }

    /// The probe in `slot` (1-based).
    pub fn probe(&self, slot: usize) -> Result<&Probe, CaptureError> {
        self.entry(slot)?
            .as_ref()
            .ok_or(CaptureError::NoProbeInSlot(slot))
    }

    pub fn probe_mut(&mut self, slot: usize) -> Result<&mut Probe, CaptureError> {
        let capacity = self.slots.len();
        self.slots
            .get_mut(slot.wrapping_sub(1))
            .ok_or(CaptureError::SlotOutOfRange { slot, capacity })?
            .as_mut()
            .ok_or(CaptureError::NoProbeInSlot(slot))
    }

    /// Remove the probe from `slot`, transferring its ownership.
    pub fn take_probe(&mut self, slot: usize) -> Result<Probe, CaptureError> {
        self.probe_mut(slot)?;
        self.slots[slot - 1]
            .take()
            .ok_or(CaptureError::NoProbeInSlot(slot))
    }

    /// Slot entries in slot order.
    pub fn slots(&self) -> &[Option<Probe>] {
        &self.slots
    }

    fn entry(&self, slot: usize) -> Result<&Option<Probe>, CaptureError> {
        self.slots
            .get(slot.wrapping_sub(1))
            .ok_or(CaptureError::SlotOutOfRange {
                slot,
                capacity: self.slots.len(),
            })
    }
}

/// Query every slot without binding devices.
///
/// Returns the descriptor of each slot holding a well-formed probe
/// description, `None` for the others.
#[cfg_attr(feature = "iio", allow(dead_code))] // Only used when no device backend is built in
pub async fn survey<S: SlotInfoSource>(
    source: &S,
    slot_count: usize,
) -> Result<Vec<Option<ProbeDescriptor>>, CaptureError> {
    let mut slots = Vec::with_capacity(slot_count);
    for slot in 1..=slot_count {
        let descriptor = match query_slot(source, slot).await? {
            QueriedSlot::Probe(descriptor) => Some(descriptor),
            _ => None,
        };
        slots.push(descriptor);
    }
    Ok(slots)
}

/// Outcome of querying one slot.
enum QueriedSlot {
    /// The service did not answer for this slot.
    Unknown,
    Empty,
    Malformed,
    Probe(ProbeDescriptor),
}

impl QueriedSlot {
    fn is_populated(&self) -> bool {
        matches!(self, QueriedSlot::Probe(_) | QueriedSlot::Malformed)
    }
}

async fn query_slot<S: SlotInfoSource>(source: &S, slot: usize) -> Result<QueriedSlot, CaptureError> {
    let info = match source.slot_info(slot).await {
        Ok(info) => info,
        Err(DiscoveryError::Unreachable(e)) => {
            return Err(CaptureError::DiscoveryUnreachable(DiscoveryError::Unreachable(e)));
        }
        Err(e) => {
            warn!("No slot information for slot {}: {}", slot, e);
            return Ok(QueriedSlot::Unknown);
        }
    };
    debug!("Slot {} info: {}", slot, info.trim_end());

    match parse_slot_info(&info) {
        Ok(SlotStatus::Empty) => {
            debug!("Slot {} is empty", slot);
            Ok(QueriedSlot::Empty)
        }
        Ok(SlotStatus::Populated(descriptor)) => {
            debug!(
                "Slot {} holds a {} probe (shunt {} uOhm, power switch: {})",
                slot, descriptor.kind, descriptor.shunt_uohm, descriptor.power_switch
            );
            Ok(QueriedSlot::Probe(descriptor))
        }
        Err(e) => {
            warn!("Slot {}: {}", slot, e);
            Ok(QueriedSlot::Malformed)
        }
    }
}

fn bind(
    slot: usize,
    status: QueriedSlot,
    devices: &mut impl Iterator<Item = Box<dyn Device>>,
) -> Option<Probe> {
    match status {
        QueriedSlot::Probe(descriptor) => devices
            .next()
            .map(|device| Probe::from_descriptor(slot, descriptor, device)),
        QueriedSlot::Malformed => {
            // Skip the device so later slots stay aligned.
            if let Some(device) = devices.next() {
                debug!("Slot {}: leaving {} unbound", slot, device.id());
            }
            None
        }
        QueriedSlot::Unknown | QueriedSlot::Empty => None,
    }
}
