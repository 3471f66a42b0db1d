//! Per-device metadata retrieval as a resumable state machine.
//!
//! A device walks `Description -> Capabilities -> Objects(1..) ->
//! Endpoints(0..) -> Interrupts(0..) -> HiddenObjects(..) -> Done`. The phase
//! is stored on the device, so an interrupted scan picks up where it stopped
//! in the next round.
use crate::{
    core::device::{Device, DeviceObject, DeviceSummary, Endpoint, Interrupt},
    protocol::{command::Command, error::HbusError, operation::Instruction},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnumerationPhase {
    /// QUERY object 0.
    #[default]
    Description,
    /// GETCH object 0.
    Capabilities,
    /// QUERY object n.
    Objects(u8),
    /// QUERY_EP endpoint n.
    Endpoints(u8),
    /// QUERY_INT interrupt n.
    Interrupts(u8),
    /// GETCH hidden object n.
    HiddenObjects(u8),
    Done,
}

impl EnumerationPhase {
    /// The request this phase sends, or `None` once done.
    pub fn request(self) -> Option<Instruction> {
        let (command, number) = match self {
            EnumerationPhase::Description => (Command::Query, 0),
            EnumerationPhase::Capabilities => (Command::GetCh, 0),
            EnumerationPhase::Objects(n) => (Command::Query, n),
            EnumerationPhase::Endpoints(n) => (Command::QueryEp, n),
            EnumerationPhase::Interrupts(n) => (Command::QueryInt, n),
            EnumerationPhase::HiddenObjects(n) => (Command::GetCh, n),
            EnumerationPhase::Done => return None,
        };
        Instruction::new(command, vec![number]).ok()
    }

    pub fn is_done(self) -> bool {
        self == EnumerationPhase::Done
    }
}

/// Apply the reply parameters (object address first) of the current phase and
/// return the next phase.
pub fn advance(
    device: &mut Device,
    phase: EnumerationPhase,
    params: &[u8],
) -> Result<EnumerationPhase, HbusError> {
    let expected = match phase.request() {
        Some(instruction) => instruction.object().unwrap_or(0),
        None => return Ok(EnumerationPhase::Done),
    };
    let (number, payload) = match params.split_first() {
        Some((&number, payload)) => (number, payload),
        None => {
            return Err(HbusError::MalformedFrame {
                reason: format!("{phase:?} reply has no parameters"),
            })
        }
    };
    if number != expected {
        return Err(HbusError::MalformedFrame {
            reason: format!("{phase:?} reply is for number {number}"),
        });
    }

    let next = match phase {
        EnumerationPhase::Description => {
            // QUERY_RESP for object 0: flags, size and subtype are unused
            device.description = String::from_utf8_lossy(payload.get(3..).unwrap_or(&[]))
                .trim_end_matches('\0')
                .to_string();
            EnumerationPhase::Capabilities
        }
        EnumerationPhase::Capabilities => {
            let summary = DeviceSummary::parse(payload)?;
            device.apply_summary(&summary);
            objects_from(device, 1)
        }
        EnumerationPhase::Objects(n) => {
            let object = DeviceObject::from_query(n, payload)?;
            device.objects.insert(n, object);
            match n.checked_add(1) {
                Some(next) => objects_from(device, next),
                None => endpoints_from(device, 0),
            }
        }
        EnumerationPhase::Endpoints(n) => {
            device.endpoints.insert(n, Endpoint::from_query(n, payload)?);
            match n.checked_add(1) {
                Some(next) => endpoints_from(device, next),
                None => interrupts_from(device, 0),
            }
        }
        EnumerationPhase::Interrupts(n) => {
            device
                .interrupts
                .insert(n, Interrupt::from_query(n, payload)?);
            match n.checked_add(1) {
                Some(next) => interrupts_from(device, next),
                None => {
                    device.partition_hidden();
                    next_hidden(device, None)
                }
            }
        }
        EnumerationPhase::HiddenObjects(n) => {
            if let Some(object) = device.hidden_objects.get_mut(&n) {
                object.last_value = Some(payload.to_vec());
            }
            device.inject_extended(n);
            next_hidden(device, Some(n))
        }
        EnumerationPhase::Done => EnumerationPhase::Done,
    };

    if next.is_done() {
        device.extended_retrieved = true;
    }
    Ok(next)
}

fn objects_from(device: &mut Device, n: u8) -> EnumerationPhase {
    if n >= 1 && n <= device.object_count {
        EnumerationPhase::Objects(n)
    } else {
        endpoints_from(device, 0)
    }
}

fn endpoints_from(device: &mut Device, n: u8) -> EnumerationPhase {
    if n < device.endpoint_count {
        EnumerationPhase::Endpoints(n)
    } else {
        interrupts_from(device, 0)
    }
}

fn interrupts_from(device: &mut Device, n: u8) -> EnumerationPhase {
    if n < device.interrupt_count {
        EnumerationPhase::Interrupts(n)
    } else {
        device.partition_hidden();
        next_hidden(device, None)
    }
}

fn next_hidden(device: &Device, after: Option<u8>) -> EnumerationPhase {
    let next = match after {
        Some(n) => n
            .checked_add(1)
            .and_then(|from| device.hidden_objects.range(from..).next()),
        None => device.hidden_objects.iter().next(),
    };
    match next {
        Some((&number, _)) => EnumerationPhase::HiddenObjects(number),
        None => EnumerationPhase::Done,
    }
}
