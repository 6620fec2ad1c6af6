//! Per-slot FMI evaluation lifecycle.
//!
//! The wire protocol expects one canonical priming sequence per change of
//! inputs: setup experiment, push the inputs, then enter and immediately
//! exit initialization mode so the unit consumes them as initial values.
//! On every call after the first, a reset precedes the sequence to return
//! the unit to its default state; the reset invalidates previously pushed
//! inputs, so everything the caller ever set is re-marked changed first.

use crate::config::DerivativeSettings;
use crate::error::FmuError;
use crate::model::Model;
use crate::pool::{Slot, SlotPhase};

/// Runs one logical evaluation against a leased slot: prime, push changed
/// inputs, then fetch the requested outputs into the value buffer.
///
/// Setup/reset/init failures are fatal for the slot's current call and force
/// the slot back to `Uninitialized`, so its next lease primes from scratch.
/// Set/get failures are recoverable.
pub(crate) fn evaluate(
    slot: &mut Slot,
    model: &Model,
    settings: &DerivativeSettings,
) -> Result<(), FmuError> {
    let first_use = slot.phase == SlotPhase::Uninitialized;
    if !first_use {
        reset(slot)?;
        slot.mark_applied();
    }
    slot.gather_io(model);
    prime(slot, settings)?;
    fetch(slot)?;
    // The machine returns to Initialized once the call completes.
    slot.phase = SlotPhase::Initialized;
    Ok(())
}

fn reset(slot: &mut Slot) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let ok = slot.instance_mut()?.reset().is_ok();
    if !ok {
        log::warn!("fmi2Reset failed on slot {slot_id}");
        slot.phase = SlotPhase::Uninitialized;
        return Err(FmuError::Protocol {
            call: "fmi2Reset",
            slot: slot_id,
        });
    }
    Ok(())
}

fn prime(slot: &mut Slot, settings: &DerivativeSettings) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let tolerance = (settings.fmu_tolerance > 0.0).then_some(settings.fmu_tolerance);

    let ok = slot
        .instance_mut()?
        .setup_experiment(tolerance, 0.0, Some(1.0))
        .is_ok();
    if !ok {
        log::warn!("fmi2SetupExperiment failed on slot {slot_id}");
        slot.phase = SlotPhase::Uninitialized;
        return Err(FmuError::Protocol {
            call: "fmi2SetupExperiment",
            slot: slot_id,
        });
    }

    push_inputs(slot)?;

    slot.phase = SlotPhase::Initializing;
    let ok = slot.instance_mut()?.enter_initialization_mode().is_ok();
    if !ok {
        log::warn!("fmi2EnterInitializationMode failed on slot {slot_id}");
        slot.phase = SlotPhase::Uninitialized;
        return Err(FmuError::Protocol {
            call: "fmi2EnterInitializationMode",
            slot: slot_id,
        });
    }
    let ok = slot.instance_mut()?.exit_initialization_mode().is_ok();
    if !ok {
        log::warn!("fmi2ExitInitializationMode failed on slot {slot_id}");
        slot.phase = SlotPhase::Uninitialized;
        return Err(FmuError::Protocol {
            call: "fmi2ExitInitializationMode",
            slot: slot_id,
        });
    }
    slot.phase = SlotPhase::Initialized;
    Ok(())
}

/// Pushes the gathered input batch over the wire.
pub(crate) fn push_inputs(slot: &mut Slot) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let Slot {
        handle,
        vr_in,
        v_in,
        ..
    } = slot;
    let instance = handle.as_deref_mut().ok_or(FmuError::Protocol {
        call: "missing instance handle",
        slot: slot_id,
    })?;
    if !instance.set_real(vr_in, v_in).is_ok() {
        log::warn!("fmi2SetReal failed on slot {slot_id}");
        return Err(FmuError::Io {
            call: "fmi2SetReal",
            slot: slot_id,
        });
    }
    Ok(())
}

fn fetch(slot: &mut Slot) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let n_out = slot.id_out.len();
    if n_out == 0 {
        return Ok(());
    }
    slot.v_out.clear();
    slot.v_out.resize(n_out, 0.0);
    {
        let Slot {
            handle,
            vr_out,
            v_out,
            ..
        } = slot;
        let instance = handle.as_deref_mut().ok_or(FmuError::Protocol {
            call: "missing instance handle",
            slot: slot_id,
        })?;
        if !instance.get_real(vr_out, v_out).is_ok() {
            log::warn!("fmi2GetReal failed on slot {slot_id}");
            return Err(FmuError::Io {
                call: "fmi2GetReal",
                slot: slot_id,
            });
        }
    }
    for k in 0..n_out {
        let id = slot.id_out[k];
        slot.values[id] = slot.v_out[k];
    }
    slot.phase = SlotPhase::Evaluated;
    Ok(())
}
