//! `DeviceRegistry`: opens, configures, and owns hardware handles behind
//! a keyed plugin catalogue.

use std::collections::HashMap;

use super::{AnalogInput, AnalogOutput, Attenuator, DeviceGroup, DeviceSettings, DigitalIo};
use crate::error::DeviceError;

/// Opaque, move-only creation token returned by `open`. Dropping it does
/// nothing on its own — the registry owns the device's lifetime — but it
/// lets callers thread an identity through without re-doing a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The raw numeric id, exposed for logging/diagnostics and for
    /// `TraceIdentity::device_id`; not otherwise meaningful outside the
    /// registry.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The concrete capability a catalogued device implements. A plugin
/// implements exactly the slice(s) it supports; there is no requirement
/// that a device implement more than one variant.
pub enum DeviceHandle {
    AnalogInput(Box<dyn AnalogInput>),
    AnalogOutput(Box<dyn AnalogOutput>),
    DigitalIo(Box<dyn DigitalIo>),
    Attenuator(Box<dyn Attenuator>),
    Miscellaneous(Box<dyn super::Device>),
}

impl DeviceHandle {
    fn ident(&self) -> &str {
        match self {
            DeviceHandle::AnalogInput(d) => d.ident(),
            DeviceHandle::AnalogOutput(d) => d.ident(),
            DeviceHandle::DigitalIo(d) => d.ident(),
            DeviceHandle::Attenuator(d) => d.ident(),
            DeviceHandle::Miscellaneous(d) => d.ident(),
        }
    }

    fn group(&self) -> DeviceGroup {
        match self {
            DeviceHandle::AnalogInput(_) => DeviceGroup::AnalogInput,
            DeviceHandle::AnalogOutput(_) => DeviceGroup::AnalogOutput,
            DeviceHandle::DigitalIo(_) => DeviceGroup::DigitalIo,
            DeviceHandle::Attenuator(_) => DeviceGroup::Attenuator,
            DeviceHandle::Miscellaneous(_) => DeviceGroup::Miscellaneous,
        }
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        match self {
            DeviceHandle::AnalogInput(d) => d.reset(),
            DeviceHandle::AnalogOutput(d) => d.reset(),
            DeviceHandle::DigitalIo(d) => d.reset(),
            DeviceHandle::Attenuator(d) => d.reset(),
            DeviceHandle::Miscellaneous(d) => d.reset(),
        }
    }

    fn settings(&self) -> DeviceSettings {
        match self {
            DeviceHandle::AnalogInput(d) => d.settings(),
            DeviceHandle::AnalogOutput(d) => d.settings(),
            DeviceHandle::DigitalIo(d) => d.settings(),
            DeviceHandle::Attenuator(d) => d.settings(),
            DeviceHandle::Miscellaneous(d) => d.settings(),
        }
    }
}

struct Entry {
    id: DeviceId,
    path: String,
    handle: DeviceHandle,
}

/// Catalogues plugin classes by capability group and owns every
/// instantiated device. Mutated only when no RePro is running and no
/// session is active; reads are lock-free after initialisation because
/// the registry is only ever touched from the thread that owns it
/// (typically the RePro supervisor / main thread).
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<Entry>,
    next_id: u32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first device in `group` whose ident matches `ident`,
    /// falling back to positional (zero-based) indexing if `ident` parses
    /// as an integer.
    pub fn lookup(&self, group: DeviceGroup, ident: &str) -> Option<DeviceId> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.handle.group() == group && e.handle.ident() == ident)
        {
            return Some(entry.id);
        }
        if let Ok(index) = ident.parse::<usize>() {
            return self
                .entries
                .iter()
                .filter(|e| e.handle.group() == group)
                .nth(index)
                .map(|e| e.id);
        }
        None
    }

    /// Opens (instantiates) a device under `group`. Reopening an ident that
    /// is already open is a no-op that returns the existing id.
    pub fn open(&mut self, group: DeviceGroup, path: &str, handle: DeviceHandle) -> DeviceId {
        let ident = handle.ident().to_string();
        if let Some(existing) = self.lookup(group, &ident) {
            return existing;
        }
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            path: path.to_string(),
            handle,
        });
        id
    }

    pub fn handle(&self, id: DeviceId) -> Option<&DeviceHandle> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.handle)
    }

    pub fn handle_mut(&mut self, id: DeviceId) -> Option<&mut DeviceHandle> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .map(|e| &mut e.handle)
    }

    pub fn analog_input_mut(&mut self, id: DeviceId) -> Option<&mut dyn AnalogInput> {
        match self.handle_mut(id)? {
            DeviceHandle::AnalogInput(d) => Some(d.as_mut()),
            _ => None,
        }
    }

    pub fn analog_output_mut(&mut self, id: DeviceId) -> Option<&mut dyn AnalogOutput> {
        match self.handle_mut(id)? {
            DeviceHandle::AnalogOutput(d) => Some(d.as_mut()),
            _ => None,
        }
    }

    pub fn attenuator_mut(&mut self, id: DeviceId) -> Option<&mut dyn Attenuator> {
        match self.handle_mut(id)? {
            DeviceHandle::Attenuator(d) => Some(d.as_mut()),
            _ => None,
        }
    }

    /// Closes a single device. Best-effort: errors are returned but do not
    /// prevent the entry from being dropped.
    pub fn close(&mut self, id: DeviceId) -> Result<(), DeviceError> {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let mut entry = self.entries.remove(pos);
            let ident = entry.handle.ident().to_string();
            entry.handle.reset().inspect_err(|e| {
                log::warn!("closing device {ident:?} reported {e}, dropping it anyway");
            })
        } else {
            Err(DeviceError::InvalidDevice {
                group: "unknown",
                ident: format!("id {}", id.0),
            })
        }
    }

    /// Closes every open device. Collects errors but attempts every close
    /// before returning; one failed close never aborts the sweep.
    pub fn close_all(&mut self) -> Vec<(DeviceId, DeviceError)> {
        let ids: Vec<DeviceId> = self.entries.iter().map(|e| e.id).collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.close(id) {
                errors.push((id, e));
            }
        }
        errors
    }

    pub fn settings_snapshot(&self) -> HashMap<DeviceId, DeviceSettings> {
        self.entries
            .iter()
            .map(|e| (e.id, e.handle.settings()))
            .collect()
    }

    pub fn path_of(&self, id: DeviceId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.path.as_str())
    }

    pub fn iter_group(&self, group: DeviceGroup) -> impl Iterator<Item = DeviceId> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.handle.group() == group)
            .map(|e| e.id)
    }

    /// Transfers exclusive ownership of a device out of the registry, e.g.
    /// to hand it to the [`crate::acquisition::AcquisitionEngine`] worker
    /// thread that will be its sole caller for the duration of acquisition.
    pub fn take_handle(&mut self, id: DeviceId) -> Option<(String, DeviceHandle)> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(pos);
        Some((entry.path, entry.handle))
    }

    /// Returns a previously [`DeviceRegistry::take_handle`]-n device.
    pub fn return_handle(&mut self, id: DeviceId, path: String, handle: DeviceHandle) {
        self.entries.push(Entry { id, path, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimAnalogInput;

    #[test]
    fn reopening_same_ident_is_noop() {
        let mut reg = DeviceRegistry::new();
        let a = reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim0",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-0", 8, 1_000_000.0))),
        );
        let b = reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim0",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-0", 8, 1_000_000.0))),
        );
        assert_eq!(a, b);
        assert_eq!(reg.iter_group(DeviceGroup::AnalogInput).count(), 1);
    }

    #[test]
    fn close_all_collects_but_continues() {
        let mut reg = DeviceRegistry::new();
        reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim0",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-0", 8, 1_000_000.0))),
        );
        reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim1",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-1", 8, 1_000_000.0))),
        );
        let errors = reg.close_all();
        assert!(errors.is_empty());
        assert_eq!(reg.iter_group(DeviceGroup::AnalogInput).count(), 0);
    }

    #[test]
    fn lookup_falls_back_to_positional_index() {
        let mut reg = DeviceRegistry::new();
        reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim0",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-0", 8, 1_000_000.0))),
        );
        reg.open(
            DeviceGroup::AnalogInput,
            "/dev/sim1",
            DeviceHandle::AnalogInput(Box::new(SimAnalogInput::new("ai-1", 8, 1_000_000.0))),
        );
        let id = reg.lookup(DeviceGroup::AnalogInput, "1").unwrap();
        assert_eq!(reg.handle(id).unwrap().ident(), "ai-1");
    }
}
