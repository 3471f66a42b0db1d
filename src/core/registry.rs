use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    core::device::Device,
    protocol::address::{DeviceAddress, MAX_DEV_NUMBER},
};

/// Known devices keyed by global id, plus the UID -> address memory used to
/// hand a returning device its old address.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, Device>,
    known_uids: HashMap<u32, DeviceAddress>,
    reserved: BTreeSet<DeviceAddress>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `address` out of automatic assignment (static devices).
    pub fn reserve(&mut self, address: DeviceAddress) {
        self.reserved.insert(address);
    }

    pub fn is_reserved(&self, address: DeviceAddress) -> bool {
        self.reserved.contains(&address)
    }

    /// Insert or replace the device at its address.
    pub fn register(&mut self, device: Device) -> Option<Device> {
        if device.uid != 0 && !device.is_virtual {
            self.known_uids.insert(device.uid, device.address);
        }
        self.devices.insert(device.address.global_id(), device)
    }

    pub fn remove(&mut self, address: DeviceAddress) -> Option<Device> {
        self.devices.remove(&address.global_id())
    }

    pub fn get(&self, address: DeviceAddress) -> Option<&Device> {
        self.devices.get(&address.global_id())
    }

    pub fn get_mut(&mut self, address: DeviceAddress) -> Option<&mut Device> {
        self.devices.get_mut(&address.global_id())
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.devices.contains_key(&address.global_id())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.devices.values().map(|d| d.address).collect()
    }

    /// Pick an address on `bus` for the device with `uid`: its previous one
    /// when still free, otherwise the lowest unused number.
    pub fn next_address(&self, bus: u8, uid: u32) -> Option<DeviceAddress> {
        if let Some(&previous) = self.known_uids.get(&uid) {
            let holder = self.get(previous);
            if previous.bus == bus && holder.map_or(true, |d| d.uid == uid) {
                return Some(previous);
            }
        }

        let remembered: BTreeSet<DeviceAddress> = self
            .known_uids
            .iter()
            .filter(|(&other, _)| other != uid)
            .map(|(_, &address)| address)
            .collect();
        let free = |address: &DeviceAddress| !self.contains(*address) && !self.is_reserved(*address);
        let candidates = || (1..=MAX_DEV_NUMBER).map(|dev| DeviceAddress { bus, dev });

        candidates()
            .find(|a| free(a) && !remembered.contains(a))
            .or_else(|| candidates().find(free))
    }
}
