//! Hardware capability contracts and the process-wide claim registry.
//!
//! The control core never talks to vendor drivers directly: jobs hold trait
//! objects (`Adc`, `Dac`, `GpioOutput`, `EdgeSource`, …) with one Linux
//! implementation and one deterministic simulator each. Every physical
//! resource must be claimed in the registry before use; a claim is released
//! when its guard drops, on every exit path.

pub mod adc;
pub mod dac;
pub mod gpio;
pub mod pwm;

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

pub use adc::{Adc, Gain, SimAdc};
pub use dac::{Dac, LedChannel, SimDac};
pub use gpio::{EdgeSource, GpioInput, GpioOutput, Pull, SimEdgeSource, SimInput, SimOutput};
pub use pwm::Pwm;

/// A physical resource that admits exactly one owner at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    GpioPin(u32),
    AdcChannel(u8),
    DacChannel(u8),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GpioPin(pin) => write!(f, "gpio pin {pin}"),
            Self::AdcChannel(ch) => write!(f, "adc channel {ch}"),
            Self::DacChannel(ch) => write!(f, "dac channel {ch}"),
        }
    }
}

fn registry() -> &'static Mutex<HashSet<Resource>> {
    static CLAIMED: OnceLock<Mutex<HashSet<Resource>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Mark `resource` unavailable to the rest of the process.
///
/// Fails when something else already holds it. The returned guard releases
/// the resource when dropped.
pub fn claim(resource: Resource) -> Result<Claim> {
    let mut claimed = registry().lock().unwrap();
    if !claimed.insert(resource.clone()) {
        return Err(Error::HardwareUnavailable(resource.to_string()));
    }
    Ok(Claim { resource })
}

/// Whether `resource` is currently claimed by anyone.
pub fn is_claimed(resource: &Resource) -> bool {
    registry().lock().unwrap().contains(resource)
}

/// Scoped ownership of one [`Resource`].
#[derive(Debug)]
pub struct Claim {
    resource: Resource,
}

impl Claim {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        registry().lock().unwrap().remove(&self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_then_release_on_drop() {
        let resource = Resource::GpioPin(901);
        {
            let _claim = claim(resource.clone()).unwrap();
            assert!(is_claimed(&resource));
        }
        assert!(!is_claimed(&resource));
    }

    #[test]
    fn second_claim_on_same_resource_fails() {
        let resource = Resource::GpioPin(902);
        let _held = claim(resource.clone()).unwrap();
        let second = claim(resource.clone());
        assert!(matches!(second, Err(Error::HardwareUnavailable(_))));
    }

    #[test]
    fn distinct_resources_do_not_collide() {
        let _a = claim(Resource::AdcChannel(200)).unwrap();
        let _b = claim(Resource::AdcChannel(201)).unwrap();
        let _c = claim(Resource::DacChannel(200)).unwrap();
    }

    #[test]
    fn released_resource_can_be_reclaimed() {
        let resource = Resource::GpioPin(903);
        drop(claim(resource.clone()).unwrap());
        let again = claim(resource);
        assert!(again.is_ok());
    }
}
