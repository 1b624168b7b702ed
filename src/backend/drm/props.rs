//! Name-to-handle property tables for DRM objects.
//!
//! Every configurable attribute of a plane, CRTC or connector is exposed by
//! the kernel as a named property. The table for each object is fetched once
//! right after discovery and never changes afterwards; a lookup miss means
//! the property is not supported on this hardware, which callers must treat
//! as a capability gap rather than an error.

use std::io;

use drm::control::{property, Device as ControlDevice, ResourceHandle};
use tracing::trace;

#[derive(Debug, Default)]
pub struct PropertyTable {
    props: Vec<(String, property::Handle)>,
}

impl PropertyTable {
    /// Fetches the full property list of one DRM object.
    pub fn fetch(
        device: &impl ControlDevice,
        object: impl ResourceHandle + Copy,
    ) -> io::Result<Self> {
        let prop_vals = device.get_properties(object)?;

        let mut props = Vec::new();
        for (handle, _value) in prop_vals {
            let info = device.get_property(handle)?;
            let Ok(name) = info.name().to_str() else {
                continue;
            };

            trace!("property {}: {name}", u32::from(handle));
            props.push((name.to_owned(), handle));
        }

        Ok(Self { props })
    }

    /// Looks up a property by name. `None` means the hardware does not
    /// expose it, not that something went wrong.
    pub fn resolve(&self, name: &str) -> Option<property::Handle> {
        self.props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| *handle)
    }

    #[cfg(test)]
    fn from_pairs(pairs: Vec<(String, property::Handle)>) -> Self {
        Self { props: pairs }
    }
}
