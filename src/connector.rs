//! Connector Registry & Handshake (specification §4.3).
//!
//! The teacher's `Device::connect` hardwires a single handshake (the Volca
//! Sample 2 discovery request/reply). This module generalises that same
//! open → drain → inquiry → "try handshakes in order" shape the
//! specification describes into an explicit descriptor table, so adding a
//! new device family (MIDI SDS, Volca Sample 1, MicroFreak, ...) means
//! registering one more [`ConnectorDescriptor`] rather than changing the
//! connect path.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::CoreError;
use crate::fs_ops::FsOps;

/// What a successful handshake installs on the backend.
pub struct Handshake {
    pub fs_ops: Arc<dyn FsOps>,
    pub name: String,
    pub version: String,
    pub description: String,
}

/// One entry in the connector registry.
pub struct ConnectorDescriptor {
    pub name: &'static str,
    /// Whether this connector requires the standard identity reply to have
    /// succeeded before its handshake is even attempted.
    pub standard: bool,
    /// Matched against the device's reported name to bias trial order.
    pub regex: Option<Regex>,
    pub handshake: Box<dyn Fn(&Backend) -> Result<Handshake, CoreError> + Send + Sync>,
}

impl std::fmt::Debug for ConnectorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorDescriptor")
            .field("name", &self.name)
            .field("standard", &self.standard)
            .finish()
    }
}

/// Ordered set of connectors to try against a newly opened device.
#[derive(Default)]
pub struct Registry {
    descriptors: Vec<ConnectorDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ConnectorDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Runs the matching algorithm (specification §4.3, steps 4-7) against
    /// an already-opened, already-inquired backend.
    pub fn attach(&self, backend: &Backend, device_name: &str) -> Result<Handshake, CoreError> {
        let ordered = self.ordered_candidates(device_name);

        for descriptor in ordered {
            if descriptor.standard && backend.identity.lock().expect("poisoned").company.is_empty() {
                continue;
            }
            debug!(connector = descriptor.name, "trying handshake");
            match (descriptor.handshake)(backend) {
                Ok(handshake) => {
                    info!(connector = descriptor.name, name = %handshake.name, "device adopted");
                    return Ok(handshake);
                }
                Err(CoreError::NotConnected) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(CoreError::NotConnected)
    }

    fn ordered_candidates(&self, device_name: &str) -> Vec<&ConnectorDescriptor> {
        let (mut matching, mut rest): (Vec<_>, Vec<_>) = self
            .descriptors
            .iter()
            .partition(|d| d.regex.as_ref().is_some_and(|re| re.is_match(device_name)));
        matching.append(&mut rest);
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::FsOptions;

    #[derive(Debug)]
    struct DummyFs;
    impl FsOps for DummyFs {
        fn id(&self) -> &str {
            "dummy"
        }
        fn options(&self) -> FsOptions {
            FsOptions::empty()
        }
        fn display_name(&self) -> &str {
            "Dummy"
        }
        fn extensions(&self) -> &[&str] {
            &["bin"]
        }
    }

    #[test]
    fn regex_matching_descriptor_is_tried_first() {
        let mut registry = Registry::new();
        registry.register(ConnectorDescriptor {
            name: "generic",
            standard: false,
            regex: None,
            handshake: Box::new(|_| Err(CoreError::NotConnected)),
        });
        registry.register(ConnectorDescriptor {
            name: "volca",
            standard: false,
            regex: Some(Regex::new("(?i)volca").unwrap()),
            handshake: Box::new(|_| {
                Ok(Handshake {
                    fs_ops: Arc::new(DummyFs),
                    name: "Volca Sample".to_string(),
                    version: "1.0".to_string(),
                    description: "".to_string(),
                })
            }),
        });

        let ordered = registry.ordered_candidates("volca sample");
        assert_eq!(ordered[0].name, "volca");
    }
}
