//! Command Catalog
//!
//! The set of descriptors known at startup, keyed by name. With CAN
//! auto-formatting off the request bytes carry their own ISO-TP PCI, so
//! `02010C` is a two byte single frame asking mode 01 for PID 0C.

use crate::command::{CommandDescriptor, Decoder};
use crate::decoders;
use std::collections::BTreeMap;

/// Functional (broadcast) request header for 11-bit CAN
pub const FUNCTIONAL_HEADER: &[u8] = b"7DF";
/// Nissan Leaf Li-ion battery controller request header
pub const LBC_HEADER: &[u8] = b"79B";

/// Named command descriptors
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    commands: BTreeMap<String, CommandDescriptor>,
}

impl Catalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard mode 01 PIDs plus the Leaf battery controller
    pub fn standard() -> Self {
        let pid = |name: &str, desc: &str, cmd: &[u8], bytes: usize, decoder: Decoder| {
            CommandDescriptor::new(name, desc, FUNCTIONAL_HEADER, cmd, bytes, decoder, false)
        };

        let mut catalog = Self::new();
        catalog.insert(pid("engine_load", "Calculated engine load", b"020104", 3, decoders::percent));
        catalog.insert(pid("coolant_temp", "Engine coolant temperature", b"020105", 3, decoders::temperature));
        catalog.insert(pid("short_fuel_trim", "Short term fuel trim bank 1", b"020106", 3, decoders::fuel_trim));
        catalog.insert(pid("long_fuel_trim", "Long term fuel trim bank 1", b"020107", 3, decoders::fuel_trim));
        catalog.insert(pid("intake_pressure", "Intake manifold absolute pressure", b"02010B", 3, decoders::pressure));
        catalog.insert(pid("rpm", "Engine RPM", b"02010C", 4, decoders::rpm));
        catalog.insert(pid("speed", "Vehicle speed", b"02010D", 3, decoders::speed));
        catalog.insert(pid("maf", "Mass air flow rate", b"020110", 4, decoders::maf));
        catalog.insert(pid("throttle_pos", "Throttle position", b"020111", 3, decoders::percent));
        catalog.insert(CommandDescriptor::new(
            "lbc",
            "Li-ion battery controller",
            LBC_HEADER,
            b"022101",
            53,
            decoders::lbc,
            false,
        ));
        catalog
    }

    /// Add or replace a descriptor under its name
    pub fn insert(&mut self, command: CommandDescriptor) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// Descriptor registered under `name`
    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    /// Keep only the named commands; unknown names are ignored
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let commands = names
            .iter()
            .filter_map(|n| self.commands.get_key_value(n.as_ref()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { commands }
    }

    /// Descriptors in name order
    pub fn iter(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.values()
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no descriptor is registered
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog() {
        let catalog = Catalog::standard();
        assert_eq!(catalog.len(), 10);

        let rpm = catalog.get("rpm").unwrap();
        assert_eq!(rpm.command(), b"02010C");
        assert_eq!(rpm.header(), FUNCTIONAL_HEADER);

        let lbc = catalog.get("lbc").unwrap();
        assert_eq!(lbc.header(), LBC_HEADER);
        assert!(!lbc.fast());
    }

    #[test]
    fn test_select() {
        let catalog = Catalog::standard().select(&["rpm", "lbc", "missing"]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("speed").is_none());
    }
}
