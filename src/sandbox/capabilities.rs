// Capability table held by each boundary instance

use crate::protocol::Capabilities;

/// Which capabilities the host has granted for this boundary's lifetime
///
/// Grants merge freely until the first `run`, after which the table is sealed
/// and further `setup` messages are ignored.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    granted: Capabilities,
    sealed: bool,
}

impl CapabilityTable {
    pub fn new(initial: Capabilities) -> Self {
        Self {
            granted: initial,
            sealed: false,
        }
    }

    /// Merge a `setup` grant; returns false if the table is already sealed
    pub fn merge(&mut self, grant: Capabilities) -> bool {
        if self.sealed {
            return false;
        }
        self.granted.merge(grant);
        true
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Proxied fetch is injected only when requested by the run AND granted
    pub fn fetch_enabled(&self, requested: bool) -> bool {
        requested && self.granted.fetch_granted()
    }

    pub fn logger_enabled(&self) -> bool {
        self.granted.logger_granted()
    }

    pub fn granted(&self) -> Capabilities {
        self.granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_granted_by_default() {
        let table = CapabilityTable::default();
        assert!(!table.fetch_enabled(true));
        assert!(!table.logger_enabled());
    }

    #[test]
    fn fetch_requires_request_and_grant() {
        let table = CapabilityTable::new(Capabilities::standard());
        assert!(table.fetch_enabled(true));
        assert!(!table.fetch_enabled(false));
    }

    #[test]
    fn sealed_table_ignores_setup() {
        let mut table = CapabilityTable::default();
        assert!(table.merge(Capabilities {
            fetch: Some(true),
            logger: None,
        }));
        table.seal();
        assert!(!table.merge(Capabilities::standard()));
        assert!(table.fetch_enabled(true));
        assert!(!table.logger_enabled());
    }
}
