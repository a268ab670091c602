//! Error taxonomy and packet verdicts for the NAT data path.
//!
//! Nothing on the data path panics or bubbles an error upward: every failure
//! is folded into a [`Verdict`] at the engine boundary. The individual
//! [`NatError`] variants exist so internal code and logs can distinguish
//! failure classes (endpoint filter, table full, insert race, ...).

/// Final disposition of a packet after it went through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue down the stack (translated or not ours).
    Pass,
    /// Discard the packet.
    Drop,
}

/// Failure classes of the NAT data path and control plane.
#[derive(Debug, thiserror::Error)]
pub enum NatError {
    /// The transport protocol is not one the engine translates.
    #[error("protocol not handled by the NAT engine")]
    UnhandledProtocol,

    /// No WAN address is bound for the interface the packet arrived on.
    #[error("no WAN address bound for ifindex {ifindex}")]
    WanIpMissing { ifindex: u32 },

    /// The remote endpoint does not match the mapping trigger and port
    /// reuse is not allowed for this flow.
    #[error("endpoint filter rejected the remote peer")]
    EndpointFiltered,

    /// The configured NAT port range has no free slot left.
    #[error("no free NAT port in the configured range")]
    PortExhausted,

    /// A table reached its configured capacity.
    #[error("{table} table is full")]
    TableFull { table: &'static str },

    /// A concurrent writer claimed the slot first; the partial insert was
    /// rolled back and the next packet of the flow will retry.
    #[error("lost a concurrent insert race")]
    InsertRace,

    /// A concurrent packet changed the connection state underneath us.
    #[error("connection state changed concurrently")]
    StateRace,

    /// No mapping entry matches an inbound packet.
    #[error("no NAT mapping for packet")]
    MappingNotFound,

    /// An egress mapping exists but its paired ingress entry is gone.
    #[error("mapping pair is missing its reverse entry")]
    PairBroken,

    /// No conntrack entry exists and the packet may not create one.
    #[error("no conntrack entry for packet")]
    ConnNotFound,

    /// The flow timer could not be armed; the partial entry was removed.
    #[error("failed to arm the flow timer")]
    TimerSetup,

    /// The metric ring buffer is full; the caller retries next tick.
    #[error("metric ring is full")]
    RingFull,

    /// A packet edit would fall outside the buffer.
    #[error("packet edit out of bounds at offset {0}")]
    EditOutOfBounds(usize),

    /// An edit primitive was called with an unsupported field size.
    #[error("unsupported checksum field size {0}")]
    BadFieldSize(usize),
}

impl NatError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            NatError::UnhandledProtocol => "UnhandledProtocol",
            NatError::WanIpMissing { .. } => "WanIpMissing",
            NatError::EndpointFiltered => "EndpointFiltered",
            NatError::PortExhausted => "PortExhausted",
            NatError::TableFull { .. } => "TableFull",
            NatError::InsertRace => "InsertRace",
            NatError::StateRace => "StateRace",
            NatError::MappingNotFound => "MappingNotFound",
            NatError::PairBroken => "PairBroken",
            NatError::ConnNotFound => "ConnNotFound",
            NatError::TimerSetup => "TimerSetup",
            NatError::RingFull => "RingFull",
            NatError::EditOutOfBounds(_) => "EditOutOfBounds",
            NatError::BadFieldSize(_) => "BadFieldSize",
        }
    }

    /// Folds the error into the verdict returned to the packet path.
    ///
    /// Only an unhandled protocol passes through; every other failure drops
    /// the packet.
    pub fn verdict(&self) -> Verdict {
        match self {
            NatError::UnhandledProtocol => Verdict::Pass,
            _ => Verdict::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhandled_protocol_passes_through() {
        assert_eq!(NatError::UnhandledProtocol.verdict(), Verdict::Pass);
    }

    #[test]
    fn test_data_path_errors_drop() {
        let errors = vec![
            NatError::WanIpMissing { ifindex: 3 },
            NatError::EndpointFiltered,
            NatError::PortExhausted,
            NatError::TableFull { table: "nat4_mappings" },
            NatError::InsertRace,
            NatError::StateRace,
            NatError::MappingNotFound,
            NatError::PairBroken,
            NatError::ConnNotFound,
            NatError::TimerSetup,
            NatError::RingFull,
            NatError::EditOutOfBounds(14),
            NatError::BadFieldSize(3),
        ];
        for err in errors {
            assert_eq!(err.verdict(), Verdict::Drop, "{err:?} should drop");
        }
    }

    #[test]
    fn test_kind_matches_variant_name() {
        assert_eq!(NatError::EndpointFiltered.kind(), "EndpointFiltered");
        assert_eq!(
            NatError::TableFull { table: "nat4_mappings" }.kind(),
            "TableFull"
        );
        assert_eq!(NatError::WanIpMissing { ifindex: 1 }.kind(), "WanIpMissing");
    }

    #[test]
    fn test_display_includes_context() {
        let err = NatError::WanIpMissing { ifindex: 7 };
        assert!(err.to_string().contains("ifindex 7"));
        let err = NatError::EditOutOfBounds(42);
        assert!(err.to_string().contains("42"));
    }
}
