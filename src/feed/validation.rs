//! Write validation
//!
//! The on-chain price is sticky: moves inside the contract band are not worth
//! a transaction, and moves outside it must be corroborated by the reference
//! oracle band.

use crate::types::Bounds;

/// Outcome of validating one candidate price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Candidate should be written
    Accept,
    /// Candidate is within the contract band of the current on-chain price
    Suppressed { contract: Bounds },
    /// Candidate is outside the reference band
    Rejected { reference: Bounds },
}

impl Decision {
    pub fn should_write(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

/// Decide whether `new_price` should be written.
///
/// `contract_price` is the scaled on-chain price, 0 when nothing was written yet.
pub fn decide(
    new_price: i64,
    contract_price: i64,
    reference: Bounds,
    contract_tolerance_bps: u32,
) -> Decision {
    let within_reference = reference.contains(new_price);

    if contract_price == 0 {
        return if within_reference {
            Decision::Accept
        } else {
            Decision::Rejected { reference }
        };
    }

    let contract = Bounds::around(contract_price, contract_tolerance_bps);
    if contract.contains(new_price) {
        return Decision::Suppressed { contract };
    }

    if within_reference {
        Decision::Accept
    } else {
        Decision::Rejected { reference }
    }
}
