use crate::types::*;

/// One direction of a flow-control ledger: the number of payload octets the
/// governed sender may still transmit.
///
/// The count is signed because SETTINGS_INITIAL_WINDOW_SIZE changes may push
/// an already-consumed window below zero; frame-driven accounting itself
/// never crosses zero.
///
/// https://httpwg.org/specs/rfc7540.html#FlowControl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    credits: i64,
}

impl FlowWindow {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            credits: i64::from(initial),
        }
    }

    #[must_use]
    pub fn available(&self) -> i64 {
        self.credits
    }

    /// Spends `octets` of credit for an outgoing or incoming DATA frame,
    /// counted at full on-wire payload size. Driving the window negative is
    /// a FLOW_CONTROL_ERROR at the owner's `level`.
    pub fn consume(&mut self, octets: usize, level: Level) -> Result<(), ProtocolError> {
        let next = self.credits - octets as i64;
        if next < 0 {
            return Err(ProtocolError {
                code: ErrorType::FlowControlError,
                level,
                message: "flow-control window exhausted".into(),
            });
        }
        self.credits = next;
        Ok(())
    }

    /// Adds a WINDOW_UPDATE increment. Saturating past 2^31-1 is a
    /// FLOW_CONTROL_ERROR at the owner's `level`.
    pub fn replenish(&mut self, increment: u32, level: Level) -> Result<(), ProtocolError> {
        let next = self.credits + i64::from(increment);
        if next > i64::from(U31_MAX) {
            return Err(ProtocolError {
                code: ErrorType::FlowControlError,
                level,
                message: "flow-control window exceeds 2^31-1".into(),
            });
        }
        self.credits = next;
        Ok(())
    }
}
