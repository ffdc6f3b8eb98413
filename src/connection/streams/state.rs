//! Per-direction stream state machines, named and shaped after the
//! teacher's `stream::{SendState, RecvState}` (visible through their use
//! sites in `connection.rs`: `Ready`, `DataSent`, `DataRecvd`,
//! `ResetSent{stop_reason}`, `ResetRecvd{stop_reason}` for the send half;
//! `Recv{size}`, `DataRecvd{size}`, `ResetRecvd{..}` for the receive half).

use crate::ApplicationErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    DataSent,
    ResetSent,
    DataRecvd,
    ResetRecvd,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRecvd,
    ResetRecvd,
    DataRead,
    ResetRead,
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }
}

/// Send-half bookkeeping: state, flow-control limit, bytes queued/sent,
/// and (once reset) the error code the peer will see.
pub struct Send {
    pub state: SendState,
    pub max_data: u64,
    pub offset: u64,
    pub bytes_in_flight: u64,
    pub error_code: Option<ApplicationErrorCode>,
    pub final_size: Option<u64>,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Send {
            state: SendState::Ready,
            max_data,
            offset: 0,
            bytes_in_flight: 0,
            error_code: None,
            final_size: None,
        }
    }

    /// RESET_STREAM is only still meaningful (and only still retransmitted
    /// on loss, per the retransmission-policy table) while the send part
    /// hasn't reached one of its own terminal states.
    pub fn reset(&mut self, error_code: ApplicationErrorCode) {
        if !self.state.is_terminal() {
            self.state = SendState::ResetSent;
            self.error_code = Some(error_code);
        }
    }

    pub fn is_writable(&self) -> bool {
        self.state == SendState::Ready
    }
}

/// Receive-half bookkeeping: state plus the known/eventual final size.
pub struct Recv {
    pub state: RecvState,
    pub final_size: Option<u64>,
    pub max_data: u64,
    pub error_code: Option<ApplicationErrorCode>,
}

impl Recv {
    pub fn new(max_data: u64) -> Self {
        Recv {
            state: RecvState::Recv,
            final_size: None,
            max_data,
            error_code: None,
        }
    }

    /// Establish (or re-confirm) final size from a FIN or RESET_STREAM.
    /// Returns an error if this contradicts a previously established
    /// final size (`FINAL_SIZE_ERROR` per the spec's invariant that final
    /// size, once known, is immutable).
    pub fn set_final_size(&mut self, size: u64) -> Result<(), ()> {
        match self.final_size {
            Some(existing) if existing != size => Err(()),
            _ => {
                self.final_size = Some(size);
                if self.state == RecvState::Recv {
                    self.state = RecvState::SizeKnown;
                }
                Ok(())
            }
        }
    }

    pub fn reset(&mut self, error_code: ApplicationErrorCode, final_size: u64) -> Result<(), ()> {
        self.set_final_size(final_size)?;
        if !self.state.is_terminal() {
            self.state = RecvState::ResetRecvd;
            self.error_code = Some(error_code);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_after_data_recvd_is_a_no_op() {
        let mut send = Send::new(1000);
        send.state = SendState::DataRecvd;
        send.reset(crate::varint::VarInt::from_u64(7).unwrap());
        assert_eq!(send.state, SendState::DataRecvd);
    }

    #[test]
    fn conflicting_final_size_is_rejected() {
        let mut recv = Recv::new(1000);
        recv.set_final_size(10).unwrap();
        assert!(recv.set_final_size(11).is_err());
        assert!(recv.set_final_size(10).is_ok());
    }
}
