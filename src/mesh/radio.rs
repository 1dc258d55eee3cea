//! Radio driver boundary.
//!
//! The physical-layer driver lives outside the protocol engine. Its contract
//! is deliberately narrow: transmit a frame, poll for a received frame,
//! reconfigure parameters, and report channel activity for carrier sensing.
//! The interrupt side of a real driver does exactly one thing — push a
//! [`ReceivedFrame`] into the bounded RX queue and wake the engine.

use crate::types::RADIO_QUEUE_DEPTH;
use thiserror::Error;
use tokio::sync::mpsc;

/// Physical-layer parameter block. These values are bit-exact interop
/// requirements: radios configured differently will not hear each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioParams {
    /// Carrier frequency in Hz (915 MHz US, or regional equivalent).
    pub frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor, 7-12.
    pub spreading_factor: u8,
    /// Coding rate denominator (4/x).
    pub coding_rate_denom: u8,
    /// Sync word separating co-channel networks at the PHY.
    pub sync_word: u8,
    /// Preamble length in symbols.
    pub preamble_len: u16,
    /// TX power in dBm.
    pub tx_power_dbm: i8,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            frequency_hz: 915_000_000,
            bandwidth_hz: 125_000,
            spreading_factor: 10,
            coding_rate_denom: 5,
            sync_word: 0x12,
            preamble_len: 8,
            tx_power_dbm: 22,
        }
    }
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("transmit failed: {0}")]
    TxFailed(String),

    #[error("invalid radio parameters: {0}")]
    BadParams(&'static str),
}

/// A raw frame as delivered by the radio, with reception metadata.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub bytes: Vec<u8>,
    pub rssi_dbm: i16,
    pub snr_db: f32,
}

/// Contract every radio driver implements. All calls are non-blocking; the
/// MAC schedules around airtime itself.
pub trait RadioDriver: Send {
    /// Queue one frame for transmission.
    fn tx(&mut self, bytes: &[u8]) -> Result<(), RadioError>;

    /// Take the next received frame, if any.
    fn rx_poll(&mut self) -> Option<ReceivedFrame>;

    /// Reconfigure the PHY.
    fn set_params(&mut self, params: RadioParams) -> Result<(), RadioError>;

    /// Channel-activity detection sample for carrier sensing. Drivers
    /// without CAD support may always return `false`.
    fn channel_activity(&mut self) -> bool {
        false
    }
}

/// Bounded queue from the receive interrupt into the engine loop. The ISR
/// uses `try_send` — when the engine is saturated the frame is dropped at
/// the radio, never buffered unbounded.
pub type RadioRxQueue = mpsc::Receiver<ReceivedFrame>;
pub type RadioRxSender = mpsc::Sender<ReceivedFrame>;

pub fn radio_rx_queue() -> (RadioRxSender, RadioRxQueue) {
    mpsc::channel(RADIO_QUEUE_DEPTH)
}
