//! Framed request/response channel to the UART-attached measurement board.
//!
//! Wire format: 0x02 start byte, a length byte covering everything after
//! the start/length pair plus the checksum, the payload, then a BCC byte
//! (XOR of all preceding bytes). A frame is therefore `length + 2` bytes
//! end to end.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::RthError;

pub const FRAME_START: u8 = 0x02;
const BAUD_RATE: u32 = 57_600;
const READ_CHUNK: usize = 256;

/// XOR block check character over a byte slice.
pub fn bcc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Wrap a payload in start byte, length byte and trailing BCC.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(FRAME_START);
    frame.push((payload.len() + 1) as u8);
    frame.extend_from_slice(payload);
    frame.push(bcc(&frame));
    frame
}

/// Accumulates raw serial bytes and slices complete frames out of them.
/// Feeding the same byte stream in different chunk sizes yields the same
/// frames.
#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract every complete frame currently buffered.
    ///
    /// Bytes before the first start marker are dropped; if no marker exists
    /// at all the whole accumulator is discarded so a stream of garbage
    /// cannot grow the buffer forever. An incomplete trailing frame is kept
    /// for the next call.
    pub fn pop_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            match self.buf.iter().position(|&b| b == FRAME_START) {
                None => {
                    self.buf.clear();
                    return frames;
                }
                Some(idx) if idx > 0 => {
                    self.buf.advance(idx);
                }
                Some(_) => {}
            }
            if self.buf.len() < 2 {
                return frames;
            }
            let frame_len = self.buf[1] as usize + 2;
            if self.buf.len() < frame_len {
                return frames;
            }
            frames.push(self.buf.split_to(frame_len).to_vec());
        }
    }
}

/// Serial port plus receive accumulator.
///
/// Note: received frames are accepted on header bytes and length alone;
/// their BCC is not verified. The measurement board in the field computes
/// it, but no deployed build ever checked it, so validation here would
/// change observable behavior with marginal cabling.
pub struct FramedPort {
    port: Box<dyn SerialPort>,
    rx: FrameBuffer,
}

impl FramedPort {
    pub fn open(device: &str) -> Result<Self, RthError> {
        let port = serialport::new(device, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(RthError::SerialOpen)?;
        Ok(Self {
            port,
            rx: FrameBuffer::default(),
        })
    }

    /// Discard pending input; the first read after power-up often returns
    /// garbage.
    pub fn flush_input(&mut self) {
        if let Err(e) = self.port.clear(ClearBuffer::Input) {
            log::error!("Serial input flush failed {e:?}");
        }
    }
}

/// Request/response seam between the measurement board and the J1772
/// sampler. Production uses [`FramedPort`]; tests script the exchange.
pub trait FrameLink {
    fn send(&mut self, payload: &[u8]) -> Result<(), RthError>;
    /// Non-blocking; returns zero or more complete frames.
    fn poll_frames(&mut self) -> Vec<Vec<u8>>;
}

impl FrameLink for FramedPort {
    fn send(&mut self, payload: &[u8]) -> Result<(), RthError> {
        let frame = encode_frame(payload);
        log::trace!("UART tx {frame:02x?}");
        self.port
            .write_all(&frame)
            .map_err(RthError::SerialWrite)?;
        Ok(())
    }

    fn poll_frames(&mut self) -> Vec<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.port.read(&mut chunk) {
            Ok(n) if n > 0 => self.rx.extend(&chunk[..n]),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => log::error!("Serial read failed {e:?}"),
        }
        let frames = self.rx.pop_frames();
        for frame in &frames {
            log::trace!("UART rx {frame:02x?}");
        }
        frames
    }
}
