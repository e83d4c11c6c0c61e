use super::InputError;
use crate::Payload;

/// The wire size of a segment header in bytes.
pub const OVERHEAD: usize = 24;

/// The command carried in a segment header.
///
/// A segment is either data ([`Push`](Command::Push)), an acknowledgement
/// ([`Ack`](Command::Ack)), or one half of the window-probe exchange:
/// [`WindowAsk`](Command::WindowAsk) requests the peer's receive window and
/// [`WindowTell`](Command::WindowTell) advertises it unsolicited. Every
/// header also carries the sender's free window and cumulative ack, so the
/// command only selects which of the remaining fields are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    WindowAsk = 83,
    WindowTell = 84,
}

impl TryFrom<u8> for Command {
    type Error = InputError;

    fn try_from(cmd: u8) -> Result<Self, Self::Error> {
        match cmd {
            81 => Ok(Command::Push),
            82 => Ok(Command::Ack),
            83 => Ok(Command::WindowAsk),
            84 => Ok(Command::WindowTell),
            other => Err(InputError::BadCmd(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

/// A segment header as it appears on the wire: eight little-endian fields in
/// 24 bytes, followed by `len` payload bytes.
///
/// `cmd` is kept as the raw byte so that a header can be decoded before its
/// command is validated; conversion to [`Command`] happens at the point where
/// the segment is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Conversation id shared by both peers
    pub conv: u32,
    /// Command byte, one of the [`Command`] values
    pub cmd: u8,
    /// Fragment countdown; 0 marks the final fragment of a message
    pub frg: u8,
    /// The sender's free receive window, in segments
    pub wnd: u16,
    /// Millisecond timestamp of the original push, echoed by acks
    pub ts: u32,
    /// Sequence number
    pub sn: u32,
    /// Cumulative ack: the next sequence number the sender expects
    pub una: u32,
    /// Payload length in bytes
    pub len: u32,
}

impl Header {
    /// Appends the 24-byte wire encoding of this header to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.conv.to_le_bytes());
        buf.push(self.cmd);
        buf.push(self.frg);
        buf.extend_from_slice(&self.wnd.to_le_bytes());
        buf.extend_from_slice(&self.ts.to_le_bytes());
        buf.extend_from_slice(&self.sn.to_le_bytes());
        buf.extend_from_slice(&self.una.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
    }

    /// Reads a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, InputError> {
        if bytes.len() < OVERHEAD {
            return Err(InputError::ShortHeader(bytes.len()));
        }
        Ok(Self {
            conv: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            cmd: bytes[4],
            frg: bytes[5],
            wnd: u16::from_le_bytes([bytes[6], bytes[7]]),
            ts: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            sn: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            una: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            len: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        })
    }
}

/// Reads the conversation id from the front of a raw datagram without
/// decoding the rest of the header. Returns `None` for datagrams too short to
/// hold a segment. Dispatchers use this to route a datagram to the right
/// connection before feeding it to `input`.
pub fn peek_conv(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < OVERHEAD {
        return None;
    }
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// A segment held in one of the connection's buffers: the wire header plus
/// retransmission bookkeeping that never leaves the sender.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub header: Header,
    /// Absolute time of the next retransmission
    pub resendts: u32,
    /// Retransmission timeout for this segment, grown on each timeout
    pub rto: u32,
    /// How many later segments have been acked while this one has not
    pub fastack: u32,
    /// Transmission count
    pub xmit: u32,
    pub data: Payload,
}

impl Segment {
    pub fn new(header: Header, data: Payload) -> Self {
        Self {
            header,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
            data,
        }
    }

    /// A blank push-side segment carrying `data`; the remaining header fields
    /// are stamped when the segment moves into the send buffer.
    pub fn with_data(data: Payload) -> Self {
        let header = Header {
            conv: 0,
            cmd: Command::Push.into(),
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: data.len() as u32,
        };
        Self::new(header, data)
    }

    /// Appends the header and payload to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        debug_assert_eq!(self.header.len as usize, self.data.len());
        self.header.encode_into(buf);
        buf.extend(self.data.iter());
    }
}
