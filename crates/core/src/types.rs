pub type RunId = u16;
pub type Seq = u16;

/// Leading discriminator of every binary frame, written big-endian (`A5 5A` on the wire).
pub const MAGIC: u16 = 0xA55A;
pub const MAGIC_BYTES: [u8; 2] = MAGIC.to_be_bytes();

/// First byte of every encoded control line. Never equal to `MAGIC_BYTES[0]`.
pub const CONTROL_START: u8 = b'{';
pub const LINE_TERMINATOR: u8 = b'\n';

/// magic + run_id + seq + total + payload_len
pub const HEADER_LEN: usize = 10;
pub const CHECKSUM_LEN: usize = 4;
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CHECKSUM_LEN;
pub const MIN_MTU: u16 = FRAME_OVERHEAD as u16 + 1;

/// Baud rate both modules are configured for out of band.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// 8N1 framing: start bit, eight data bits, stop bit.
pub const BITS_PER_SERIAL_BYTE: u32 = 10;

/// Payload bytes carried by one frame at `mtu`, or `None` if the MTU cannot hold a payload.
pub fn payload_capacity(mtu: u16) -> Option<usize> {
    (mtu as usize).checked_sub(FRAME_OVERHEAD).filter(|cap| *cap > 0)
}
