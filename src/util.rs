use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

pub(crate) const PADDING_MULTIPLE: usize = 4;

pub(crate) fn get_padding_size(len: usize) -> usize {
    (PADDING_MULTIPLE - (len % PADDING_MULTIPLE)) % PADDING_MULTIPLE
}

/// Total bytes a chunk of the given length occupies on the wire, i.e. the
/// length rounded up to the next 4 byte boundary. Padding is not included in
/// the chunk's length field.
pub(crate) fn pad4(len: usize) -> usize {
    len + get_padding_size(len)
}

/// Allocate and zero this data once.
/// We need it for padding and the checksum and don't want to allocate/clear
/// each time.
pub(crate) static FOUR_ZEROES: Bytes = Bytes::from_static(&[0, 0, 0, 0]);

pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC32-C over a serialized packet with the checksum field treated as zero.
pub(crate) fn generate_packet_checksum(raw: &Bytes) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[0..8]);
    digest.update(&FOUR_ZEROES[..]);
    digest.update(&raw[12..]);
    digest.finalize()
}
