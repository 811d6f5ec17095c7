// Functions related to field encoding.
use byteorder::{ByteOrder, LittleEndian};

// All EFS on-disk integers are little-endian, tightly packed.
type E = LittleEndian;

pub fn read_2(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn read_8(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn write_2(buf: &mut [u8], n: u16) {
    E::write_u16(buf, n)
}

pub fn write_8(buf: &mut [u8], n: u64) {
    E::write_u64(buf, n)
}
