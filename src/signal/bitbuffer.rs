//! Bit-level access to frame payloads in the two signal layouts of CAN databases.
//!
//! Little endian (Intel) signals are addressed by their least significant bit and
//! grow towards higher bit numbers. Big endian (Motorola) signals are addressed by
//! their most significant bit in network bit order, where bit 0 of the remapped
//! index is the MSB of byte 0.

use crate::signal::error::Error;
use crate::signal::Endian;

/// Largest payload covered by the big endian remap table, one CAN FD frame.
pub const MAX_LEN: usize = 64;
const MAX_BITS: usize = MAX_LEN * 8;

/// Initial content of a payload that was neither encoded nor received yet.
pub const FILL: u8 = 0x5a;

/// Reverses the bit numbering inside every byte. Applying it twice is the identity.
static BE_BIT_MAP: [u16; MAX_BITS] = build_be_bit_map();

const fn build_be_bit_map() -> [u16; MAX_BITS] {
    let mut map = [0u16; MAX_BITS];
    let mut i = 0;
    while i < MAX_LEN {
        let mut j = 0;
        while j < 8 {
            map[i * 8 + j] = (i * 8 + 7 - j) as u16;
            j += 1;
        }
        i += 1;
    }
    map
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBuffer {
    data: Vec<u8>,
}

impl BitBuffer {
    /// Buffer of `len` bytes filled with [`FILL`].
    pub fn new(len: usize) -> Self {
        Self { data: vec![FILL; len] }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self { data: data.to_vec() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the whole payload, e.g. with a received frame.
    pub fn replace(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    pub fn set(&mut self, endian: Endian, start: u16, size: u8, value: u32) -> Result<(), Error> {
        match endian {
            Endian::Big => self.set_bits_be(start, size, value),
            Endian::Little => self.set_bits_le(start, size, value),
        }
    }

    pub fn get(&self, endian: Endian, start: u16, size: u8) -> Result<u32, Error> {
        match endian {
            Endian::Big => self.get_bits_be(start, size),
            Endian::Little => self.get_bits_le(start, size),
        }
    }

    pub fn set_bits_be(&mut self, start: u16, size: u8, value: u32) -> Result<(), Error> {
        let first = self.be_range(start, size)?;
        for i in 0..size as usize {
            let bit = BE_BIT_MAP[first + i] as usize;
            let set = value >> (size as usize - 1 - i) & 1 != 0;
            self.write_bit(bit, set);
        }
        Ok(())
    }

    pub fn get_bits_be(&self, start: u16, size: u8) -> Result<u32, Error> {
        let first = self.be_range(start, size)?;
        let mut value = 0u32;
        for i in 0..size as usize {
            let bit = BE_BIT_MAP[first + i] as usize;
            value = value << 1 | self.read_bit(bit) as u32;
        }
        Ok(value)
    }

    pub fn set_bits_le(&mut self, start: u16, size: u8, value: u32) -> Result<(), Error> {
        let last = self.le_range(start, size)?;
        for i in 0..size as usize {
            let set = value >> (size as usize - 1 - i) & 1 != 0;
            self.write_bit(last - i, set);
        }
        Ok(())
    }

    pub fn get_bits_le(&self, start: u16, size: u8) -> Result<u32, Error> {
        let last = self.le_range(start, size)?;
        let mut value = 0u32;
        for i in 0..size as usize {
            value = value << 1 | self.read_bit(last - i) as u32;
        }
        Ok(value)
    }

    /// Index of the signal's MSB in the remapped order; the signal occupies `size` consecutive indices from there.
    fn be_range(&self, start: u16, size: u8) -> Result<usize, Error> {
        check_size(size)?;
        let first = *BE_BIT_MAP
            .get(start as usize)
            .ok_or(Error::StartOutOfRange(start))? as usize;
        let end = first + size as usize;
        if end > self.data.len() * 8 {
            return Err(Error::OutOfBounds { start, size });
        }
        Ok(first)
    }

    /// Physical position of the signal's MSB.
    fn le_range(&self, start: u16, size: u8) -> Result<usize, Error> {
        check_size(size)?;
        let end = start as usize + size as usize;
        if end > self.data.len() * 8 {
            return Err(Error::OutOfBounds { start, size });
        }
        Ok(end - 1)
    }

    fn write_bit(&mut self, bit: usize, set: bool) {
        let mask = 1u8 << (bit % 8);
        if set {
            self.data[bit / 8] |= mask;
        } else {
            self.data[bit / 8] &= !mask;
        }
    }

    fn read_bit(&self, bit: usize) -> bool {
        self.data[bit / 8] & (1 << (bit % 8)) != 0
    }
}

fn check_size(size: u8) -> Result<(), Error> {
    if (1..=32).contains(&size) {
        Ok(())
    } else {
        Err(Error::InvalidSize(size))
    }
}

/// Mask covering the low `size` bits.
pub fn mask(size: u8) -> u32 {
    match size {
        0 => 0,
        32.. => u32::MAX,
        _ => u32::MAX >> (32 - size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_filled() {
        assert_eq!(BitBuffer::new(3).as_bytes(), &[0x5a, 0x5a, 0x5a]);
    }

    #[test]
    fn remap_is_an_involution() {
        for p in 0..MAX_BITS {
            assert_eq!(BE_BIT_MAP[BE_BIT_MAP[p] as usize] as usize, p);
        }
        assert_eq!(BE_BIT_MAP[0], 7);
        assert_eq!(BE_BIT_MAP[15], 8);
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = BitBuffer::new(8);
        buf.set_bits_le(0, 16, 0x1234).unwrap();
        assert_eq!(&buf.as_bytes()[..2], &[0x34, 0x12]);

        buf.set_bits_le(20, 4, 0xf).unwrap();
        assert_eq!(buf.as_bytes()[2], 0xfa);
    }

    #[test]
    fn big_endian_layout() {
        let mut buf = BitBuffer::new(8);
        buf.set_bits_be(7, 16, 0x1234).unwrap();
        assert_eq!(&buf.as_bytes()[..2], &[0x12, 0x34]);

        // 4 bit signal in the high nibble of byte 2
        buf.set_bits_be(23, 4, 0x0).unwrap();
        assert_eq!(buf.as_bytes()[2], 0x0a);
        assert_eq!(buf.get_bits_be(7, 8).unwrap(), 0x12);
    }

    #[test]
    fn roundtrip_all_widths_and_starts() {
        let values = [0u32, u32::MAX, 0xdead_beef, 0x1234_5678, 0xa5a5_a5a5];
        for endian in [Endian::Big, Endian::Little] {
            for size in 1..=32u8 {
                for start in 0..64u16 {
                    let mut buf = BitBuffer::new(8);
                    let fits = match endian {
                        Endian::Big => BE_BIT_MAP[start as usize] as usize + size as usize <= 64,
                        Endian::Little => start as usize + size as usize <= 64,
                    };
                    if !fits {
                        assert!(buf.set(endian, start, size, 1).is_err());
                        continue;
                    }
                    for value in values {
                        buf.set(endian, start, size, value).unwrap();
                        assert_eq!(buf.get(endian, start, size).unwrap(), value & mask(size));
                    }
                }
            }
        }
    }

    #[test]
    fn big_endian_over_canfd_payload() {
        for start in 0..MAX_BITS as u16 {
            let msb = BE_BIT_MAP[start as usize] as usize;
            for size in [1u8, 7, 8, 9, 16, 31, 32] {
                let mut buf = BitBuffer::new(MAX_LEN);
                if msb + size as usize > MAX_BITS {
                    let expected = Err(Error::OutOfBounds { start, size });
                    assert_eq!(buf.set_bits_be(start, size, 1), expected);
                    assert_eq!(buf.get_bits_be(start, size).map(|_| ()), expected);
                    assert_eq!(buf.as_bytes(), &[FILL; MAX_LEN][..]);
                    continue;
                }

                // bits owned by the signal
                let mut owned = BitBuffer::from_bytes(&[0; MAX_LEN]);
                owned.set_bits_be(start, size, u32::MAX).unwrap();
                let owned = owned.as_bytes();
                assert_eq!(owned.iter().map(|b| b.count_ones()).sum::<u32>(), size as u32);

                let value = 0x9e37_79b9 & mask(size);
                buf.set_bits_be(start, size, value).unwrap();
                assert_eq!(buf.get_bits_be(start, size).unwrap(), value);
                for (byte, bits) in buf.as_bytes().iter().zip(owned) {
                    assert_eq!(byte & !bits, FILL & !bits, "start {} size {}", start, size);
                }
            }
        }

        let mut buf = BitBuffer::new(MAX_LEN);
        // LSB of the last byte
        assert!(buf.set_bits_be(504, 1, 1).is_ok());
        assert_eq!(buf.set_bits_be(504, 2, 1), Err(Error::OutOfBounds { start: 504, size: 2 }));
        // MSB of the last byte
        buf.set_bits_be(511, 8, 0xc3).unwrap();
        assert_eq!(buf.as_bytes()[MAX_LEN - 1], 0xc3);
        assert_eq!(buf.set_bits_be(511, 9, 1), Err(Error::OutOfBounds { start: 511, size: 9 }));
        assert_eq!(buf.get_bits_be(512, 1), Err(Error::StartOutOfRange(512)));
    }

    #[test]
    fn neighbours_untouched() {
        let mut buf = BitBuffer::new(2);
        buf.set_bits_le(4, 8, 0xff).unwrap();
        assert_eq!(buf.as_bytes(), &[0xfa, 0x5f]);
    }

    #[test]
    fn invalid_parameters() {
        let mut buf = BitBuffer::new(8);
        assert_eq!(buf.set_bits_le(0, 0, 1), Err(Error::InvalidSize(0)));
        assert_eq!(buf.set_bits_be(0, 33, 1), Err(Error::InvalidSize(33)));
        assert_eq!(buf.get_bits_be(512, 8), Err(Error::StartOutOfRange(512)));
        assert_eq!(buf.get_bits_le(60, 8), Err(Error::OutOfBounds { start: 60, size: 8 }));
    }
}
