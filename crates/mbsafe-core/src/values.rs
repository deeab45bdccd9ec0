//! Stateless helpers for packing bits, words and floats
//!
//! Bit tables hold one bit per byte (0 or 1), the way a [`Mapping`] stores
//! coils. Floats occupy two registers, high word first.
//!
//! [`Mapping`]: crate::mapping::Mapping

/// Pack up to 8 bits from `src[index..]` into one byte, LSB first.
pub fn get_byte_from_bits(src: &[u8], index: usize, nb_bits: usize) -> u8 {
    let nb_bits = nb_bits.min(8);
    src[index..index + nb_bits]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, &bit)| acc | (((bit != 0) as u8) << i))
}

/// Unpack the 8 bits of `value` into `dest[index..index + 8]`.
pub fn set_bits_from_byte(dest: &mut [u8], index: usize, value: u8) {
    for (i, slot) in dest[index..index + 8].iter_mut().enumerate() {
        *slot = (value >> i) & 1;
    }
}

/// Unpack `nb_bits` bits from `tab_byte` into `dest[index..]`, LSB first.
pub fn set_bits_from_bytes(dest: &mut [u8], index: usize, nb_bits: usize, tab_byte: &[u8]) {
    for (i, slot) in dest[index..index + nb_bits].iter_mut().enumerate() {
        *slot = (tab_byte[i / 8] >> (i % 8)) & 1;
    }
}

/// Big-endian 16-bit value at `tab[index]`, `tab[index + 1]`.
#[inline]
pub fn get_int16_from_int8(tab: &[u8], index: usize) -> u16 {
    ((tab[index] as u16) << 8) | tab[index + 1] as u16
}

/// 32-bit value from two registers, high word first.
#[inline]
pub fn get_int32_from_int16(tab: &[u16], index: usize) -> u32 {
    ((tab[index] as u32) << 16) | tab[index + 1] as u32
}

/// Float from two registers, high word first.
#[inline]
pub fn get_float(src: &[u16]) -> f32 {
    f32::from_bits(get_int32_from_int16(src, 0))
}

/// Store `value` into two registers, high word first.
#[inline]
pub fn set_float(value: f32, dest: &mut [u16]) {
    let bits = value.to_bits();
    dest[0] = (bits >> 16) as u16;
    dest[1] = bits as u16;
}

/// Pack a bit table into bytes, LSB first (the wire layout of coil data).
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Inverse of [`pack_bits`], producing exactly `nb_bits` values.
pub fn unpack_bits(bytes: &[u8], nb_bits: usize) -> Vec<bool> {
    (0..nb_bits)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_from_bits() {
        let bits = [1, 0, 1, 1, 0, 0, 0, 0, 1];
        assert_eq!(get_byte_from_bits(&bits, 0, 8), 0b0000_1101);
        assert_eq!(get_byte_from_bits(&bits, 2, 2), 0b11);
        // capped at 8
        assert_eq!(get_byte_from_bits(&bits, 1, 20), 0b1000_0110);
    }

    #[test]
    fn test_bits_from_byte() {
        let mut dest = [0u8; 10];
        set_bits_from_byte(&mut dest, 1, 0xA5);
        assert_eq!(dest, [0, 1, 0, 1, 0, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_bits_from_bytes() {
        let mut dest = [9u8; 12];
        set_bits_from_bytes(&mut dest, 0, 10, &[0xFF, 0x02]);
        assert_eq!(&dest[..10], &[1, 1, 1, 1, 1, 1, 1, 1, 0, 1]);
        assert_eq!(dest[10], 9);
    }

    #[test]
    fn test_ints() {
        assert_eq!(get_int16_from_int8(&[0x12, 0x34, 0x56], 1), 0x3456);
        assert_eq!(get_int32_from_int16(&[0x1234, 0x5678], 0), 0x1234_5678);
    }

    #[test]
    fn test_float_word_order() {
        let mut regs = [0u16; 2];
        set_float(1.0, &mut regs);
        // 1.0f32 == 0x3F800000
        assert_eq!(regs, [0x3F80, 0x0000]);
        assert_eq!(get_float(&regs), 1.0);

        set_float(-123.456, &mut regs);
        assert_eq!(get_float(&regs), -123.456);
    }

    #[test]
    fn test_pack_bits() {
        let bits = [true, false, true, false, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0x05, 0x01]);
        assert_eq!(unpack_bits(&packed, 9), bits.to_vec());
        assert!(pack_bits(&[]).is_empty());
    }
}
