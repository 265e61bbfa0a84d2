/// Mask/unmask a whole fragment payload in place.
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_offset(buf, key, 0);
}

/// Mask/unmask a payload slice that starts `offset` bytes into its
/// fragment.
///
/// The XOR key cycles over the whole fragment, so a payload consumed in
/// several reads must keep the key phase aligned across calls; the receive
/// cursor tracks the offset and passes it here.
#[inline]
pub(crate) fn apply_mask_offset(buf: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[(offset + i) & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_unmask_identity() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, key);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_known_values() {
        let key = [0xFF, 0xFF, 0xFF, 0xFF];
        let mut data = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
        apply_mask(&mut data, key);
        assert_eq!(data, vec![0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x99, 0x88]);

        let key = [0x12, 0x34, 0x56, 0x78];
        let mut data = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut data, key);
        assert_eq!(data, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }

    #[test]
    fn test_mask_empty() {
        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, [0x12, 0x34, 0x56, 0x78]);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_split_reads_match_single_pass() {
        // Unmasking a fragment in arbitrary chunks must agree with
        // unmasking it in one pass.
        let key = [0x6D, 0xB6, 0xB2, 0x80];
        let original: Vec<u8> = (0..97).map(|i| (i * 7) as u8).collect();

        let mut whole = original.clone();
        apply_mask(&mut whole, key);

        for chunk in [1usize, 2, 3, 4, 5, 13] {
            let mut split = original.clone();
            let mut offset = 0;
            for piece in split.chunks_mut(chunk) {
                apply_mask_offset(piece, key, offset);
                offset += piece.len();
            }
            assert_eq!(split, whole, "chunk size {chunk}");
        }
    }
}
