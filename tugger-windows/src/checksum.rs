// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! PE image checksums, as computed by `CheckSumMappedFile`. */

use {
    crate::image::PeLayout,
    anyhow::Result,
    byteorder::{ByteOrder, LittleEndian},
};

/// Compute the checksum of an image, treating the 4 bytes at
/// `checksum_offset` as zero.
pub fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let field = checksum_offset..checksum_offset + 4;
    let byte = |i: usize| -> u64 {
        if field.contains(&i) {
            0
        } else {
            data.get(i).copied().unwrap_or(0) as u64
        }
    };

    let mut sum: u64 = 0;
    for i in (0..data.len()).step_by(2) {
        sum += byte(i) | byte(i + 1) << 8;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum = (sum & 0xffff) + (sum >> 16);

    (sum as u32).wrapping_add(data.len() as u32)
}

/// Recompute and store the checksum of a PE image.
pub fn update_checksum(data: &mut [u8]) -> Result<u32> {
    let offset = PeLayout::parse(data)?.checksum_offset();
    let checksum = compute_checksum(data, offset);
    LittleEndian::write_u32(&mut data[offset..offset + 4], checksum);

    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::PeBuilder};

    #[test]
    fn small_sum() {
        let data = [1, 0, 2, 0, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(compute_checksum(&data, 4), 3 + 8);

        let data = [0xff, 0xff, 0x02, 0x00, 0x01];
        // 0xffff + 2 folds to 0x0002, plus the trailing byte, plus the length.
        assert_eq!(compute_checksum(&data, 100), 2 + 1 + 5);
    }

    #[test]
    fn update_is_stable() -> Result<()> {
        let mut data = PeBuilder::new().import("KERNEL32.dll").build();
        let first = update_checksum(&mut data)?;
        assert_ne!(first, 0);

        let snapshot = data.clone();
        assert_eq!(update_checksum(&mut data)?, first);
        assert_eq!(data, snapshot);

        Ok(())
    }
}
