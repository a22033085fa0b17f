// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crc::crc32;

const INITIAL_CRC: u32 = 0xf597a6cf;
const CRC_SEED: u32 = 0xedb88320;

pub fn align_to(num: usize, align_to: usize) -> usize {
    let agn = align_to - 1;

    (num + agn) & !agn
}

pub fn crc32_calc(buf: &[u8]) -> u32 {
    let table = crc32::make_table(CRC_SEED);

    // For some reason, we need to negate the initial CRC value
    // and the result, to match what LVM2 is generating.
    !crc32::update(!INITIAL_CRC, &table, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align_to(0, 512), 0);
        assert_eq!(align_to(1, 512), 512);
        assert_eq!(align_to(512, 512), 512);
        assert_eq!(align_to(513, 512), 1024);
    }

    #[test]
    fn crc_is_stable() {
        let a = crc32_calc(b"melvin");
        let b = crc32_calc(b"melvin");
        assert_eq!(a, b);
        assert_ne!(a, crc32_calc(b"melvind"));
    }
}
