/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */
use sha2::{Digest, Sha256};

use super::{
    definitions::ChecksumType,
    error::{Error, Result},
};

pub type Cksum = [u64; 4];

/// Fletcher over 16-byte pairs of little-endian u64 words, accumulated as
/// (a0, a1, b0, b1).  A trailing partial pair is ignored, as zfs does.
pub fn fletcher2(data: &[u8]) -> Cksum {
    let (mut a0, mut a1, mut b0, mut b1) = (0u64, 0u64, 0u64, 0u64);
    let mut words = data.chunks_exact(8);
    while let (Some(w0), Some(w1)) = (words.next(), words.next()) {
        a0 = a0.wrapping_add(u64::from_le_bytes(w0.try_into().unwrap()));
        a1 = a1.wrapping_add(u64::from_le_bytes(w1.try_into().unwrap()));
        b0 = b0.wrapping_add(a0);
        b1 = b1.wrapping_add(a1);
    }
    [a0, a1, b0, b1]
}

/// Fletcher over little-endian u32 words with four cascaded accumulators.
pub fn fletcher4(data: &[u8]) -> Cksum {
    let (mut a, mut b, mut c, mut d) = (0u64, 0u64, 0u64, 0u64);
    for word in data.chunks_exact(4) {
        a = a.wrapping_add(u64::from(u32::from_le_bytes(word.try_into().unwrap())));
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }
    [a, b, c, d]
}

/// SHA-256 with every 64-bit word of the digest byte-swapped, matching the
/// on-disk checksum representation.
pub fn sha256(data: &[u8]) -> Cksum {
    let digest = Sha256::digest(data);
    let mut out = [0u64; 4];
    for (word, bytes) in out.iter_mut().zip(digest.chunks_exact(8)) {
        *word = u64::from_be_bytes(bytes.try_into().unwrap());
    }
    out
}

fn compute(data: &[u8], kind: ChecksumType) -> Result<Option<Cksum>> {
    Ok(match kind {
        ChecksumType::Off => None,
        ChecksumType::On | ChecksumType::Zilog | ChecksumType::Fletcher2 => Some(fletcher2(data)),
        ChecksumType::Zilog2 | ChecksumType::Fletcher4 => Some(fletcher4(data)),
        ChecksumType::Label | ChecksumType::GangHeader | ChecksumType::Sha256 => {
            Some(sha256(data))
        }
        _ => return Err(Error::Unsupported("checksum algorithm")),
    })
}

/// Verify `data` against an expected checksum.  `Off` always matches.
pub fn verify(data: &[u8], kind: ChecksumType, expected: &Cksum) -> Result<bool> {
    Ok(match compute(data, kind)? {
        Some(actual) => actual == *expected,
        None => true,
    })
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn fletcher2_two_words() {
        let mut data = [0u8; 16];
        data[0] = 1;
        data[8] = 2;
        assert_eq!([1, 2, 1, 2], fletcher2(&data));
    }

    #[test]
    fn fletcher2_ignores_partial_pair() {
        let mut data = [0u8; 24];
        data[0] = 1;
        data[8] = 2;
        data[16] = 0xff;
        assert_eq!([1, 2, 1, 2], fletcher2(&data));
    }

    #[test]
    fn fletcher4_accumulators() {
        let data = 1u32.to_le_bytes();
        assert_eq!([1, 1, 1, 1], fletcher4(&data));
        let mut data = [0u8; 8];
        data[0] = 1;
        data[4] = 1;
        assert_eq!([2, 3, 4, 5], fletcher4(&data));
    }

    #[test]
    fn sha256_word_order() {
        // SHA-256 of the empty string, read as four big-endian words.
        assert_eq!(
            [
                0xe3b0c44298fc1c14,
                0x9afbf4c8996fb924,
                0x27ae41e4649b934c,
                0xa495991b7852b855
            ],
            sha256(b"")
        );
    }

    #[test]
    fn off_always_matches() {
        assert!(verify(b"junk", ChecksumType::Off, &[1, 2, 3, 4]).unwrap());
    }

    #[test]
    fn mismatch_detected() {
        assert!(!verify(b"junkjunkjunkjunk", ChecksumType::Fletcher2, &[0; 4]).unwrap());
    }

    #[test]
    fn unimplemented_algorithm_errors() {
        assert!(verify(b"", ChecksumType::Blake3, &[0; 4]).is_err());
    }
}
