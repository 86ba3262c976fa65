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
use std::io::Read;

use flate2::read::ZlibDecoder;

use super::{
    definitions::CompressionType,
    error::{Error, Result},
};

const MATCH_BITS: usize = 6;
const MATCH_MIN: usize = 3;
const MATCH_MAX: usize = (1 << MATCH_BITS) + (MATCH_MIN - 1);
const OFFSET_MASK: usize = (1 << (16 - MATCH_BITS)) - 1;
const LEMPEL_SIZE: usize = 1024;

const ZLE_LEVEL: usize = 64;

/// Decompress `src` into a buffer of exactly `lsize` bytes.
pub fn decompress(src: &[u8], lsize: usize, comp: CompressionType) -> Result<Vec<u8>> {
    match comp {
        CompressionType::Off | CompressionType::Empty => {
            let mut out = src[..src.len().min(lsize)].to_vec();
            out.resize(lsize, 0);
            Ok(out)
        }
        CompressionType::On | CompressionType::Lzjb => lzjb_decompress(src, lsize),
        CompressionType::Gzip1
        | CompressionType::Gzip2
        | CompressionType::Gzip3
        | CompressionType::Gzip4
        | CompressionType::Gzip5
        | CompressionType::Gzip6
        | CompressionType::Gzip7
        | CompressionType::Gzip8
        | CompressionType::Gzip9 => gzip_decompress(src, lsize),
        CompressionType::Zle => zle_decompress(src, lsize, ZLE_LEVEL),
        _ => Err(Error::Unsupported("compression algorithm")),
    }
}

/// LZJB decoder.  An 8-bit copymask selects, per item, either a literal byte
/// or a two-byte back-reference encoding {mlen in [3, 66], offset in
/// [1, 1023]}.  A reference reaching before the start of the output is
/// corrupt input.
pub fn lzjb_decompress(src: &[u8], lsize: usize) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(lsize);
    let mut s = 0;
    let mut copymap = 0u8;
    let mut copymask = 1u32 << 7;

    while dst.len() < lsize {
        copymask <<= 1;
        if copymask == 1 << 8 {
            copymask = 1;
            copymap = *src.get(s).ok_or(Error::Format("truncated lzjb stream"))?;
            s += 1;
        }

        if copymap & copymask as u8 != 0 {
            if s + 1 >= src.len() {
                return Err(Error::Format("truncated lzjb stream"));
            }
            let mlen = (src[s] as usize >> (8 - MATCH_BITS)) + MATCH_MIN;
            let offset = (((src[s] as usize) << 8) | src[s + 1] as usize) & OFFSET_MASK;
            s += 2;

            if offset == 0 || offset > dst.len() {
                return Err(Error::Format("lzjb back-reference before output start"));
            }

            let mut pos = dst.len() - offset;
            for _ in 0..mlen {
                if dst.len() >= lsize {
                    break;
                }
                dst.push(dst[pos]);
                pos += 1;
            }
        } else {
            dst.push(*src.get(s).ok_or(Error::Format("truncated lzjb stream"))?);
            s += 1;
        }
    }

    Ok(dst)
}

/// LZJB encoder.  The Lempel table starts zeroed so identical input always
/// yields identical output.  Returns `None` when the result would not fit in
/// `src.len()` bytes, in which case the block is stored uncompressed.
pub fn lzjb_compress(src: &[u8]) -> Option<Vec<u8>> {
    let mut dst = Vec::with_capacity(src.len());
    let mut lempel = [0u16; LEMPEL_SIZE];
    let mut copymap = 0;
    let mut copymask = 1u32 << 7;
    let mut s = 0;

    while s < src.len() {
        copymask <<= 1;
        if copymask == 1 << 8 {
            if dst.len() >= src.len().saturating_sub(1 + 2 * 8) {
                return None;
            }
            copymask = 1;
            copymap = dst.len();
            dst.push(0);
        }

        if s + MATCH_MAX > src.len() {
            dst.push(src[s]);
            s += 1;
            continue;
        }

        let mut hash =
            ((src[s] as usize) << 16) + ((src[s + 1] as usize) << 8) + src[s + 2] as usize;
        hash += hash >> 9;
        hash += hash >> 5;
        let hp = &mut lempel[hash & (LEMPEL_SIZE - 1)];
        let offset = s.wrapping_sub(*hp as usize) & OFFSET_MASK;
        *hp = s as u16;

        let cpy = s.wrapping_sub(offset);
        if offset != 0 && cpy < s && src[cpy..cpy + MATCH_MIN] == src[s..s + MATCH_MIN] {
            dst[copymap] |= copymask as u8;

            let mut mlen = MATCH_MIN;
            while mlen < MATCH_MAX && src[s + mlen] == src[cpy + mlen] {
                mlen += 1;
            }

            dst.push((((mlen - MATCH_MIN) << (8 - MATCH_BITS)) | (offset >> 8)) as u8);
            dst.push(offset as u8);
            s += mlen;
        } else {
            dst.push(src[s]);
            s += 1;
        }
    }

    Some(dst)
}

/// Gzip levels 1-9 all store an RFC 1950 zlib stream.
fn gzip_decompress(src: &[u8], lsize: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; lsize];
    ZlibDecoder::new(src).read_exact(&mut out)?;
    Ok(out)
}

/// Zero-length encoding: a length byte `b < n` is followed by `b + 1`
/// literal bytes, otherwise it stands for `256 - b + 1` zero bytes.
fn zle_decompress(src: &[u8], lsize: usize, n: usize) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(lsize);
    let mut s = 0;

    while s < src.len() && dst.len() < lsize {
        let b = src[s] as usize;
        s += 1;

        if b < n {
            let count = (b + 1).min(lsize - dst.len());
            if s + count > src.len() {
                return Err(Error::Format("truncated zle stream"));
            }
            dst.extend_from_slice(&src[s..s + count]);
            s += count;
        } else {
            let count = (256 - b + 1).min(lsize - dst.len());
            dst.resize(dst.len() + count, 0);
        }
    }

    if dst.len() != lsize {
        return Err(Error::Format("zle stream too short"));
    }

    Ok(dst)
}

#[cfg(test)]
mod t {
    use std::io::Write;

    use super::*;

    #[test]
    fn lzjb_round_trip() {
        let pattern: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        let compressed = lzjb_compress(&pattern).unwrap();
        assert!(compressed.len() < pattern.len());
        let restored = lzjb_decompress(&compressed, pattern.len()).unwrap();
        assert_eq!(pattern, restored);
    }

    #[test]
    fn lzjb_deterministic() {
        let data = vec![7u8; 4096];
        assert_eq!(lzjb_compress(&data), lzjb_compress(&data));
    }

    #[test]
    fn lzjb_rejects_bad_back_reference() {
        // copymap 0x01 flags a back-reference as the very first item, which
        // necessarily points before the start of the output.
        let src = [0x01u8, 0x04, 0x01];
        assert!(lzjb_decompress(&src, 16).is_err());
    }

    #[test]
    fn lzjb_rejects_truncation() {
        assert!(lzjb_decompress(&[0x00u8, b'a'], 8).is_err());
    }

    #[test]
    fn zle_literal_run() {
        let mut src = vec![0x3f];
        src.extend_from_slice(&[b'A'; 64]);
        assert_eq!(vec![b'A'; 64], zle_decompress(&src, 64, 64).unwrap());
    }

    #[test]
    fn zle_zero_run() {
        // 256 - 0x80 + 1 = 129 zero bytes.
        assert_eq!(vec![0u8; 129], zle_decompress(&[0x80], 129, 64).unwrap());
    }

    #[test]
    fn zle_short_stream_is_an_error() {
        assert!(zle_decompress(&[0x80], 200, 64).is_err());
    }

    #[test]
    fn gzip_zlib_stream() {
        let plain = b"a zlib stream, as stored by gzip-compressed blocks".repeat(8);
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&plain).unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(
            plain,
            decompress(&compressed, plain.len(), CompressionType::Gzip6).unwrap()
        );
    }

    #[test]
    fn copy_pads_to_lsize() {
        let out = decompress(b"abc", 6, CompressionType::Off).unwrap();
        assert_eq!(b"abc\0\0\0".to_vec(), out);
    }

    #[test]
    fn lz4_is_unsupported() {
        assert!(matches!(
            decompress(b"", 0, CompressionType::Lz4),
            Err(Error::Unsupported(_))
        ));
    }
}
