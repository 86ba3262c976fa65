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
use bincode::{error::DecodeError, Decode};
use fuser::FileType;
use libc::{mode_t, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};

use super::error::{Error, Result};

/// Decode an on-disk structure from a byte slice.  ZFS structures are
/// little-endian; big-endian pools are rejected at the uberblock magic.
pub fn decode<T>(bytes: &[u8]) -> std::result::Result<(T, usize), DecodeError>
where
    T: Decode,
{
    let config = bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding();
    bincode::decode_from_slice(bytes, config)
}

/// Map znode mode bits to the host's notion of a file type.
pub fn file_kind(mode: u64) -> Result<FileType> {
    match mode as mode_t & S_IFMT {
        S_IFREG => Ok(FileType::RegularFile),
        S_IFDIR => Ok(FileType::Directory),
        S_IFLNK => Ok(FileType::Symlink),
        S_IFSOCK => Ok(FileType::Socket),
        S_IFIFO => Ok(FileType::NamedPipe),
        S_IFCHR => Ok(FileType::CharDevice),
        S_IFBLK => Ok(FileType::BlockDevice),
        _ => Err(Error::Format("unknown file type in mode bits")),
    }
}

/// Shell-style wildcard match: `*` matches any run of characters, `?` matches
/// exactly one.  Used to filter directory listings.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(c), Some(d)) if c == d => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod t {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("*", "anything", true)]
    #[case("*.txt", "notes.txt", true)]
    #[case("*.txt", "notes.txt.bak", false)]
    #[case("a?c", "abc", true)]
    #[case("a?c", "ac", false)]
    #[case("passwd", "passwd", true)]
    #[case("passwd", "passwd1", false)]
    #[case("p*w?", "passwd", true)]
    #[case("", "", true)]
    #[case("*", "", true)]
    fn wildcard(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(expected, wildcard_match(pattern, name));
    }
}
