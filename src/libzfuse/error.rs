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
use std::io;

use libc::{c_int, EACCES, EINVAL, EIO, ENOENT, EOPNOTSUPP};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block failed verification on every DVA that was tried.
    #[error("checksum mismatch on vdev {vdev} at offset {offset:#x}")]
    Checksum { vdev: u64, offset: u64 },

    #[error("invalid on-disk format: {0}")]
    Format(&'static str),

    /// A leaf device that was never bound at pool open.
    #[error("missing device")]
    MissingDevice,

    #[error("not found")]
    NotFound,

    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Errno handed to the kernel at the fuse boundary.
    pub fn errno(&self) -> c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(EIO),
            Error::Checksum { .. } => EIO,
            Error::Format(_) => EINVAL,
            Error::MissingDevice => EIO,
            Error::NotFound => ENOENT,
            Error::Unsupported(_) => EOPNOTSUPP,
        }
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::Format("undecodable structure")
    }
}

/// Errno for any operation that would modify the pool.
pub const EROFS_DENIED: c_int = EACCES;

pub type Result<T> = std::result::Result<T, Error>;
