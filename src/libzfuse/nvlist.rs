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
use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::debug;

use super::error::{Error, Result};

/// Nested lists deeper than this are treated as corrupt.
const MAX_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
enum PairType {
    Boolean = 1,
    Byte = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Int64 = 7,
    Uint64 = 8,
    String = 9,
    ByteArray = 10,
    Int16Array = 11,
    Uint16Array = 12,
    Int32Array = 13,
    Uint32Array = 14,
    Int64Array = 15,
    Uint64Array = 16,
    StringArray = 17,
    HrTime = 18,
    Nvlist = 19,
    NvlistArray = 20,
    BooleanValue = 21,
    Int8 = 22,
    Uint8 = 23,
    BooleanArray = 24,
    Int8Array = 25,
    Uint8Array = 26,
}

/// A decoded pair value.  Scalars are single-element vectors, matching the
/// on-disk count field.
#[derive(Debug, PartialEq)]
pub enum Value {
    Bool,
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    Str(Vec<String>),
    List(Vec<NvList>),
}

/// The XDR-style big-endian tagged dictionary embedded in vdev labels and in
/// PACKED_NVLIST objects.
#[derive(Debug, Default, PartialEq)]
pub struct NvList {
    pairs: HashMap<String, Value>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(Error::Format("truncated nvlist"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    /// Length-prefixed string, padded to 4-byte alignment.
    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Format("nvlist string is not utf-8"))?;
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(s)
    }
}

impl NvList {
    /// Decode a packed nvlist: a 4-byte encoding/endian header followed by
    /// the outermost list body.
    pub fn unpack(data: &[u8]) -> Result<NvList> {
        let mut cur = Cursor { buf: data, pos: 0 };
        let encoding = cur.u8()?;
        let endian = cur.u8()?;
        cur.take(2)?;
        if encoding != 1 || endian != 1 {
            return Err(Error::Format("nvlist is not XDR encoded"));
        }
        Self::parse(&mut cur, 0)
    }

    fn parse(cur: &mut Cursor, depth: usize) -> Result<NvList> {
        if depth >= MAX_DEPTH {
            return Err(Error::Format("nvlist nesting too deep"));
        }

        let _version = cur.u32()?;
        let _flags = cur.u32()?;

        let mut pairs = HashMap::new();

        loop {
            let pair_start = cur.pos;
            let esize = cur.u32()? as usize;
            let _dsize = cur.u32()?;
            if esize == 0 && _dsize == 0 {
                break;
            }

            let name = cur.string()?;
            let raw_type = cur.u32()?;
            let count = cur.u32()? as usize;

            match PairType::from_u32(raw_type) {
                Some(ty) if count > 0 || ty == PairType::Boolean => {
                    match Self::parse_value(cur, ty, count, depth) {
                        Ok(value) => {
                            pairs.insert(name, value);
                        }
                        Err(Error::Format(reason)) => {
                            debug!("skipping nvlist pair {name:?}: {reason}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => debug!("skipping nvlist pair {name:?} of unknown type {raw_type}"),
            }

            // The encoded size is the authoritative framing; resynchronize on
            // it no matter how much of the value was understood.
            cur.pos = pair_start
                .checked_add(esize)
                .filter(|&e| e <= cur.buf.len())
                .ok_or(Error::Format("nvlist pair overruns buffer"))?;
        }

        Ok(NvList { pairs })
    }

    fn parse_value(cur: &mut Cursor, ty: PairType, count: usize, depth: usize) -> Result<Value> {
        fn collect<T>(count: usize, mut f: impl FnMut() -> Result<T>) -> Result<Vec<T>> {
            (0..count).map(|_| f()).collect()
        }

        Ok(match ty {
            PairType::Boolean => Value::Bool,
            PairType::BooleanValue | PairType::BooleanArray => {
                Value::U32(collect(count, || cur.u32())?)
            }
            PairType::Byte | PairType::ByteArray | PairType::Uint8 | PairType::Uint8Array => {
                Value::U8(collect(count, || cur.u8())?)
            }
            PairType::Int8 | PairType::Int8Array => {
                Value::I8(collect(count, || Ok(cur.u8()? as i8))?)
            }
            PairType::Int16 | PairType::Int16Array => {
                Value::I16(collect(count, || Ok(cur.u16()? as i16))?)
            }
            PairType::Uint16 | PairType::Uint16Array => Value::U16(collect(count, || cur.u16())?),
            PairType::Int32 | PairType::Int32Array => {
                Value::I32(collect(count, || Ok(cur.u32()? as i32))?)
            }
            PairType::Uint32 | PairType::Uint32Array => Value::U32(collect(count, || cur.u32())?),
            PairType::Int64 | PairType::Int64Array => {
                Value::I64(collect(count, || Ok(cur.u64()? as i64))?)
            }
            PairType::Uint64 | PairType::Uint64Array | PairType::HrTime => {
                Value::U64(collect(count, || cur.u64())?)
            }
            PairType::String | PairType::StringArray => {
                Value::Str(collect(count, || cur.string())?)
            }
            PairType::Nvlist | PairType::NvlistArray => {
                Value::List(collect(count, || Self::parse(cur, depth + 1))?)
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.pairs.get(name)
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        match self.pairs.get(name)? {
            Value::U64(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.pairs.get(name)? {
            Value::Str(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> Option<&NvList> {
        self.lists(name)?.first()
    }

    pub fn lists(&self, name: &str) -> Option<&[NvList]> {
        match self.pairs.get(name)? {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
