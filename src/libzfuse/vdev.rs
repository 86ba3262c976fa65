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
use std::sync::Arc;

use super::{
    definitions::{ZfsGuid, SECTOR_SHIFT, VDEV_LABEL_START_SIZE},
    device::LeafDevice,
    error::{Error, Result},
    nvlist::NvList,
};

fn roundup(x: u64, y: u64) -> u64 {
    x.div_ceil(y) * y
}

/// One I/O column of a RAID-Z stripe.
#[derive(Debug, PartialEq)]
pub struct RaidzCol {
    /// Child device index.
    pub devidx: usize,
    /// Byte offset on that child.
    pub offset: u64,
    /// Bytes of this column that belong to the I/O.
    pub size: u64,
}

/// The variable-stripe RAID-Z layout: a pure function of the logical offset
/// and size, ported from the on-disk format's raidz map.
#[derive(Debug)]
pub struct RaidzMap {
    pub cols: Vec<RaidzCol>,
    /// Data columns start here; everything before is parity.
    pub firstdatacol: usize,
    pub bigcols: usize,
    pub skipstart: usize,
    pub asize: u64,
    pub nskip: u64,
}

impl RaidzMap {
    pub fn new(offset: u64, psize: u64, ashift: u32, dcols: usize, nparity: usize) -> RaidzMap {
        let b = offset >> ashift;
        let s = psize >> ashift;
        let f = (b % dcols as u64) as usize;
        let o = (b / dcols as u64) << ashift;
        let q = s / (dcols - nparity) as u64;
        let r = (s - q * (dcols - nparity) as u64) as usize;
        let bc = if r == 0 { 0 } else { r + nparity };
        let tot = s + nparity as u64 * (q + u64::from(r != 0));

        let (cols, scols) = if q == 0 {
            (bc, dcols.min(roundup(bc as u64, nparity as u64 + 1) as usize))
        } else {
            (dcols, dcols)
        };

        let mut col = Vec::with_capacity(scols);
        let mut asize = 0;

        for c in 0..scols {
            let mut devidx = f + c;
            let mut coff = o;
            if devidx >= dcols {
                devidx -= dcols;
                coff += 1 << ashift;
            }

            let size = if c >= cols {
                0
            } else if c < bc {
                (q + 1) << ashift
            } else {
                q << ashift
            };
            asize += size;

            col.push(RaidzCol {
                devidx,
                offset: coff,
                size,
            });
        }

        let mut skipstart = bc;
        let firstdatacol = nparity;

        // Single-parity pools switch the parity and first data column every
        // 1 MiB of logical offset.  This is a permanent on-disk format
        // requirement inherited from the original allocator.
        if firstdatacol == 1 && offset & (1 << 20) != 0 {
            let (devidx, coff) = (col[0].devidx, col[0].offset);
            col[0].devidx = col[1].devidx;
            col[0].offset = col[1].offset;
            col[1].devidx = devidx;
            col[1].offset = coff;

            if skipstart == 0 {
                skipstart = 1;
            }
        }

        RaidzMap {
            cols: col,
            firstdatacol,
            bigcols: bc,
            skipstart,
            asize: roundup(asize, (nparity as u64 + 1) << ashift),
            nskip: roundup(tot, nparity as u64 + 1) - tot,
        }
    }
}

/// A node of the vdev tree described by the label's `vdev_tree` nvlist.
/// "disk" and "file" leaves read identically once the backing device is
/// bound.
#[derive(Debug)]
pub enum Vdev {
    Leaf {
        guid: ZfsGuid,
        path: Option<String>,
        dev: Option<Arc<LeafDevice>>,
    },
    Mirror {
        guid: ZfsGuid,
        children: Vec<Vdev>,
    },
    Raidz {
        guid: ZfsGuid,
        ashift: u32,
        nparity: usize,
        children: Vec<Vdev>,
    },
}

impl Vdev {
    fn from_nvlist(nvl: &NvList) -> Result<Vdev> {
        let vtype = nvl
            .string("type")
            .ok_or(Error::Format("vdev node has no type"))?;
        let guid = nvl
            .u64("guid")
            .ok_or(Error::Format("vdev node has no guid"))?;

        let children = |nvl: &NvList| -> Result<Vec<Vdev>> {
            nvl.lists("children")
                .ok_or(Error::Format("interior vdev has no children"))?
                .iter()
                .map(Vdev::from_nvlist)
                .collect()
        };

        match vtype {
            "disk" | "file" => Ok(Vdev::Leaf {
                guid,
                path: nvl.string("path").map(str::to_owned),
                dev: None,
            }),
            "mirror" => Ok(Vdev::Mirror {
                guid,
                children: children(nvl)?,
            }),
            "raidz" => {
                let nparity = nvl.u64("nparity").unwrap_or(1) as usize;
                let children = children(nvl)?;
                if children.len() <= nparity {
                    return Err(Error::Format("raid-z narrower than its parity"));
                }
                Ok(Vdev::Raidz {
                    guid,
                    ashift: nvl.u64("ashift").unwrap_or(SECTOR_SHIFT as u64) as u32,
                    nparity,
                    children,
                })
            }
            _ => Err(Error::Unsupported("vdev type")),
        }
    }

    /// Attach an opened device to the leaf with the given guid.
    pub fn bind(&mut self, guid: ZfsGuid, dev: &Arc<LeafDevice>) -> bool {
        match self {
            Vdev::Leaf {
                guid: leaf_guid,
                dev: slot,
                ..
            } => {
                if *leaf_guid == guid {
                    *slot = Some(Arc::clone(dev));
                    true
                } else {
                    false
                }
            }
            Vdev::Mirror { children, .. } | Vdev::Raidz { children, .. } => {
                children.iter_mut().any(|child| child.bind(guid, dev))
            }
        }
    }

    /// Leaves that never got a backing device.
    pub fn missing(&self) -> usize {
        match self {
            Vdev::Leaf { dev, .. } => usize::from(dev.is_none()),
            Vdev::Mirror { children, .. } | Vdev::Raidz { children, .. } => {
                children.iter().map(Vdev::missing).sum()
            }
        }
    }

    /// Read `size` bytes at a logical offset within this vdev.
    pub fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        match self {
            Vdev::Leaf { dev, .. } => {
                let dev = dev.as_ref().ok_or(Error::MissingDevice)?;
                let mut buf = vec![0u8; size];
                dev.read(&mut buf, offset + VDEV_LABEL_START_SIZE)?;
                Ok(buf)
            }
            Vdev::Mirror { children, .. } => {
                let mut last = Error::MissingDevice;
                for child in children {
                    match child.read(size, offset) {
                        Ok(buf) => return Ok(buf),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
            Vdev::Raidz {
                ashift,
                nparity,
                children,
                ..
            } => {
                let map = RaidzMap::new(offset, size as u64, *ashift, children.len(), *nparity);

                let mut out = Vec::with_capacity(size);
                for col in &map.cols[map.firstdatacol..] {
                    if col.size == 0 {
                        continue;
                    }
                    let data = children[col.devidx]
                        .read(col.size as usize, col.offset)
                        .map_err(|e| match e {
                            Error::MissingDevice => {
                                Error::Unsupported("raid-z reconstruction from parity")
                            }
                            other => other,
                        })?;
                    out.extend_from_slice(&data);
                }

                if out.len() < size {
                    return Err(Error::Format("raid-z stripe shorter than request"));
                }
                out.truncate(size);
                Ok(out)
            }
        }
    }
}

/// A top-level vdev plus the identity the pool tracks it by.
#[derive(Debug)]
pub struct TopVdev {
    pub id: u64,
    pub guid: ZfsGuid,
    pub asize: u64,
    pub vdev: Vdev,
}

impl TopVdev {
    pub fn from_nvlist(nvl: &NvList) -> Result<TopVdev> {
        Ok(TopVdev {
            id: nvl.u64("id").ok_or(Error::Format("vdev tree has no id"))?,
            guid: nvl
                .u64("guid")
                .ok_or(Error::Format("vdev tree has no guid"))?,
            asize: nvl.u64("asize").unwrap_or(0),
            vdev: Vdev::from_nvlist(nvl)?,
        })
    }

    /// Whether the number of unbound leaves is within this vdev's redundancy.
    pub fn tolerates(&self, missing: usize) -> bool {
        match &self.vdev {
            Vdev::Raidz { nparity, .. } => missing <= *nparity,
            Vdev::Mirror { children, .. } => missing < children.len(),
            Vdev::Leaf { .. } => missing == 0,
        }
    }

    /// Capacity contribution for statfs, shaped by the vdev layout.
    pub fn shaped_asize(&self) -> u64 {
        match &self.vdev {
            Vdev::Raidz {
                nparity, children, ..
            } if children.len() > 1 => {
                self.asize * (children.len() - nparity) as u64 / children.len() as u64
            }
            Vdev::Mirror { children, .. } if !children.is_empty() => {
                self.asize / children.len() as u64
            }
            _ => self.asize,
        }
    }
}
