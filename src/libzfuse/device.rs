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
use std::{
    fs::File,
    io,
    os::unix::fs::{FileExt, FileTypeExt},
    path::{Path, PathBuf},
};

use cfg_if::cfg_if;

use super::{
    definitions::{SECTOR_SHIFT, SECTOR_SIZE, VDEV_LABELS, VDEV_LABEL_SIZE},
    error::{Error, Result},
};

cfg_if! {
    if #[cfg(target_os = "freebsd")] {
        mod ffi {
            nix::ioctl_read! {
                /// Size of the device medium in bytes.
                diocgmediasize, b'd', 129, libc::off_t
            }
        }
    } else if #[cfg(target_os = "linux")] {
        mod ffi {
            nix::ioctl_read! {
                /// Size of the block device in bytes.
                blkgetsize64, 0x12, 114, u64
            }
        }
    }
}

const MBR_SIG_OFFSET: usize = 0x1fe;
const MBR_TABLE_OFFSET: usize = 0x1be;
const MBR_ENTRY_SIZE: usize = 16;

/// One member of the pool: a disk image or a raw block device, with an
/// optional partition offset applied.
#[derive(Debug)]
pub struct LeafDevice {
    file: File,
    start: u64,
    size: u64,
    path: PathBuf,
}

impl LeafDevice {
    fn device_size(file: &File) -> Result<u64> {
        let md = file.metadata()?;
        let ft = md.file_type();
        if ft.is_block_device() || ft.is_char_device() {
            cfg_if! {
                if #[cfg(target_os = "freebsd")] {
                    use std::os::fd::AsRawFd;
                    let mut size = 0;
                    // This ioctl is always safe
                    unsafe { ffi::diocgmediasize(file.as_raw_fd(), &mut size) }
                        .map_err(|e| Error::Io(io::Error::from(e)))?;
                    return Ok(size as u64);
                } else if #[cfg(target_os = "linux")] {
                    use std::os::fd::AsRawFd;
                    let mut size = 0;
                    // This ioctl is always safe
                    unsafe { ffi::blkgetsize64(file.as_raw_fd(), &mut size) }
                        .map_err(|e| Error::Io(io::Error::from(e)))?;
                    return Ok(size);
                }
            }
        }
        Ok(md.len())
    }

    /// Open a pool member.  `partition` selects up to two nested MBR
    /// partition indices (0x0000EEPP, PP primary, EE extended, zero based);
    /// zero selects the first partition when a table is present at all.
    pub fn open(path: &Path, mut partition: u32) -> Result<LeafDevice> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = Self::device_size(&file)?;

        let mut dev = LeafDevice {
            file,
            start: 0,
            size,
            path: path.to_owned(),
        };

        for _ in 0..2 {
            let mut mbr = [0u8; SECTOR_SIZE as usize];
            if dev.read(&mut mbr, 0).is_err() {
                break;
            }

            if mbr[MBR_SIG_OFFSET] == 0x55 && mbr[MBR_SIG_OFFSET + 1] == 0xaa {
                let index = (partition & 0xff) as usize;
                if index < 4 {
                    let entry = &mbr[MBR_TABLE_OFFSET + index * MBR_ENTRY_SIZE..];
                    let start = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
                    let nsectors = u32::from_le_bytes(entry[12..16].try_into().unwrap()) as u64;

                    if start != 0 && nsectors != 0 {
                        dev.start += start << SECTOR_SHIFT;
                        dev.size = nsectors << SECTOR_SHIFT;
                    }
                }
            }

            partition >>= 8;
        }

        Ok(dev)
    }

    /// Usable size in bytes, after any partition offset.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at `offset` relative to the effective
    /// start of the device.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        debug_assert_eq!(
            0,
            offset & (SECTOR_SIZE - 1),
            "unaligned device read at {offset:#x}"
        );
        debug_assert_eq!(0, buf.len() & (SECTOR_SIZE as usize - 1));

        if offset + buf.len() as u64 > self.size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past the end of {}", self.path.display()),
            )));
        }

        self.file.read_exact_at(buf, self.start + offset)?;
        Ok(())
    }

    /// Read one of the four label copies: two at the front of the device and
    /// two at the back.
    pub fn read_label(&self, index: usize) -> Result<Vec<u8>> {
        let label_size = VDEV_LABEL_SIZE as u64;
        let offset = match index {
            0 => 0,
            1 => label_size,
            2 => self
                .size
                .checked_sub(2 * label_size)
                .ok_or(Error::Format("device smaller than its labels"))?,
            3 => self
                .size
                .checked_sub(label_size)
                .ok_or(Error::Format("device smaller than its labels"))?,
            _ => return Err(Error::Format("label index out of range")),
        };

        let mut buf = vec![0u8; VDEV_LABEL_SIZE];
        self.read(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn label_count(&self) -> usize {
        VDEV_LABELS
    }
}

#[cfg(test)]
mod t {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn image_with_mbr(part0_start_lba: u32, part0_sectors: u32) -> NamedTempFile {
        let mut mbr = vec![0u8; 512];
        mbr[MBR_SIG_OFFSET] = 0x55;
        mbr[MBR_SIG_OFFSET + 1] = 0xaa;
        mbr[MBR_TABLE_OFFSET + 8..MBR_TABLE_OFFSET + 12]
            .copy_from_slice(&part0_start_lba.to_le_bytes());
        mbr[MBR_TABLE_OFFSET + 12..MBR_TABLE_OFFSET + 16]
            .copy_from_slice(&part0_sectors.to_le_bytes());

        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&mbr).unwrap();
        f.as_file().set_len(1 << 20).unwrap();
        f
    }

    #[test]
    fn plain_image_is_not_shifted() {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(1 << 20).unwrap();
        let dev = LeafDevice::open(f.path(), 0).unwrap();
        assert_eq!(1 << 20, dev.size());
        assert_eq!(0, dev.start);
    }

    #[test]
    fn partition_offset_detected() {
        let f = image_with_mbr(16, 1024);
        let dev = LeafDevice::open(f.path(), 0).unwrap();
        assert_eq!(16 << 9, dev.start);
        assert_eq!(1024 << 9, dev.size());
    }

    #[test]
    fn empty_partition_entry_is_ignored() {
        // Valid signature but partition 1 is all zeros in both rounds.
        let f = image_with_mbr(16, 1024);
        let dev = LeafDevice::open(f.path(), 0x0101).unwrap();
        assert_eq!(0, dev.start);
        assert_eq!(1 << 20, dev.size());
    }

    #[test]
    fn reads_are_positioned() {
        let mut f = NamedTempFile::new().unwrap();
        let mut data = vec![0u8; 2048];
        data[512] = 0xab;
        f.write_all(&data).unwrap();

        let dev = LeafDevice::open(f.path(), 0).unwrap();
        let mut buf = [0u8; 512];
        dev.read(&mut buf, 512).unwrap();
        assert_eq!(0xab, buf[0]);
    }

    #[test]
    fn short_read_is_an_error() {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(1024).unwrap();
        let dev = LeafDevice::open(f.path(), 0).unwrap();
        let mut buf = [0u8; 1024];
        assert!(dev.read(&mut buf, 512).is_err());
    }

    #[test]
    fn label_offsets() {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(4 << 20).unwrap();
        let dev = LeafDevice::open(f.path(), 0).unwrap();
        for index in 0..dev.label_count() {
            assert_eq!(VDEV_LABEL_SIZE, dev.read_label(index).unwrap().len());
        }
        assert!(dev.read_label(4).is_err());
    }
}
