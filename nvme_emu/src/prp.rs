// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing of NVMe PRP (Physical Region Page) entries and lists.

use crate::error::NvmeError;
use crate::spec;
use hostmem::HostMemory;
use zerocopy::IntoBytes;

/// A gather/scatter description of a host data transfer, built from the two
/// data pointer words of a command.
#[derive(Debug)]
pub struct PrpRange {
    offset: usize,
    len: usize,
    page_size: usize,
    pages: Vec<u64>,
}

impl PrpRange {
    /// Parses a PRP range for a transfer of `len` bytes from the two PRP
    /// values in `dptr`, using the controller's current memory page size.
    ///
    /// The first pointer may start at any offset within its page. When the
    /// transfer spans more than two pages, the second pointer addresses a
    /// PRP list of page base addresses, itself chained across pages when
    /// necessary.
    pub fn parse(
        mem: &HostMemory,
        len: usize,
        dptr: [u64; 2],
        page_size: u32,
    ) -> Result<Self, NvmeError> {
        let page_size = page_size as usize;
        if len == 0 || dptr[0] == 0 || !page_size.is_power_of_two() {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
        }
        let page_mask = !(page_size as u64 - 1);
        let offset = (dptr[0] & !page_mask) as usize;
        let count = (offset + len).div_ceil(page_size);
        let mut pages = vec![0; count];
        pages[0] = dptr[0] & page_mask;

        if count == 2 {
            if dptr[1] == 0 {
                return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
            }
            if dptr[1] & !page_mask != 0 {
                return Err(spec::Status::PRP_OFFSET_INVALID.into());
            }
            pages[1] = dptr[1];
        } else if count > 2 {
            let entries_per_page = page_size / 8;
            let mut next_list = dptr[1];
            let mut filled = 1;
            while filled < count {
                if next_list == 0 {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
                if next_list & 7 != 0 {
                    return Err(spec::Status::PRP_OFFSET_INVALID.into());
                }
                let remaining = count - filled;
                let n = remaining.min(entries_per_page);
                let mut entries = vec![0u64; n];
                mem.read_at(next_list, entries.as_mut_bytes())
                    .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
                // A list page that cannot hold the rest of the range ends in
                // a pointer to the next list page, not a data page.
                let data_entries = if n == remaining { n } else { n - 1 };
                for entry in &entries[..data_entries] {
                    if *entry == 0 {
                        return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                    }
                    if *entry & !page_mask != 0 {
                        return Err(spec::Status::PRP_OFFSET_INVALID.into());
                    }
                }
                pages[filled..filled + data_entries].copy_from_slice(&entries[..data_entries]);
                filled += data_entries;
                if data_entries < n {
                    next_list = entries[n - 1] & page_mask;
                }
            }
        }

        Ok(Self {
            offset,
            len,
            page_size,
            pages,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reads from the range into `buf`, which must not exceed the range.
    pub fn read(&self, mem: &HostMemory, buf: &mut [u8]) -> Result<(), NvmeError> {
        let mut pos = 0;
        for (addr, n) in self.segments(buf.len()) {
            mem.read_at(addr, &mut buf[pos..pos + n])
                .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
            pos += n;
        }
        Ok(())
    }

    /// Writes `buf` into the range, which it must not exceed.
    pub fn write(&self, mem: &HostMemory, buf: &[u8]) -> Result<(), NvmeError> {
        let mut pos = 0;
        for (addr, n) in self.segments(buf.len()) {
            mem.write_at(addr, &buf[pos..pos + n])
                .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
            pos += n;
        }
        Ok(())
    }

    /// Per-page (address, length) chunks covering `total` bytes.
    fn segments(&self, total: usize) -> Vec<(u64, usize)> {
        debug_assert!(total <= self.len);
        let mut out = Vec::new();
        let mut offset = self.offset;
        let mut page = 0;
        let mut left = total.min(self.len);
        while left > 0 {
            let chunk = (self.page_size - offset).min(left);
            out.push((self.pages[page] + offset as u64, chunk));
            left -= chunk;
            offset = 0;
            page += 1;
        }
        out
    }
}
