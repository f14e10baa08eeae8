/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! The handoff record: a language-neutral description of every capability and
//! memory region a process builder grants a child, serialized into a page the
//! child maps at `INIT_DATA_ADDR` and decodes in `initProcess`.
//!
//! Grounded on the schema table in spec section 6 and the pack/pack of the
//! `oxidecomputer-hubris` tree for the serializer choice: that tree's
//! `sys/userlib`/`sys/abi` crates already pair `serde` (`no_std`, `alloc`
//! feature) with `ssmarshal` for exactly this kind of compact wire struct; the
//! teacher itself ships no serializer, so this is pack enrichment rather than
//! teacher imitation.

#![no_std]

extern crate alloc;

use alloc::{string::String, vec::Vec};
use serde::{Deserialize, Serialize};

/// A contiguous range of untyped memory granted to the child, identified by
/// the slot it was copied into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UntypedRecord {
    pub slot: u32,
    pub size_bits: u32,
    pub phys_addr: u64,
    pub is_device: bool,
}

/// A named endpoint or notification capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedSlot {
    pub name: String,
    pub slot: u32,
}

/// A shared memory region mapped (or mappable) at a fixed child virtual address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemRecord {
    pub name: String,
    pub addr: u64,
    pub length_bytes: u64,
}

/// A device memory region mapped into the child, with one capability per frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub size_bits: u32,
    pub num_pages: u32,
    pub caps: Vec<u32>,
}

/// An IRQ line bound to a notification/endpoint the child can wait on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqRecord {
    pub name: String,
    pub irq_slot: u32,
    pub ep_slot: u32,
    pub number: u32,
}

/// The full handoff record, matching the schema in spec section 6.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HandoffRecord {
    pub proc_name: String,
    pub cnode_size_bits: u32,
    pub cnode_next_free: u32,
    pub stack_pages: u32,
    pub stack_top_addr: u64,
    pub untypeds: Vec<UntypedRecord>,
    pub endpoints: Vec<NamedSlot>,
    pub notifications: Vec<NamedSlot>,
    pub shmem_regions: Vec<ShmemRecord>,
    pub device_regions: Vec<DeviceRecord>,
    pub irq_lines: Vec<IrqRecord>,
}

/// Errors while encoding or decoding a handoff record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, snafu::Snafu)]
pub enum HandoffError {
    #[snafu(display("handoff record did not fit in the destination buffer"))]
    BufferTooSmall,
    #[snafu(display("handoff record bytes were not a valid encoding"))]
    InvalidEncoding,
}

impl From<ssmarshal::Error> for HandoffError {
    fn from(e: ssmarshal::Error) -> Self {
        match e {
            ssmarshal::Error::EndOfStream => HandoffError::BufferTooSmall,
            _ => HandoffError::InvalidEncoding,
        }
    }
}

impl HandoffRecord {
    /// Prepend an untyped region, matching the reference library's linked-list
    /// prepend order (spec 4.5: "the child sees resources in reverse
    /// registration order"; acceptable because lookup is by name, not position).
    pub fn add_untyped(&mut self, rec: UntypedRecord) {
        self.untypeds.insert(0, rec);
    }

    pub fn add_endpoint(&mut self, rec: NamedSlot) {
        self.endpoints.insert(0, rec);
    }

    pub fn add_notification(&mut self, rec: NamedSlot) {
        self.notifications.insert(0, rec);
    }

    pub fn add_shmem(&mut self, rec: ShmemRecord) {
        self.shmem_regions.insert(0, rec);
    }

    pub fn add_device(&mut self, rec: DeviceRecord) {
        self.device_regions.insert(0, rec);
    }

    pub fn add_irq(&mut self, rec: IrqRecord) {
        self.irq_lines.insert(0, rec);
    }

    /// The exact serialized length, used to compute `INIT_DATA_SIZE` (unpadded)
    /// and the page-rounded reservation size (spec 4.5, step 1-2).
    pub fn encoded_len(&self) -> Result<usize, HandoffError> {
        // ssmarshal has no size-only precomputation; serialize into a
        // generously sized scratch buffer and report how much was used.
        let mut scratch = [0u8; 16 * 1024];
        Ok(ssmarshal::serialize(&mut scratch, self)?)
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, HandoffError> {
        Ok(ssmarshal::serialize(buf, self)?)
    }

    /// Deserialize a record previously written by [`HandoffRecord::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, HandoffError> {
        let (record, _used): (Self, usize) = ssmarshal::deserialize(buf)?;
        Ok(record)
    }

    /// Round `self.encoded_len()` up to a multiple of `page_size`.
    pub fn pages_required(&self, page_size: usize) -> Result<usize, HandoffError> {
        let len = self.encoded_len()?;
        Ok((len + page_size - 1) / page_size)
    }

    pub fn lookup_endpoint(&self, name: &str) -> Option<u32> {
        self.endpoints.iter().find(|e| e.name == name).map(|e| e.slot)
    }

    pub fn lookup_notification(&self, name: &str) -> Option<u32> {
        self.notifications.iter().find(|e| e.name == name).map(|e| e.slot)
    }

    pub fn lookup_shmem(&self, name: &str) -> Option<&ShmemRecord> {
        self.shmem_regions.iter().find(|e| e.name == name)
    }

    pub fn lookup_device(&self, name: &str) -> Option<&DeviceRecord> {
        self.device_regions.iter().find(|e| e.name == name)
    }

    pub fn lookup_irq(&self, name: &str) -> Option<&IrqRecord> {
        self.irq_lines.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn round_trip_preserves_every_field() {
        let mut record = HandoffRecord {
            proc_name: "child".to_string(),
            cnode_size_bits: 10,
            cnode_next_free: 8,
            stack_pages: 4,
            stack_top_addr: 0x2000_0000,
            ..Default::default()
        };
        record.add_untyped(UntypedRecord {
            slot: 20,
            size_bits: 12,
            phys_addr: 0x8000_0000,
            is_device: false,
        });
        record.add_endpoint(NamedSlot {
            name: "ep".to_string(),
            slot: 9,
        });

        let mut buf = [0u8; 1024];
        let len = record.encode(&mut buf).unwrap();
        let decoded = HandoffRecord::decode(&buf[..len]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn lookup_by_name_finds_first_match() {
        let mut record = HandoffRecord::default();
        record.add_endpoint(NamedSlot {
            name: "ep".to_string(),
            slot: 11,
        });
        record.add_endpoint(NamedSlot {
            name: "ep".to_string(),
            slot: 22,
        });
        // Most recently prepended ("first" in the reversed list) wins.
        assert_eq!(record.lookup_endpoint("ep"), Some(22));
        assert_eq!(record.lookup_endpoint("missing"), None);
    }

    #[test]
    fn pages_required_rounds_up() {
        let record = HandoffRecord {
            proc_name: "p".to_string(),
            ..Default::default()
        };
        let len = record.encoded_len().unwrap();
        let pages = record.pages_required(4096).unwrap();
        assert!(pages * 4096 >= len);
        assert!(len > 0);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let record = HandoffRecord {
            proc_name: "p".to_string(),
            ..Default::default()
        };
        let mut buf = [0u8; 1024];
        let len = record.encode(&mut buf).unwrap();
        assert!(HandoffRecord::decode(&buf[..len - 1]).is_err());
    }
}
