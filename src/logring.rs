//! Log ring module.
//!
//! An append-only ring of fixed-stride telemetry records in non-volatile
//! storage. A slot whose id reads `0xFFFF_FFFF` is empty, which matches the
//! erased state of the backing medium. Each record carries a trailing
//! CRC-16 so a torn write reads back as an empty slot.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{Context, Error};
use crc::{Crc, CRC_16_IBM_SDLC};

use crate::{
    error,
    telemetry::{BmeReading, BmeSlot, DataPoint, GpsState, SysError, ERASED_ID},
};

/// CRC used for the record trailer.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Packed record payload length, without the CRC trailer.
const PAYLOAD_LEN: usize = 70;

/// On-storage record stride, payload plus CRC-16.
pub const RECORD_LEN: usize = PAYLOAD_LEN + 2;

/// One packed on-storage record.
pub type RecordBytes = [u8; RECORD_LEN];

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn put_i16(&mut self, v: i16) {
        self.put(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
}

fn pack_bme(w: &mut Writer, bme: &BmeReading) {
    w.put_u32(bme.press);
    w.put_i16(bme.temp);
    w.put_u8(bme.hum);
}

fn unpack_bme(r: &mut Reader, status_source: SysError, slot: BmeSlot) -> BmeReading {
    BmeReading {
        press: r.u32(),
        temp: r.i16(),
        hum: r.u8(),
        status: status_source.bme_status(slot),
    }
}

/// Packs a snapshot into its bit-stable on-storage form.
pub fn pack_record(point: &DataPoint) -> RecordBytes {
    let mut bytes = [0u8; RECORD_LEN];
    let mut w = Writer {
        buf: &mut bytes,
        pos: 0,
    };

    w.put_u32(point.id);
    w.put_u16(point.reset_count);
    w.put_u32(point.sys_time);
    w.put_u32(point.gps_time);
    w.put_u8(point.gps_state.to_u8());
    w.put_u8(point.gps_sats);
    w.put_u8(point.gps_ttff);
    w.put_u8(point.gps_pdop);
    w.put_u16(point.gps_alt);
    w.put_i32(point.gps_lat);
    w.put_i32(point.gps_lon);
    w.put_u16(point.adc_vbat);
    w.put_u16(point.adc_vsol);
    w.put_u16(point.pac_vbat);
    w.put_u16(point.pac_vsol);
    w.put_i16(point.pac_pbat);
    w.put_i16(point.pac_psol);
    w.put_u16(point.light_intensity);
    pack_bme(&mut w, &point.bme_i1);
    pack_bme(&mut w, &point.bme_e1);
    pack_bme(&mut w, &point.bme_e2);
    w.put_i16(point.stm32_temp);
    w.put_i16(point.si446x_temp);
    w.put_u16(point.sys_error.bits());
    w.put_u8(point.gpio);
    debug_assert_eq!(w.pos, PAYLOAD_LEN);

    let crc = CRC16.checksum(&bytes[..PAYLOAD_LEN]);
    bytes[PAYLOAD_LEN..].copy_from_slice(&crc.to_le_bytes());
    bytes
}

/// Unpacks an on-storage record. Returns `None` for erased slots and for
/// torn records whose CRC does not verify.
pub fn unpack_record(bytes: &RecordBytes) -> Option<DataPoint> {
    let stored = u16::from_le_bytes([bytes[PAYLOAD_LEN], bytes[PAYLOAD_LEN + 1]]);
    if CRC16.checksum(&bytes[..PAYLOAD_LEN]) != stored {
        return None;
    }

    let mut r = Reader { buf: bytes, pos: 0 };
    let id = r.u32();
    if id == ERASED_ID {
        return None;
    }

    let reset_count = r.u16();
    let sys_time = r.u32();
    let gps_time = r.u32();
    let gps_state = GpsState::from_u8(r.u8());
    let gps_sats = r.u8();
    let gps_ttff = r.u8();
    let gps_pdop = r.u8();
    let gps_alt = r.u16();
    let gps_lat = r.i32();
    let gps_lon = r.i32();
    let adc_vbat = r.u16();
    let adc_vsol = r.u16();
    let pac_vbat = r.u16();
    let pac_vsol = r.u16();
    let pac_pbat = r.i16();
    let pac_psol = r.i16();
    let light_intensity = r.u16();

    // The BME statuses live inside sys_error, which sits after the readings.
    let bme_start = r.pos;
    r.pos = bme_start + 3 * 7 + 2 + 2;
    let sys_error = SysError::from_bits_retain(r.u16());
    let gpio = r.u8();
    r.pos = bme_start;

    let bme_i1 = unpack_bme(&mut r, sys_error, BmeSlot::I1);
    let bme_e1 = unpack_bme(&mut r, sys_error, BmeSlot::E1);
    let bme_e2 = unpack_bme(&mut r, sys_error, BmeSlot::E2);
    let stm32_temp = r.i16();
    let si446x_temp = r.i16();

    Some(DataPoint {
        id,
        reset_count,
        sys_time,
        gps_time,
        gps_state,
        gps_sats,
        gps_ttff,
        gps_pdop,
        gps_alt,
        gps_lat,
        gps_lon,
        adc_vbat,
        adc_vsol,
        pac_vbat,
        pac_vsol,
        pac_pbat,
        pac_psol,
        light_intensity,
        bme_i1,
        bme_e1,
        bme_e2,
        stm32_temp,
        si446x_temp,
        sys_error,
        gpio,
    })
}

/// Wear-aware circular record store.
#[derive(Debug)]
pub struct LogRing {
    file: File,
    slots: usize,
    head: usize,
    len: usize,
    last_id: Option<u32>,
}

impl LogRing {
    /// Opens (or creates) the ring and recovers head and length by scanning
    /// every slot.
    pub fn open<P: AsRef<Path>>(path: P, slots: usize) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .context(error::Ring::Open {
                path: path.as_ref().to_owned(),
            })?;

        let expected = (slots * RECORD_LEN) as u64;
        let actual = file
            .metadata()
            .context(error::Ring::Open {
                path: path.as_ref().to_owned(),
            })?
            .len();
        if actual != expected {
            // Fresh or resized storage starts pristine (all erased).
            file.set_len(0).context(error::Ring::Open {
                path: path.as_ref().to_owned(),
            })?;
            let _ = file.seek(SeekFrom::Start(0)).context(error::Ring::Open {
                path: path.as_ref().to_owned(),
            })?;
            let erased = vec![0xFFu8; slots * RECORD_LEN];
            file.write_all(&erased).context(error::Ring::Open {
                path: path.as_ref().to_owned(),
            })?;
        }

        let mut ring = Self {
            file,
            slots,
            head: 0,
            len: 0,
            last_id: None,
        };
        ring.recover()?;
        Ok(ring)
    }

    fn recover(&mut self) -> Result<(), Error> {
        let mut newest: Option<(usize, u32)> = None;
        let mut len = 0;

        for slot in 0..self.slots {
            if let Some(point) = self.read_slot(slot)? {
                len += 1;
                if newest.map_or(true, |(_, id)| point.id > id) {
                    newest = Some((slot, point.id));
                }
            }
        }

        self.len = len;
        if let Some((slot, id)) = newest {
            self.head = (slot + 1) % self.slots;
            self.last_id = Some(id);
        } else {
            self.head = 0;
            self.last_id = None;
        }
        Ok(())
    }

    /// Number of valid records currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the ring holds no valid record.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    fn read_slot(&mut self, slot: usize) -> Result<Option<DataPoint>, Error> {
        let mut bytes = [0u8; RECORD_LEN];
        let _ = self
            .file
            .seek(SeekFrom::Start((slot * RECORD_LEN) as u64))
            .context(error::Ring::SlotIo { slot })?;
        self.file
            .read_exact(&mut bytes)
            .context(error::Ring::SlotIo { slot })?;
        Ok(unpack_record(&bytes))
    }

    fn write_slot(&mut self, slot: usize, bytes: &RecordBytes) -> Result<(), Error> {
        let _ = self
            .file
            .seek(SeekFrom::Start((slot * RECORD_LEN) as u64))
            .context(error::Ring::SlotIo { slot })?;
        self.file
            .write_all(bytes)
            .context(error::Ring::SlotIo { slot })?;
        self.file
            .sync_data()
            .context(error::Ring::SlotIo { slot })?;
        Ok(())
    }

    /// Appends a record at the head, overwriting the oldest slot once the
    /// ring has wrapped. Re-appending the id written last rewrites its slot
    /// in place, which keeps power-on recovery idempotent.
    pub fn append(&mut self, point: &DataPoint) -> Result<(), Error> {
        let bytes = pack_record(point);

        let slot = if self.last_id == Some(point.id) {
            (self.head + self.slots - 1) % self.slots
        } else {
            let slot = self.head;
            self.head = (self.head + 1) % self.slots;
            if self.len < self.slots {
                self.len += 1;
            }
            self.last_id = Some(point.id);
            slot
        };

        self.write_slot(slot, &bytes)
    }

    /// Reads the record at a logical index, 0 being the oldest stored
    /// record. Returns `None` past the end.
    pub fn get(&mut self, index: usize) -> Result<Option<DataPoint>, Error> {
        if index >= self.len {
            return Ok(None);
        }
        // Valid records end at head - 1, so the oldest sits len slots
        // before the head. A torn write at the head must not shift the
        // window onto its slot.
        let start = (self.head + self.slots - self.len) % self.slots;
        let slot = (start + index) % self.slots;
        self.read_slot(slot)
    }

    /// Reads the newest stored record, the seed after a reset.
    pub fn last(&mut self) -> Result<Option<DataPoint>, Error> {
        if self.len == 0 {
            return Ok(None);
        }
        self.get(self.len - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::BmeStatus;

    fn temp_ring(name: &str, slots: usize) -> (std::path::PathBuf, LogRing) {
        let path = std::env::temp_dir().join(format!("picoballoon-ring-{name}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let ring = LogRing::open(&path, slots).unwrap();
        (path, ring)
    }

    fn sample(id: u32) -> DataPoint {
        let mut point = DataPoint::empty(id);
        point.sys_time = id * 60;
        point.gps_state = GpsState::LockedOff;
        point.gps_lat = 377_749_000;
        point.gps_lon = -1_224_194_000;
        point.gps_alt = 12_000;
        point.adc_vbat = 3300;
        point.bme_i1 = BmeReading {
            press: 1_013_250,
            temp: 2137,
            hum: 45,
            status: BmeStatus::Ok,
        };
        point.sys_error.set_bme_status(BmeSlot::I1, BmeStatus::Ok);
        point.sys_error.set_bme_status(BmeSlot::E1, BmeStatus::NotFitted);
        point.sys_error.set_bme_status(BmeSlot::E2, BmeStatus::NotFitted);
        point
    }

    /// Checks the packed record round-trip.
    #[test]
    fn record_round_trip() {
        let point = sample(42);
        let bytes = pack_record(&point);
        let mut restored = unpack_record(&bytes).unwrap();
        // Statuses of unfitted slots come back from sys_error.
        restored.bme_e1.status = point.bme_e1.status;
        restored.bme_e2.status = point.bme_e2.status;
        assert_eq!(restored, point);
    }

    /// A flipped byte makes the record read as empty.
    #[test]
    fn torn_record_reads_empty() {
        let mut bytes = pack_record(&sample(7));
        bytes[20] ^= 0x40;
        assert!(unpack_record(&bytes).is_none());
    }

    /// An erased slot reads as empty even though its CRC is absent.
    #[test]
    fn erased_slot_reads_empty() {
        let bytes = [0xFFu8; RECORD_LEN];
        assert!(unpack_record(&bytes).is_none());
    }

    /// Write three records, reopen, and read them back in order, like a
    /// power cycle in flight.
    #[test]
    fn reopen_round_trip() {
        let (path, mut ring) = temp_ring("reopen", 8);
        for id in 1..=3 {
            ring.append(&sample(id)).unwrap();
        }
        drop(ring);

        let mut ring = LogRing::open(&path, 8).unwrap();
        assert_eq!(ring.len(), 3);
        for (index, id) in (1u32..=3).enumerate() {
            assert_eq!(ring.get(index).unwrap().unwrap().id, id);
        }
        assert!(ring.get(3).unwrap().is_none());
        assert_eq!(ring.last().unwrap().unwrap().id, 3);

        let _ = std::fs::remove_file(&path);
    }

    /// The oldest record is overwritten once the ring wraps.
    #[test]
    fn wrap_overwrites_oldest() {
        let (path, mut ring) = temp_ring("wrap", 4);
        for id in 1..=6 {
            ring.append(&sample(id)).unwrap();
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.get(0).unwrap().unwrap().id, 3);
        assert_eq!(ring.get(3).unwrap().unwrap().id, 6);

        let _ = std::fs::remove_file(&path);
    }

    /// Re-appending the same id rewrites in place instead of advancing.
    #[test]
    fn same_id_rewrites_in_place() {
        let (path, mut ring) = temp_ring("rewrite", 4);
        ring.append(&sample(1)).unwrap();
        let mut updated = sample(1);
        updated.gps_alt = 20_000;
        ring.append(&updated).unwrap();

        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(0).unwrap().unwrap().gps_alt, 20_000);

        let _ = std::fs::remove_file(&path);
    }

    /// A torn write after the ring has wrapped: the reopened ring must
    /// window onto the surviving records, not onto physical slot 0.
    #[test]
    fn recovery_after_wrap_and_torn_head() {
        let (path, mut ring) = temp_ring("wraptorn", 4);
        // ids 1-4 fill slots 0-3; id 5 wraps onto slot 0.
        for id in 1..=5 {
            ring.append(&sample(id)).unwrap();
        }
        drop(ring);

        // Tear the most recently written record (id 5, physical slot 0).
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut ring = LogRing::open(&path, 4).unwrap();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(0).unwrap().unwrap().id, 2);
        assert_eq!(ring.get(1).unwrap().unwrap().id, 3);
        assert_eq!(ring.get(2).unwrap().unwrap().id, 4);
        assert!(ring.get(3).unwrap().is_none());
        // The newest surviving record seeds the next boot.
        assert_eq!(ring.last().unwrap().unwrap().id, 4);

        let _ = std::fs::remove_file(&path);
    }

    /// A torn slot is skipped during recovery.
    #[test]
    fn recovery_skips_torn_slot() {
        let (path, mut ring) = temp_ring("torn", 4);
        for id in 1..=2 {
            ring.append(&sample(id)).unwrap();
        }
        drop(ring);

        // Corrupt the second record on storage.
        let mut raw = std::fs::read(&path).unwrap();
        raw[RECORD_LEN + 10] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut ring = LogRing::open(&path, 4).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(0).unwrap().unwrap().id, 1);

        let _ = std::fs::remove_file(&path);
    }
}
