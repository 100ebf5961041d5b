//! Fixed-size trace record codec and serial-merged reader.
//!
//! A trace is a stream of 27-byte little-endian records
//! `{type: u8, core: u16, line_addr: u64, cycle: u64, serial: u64}`.
//! Serials are assigned monotonically at capture time across all cores;
//! the reader demultiplexes records into per-core queues and always yields
//! the globally smallest serial next (ties broken by core id), which is
//! what makes replay deterministic.

use std::io::{BufReader, BufWriter, Read, Write};

use crate::engine::NvOverlay;
use crate::error::{NvError, Result};

/// Byte size of one encoded record.
pub const RECORD_BYTES: usize = 27;

/// What a trace record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// L1 load.
    Load = 0,
    /// L1 store.
    Store = 1,
    /// L1 eviction.
    L1Evict = 2,
    /// L2 eviction.
    L2Evict = 3,
    /// LLC eviction.
    L3Evict = 4,
    /// Instruction-count marker (ignored by the engine).
    Inst = 5,
    /// Cycle marker (ignored by the engine).
    Cycle = 6,
}

impl EventKind {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => EventKind::Load,
            1 => EventKind::Store,
            2 => EventKind::L1Evict,
            3 => EventKind::L2Evict,
            4 => EventKind::L3Evict,
            5 => EventKind::Inst,
            6 => EventKind::Cycle,
            other => return Err(NvError::UnknownEventType(other)),
        })
    }
}

/// One captured event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    /// Event type.
    pub kind: EventKind,
    /// Issuing core.
    pub core: u16,
    /// Cache-line address.
    pub line_addr: u64,
    /// Cycle the event was observed at.
    pub cycle: u64,
    /// Global capture order.
    pub serial: u64,
}

impl TraceRecord {
    /// Encode into the packed little-endian wire form.
    pub fn encode(&self) -> [u8; RECORD_BYTES] {
        let mut buf = [0u8; RECORD_BYTES];
        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.core.to_le_bytes());
        buf[3..11].copy_from_slice(&self.line_addr.to_le_bytes());
        buf[11..19].copy_from_slice(&self.cycle.to_le_bytes());
        buf[19..27].copy_from_slice(&self.serial.to_le_bytes());
        buf
    }

    /// Decode from the packed little-endian wire form.
    pub fn decode(buf: &[u8; RECORD_BYTES]) -> Result<Self> {
        Ok(TraceRecord {
            kind: EventKind::from_u8(buf[0])?,
            core: u16::from_le_bytes(buf[1..3].try_into().expect("2 bytes")),
            line_addr: u64::from_le_bytes(buf[3..11].try_into().expect("8 bytes")),
            cycle: u64::from_le_bytes(buf[11..19].try_into().expect("8 bytes")),
            serial: u64::from_le_bytes(buf[19..27].try_into().expect("8 bytes")),
        })
    }
}

/// Appends records to a sink, assigning capture serials.
pub struct TraceWriter<W: Write> {
    sink: BufWriter<W>,
    next_serial: u64,
    record_count: u64,
}

impl<W: Write> TraceWriter<W> {
    /// Wrap a sink.
    pub fn new(sink: W) -> Self {
        TraceWriter {
            sink: BufWriter::new(sink),
            next_serial: 0,
            record_count: 0,
        }
    }

    /// Append one event, stamping it with the next serial.
    pub fn emit(&mut self, kind: EventKind, core: u16, line_addr: u64, cycle: u64) -> Result<()> {
        let record = TraceRecord {
            kind,
            core,
            line_addr,
            cycle,
            serial: self.next_serial,
        };
        self.next_serial += 1;
        self.record_count += 1;
        self.sink.write_all(&record.encode())?;
        Ok(())
    }

    /// Records emitted so far.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Flush buffered records to the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Replays a trace in capture order from per-core queues.
pub struct TraceReader {
    /// Per-core FIFO queues; front is each stream's next record.
    queues: Vec<std::collections::VecDeque<TraceRecord>>,
}

impl TraceReader {
    /// Read every record from `source`, demultiplexing by core.
    ///
    /// Fails on truncated input, unknown event types, or core ids at or
    /// above `cores`.
    pub fn new<R: Read>(source: R, cores: u32) -> Result<Self> {
        let mut reader = BufReader::new(source);
        let mut queues = vec![std::collections::VecDeque::new(); cores as usize];
        let mut buf = [0u8; RECORD_BYTES];
        loop {
            match read_record(&mut reader, &mut buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Record => {
                    let record = TraceRecord::decode(&buf)?;
                    if record.core as u32 >= cores {
                        return Err(NvError::CoreOutOfRange { core: record.core, cores });
                    }
                    queues[record.core as usize].push_back(record);
                }
            }
        }
        Ok(TraceReader { queues })
    }

    /// Records still queued.
    pub fn remaining(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }

    /// Pop the record with the globally smallest serial; ties go to the
    /// lowest core id.
    pub fn next(&mut self) -> Option<TraceRecord> {
        let core = self
            .queues
            .iter()
            .enumerate()
            .filter_map(|(core, queue)| queue.front().map(|record| (record.serial, core)))
            .min()?
            .1;
        self.queues[core].pop_front()
    }
}

enum ReadOutcome {
    Record,
    Eof,
}

/// Fill `buf` with one record, distinguishing clean EOF from truncation.
fn read_record<R: Read>(reader: &mut R, buf: &mut [u8; RECORD_BYTES]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < RECORD_BYTES {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(ReadOutcome::Eof)
            } else {
                Err(NvError::TruncatedTrace(filled))
            };
        }
        filled += n;
    }
    Ok(ReadOutcome::Record)
}

/// Feed every memory event of a trace into `engine`, in capture order.
///
/// `Inst` and `Cycle` markers are skipped. Returns the cycle of the last
/// record replayed.
pub fn drive(engine: &mut NvOverlay, reader: &mut TraceReader) -> u64 {
    let mut last_cycle = 0;
    while let Some(record) = reader.next() {
        last_cycle = record.cycle;
        let core = record.core as u32;
        match record.kind {
            EventKind::Load => engine.load(core, record.line_addr, record.cycle),
            EventKind::Store => engine.store(core, record.line_addr, record.cycle),
            EventKind::L1Evict => engine.l1_evict(core, record.line_addr, record.cycle),
            EventKind::L2Evict => engine.l2_evict(core, record.line_addr, record.cycle),
            EventKind::L3Evict => engine.l3_evict(core, record.line_addr, record.cycle),
            EventKind::Inst | EventKind::Cycle => {}
        }
    }
    last_cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn test_record_round_trip() {
        let record = TraceRecord {
            kind: EventKind::Store,
            core: 3,
            line_addr: 0xDEAD_BE40,
            cycle: 123_456,
            serial: 42,
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), RECORD_BYTES);
        assert_eq!(TraceRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = [0u8; RECORD_BYTES];
        buf[0] = 9;
        assert!(matches!(
            TraceRecord::decode(&buf),
            Err(NvError::UnknownEventType(9))
        ));
    }

    #[test]
    fn test_writer_reader_round_trip_through_file() {
        let mut file = tempfile::tempfile().expect("temp file");
        {
            let mut writer = TraceWriter::new(&mut file);
            writer.emit(EventKind::Store, 0, 0x1000, 0).unwrap();
            writer.emit(EventKind::Load, 1, 0x2000, 1).unwrap();
            writer.emit(EventKind::L3Evict, 0, 0x1000, 2).unwrap();
            writer.flush().unwrap();
            assert_eq!(writer.record_count(), 3);
        }
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = TraceReader::new(&file, 2).unwrap();
        assert_eq!(reader.remaining(), 3);
        let kinds: Vec<EventKind> = std::iter::from_fn(|| reader.next())
            .map(|record| record.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Store, EventKind::Load, EventKind::L3Evict]);
    }

    #[test]
    fn test_reader_merges_by_serial_across_cores() {
        // Core 1's records captured between core 0's: replay interleaves.
        let records = [
            TraceRecord { kind: EventKind::Store, core: 0, line_addr: 0x1000, cycle: 0, serial: 0 },
            TraceRecord { kind: EventKind::Store, core: 1, line_addr: 0x2000, cycle: 1, serial: 1 },
            TraceRecord { kind: EventKind::Store, core: 0, line_addr: 0x1040, cycle: 2, serial: 2 },
        ];
        // Write core 0's stream first, then core 1's, out of serial order.
        let mut bytes = Vec::new();
        for record in [records[0], records[2], records[1]] {
            bytes.extend_from_slice(&record.encode());
        }
        let mut reader = TraceReader::new(bytes.as_slice(), 2).unwrap();
        let serials: Vec<u64> = std::iter::from_fn(|| reader.next())
            .map(|record| record.serial)
            .collect();
        assert_eq!(serials, vec![0, 1, 2]);
    }

    #[test]
    fn test_serial_tie_breaks_by_core_order() {
        let a = TraceRecord { kind: EventKind::Load, core: 1, line_addr: 0x1000, cycle: 0, serial: 5 };
        let b = TraceRecord { kind: EventKind::Load, core: 0, line_addr: 0x2000, cycle: 0, serial: 5 };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&a.encode());
        bytes.extend_from_slice(&b.encode());
        let mut reader = TraceReader::new(bytes.as_slice(), 2).unwrap();
        assert_eq!(reader.next().unwrap().core, 0);
        assert_eq!(reader.next().unwrap().core, 1);
    }

    #[test]
    fn test_truncated_trace_rejected() {
        let record = TraceRecord { kind: EventKind::Load, core: 0, line_addr: 0, cycle: 0, serial: 0 };
        let mut bytes = record.encode().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            TraceReader::new(bytes.as_slice(), 1),
            Err(NvError::TruncatedTrace(3))
        ));
    }

    #[test]
    fn test_out_of_range_core_rejected() {
        let record = TraceRecord { kind: EventKind::Load, core: 7, line_addr: 0, cycle: 0, serial: 0 };
        let bytes = record.encode();
        assert!(matches!(
            TraceReader::new(bytes.as_slice(), 2),
            Err(NvError::CoreOutOfRange { core: 7, cores: 2 })
        ));
    }

    #[test]
    fn test_drive_feeds_engine_and_skips_markers() {
        let mut bytes = Vec::new();
        let events = [
            (EventKind::Store, 0u16, 0x1000u64, 0u64),
            (EventKind::Inst, 0, 0, 1),
            (EventKind::Load, 0, 0x1000, 2),
            (EventKind::Cycle, 0, 0, 3),
        ];
        for (serial, (kind, core, addr, cycle)) in events.into_iter().enumerate() {
            let record = TraceRecord {
                kind,
                core,
                line_addr: addr,
                cycle,
                serial: serial as u64,
            };
            bytes.extend_from_slice(&record.encode());
        }
        let mut reader = TraceReader::new(bytes.as_slice(), 1).unwrap();
        let mut cfg = crate::NvOverlayConfig::default();
        cfg.cores = 1;
        let mut engine = NvOverlay::new(cfg).unwrap();
        let last = drive(&mut engine, &mut reader);
        assert_eq!(last, 3);
        let stats = engine.stats();
        assert_eq!(stats.cores[0].stores, 1);
        assert_eq!(stats.cores[0].loads, 1);
    }
}
