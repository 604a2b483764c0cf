//! Debug capture of steered frames.
//!
//! When enabled, the drainer tees each steered frame and its extracted
//! record into a [`CaptureSink`] before invoking the analysis callback,
//! up to a configured frame cap. The bundled [`PcapCapture`] writes a
//! classic PCAP file readable by standard tools, with the records in a
//! JSON-lines sidecar.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::record::FeatureRecord;

/// Destination for captured frames and records.
///
/// `capture` is called from drainer threads under the capture lock; a
/// slow sink slows capture, not the engine (the cap keeps this bounded).
pub trait CaptureSink: Send {
    fn capture(&mut self, frame: &[u8], record: &FeatureRecord) -> io::Result<()>;
}

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

/// Classic-PCAP sink with a JSON-lines record sidecar.
///
/// `path` receives the frames; `<path>.records.jsonl` receives one JSON
/// record per captured frame, in the same order.
pub struct PcapCapture {
    frames: BufWriter<File>,
    records: BufWriter<File>,
    snaplen: u32,
}

impl PcapCapture {
    pub fn create<P: AsRef<Path>>(path: P, snaplen: u32) -> io::Result<Self> {
        let path = path.as_ref();
        let mut sidecar = PathBuf::from(path);
        sidecar.as_mut_os_string().push(".records.jsonl");

        let mut frames = BufWriter::new(File::create(path)?);
        let records = BufWriter::new(File::create(&sidecar)?);

        // PCAP global header, native byte order (the magic tells readers).
        frames.write_all(&PCAP_MAGIC.to_ne_bytes())?;
        frames.write_all(&PCAP_VERSION_MAJOR.to_ne_bytes())?;
        frames.write_all(&PCAP_VERSION_MINOR.to_ne_bytes())?;
        frames.write_all(&0i32.to_ne_bytes())?; // thiszone
        frames.write_all(&0u32.to_ne_bytes())?; // sigfigs
        frames.write_all(&snaplen.to_ne_bytes())?;
        frames.write_all(&LINKTYPE_ETHERNET.to_ne_bytes())?;

        Ok(Self {
            frames,
            records,
            snaplen,
        })
    }
}

impl CaptureSink for PcapCapture {
    fn capture(&mut self, frame: &[u8], record: &FeatureRecord) -> io::Result<()> {
        let ts_secs = (record.timestamp / 1_000_000_000) as u32;
        let ts_micros = (record.timestamp % 1_000_000_000 / 1_000) as u32;
        let incl_len = (frame.len() as u32).min(self.snaplen);

        self.frames.write_all(&ts_secs.to_ne_bytes())?;
        self.frames.write_all(&ts_micros.to_ne_bytes())?;
        self.frames.write_all(&incl_len.to_ne_bytes())?;
        self.frames.write_all(&(frame.len() as u32).to_ne_bytes())?;
        self.frames.write_all(&frame[..incl_len as usize])?;

        serde_json::to_writer(&mut self.records, record)?;
        self.records.write_all(b"\n")?;

        self.frames.flush()?;
        self.records.flush()
    }
}

/// Shared capture state: the sink plus the remaining-frame budget.
///
/// The budget is checked lock-free so drainers skip the tee entirely
/// once the cap is exhausted.
pub struct CaptureTee {
    sink: Mutex<Box<dyn CaptureSink>>,
    remaining: AtomicU32,
}

impl CaptureTee {
    pub fn new(sink: Box<dyn CaptureSink>, max_frames: u32) -> Self {
        Self {
            sink: Mutex::new(sink),
            remaining: AtomicU32::new(max_frames),
        }
    }

    /// Frames still within the cap.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Tee one frame if the budget allows. Sink errors are logged and
    /// end the capture early; they never disturb record delivery.
    pub fn tee(&self, frame: &[u8], record: &FeatureRecord) {
        if self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
        {
            return;
        }

        let mut sink = self.sink.lock();
        if let Err(err) = sink.capture(frame, record) {
            tracing::warn!(error = %err, "capture sink failed; disabling capture");
            self.remaining.store(0, Ordering::Relaxed);
        }
    }
}
