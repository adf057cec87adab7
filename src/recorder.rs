//! # Recording and Data Storage Module
//!
//! Persists delivered frames to disk without doing file I/O on the driver's
//! callback. Frames are copied into a bounded queue and written by a
//! dedicated writer thread in delivery order.
//!
//! ## Architecture
//! - **FrameWriter**: `open` / `write` / `close` interface shared by both strategies
//! - **StreamWriter**: One CSV file, appended frame after frame
//! - **SegmentWriter**: One HDF5 file per frame, named `0.h5`, `1.h5`, ...
//! - **RecordingSession**: Writer + frame counter + manifest for one recording
//! - **Recorder**: Owns the writer thread and the queue feeding it
//!
//! ## File Layout
//! ```text
//! stream:   {dir}/{task}_{YYYYMMDDTHHMMSS}.csv      one row per sample, one column per channel
//!           {dir}/{task}_{YYYYMMDDTHHMMSS}.json     manifest
//! segment:  {dir}/{task}_{YYYYMMDDTHHMMSS}/0.h5     dataset "samples" [frame_size, channels]
//!           {dir}/{task}_{YYYYMMDDTHHMMSS}/1.h5     attribute "frame_index"
//!           {dir}/{task}_{YYYYMMDDTHHMMSS}/manifest.json
//! ```
//!
//! ## Queue Policy
//! The queue holds `RECORDER_QUEUE_FRAMES` frames. When the disk falls that
//! far behind, `submit` blocks the driver callback until the writer catches
//! up; frames are never dropped or reordered.

use crate::acquisition::AcquisitionConfig;
use crate::engine::AcquisitionEvent;
use crate::error::WriterError;
use crate::frame::Frame;
use crate::metadata::{write_manifest, RecordingManifest};
use crossbeam_channel::{bounded, Receiver, Sender};
use hdf5::File;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Frames buffered between the driver callback and the writer thread
pub const RECORDER_QUEUE_FRAMES: usize = 64;

const SEGMENT_DATASET: &str = "samples";
const SEGMENT_INDEX_ATTR: &str = "frame_index";

/// Persistence strategy, chosen when recording starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterType {
    Stream,
    Segment,
}

impl WriterType {
    pub fn extension(&self) -> &'static str {
        match self {
            WriterType::Stream => "csv",
            WriterType::Segment => "h5",
        }
    }
}

impl fmt::Display for WriterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterType::Stream => write!(f, "stream"),
            WriterType::Segment => write!(f, "segment"),
        }
    }
}

impl FromStr for WriterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(WriterType::Stream),
            "segment" => Ok(WriterType::Segment),
            other => Err(format!("unknown writer type '{}', expected stream or segment", other)),
        }
    }
}

/// How a recording's file (or segment directory) is named
#[derive(Debug, Clone, PartialEq)]
pub enum NamingPolicy {
    /// Use this exact file name
    Fixed(String),
    /// `{prefix}_{YYYYMMDDTHHMMSS}.{extension}`, resolved at open time
    Timestamped { prefix: String, extension: String },
}

impl NamingPolicy {
    pub fn timestamped(prefix: impl Into<String>, writer_type: WriterType) -> Self {
        NamingPolicy::Timestamped {
            prefix: prefix.into(),
            extension: writer_type.extension().to_string(),
        }
    }

    pub fn resolve(&self) -> String {
        match self {
            NamingPolicy::Fixed(name) => name.clone(),
            NamingPolicy::Timestamped { prefix, extension } => format!(
                "{}_{}.{}",
                prefix,
                chrono::Local::now().format("%Y%m%dT%H%M%S"),
                extension
            ),
        }
    }
}

fn check_extension(path: &Path, expected: &'static str) -> Result<(), WriterError> {
    if path.extension().and_then(|e| e.to_str()) == Some(expected) {
        Ok(())
    } else {
        Err(WriterError::IllegalExtension {
            path: path.to_path_buf(),
            expected,
        })
    }
}

/// Common interface of the persistence strategies
pub trait FrameWriter {
    /// Prepare the target under `directory`; returns the file or directory written to
    fn open(&mut self, directory: &Path, naming: &NamingPolicy) -> Result<PathBuf, WriterError>;
    fn write(&mut self, frame: &Frame) -> Result<(), WriterError>;
    /// Finalize. Closing a closed writer is a no-op.
    fn close(&mut self) -> Result<(), WriterError>;
    fn is_open(&self) -> bool;
}

/// Appends every frame to one delimited text file
#[derive(Default)]
pub struct StreamWriter {
    writer: Option<csv::Writer<fs::File>>,
    path: Option<PathBuf>,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameWriter for StreamWriter {
    fn open(&mut self, directory: &Path, naming: &NamingPolicy) -> Result<PathBuf, WriterError> {
        if self.writer.is_some() {
            return Err(WriterError::WriterState("stream writer is already open"));
        }
        let path = directory.join(naming.resolve());
        check_extension(&path, WriterType::Stream.extension())?;

        fs::create_dir_all(directory)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(csv::WriterBuilder::new().has_headers(false).from_writer(file));
        self.path = Some(path.clone());

        log::info!("Stream recording to {}", path.display());
        Ok(path)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), WriterError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(WriterError::WriterState("stream writer is not open"))?;
        for row in frame.transposed_rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriterError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if let Some(path) = &self.path {
                log::info!("Stream recording closed: {}", path.display());
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

/// Writes each frame to its own numbered HDF5 file
#[derive(Debug, Default)]
pub struct SegmentWriter {
    directory: Option<PathBuf>,
    next_index: u64,
}

impl SegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the file the next `write` creates
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Restart numbering at zero
    #[allow(dead_code)]
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    pub fn segment_path(directory: &Path, index: u64) -> PathBuf {
        directory.join(format!("{}.{}", index, WriterType::Segment.extension()))
    }
}

impl FrameWriter for SegmentWriter {
    fn open(&mut self, directory: &Path, naming: &NamingPolicy) -> Result<PathBuf, WriterError> {
        if self.directory.is_some() {
            return Err(WriterError::WriterState("segment writer is already open"));
        }
        let name = PathBuf::from(naming.resolve());
        check_extension(&directory.join(&name), WriterType::Segment.extension())?;

        let stem = name.file_stem().unwrap_or(name.as_os_str());
        let session_dir = directory.join(stem);
        fs::create_dir_all(&session_dir)?;

        self.next_index = 0;
        self.directory = Some(session_dir.clone());
        log::info!("Segment recording to {}", session_dir.display());
        Ok(session_dir)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), WriterError> {
        let directory = self
            .directory
            .as_ref()
            .ok_or(WriterError::WriterState("segment writer is not open"))?;
        let path = Self::segment_path(directory, self.next_index);

        let file = File::create(&path)?;
        let dataset = file
            .new_dataset::<f64>()
            .shape((frame.frame_size(), frame.channels()))
            .create(SEGMENT_DATASET)?;
        dataset.write_raw(&frame.transposed_flat())?;
        dataset
            .new_attr::<u64>()
            .create(SEGMENT_INDEX_ATTR)?
            .write_scalar(&self.next_index)?;

        log::trace!("Segment {} written", path.display());
        self.next_index += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriterError> {
        if let Some(directory) = self.directory.take() {
            log::info!(
                "Segment recording closed: {} ({} segments)",
                directory.display(),
                self.next_index
            );
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.directory.is_some()
    }
}

/// The strategy selected for one recording, fixed while it is open
pub enum RecordingWriter {
    Stream(StreamWriter),
    Segment(SegmentWriter),
}

impl RecordingWriter {
    pub fn new(writer_type: WriterType) -> Self {
        match writer_type {
            WriterType::Stream => RecordingWriter::Stream(StreamWriter::new()),
            WriterType::Segment => RecordingWriter::Segment(SegmentWriter::new()),
        }
    }

    /// Files produced so far, segment mode only
    pub fn segment_count(&self) -> Option<u64> {
        match self {
            RecordingWriter::Stream(_) => None,
            RecordingWriter::Segment(w) => Some(w.next_index()),
        }
    }
}

impl FrameWriter for RecordingWriter {
    fn open(&mut self, directory: &Path, naming: &NamingPolicy) -> Result<PathBuf, WriterError> {
        match self {
            RecordingWriter::Stream(w) => w.open(directory, naming),
            RecordingWriter::Segment(w) => w.open(directory, naming),
        }
    }

    fn write(&mut self, frame: &Frame) -> Result<(), WriterError> {
        match self {
            RecordingWriter::Stream(w) => w.write(frame),
            RecordingWriter::Segment(w) => w.write(frame),
        }
    }

    fn close(&mut self) -> Result<(), WriterError> {
        match self {
            RecordingWriter::Stream(w) => w.close(),
            RecordingWriter::Segment(w) => w.close(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            RecordingWriter::Stream(w) => w.is_open(),
            RecordingWriter::Segment(w) => w.is_open(),
        }
    }
}

/// Everything needed to open a recording
#[derive(Debug, Clone)]
pub struct RecordingSpec {
    pub writer_type: WriterType,
    pub directory: PathBuf,
    pub naming: NamingPolicy,
    pub config: AcquisitionConfig,
}

/// One open recording and its manifest
pub struct RecordingSession {
    writer: RecordingWriter,
    target: PathBuf,
    manifest_path: PathBuf,
    manifest: RecordingManifest,
    frames: u64,
    closed: bool,
}

impl RecordingSession {
    pub fn open(spec: RecordingSpec) -> Result<Self, WriterError> {
        let mut writer = RecordingWriter::new(spec.writer_type);
        let target = writer.open(&spec.directory, &spec.naming)?;
        let manifest_path = match spec.writer_type {
            WriterType::Stream => target.with_extension("json"),
            WriterType::Segment => target.join("manifest.json"),
        };
        let manifest = RecordingManifest::new(&spec.config, spec.writer_type);
        if let Err(e) = write_manifest(&manifest_path, &manifest) {
            let _ = writer.close();
            return Err(e);
        }

        Ok(Self {
            writer,
            target,
            manifest_path,
            manifest,
            frames: 0,
            closed: false,
        })
    }

    pub fn record(&mut self, frame: &Frame) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::WriterState("recording session is closed"));
        }
        self.writer.write(frame)?;
        self.frames += 1;
        self.manifest.frame_count = self.frames;

        // keep the on-disk count accurate after every new segment
        if let Some(segments) = self.writer.segment_count() {
            self.manifest.segment_count = segments;
            write_manifest(&self.manifest_path, &self.manifest)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), WriterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.close()?;
        self.manifest.frame_count = self.frames;
        write_manifest(&self.manifest_path, &self.manifest)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Stream file or segment directory
    pub fn target(&self) -> &Path {
        &self.target
    }

    #[cfg(test)]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }
}

/// Command sent to the writer thread
enum RecorderCommand {
    Start {
        spec: RecordingSpec,
        reply: Sender<Result<PathBuf, WriterError>>,
    },
    Frame(Frame),
    Stop {
        reply: Sender<Result<u64, WriterError>>,
    },
    Shutdown,
}

/// State the writer thread reports back
#[derive(Default)]
struct RecorderShared {
    faulted: AtomicBool,
    frames: AtomicU64,
}

/// Moves frames off the driver callback onto a dedicated writer thread
pub struct Recorder {
    command_tx: Sender<RecorderCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
    /// Held across queue sends so no frame is enqueued after a stop
    enabled: Mutex<bool>,
    shared: Arc<RecorderShared>,
}

impl Recorder {
    pub fn new(events: Sender<AcquisitionEvent>) -> Self {
        let (command_tx, command_rx) = bounded(RECORDER_QUEUE_FRAMES);
        let shared = Arc::new(RecorderShared::default());
        let shared_clone = shared.clone();

        let writer_thread = thread::spawn(move || {
            Self::writer_loop(command_rx, shared_clone, events);
        });

        Self {
            command_tx,
            writer_thread: Some(writer_thread),
            enabled: Mutex::new(false),
            shared,
        }
    }

    /// Open a recording; returns the stream file or segment directory
    pub fn start(&self, spec: RecordingSpec) -> Result<PathBuf, WriterError> {
        if self.is_recording() {
            return Err(WriterError::WriterState("recording already in progress"));
        }
        // a session that faulted is still marked enabled
        *self.lock_enabled() = false;

        let (reply_tx, reply_rx) = bounded(1);
        self.command_tx
            .send(RecorderCommand::Start { spec, reply: reply_tx })
            .map_err(|_| WriterError::WriterState("writer thread is not running"))?;
        let target = reply_rx
            .recv()
            .map_err(|_| WriterError::WriterState("writer thread is not running"))??;

        self.shared.faulted.store(false, Ordering::Release);
        self.shared.frames.store(0, Ordering::Release);
        *self.lock_enabled() = true;
        Ok(target)
    }

    /// Flush queued frames and close the recording. Returns the frames written.
    pub fn stop(&self) -> Result<u64, WriterError> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let mut enabled = self.lock_enabled();
            if !*enabled {
                return Ok(self.frames_recorded());
            }
            *enabled = false;
            self.command_tx
                .send(RecorderCommand::Stop { reply: reply_tx })
                .map_err(|_| WriterError::WriterState("writer thread is not running"))?;
        }
        let frames = reply_rx
            .recv()
            .map_err(|_| WriterError::WriterState("writer thread is not running"))??;
        log::info!("Recording stopped after {} frames", frames);
        Ok(frames)
    }

    /// Queue a copy of `frame` if recording; blocks while the queue is full
    pub fn submit(&self, frame: &Frame) {
        let enabled = self.lock_enabled();
        if !*enabled || self.shared.faulted.load(Ordering::Acquire) {
            return;
        }
        if self.command_tx.send(RecorderCommand::Frame(frame.clone())).is_err() {
            log::error!("Writer thread is gone; frame not recorded");
        }
    }

    pub fn is_recording(&self) -> bool {
        *self.lock_enabled() && !self.shared.faulted.load(Ordering::Acquire)
    }

    /// Frames the writer thread has persisted in the current or last recording
    pub fn frames_recorded(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    fn lock_enabled(&self) -> std::sync::MutexGuard<'_, bool> {
        self.enabled.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writer thread loop
    ///
    /// Owns the open session; all file I/O happens here, in queue order.
    fn writer_loop(
        command_rx: Receiver<RecorderCommand>,
        shared: Arc<RecorderShared>,
        events: Sender<AcquisitionEvent>,
    ) {
        let mut session: Option<RecordingSession> = None;

        loop {
            match command_rx.recv() {
                Ok(RecorderCommand::Start { spec, reply }) => {
                    Self::close_session(&mut session);
                    let result = RecordingSession::open(spec).map(|opened| {
                        let target = opened.target().to_path_buf();
                        session = Some(opened);
                        target
                    });
                    let _ = reply.send(result);
                }
                Ok(RecorderCommand::Frame(frame)) => {
                    let Some(active) = session.as_mut() else {
                        continue;
                    };
                    let outcome = active.record(&frame).map(|_| active.frames_written());
                    match outcome {
                        Ok(frames) => shared.frames.store(frames, Ordering::Release),
                        Err(e) => {
                            log::error!("Recording failed, closing session: {}", e);
                            shared.faulted.store(true, Ordering::Release);
                            Self::close_session(&mut session);
                            let _ = events.send(AcquisitionEvent::RecordingFailed(e.to_string()));
                        }
                    }
                }
                Ok(RecorderCommand::Stop { reply }) => {
                    let result = match session.take() {
                        Some(mut active) => active.close().map(|_| active.frames_written()),
                        None => Ok(shared.frames.load(Ordering::Acquire)),
                    };
                    let _ = reply.send(result);
                }
                Ok(RecorderCommand::Shutdown) => {
                    Self::close_session(&mut session);
                    log::info!("Writer thread stopped");
                    break;
                }
                Err(_) => {
                    Self::close_session(&mut session);
                    log::info!("Writer thread: command channel closed");
                    break;
                }
            }
        }
    }

    fn close_session(session: &mut Option<RecordingSession>) {
        if let Some(mut active) = session.take() {
            if let Err(e) = active.close() {
                log::error!("Failed to close recording {}: {}", active.target().display(), e);
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.command_tx.send(RecorderCommand::Shutdown);
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Read a stream recording back into frames of `frame_size` samples
#[allow(dead_code)]
pub fn read_stream_file(path: &Path, frame_size: usize) -> Result<Vec<Frame>, WriterError> {
    if frame_size == 0 {
        return Err(WriterError::Corrupt("frame size must be positive".to_string()));
    }
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|e| WriterError::Corrupt(format!("bad sample '{}': {}", field, e)))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push(row);
    }
    if rows.len() % frame_size != 0 {
        return Err(WriterError::Corrupt(format!(
            "{} rows is not a whole number of {}-sample frames",
            rows.len(),
            frame_size
        )));
    }
    Ok(rows.chunks(frame_size).map(Frame::from_rows).collect())
}

/// Read one segment file; returns its frame index and the frame
#[allow(dead_code)]
pub fn read_segment_file(path: &Path) -> Result<(u64, Frame), WriterError> {
    let file = File::open(path)?;
    let dataset = file.dataset(SEGMENT_DATASET)?;
    let (frame_size, channels) = match dataset.shape()[..] {
        [frame_size, channels] => (frame_size, channels),
        ref other => {
            return Err(WriterError::Corrupt(format!(
                "{}: expected a 2-D dataset, found shape {:?}",
                path.display(),
                other
            )))
        }
    };
    let flat: Vec<f64> = dataset.read_raw()?;
    let index = dataset.attr(SEGMENT_INDEX_ATTR)?.read_scalar::<u64>()?;

    let mut frame = Frame::zeros(channels, frame_size);
    for (s, row) in flat.chunks(channels.max(1)).take(frame_size).enumerate() {
        for (c, value) in row.iter().enumerate() {
            frame.channel_mut(c)[s] = *value;
        }
    }
    Ok((index, frame))
}
