//! Decoded frames and the interfaces that produce and consume them.
//!
//! Decoding and encoding live outside this crate; a [`FrameSource`] yields
//! frames in index order and a [`FrameSink`] receives them in the same order.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// One decoded frame of interleaved 8-bit samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame, checking the buffer against the dimensions.
    pub fn new(index: u64, width: u32, height: u32, channels: u8, data: Vec<u8>) -> MediaResult<Self> {
        let frame = Self {
            index,
            width,
            height,
            channels,
            data,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// A frame with every sample set to `value`.
    pub fn filled(index: u64, width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Self {
            index,
            width,
            height,
            channels,
            data: vec![value; len],
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn validate(&self) -> MediaResult<()> {
        if self.data.len() != self.expected_len() {
            return Err(MediaError::invalid_frame(format!(
                "frame {} is {}x{}x{} but holds {} bytes",
                self.index,
                self.width,
                self.height,
                self.channels,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Ordered producer of frames.
pub trait FrameSource: Send {
    /// Number of frames, when known up front.
    fn total_frames(&self) -> Option<u64>;

    /// Position the source so the next frame returned has index `index`.
    fn seek(&mut self, index: u64) -> MediaResult<()>;

    /// Next frame, `None` at the end of the stream.
    fn next_frame(&mut self) -> MediaResult<Option<Frame>>;
}

/// Ordered consumer of processed frames.
pub trait FrameSink: Send {
    /// Called once before the first write with the index of that write.
    ///
    /// A non-zero start means output of frames `0..start` already exists
    /// from an earlier run.
    fn begin(&mut self, _start_frame: u64) -> MediaResult<()> {
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()>;

    /// Bytes of output written so far, including earlier runs.
    fn bytes_written(&self) -> u64;

    /// Flush and close the output. Returns the final output size.
    fn finish(&mut self) -> MediaResult<u64>;
}

/// In-memory frame source.
#[derive(Debug, Clone, Default)]
pub struct MemoryFrameSource {
    frames: Vec<Frame>,
    position: usize,
}

impl MemoryFrameSource {
    /// Frames must be indexed `0..n` in order.
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            position: 0,
        }
    }

    /// `count` solid frames whose value is the frame index (mod 256).
    pub fn synthetic(count: u64, width: u32, height: u32, channels: u8) -> Self {
        Self::new(
            (0..count)
                .map(|i| Frame::filled(i, width, height, channels, (i % 256) as u8))
                .collect(),
        )
    }
}

impl FrameSource for MemoryFrameSource {
    fn total_frames(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }

    fn seek(&mut self, index: u64) -> MediaResult<()> {
        let index = usize::try_from(index).map_err(|_| MediaError::internal("seek index overflow"))?;
        if index > self.frames.len() {
            return Err(MediaError::internal(format!(
                "cannot seek to frame {} of {}",
                index,
                self.frames.len()
            )));
        }
        self.position = index;
        Ok(())
    }

    fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        let frame = self.frames.get(self.position).cloned();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }
}

/// In-memory frame sink.
#[derive(Debug, Clone, Default)]
pub struct MemoryFrameSink {
    frames: Vec<Frame>,
    finished: bool,
}

impl MemoryFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl FrameSink for MemoryFrameSink {
    fn begin(&mut self, start_frame: u64) -> MediaResult<()> {
        // Output past the checkpoint is rewritten by this run.
        self.frames.retain(|f| f.index < start_frame);
        self.finished = false;
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        self.frames.push(frame.clone());
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.frames.iter().map(|f| f.data.len() as u64).sum()
    }

    fn finish(&mut self) -> MediaResult<u64> {
        self.finished = true;
        Ok(self.bytes_written())
    }
}

/// Dimensions shared by every frame of a raw frame directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrameLayout {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl RawFrameLayout {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

const LAYOUT_FILE: &str = "frames.json";

fn raw_frame_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("frame_{:08}.raw", index))
}

fn read_layout(dir: &Path) -> MediaResult<RawFrameLayout> {
    let path = dir.join(LAYOUT_FILE);
    let bytes = fs::read(&path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MediaError::FileNotFound(path.clone()),
        _ => MediaError::Io(e),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Frame source over a directory of `frame_<index>.raw` files plus a
/// `frames.json` layout file.
#[derive(Debug)]
pub struct RawFrameDirectory {
    dir: PathBuf,
    layout: RawFrameLayout,
    total: u64,
    position: u64,
}

impl RawFrameDirectory {
    pub fn open(dir: impl Into<PathBuf>) -> MediaResult<Self> {
        let dir = dir.into();
        let layout = read_layout(&dir)?;

        let mut total = 0;
        while raw_frame_path(&dir, total).is_file() {
            total += 1;
        }
        debug!(dir = %dir.display(), frames = total, "Opened raw frame directory");

        Ok(Self {
            dir,
            layout,
            total,
            position: 0,
        })
    }

    pub fn layout(&self) -> RawFrameLayout {
        self.layout
    }
}

impl FrameSource for RawFrameDirectory {
    fn total_frames(&self) -> Option<u64> {
        Some(self.total)
    }

    fn seek(&mut self, index: u64) -> MediaResult<()> {
        if index > self.total {
            return Err(MediaError::internal(format!(
                "cannot seek to frame {} of {}",
                index, self.total
            )));
        }
        self.position = index;
        Ok(())
    }

    fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        if self.position >= self.total {
            return Ok(None);
        }
        let index = self.position;
        let data = fs::read(raw_frame_path(&self.dir, index))?;
        self.position += 1;

        // A short or long file is a bad frame, not a broken stream.
        Ok(Some(Frame {
            index,
            width: self.layout.width,
            height: self.layout.height,
            channels: self.layout.channels,
            data,
        }))
    }
}

/// Frame sink writing one raw file per frame.
#[derive(Debug)]
pub struct RawFrameWriter {
    dir: PathBuf,
    layout: RawFrameLayout,
    bytes: u64,
}

impl RawFrameWriter {
    pub fn create(dir: impl Into<PathBuf>, layout: RawFrameLayout) -> MediaResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(LAYOUT_FILE), serde_json::to_vec_pretty(&layout)?)?;
        Ok(Self {
            dir,
            layout,
            bytes: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FrameSink for RawFrameWriter {
    fn begin(&mut self, start_frame: u64) -> MediaResult<()> {
        let mut bytes = 0;
        for index in 0..start_frame {
            match fs::metadata(raw_frame_path(&self.dir, index)) {
                Ok(meta) => bytes += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(MediaError::FileNotFound(raw_frame_path(&self.dir, index)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.bytes = bytes;
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        if frame.data.len() != self.layout.frame_len() {
            return Err(MediaError::invalid_frame(format!(
                "frame {} does not match output layout",
                frame.index
            )));
        }
        fs::write(raw_frame_path(&self.dir, frame.index), &frame.data)?;
        self.bytes += frame.data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn finish(&mut self) -> MediaResult<u64> {
        debug!(dir = %self.dir.display(), bytes = self.bytes, "Raw frame output finished");
        Ok(self.bytes)
    }
}
