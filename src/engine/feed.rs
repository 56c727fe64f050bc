//! Feed loops: take a free input buffer, fill it from the frame source,
//! pace it and hand it to the component until end of stream.

use std::time::Instant;

use super::component::{Component, Rejected};
use super::core::{BufferFlags, BufferHeader, ColorFormat, ExternalFrame, OmxError, OmxResult};
use super::exchange::ExchangeEngine;
use super::osal::sleep_ms;
use super::pacer::{PaceOutcome, Pacer};
use super::source::{FileSource, FrameChannel, LoopingSource, ServerMessage};
use crate::config::TimingConfig;

/// What a feed loop needs from its session.
pub struct FeedContext<'a> {
    pub session: usize,
    pub component: &'a dyn Component,
    pub exchange: &'a ExchangeEngine,
    pub timing: &'a TimingConfig,
}

impl FeedContext<'_> {
    fn check_failure(&self) -> OmxResult<()> {
        match self.exchange.failure()? {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn submit(&self, buffer: BufferHeader) -> OmxResult<()> {
        match self.component.empty_this_buffer(buffer) {
            Ok(()) => Ok(()),
            Err(Rejected { error, buffer }) => {
                self.give_back(buffer);
                Err(error)
            }
        }
    }

    /// Put an unsubmitted buffer back on its free queue.
    fn give_back(&self, buffer: BufferHeader) {
        let (port, id) = (buffer.port(), buffer.id());
        if let Err(e) = self.exchange.requeue(buffer) {
            tracing::warn!(session = self.session, port, id, error = %e, "buffer could not be requeued");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub frames_submitted: u64,
    pub slices_submitted: u64,
    pub overlays_submitted: u64,
    pub skipped: u64,
}

/// Hand every free output buffer to the component once.
pub fn prime_outputs(ctx: &FeedContext<'_>) -> OmxResult<usize> {
    let mut primed = 0;
    while let Some(buffer) = ctx.exchange.pop_output()? {
        if let Err(Rejected { error, buffer }) = ctx.component.fill_this_buffer(buffer) {
            ctx.give_back(buffer);
            return Err(error);
        }
        primed += 1;
    }
    tracing::debug!(session = ctx.session, primed, "output buffers primed");
    Ok(primed)
}

/// Poll until the end-of-stream output has come back.
pub fn wait_for_eos(ctx: &FeedContext<'_>) -> OmxResult<()> {
    let started = Instant::now();
    let limit = u128::from(ctx.timing.eos_drain_timeout_ms);
    loop {
        ctx.check_failure()?;
        if ctx.exchange.is_eos()? {
            return Ok(());
        }
        if started.elapsed().as_millis() >= limit {
            return Err(OmxError::EosTimeout {
                timeout_ms: ctx.timing.eos_drain_timeout_ms,
            });
        }
        sleep_ms(ctx.timing.eos_poll_ms);
    }
}

// ============================================================================
// Contiguous frames
// ============================================================================

/// Whole-frame reads of frames `first..=last` of a raw file.
pub struct RangeFeed {
    source: FileSource,
    frame_size: usize,
    last_frame: u64,
    pacer: Pacer,
    /// Row layout when the buffer stride is wider than the picture.
    planes: Option<Vec<Plane>>,
    overlay: Option<LoopingSource>,
    /// Past this many frames, resubmit the cached buffer contents instead of reading.
    cache_after: Option<u64>,
    scratch: Vec<u8>,
}

impl RangeFeed {
    pub fn new(source: FileSource, frame_size: usize, last_frame: u64, pacer: Pacer) -> Self {
        Self {
            source,
            frame_size,
            last_frame,
            pacer,
            planes: None,
            overlay: None,
            cache_after: None,
            scratch: Vec::new(),
        }
    }

    /// Place every row at `stride` instead of packing frames contiguously.
    pub fn with_stride(
        mut self,
        color: ColorFormat,
        width: u32,
        height: u32,
        stride: u32,
    ) -> OmxResult<Self> {
        self.planes = if stride > width {
            Some(planes(color, width, height, stride)?)
        } else {
            None
        };
        Ok(self)
    }

    pub fn with_overlay(mut self, overlay: LoopingSource) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_cache_after(mut self, frames: u64) -> Self {
        self.cache_after = Some(frames);
        self
    }

    /// Bytes one frame occupies in a buffer.
    pub fn buffer_len(&self) -> usize {
        match &self.planes {
            Some(planes) => planes.iter().map(|p| p.rows * p.stride).sum(),
            None => self.frame_size,
        }
    }

    /// Refuse buffers too small for one whole frame.
    pub fn check_buffer_size(&self, size: usize) -> OmxResult<()> {
        let needed = self.buffer_len();
        if size < needed {
            return Err(OmxError::BadParameter(format!(
                "input buffers of {} bytes cannot hold a {} byte frame",
                size, needed
            )));
        }
        Ok(())
    }

    fn end_position(&self) -> u64 {
        (self.last_frame + 1) * self.frame_size as u64
    }

    /// Read the frame at `pos` into `buffer`; returns bytes read and bytes placed.
    fn read_frame(&mut self, pos: u64, buffer: &mut BufferHeader) -> OmxResult<(usize, usize)> {
        let Some(planes) = self.planes.clone() else {
            let n = self
                .source
                .read_at(pos, &mut buffer.data_mut()[..self.frame_size])?;
            return Ok((n, n));
        };

        let mut plane_base = pos;
        let mut read = 0usize;
        let mut placed = 0usize;
        for plane in planes {
            let plane_len = plane.row_bytes * plane.rows;
            self.scratch.resize(plane_len, 0);
            let n = self.source.read_at(plane_base, &mut self.scratch)?;
            let data = buffer.data_mut();
            for (i, row) in self.scratch[..n].chunks(plane.row_bytes).enumerate() {
                let at = placed + i * plane.stride;
                data[at..at + row.len()].copy_from_slice(row);
            }
            read += n;
            placed += plane.rows * plane.stride;
            plane_base += plane_len as u64;
            if n < plane_len {
                break;
            }
        }
        Ok((read, placed))
    }

    /// Fill `buffer` with output frame `k`; returns whether it ends the stream.
    fn fill(&mut self, k: u64, buffer: &mut BufferHeader) -> OmxResult<bool> {
        self.check_buffer_size(buffer.alloc_len())?;
        let frame_size = self.frame_size as u64;
        let end = self.end_position();
        let pos = self.pacer.source_frame(k) * frame_size;

        let (read, placed) = match self.cache_after {
            Some(limit) if k > limit => (self.frame_size, self.buffer_len()),
            _ => self.read_frame(pos, buffer)?,
        };

        buffer.offset = 0;
        buffer.filled_len = placed;
        buffer.flags = BufferFlags::empty();

        let next_pos = self.pacer.source_frame(k + 1) * frame_size;
        let eos = read < self.frame_size
            || pos + read as u64 >= end
            || next_pos + frame_size > end;
        if eos {
            buffer.flags.insert(BufferFlags::EOS);
        }
        Ok(eos)
    }
}

pub fn run_range(ctx: &FeedContext<'_>, feed: &mut RangeFeed) -> OmxResult<FeedStats> {
    let mut stats = FeedStats::default();
    let mut k = 0u64;

    loop {
        ctx.check_failure()?;
        let Some(mut buffer) = ctx.exchange.pop_input()? else {
            sleep_ms(ctx.timing.input_backoff_ms);
            continue;
        };

        let mut overlay_buffer = None;
        if feed.overlay.is_some() {
            match ctx.exchange.pop_overlay()? {
                Some(b) => overlay_buffer = Some(b),
                None => {
                    ctx.give_back(buffer);
                    sleep_ms(ctx.timing.input_backoff_ms);
                    continue;
                }
            }
        }

        let eos = match feed.fill(k, &mut buffer) {
            Ok(eos) => eos,
            Err(e) => {
                ctx.give_back(buffer);
                if let Some(ob) = overlay_buffer {
                    ctx.give_back(ob);
                }
                return Err(e);
            }
        };

        if let (Some(overlay), Some(mut ob)) = (feed.overlay.as_mut(), overlay_buffer) {
            match overlay.next_frame(ob.data_mut()) {
                Ok(n) => {
                    ob.offset = 0;
                    ob.filled_len = n;
                    ob.flags = BufferFlags::empty();
                    // A refused overlay takes the paired input back with it.
                    if let Err(e) = ctx.submit(ob) {
                        ctx.give_back(buffer);
                        return Err(e);
                    }
                    stats.overlays_submitted += 1;
                }
                Err(e) => {
                    ctx.give_back(ob);
                    ctx.give_back(buffer);
                    return Err(e);
                }
            }
        }

        if let PaceOutcome::Late { .. } = feed.pacer.pace(k) {
            stats.skipped += 1;
        }

        tracing::debug!(
            session = ctx.session,
            frame = k,
            source_frame = feed.pacer.source_frame(k),
            len = buffer.filled_len,
            eos,
            "submitting input"
        );
        ctx.submit(buffer)?;
        stats.frames_submitted += 1;
        k += 1;

        if eos {
            tracing::info!(session = ctx.session, frames = stats.frames_submitted, "end of input");
            return Ok(stats);
        }
    }
}

// ============================================================================
// Sliced frames
// ============================================================================

/// One picture plane as stored in the file and in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plane {
    row_bytes: usize,
    rows: usize,
    stride: usize,
}

fn planes(color: ColorFormat, width: u32, height: u32, stride: u32) -> OmxResult<Vec<Plane>> {
    let (w, h, s) = (width as usize, height as usize, stride.max(width) as usize);
    let plane = |row_bytes, rows, stride| Plane {
        row_bytes,
        rows,
        stride,
    };
    match color {
        ColorFormat::Yuv420Planar => Ok(vec![
            plane(w, h, s),
            plane(w / 2, h / 2, s / 2),
            plane(w / 2, h / 2, s / 2),
        ]),
        ColorFormat::Yuv420SemiPlanar => Ok(vec![plane(w, h, s), plane(w, h / 2, s)]),
        ColorFormat::Argb8888 => Ok(vec![plane(w * 4, h, s * 4)]),
        other => Err(OmxError::UnsupportedSetting(format!(
            "sliced input in {:?}",
            other
        ))),
    }
}

/// Height-sliced reads: each submission carries `slice_height` rows of
/// every plane, placed at the buffer stride.
pub struct SlicedFeed {
    source: FileSource,
    planes: Vec<Plane>,
    height: usize,
    slice_height: usize,
    last_frame: u64,
    pacer: Pacer,
}

impl SlicedFeed {
    pub fn new(
        source: FileSource,
        color: ColorFormat,
        width: u32,
        height: u32,
        stride: u32,
        slice_height: u32,
        last_frame: u64,
        pacer: Pacer,
    ) -> OmxResult<Self> {
        if slice_height == 0 || height == 0 {
            return Err(OmxError::BadParameter("slice height must be positive".to_string()));
        }
        Ok(Self {
            source,
            planes: planes(color, width, height, stride)?,
            height: height as usize,
            slice_height: slice_height.min(height) as usize,
            last_frame,
            pacer,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.planes.iter().map(|p| p.row_bytes * p.rows).sum()
    }

    pub fn slices_per_frame(&self) -> usize {
        self.height.div_ceil(self.slice_height)
    }

    /// Bytes one slice occupies in a buffer.
    pub fn slice_capacity(&self) -> usize {
        self.planes
            .iter()
            .map(|p| self.plane_slice_rows(p) * p.stride)
            .sum()
    }

    fn plane_slice_rows(&self, plane: &Plane) -> usize {
        (self.slice_height * plane.rows).div_ceil(self.height)
    }

    /// Place slice `slice` of source frame `frame`; false on a short read.
    fn fill(&mut self, frame: u64, slice: usize, buffer: &mut BufferHeader) -> OmxResult<bool> {
        let frame_base = frame * self.frame_size() as u64;
        let mut plane_base = 0u64;
        let mut placed = 0usize;
        let mut complete = true;
        let mut row = Vec::new();

        for plane in self.planes.clone() {
            let per_slice = self.plane_slice_rows(&plane);
            let first_row = (slice * per_slice).min(plane.rows);
            let last_row = ((slice + 1) * per_slice).min(plane.rows);
            let rows = last_row - first_row;

            row.resize(plane.row_bytes * rows, 0);
            let pos = frame_base + plane_base + (first_row * plane.row_bytes) as u64;
            let n = self.source.read_at(pos, &mut row)?;
            if n < row.len() {
                complete = false;
            }

            let data = buffer.data_mut();
            for (i, chunk) in row[..n].chunks(plane.row_bytes).enumerate() {
                let at = placed + i * plane.stride;
                if at + chunk.len() > data.len() {
                    return Err(OmxError::BadParameter(format!(
                        "slice does not fit buffer of {} bytes",
                        data.len()
                    )));
                }
                data[at..at + chunk.len()].copy_from_slice(chunk);
            }
            placed += rows * plane.stride;
            plane_base += (plane.row_bytes * plane.rows) as u64;
        }

        buffer.offset = 0;
        buffer.filled_len = placed.min(buffer.alloc_len());
        buffer.flags = BufferFlags::empty();
        Ok(complete)
    }
}

pub fn run_sliced(ctx: &FeedContext<'_>, feed: &mut SlicedFeed) -> OmxResult<FeedStats> {
    let mut stats = FeedStats::default();
    let slices = feed.slices_per_frame();
    let mut k = 0u64;
    let mut slice = 0usize;

    loop {
        ctx.check_failure()?;
        let Some(mut buffer) = ctx.exchange.pop_input()? else {
            sleep_ms(ctx.timing.slice_backoff_ms);
            continue;
        };

        let frame = feed.pacer.source_frame(k);
        let complete = match feed.fill(frame, slice, &mut buffer) {
            Ok(complete) => complete,
            Err(e) => {
                ctx.give_back(buffer);
                return Err(e);
            }
        };
        let last_slice = slice + 1 == slices;
        let eos = !complete
            || frame > feed.last_frame
            || (last_slice && feed.pacer.source_frame(k + 1) > feed.last_frame);
        if eos {
            buffer.flags.insert(BufferFlags::EOS);
        }

        if slice == 0 {
            if let PaceOutcome::Late { .. } = feed.pacer.pace(k) {
                stats.skipped += 1;
            }
        }

        tracing::trace!(session = ctx.session, frame, slice, len = buffer.filled_len, "submitting slice");
        ctx.submit(buffer)?;
        stats.slices_submitted += 1;

        if last_slice || eos {
            stats.frames_submitted += 1;
        }
        if eos {
            tracing::info!(session = ctx.session, frames = stats.frames_submitted, "end of input");
            return Ok(stats);
        }

        slice += 1;
        if slice == slices {
            slice = 0;
            k += 1;
        }
    }
}

// ============================================================================
// Remote frames
// ============================================================================

/// Geometry a remote frame must have to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

pub fn run_remote(
    ctx: &FeedContext<'_>,
    channel: &dyn FrameChannel,
    geometry: RemoteGeometry,
) -> OmxResult<FeedStats> {
    let mut stats = FeedStats::default();

    loop {
        ctx.check_failure()?;
        let Some(mut buffer) = ctx.exchange.pop_input()? else {
            sleep_ms(ctx.timing.input_backoff_ms);
            continue;
        };
        buffer.offset = 0;
        buffer.flags = BufferFlags::empty();
        buffer.external = None;

        let message = match channel.receive() {
            Ok(message) => message,
            Err(e) => {
                ctx.give_back(buffer);
                return Err(e);
            }
        };

        match message {
            ServerMessage::Frame(frame) => {
                if frame.width != geometry.width
                    || frame.height != geometry.height
                    || frame.stride != geometry.stride
                {
                    ctx.give_back(buffer);
                    return Err(OmxError::BadParameter(format!(
                        "remote frame {}x{} stride {} does not match port {}x{} stride {}",
                        frame.width,
                        frame.height,
                        frame.stride,
                        geometry.width,
                        geometry.height,
                        geometry.stride
                    )));
                }
                let expected = frame.stride as usize * frame.height as usize * 3 / 2;
                let len = expected.min(frame.data.len()).min(buffer.alloc_len());
                buffer.data_mut()[..len].copy_from_slice(&frame.data[..len]);
                buffer.filled_len = expected.min(buffer.alloc_len());
                buffer.external = Some(ExternalFrame { frame_id: frame.id });
                ctx.submit(buffer)?;
                stats.frames_submitted += 1;
            }
            ServerMessage::Exit => {
                buffer.filled_len = 0;
                buffer.flags.insert(BufferFlags::EOS);
                ctx.submit(buffer)?;
                tracing::info!(session = ctx.session, frames = stats.frames_submitted, "remote source finished");
                return Ok(stats);
            }
        }
    }
}
