//! Frame-rate conversion and wall-clock pacing of submissions.

use std::time::{Duration, Instant};

use super::core::{FrameRate, OmxError, OmxResult};

/// Source frame to submit as output frame `k` when converting from input
/// rate `ni/di` to output rate `no/do_`, starting at `first`.
///
/// Works in fixed point: the ratio is scaled by the largest shift that does
/// not overflow so that integer ratios decimate exactly.
pub fn next_frame(ni: u32, di: u32, no: u32, do_: u32, k: u64, first: u64) -> u64 {
    let numer = u64::from(ni) * u64::from(do_);
    let denom = u64::from(di) * u64::from(no);
    if numer == 0 || denom == 0 {
        return first;
    }

    let mut shift: u32 = if numer >= denom { 9 } else { 17 };
    loop {
        shift -= 1;
        if (numer << shift) >> shift == numer || shift == 0 {
            break;
        }
    }

    let skip = u128::from((numer << shift) / denom);
    ((u128::from(k) * skip) >> shift) as u64 + first
}

/// How a paced frame met its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    /// No pacing rate configured.
    Unpaced,
    /// Slept until the deadline.
    OnTime { waited: Duration },
    /// The deadline had already passed; submitted immediately.
    Late { behind: Duration },
}

/// Maps output frame numbers to source frames and deadlines.
#[derive(Debug, Clone)]
pub struct Pacer {
    input: FrameRate,
    output: FrameRate,
    first_frame: u64,
    pace: Option<FrameRate>,
    start_delay: Duration,
    start: Option<Instant>,
    skipped: u64,
}

impl Pacer {
    pub fn new(
        input: FrameRate,
        output: FrameRate,
        first_frame: u64,
        pace: Option<FrameRate>,
        start_delay: Duration,
    ) -> OmxResult<Self> {
        if !input.is_valid() || !output.is_valid() {
            return Err(OmxError::BadParameter(format!(
                "frame rates must be positive (input {}/{}, output {}/{})",
                input.numer, input.denom, output.numer, output.denom
            )));
        }
        Ok(Self {
            input,
            output,
            first_frame,
            pace: pace.filter(FrameRate::is_valid),
            start_delay,
            start: None,
            skipped: 0,
        })
    }

    pub fn source_frame(&self, k: u64) -> u64 {
        next_frame(
            self.input.numer,
            self.input.denom,
            self.output.numer,
            self.output.denom,
            k,
            self.first_frame,
        )
    }

    /// Deadline of frame `k`. The origin is fixed the first time frame 0 is paced.
    pub fn deadline(&mut self, k: u64) -> Option<Instant> {
        let rate = self.pace?;
        if k == 0 || self.start.is_none() {
            self.start = Some(Instant::now() + self.start_delay);
        }
        let start = self.start?;
        // k * denom / numer seconds, split to keep microsecond precision.
        let ticks = u128::from(k) * u128::from(rate.denom);
        let secs = ticks / u128::from(rate.numer);
        let micros = (ticks % u128::from(rate.numer)) * 1_000_000 / u128::from(rate.numer);
        Some(start + Duration::from_secs(secs as u64) + Duration::from_micros(micros as u64))
    }

    /// Sleep until frame `k` is due. A frame already past due is not delayed
    /// and counts as skipped.
    pub fn pace(&mut self, k: u64) -> PaceOutcome {
        let Some(deadline) = self.deadline(k) else {
            return PaceOutcome::Unpaced;
        };
        let now = Instant::now();
        if deadline > now {
            let waited = deadline - now;
            tracing::trace!(frame = k, wait_us = waited.as_micros() as u64, "pacing");
            std::thread::sleep(waited);
            PaceOutcome::OnTime { waited }
        } else {
            let behind = now - deadline;
            self.skipped += 1;
            tracing::warn!(frame = k, behind_us = behind.as_micros() as u64, "frame late");
            PaceOutcome::Late { behind }
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_paced(&self) -> bool {
        self.pace.is_some()
    }
}
