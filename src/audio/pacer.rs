//! # Playback Pacer
//!
//! The AI service streams synthesized speech much faster than real time. Sending
//! it to the caller at network speed makes the telephony side truncate or
//! overlap audio, so the pacer re-times it: chunks go into a queue and come out
//! as fixed-size frames at the audio's own wall-clock rate, a little ahead of
//! when they are due.
//!
//! ## Scheduling Model:
//! - One pacer per session, running as its own tokio task
//! - Commands arrive over an mpsc channel (`add_chunk`, `mark_complete`, `stop`, `resume`)
//! - Output is a channel of [`PacerEvent`]s; nothing is delivered through callbacks
//! - Between frames the task sleeps on a timer until just before the next frame is due
//!
//! ## Timeline:
//! ```text
//! now        now+100ms (initial buffer)
//!  |------------|==frame 1==|==frame 2==|==frame 3==|
//!  ^ frame 1 emitted once its start falls inside the 200ms look-ahead window
//! ```

use crate::audio::codec::pcm16_to_f32;
use crate::error::RelayResult;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Tuning for the playback timeline.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Sample rate of the PCM16 fed into the pacer
    pub sample_rate: u32,

    /// Samples per emitted frame
    pub frame_size: usize,

    /// Delay before the first frame of a burst is due
    pub initial_buffer_delay: Duration,

    /// How far ahead of its due time a frame may be emitted
    pub schedule_ahead: Duration,

    /// Re-check interval while the queue is empty but the stream is not complete
    pub poll_interval: Duration,

    /// How long before a frame enters the look-ahead window the task wakes up
    pub wake_lead: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 7680, // 0.48s at 16kHz
            initial_buffer_delay: Duration::from_millis(100),
            schedule_ahead: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            wake_lead: Duration::from_millis(50),
        }
    }
}

impl PacerConfig {
    /// Config for a given rate with frames of `frame_duration` each.
    pub fn for_rate(sample_rate: u32, frame_duration: Duration) -> Self {
        let frame_size = ((sample_rate as f64 * frame_duration.as_secs_f64()).round() as usize).max(1);
        Self {
            sample_rate,
            frame_size,
            ..Self::default()
        }
    }

    fn frame_duration(&self, samples: usize) -> Duration {
        Duration::from_nanos(samples as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64)
    }
}

/// Output of the pacer.
#[derive(Debug, Clone, PartialEq)]
pub enum PacerEvent {
    /// A frame is ready to be played; `starts_at` is its slot on the timeline
    Play { samples: Vec<f32>, starts_at: Instant },
    /// The stream was marked complete and the queue has drained
    Complete,
    /// Playback was stopped and the queue cleared
    Stop,
    /// Playback was re-armed after a stop or completion
    Resume,
}

#[derive(Debug)]
enum PacerCommand {
    Enqueue(Vec<Vec<f32>>),
    MarkComplete,
    Stop,
    Resume,
}

/// Queue and clock state of one playback timeline.
///
/// All methods take the current instant explicitly so the scheduling rules can
/// be driven step by step.
#[derive(Debug)]
struct Timeline {
    config: PacerConfig,
    queue: VecDeque<Vec<f32>>,
    scheduled_time: Instant,
    playing: bool,
    stream_complete: bool,
}

impl Timeline {
    fn new(config: PacerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            scheduled_time: Instant::now(),
            playing: false,
            stream_complete: false,
        }
    }

    fn enqueue(&mut self, frames: Vec<Vec<f32>>, now: Instant) {
        self.stream_complete = false;
        self.queue.extend(frames);

        if !self.playing {
            self.playing = true;
            self.scheduled_time = now + self.config.initial_buffer_delay;
        }
    }

    fn mark_complete(&mut self, out: &mut Vec<PacerEvent>) {
        self.stream_complete = true;
        if !self.playing && self.queue.is_empty() {
            out.push(PacerEvent::Complete);
        }
    }

    fn stop(&mut self, now: Instant, out: &mut Vec<PacerEvent>) {
        self.queue.clear();
        self.playing = false;
        self.stream_complete = true;
        self.scheduled_time = now;
        out.push(PacerEvent::Stop);
    }

    fn resume(&mut self, now: Instant, out: &mut Vec<PacerEvent>) {
        self.stream_complete = false;
        self.scheduled_time = now + self.config.initial_buffer_delay;
        out.push(PacerEvent::Resume);
    }

    /// One pass of the scheduling loop. Returns when the task should wake next.
    fn tick(&mut self, now: Instant, out: &mut Vec<PacerEvent>) -> Option<Instant> {
        if !self.playing {
            return None;
        }

        // after an underrun the timeline restarts from now instead of bursting
        if self.scheduled_time < now {
            self.scheduled_time = now;
        }

        let horizon = now + self.config.schedule_ahead;
        while self.scheduled_time < horizon {
            let Some(samples) = self.queue.pop_front() else {
                break;
            };
            let starts_at = self.scheduled_time;
            self.scheduled_time += self.config.frame_duration(samples.len());
            out.push(PacerEvent::Play { samples, starts_at });
        }

        if self.queue.is_empty() {
            if self.stream_complete {
                self.playing = false;
                out.push(PacerEvent::Complete);
                None
            } else {
                Some(now + self.config.poll_interval)
            }
        } else {
            let due = self.scheduled_time.checked_sub(self.config.wake_lead).unwrap_or(now);
            Some(due.max(now))
        }
    }
}

/// Handle to a running pacer task.
///
/// Dropping the handle aborts the task, which cancels every pending timer.
pub struct PlaybackPacer {
    config: PacerConfig,
    commands: mpsc::UnboundedSender<PacerCommand>,
    task: JoinHandle<()>,
}

impl PlaybackPacer {
    /// Start a pacer task. Returns the handle and the receiving end of its events.
    pub fn spawn(config: PacerConfig) -> (Self, mpsc::UnboundedReceiver<PacerEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_timeline(Timeline::new(config.clone()), command_rx, event_tx));

        (
            Self {
                config,
                commands,
                task,
            },
            events,
        )
    }

    /// Queue a PCM16 chunk, split into frames of the configured size.
    ///
    /// ## Errors:
    /// Returns `Conversion` if the chunk holds a partial sample.
    pub fn add_chunk(&self, pcm: &[u8]) -> RelayResult<()> {
        let samples = pcm16_to_f32(pcm)?;
        if samples.is_empty() {
            return Ok(());
        }

        let frames: Vec<Vec<f32>> = samples
            .chunks(self.config.frame_size)
            .map(|frame| frame.to_vec())
            .collect();
        trace!("Pacer queued {} samples as {} frames", samples.len(), frames.len());
        self.send(PacerCommand::Enqueue(frames));
        Ok(())
    }

    pub fn mark_complete(&self) {
        self.send(PacerCommand::MarkComplete);
    }

    pub fn stop(&self) {
        self.send(PacerCommand::Stop);
    }

    pub fn resume(&self) {
        self.send(PacerCommand::Resume);
    }

    fn send(&self, command: PacerCommand) {
        if self.commands.send(command).is_err() {
            debug!("Pacer task already finished, dropping command");
        }
    }
}

impl Drop for PlaybackPacer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_timeline(
    mut timeline: Timeline,
    mut commands: mpsc::UnboundedReceiver<PacerCommand>,
    events: mpsc::UnboundedSender<PacerEvent>,
) {
    let mut wake: Option<Instant> = None;
    let mut out = Vec::new();

    loop {
        let deadline = wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = commands.recv() => {
                let now = Instant::now();
                match command {
                    Some(PacerCommand::Enqueue(frames)) => timeline.enqueue(frames, now),
                    Some(PacerCommand::MarkComplete) => timeline.mark_complete(&mut out),
                    Some(PacerCommand::Stop) => timeline.stop(now, &mut out),
                    Some(PacerCommand::Resume) => timeline.resume(now, &mut out),
                    None => break,
                }
            }
            _ = sleep_until(deadline), if wake.is_some() => {}
        }

        wake = timeline.tick(Instant::now(), &mut out);

        for event in out.drain(..) {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::f32_to_pcm16;
    use tokio::time::timeout;

    fn chunk(samples: usize) -> Vec<u8> {
        f32_to_pcm16(&vec![0.25f32; samples])
    }

    async fn next_play(events: &mut mpsc::UnboundedReceiver<PacerEvent>) -> (Instant, Instant, usize) {
        match events.recv().await {
            Some(PacerEvent::Play { samples, starts_at }) => (Instant::now(), starts_at, samples.len()),
            other => panic!("expected a play event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_chunks_are_paced_in_real_time() {
        let (pacer, mut events) = PlaybackPacer::spawn(PacerConfig::default());
        let started = Instant::now();

        for _ in 0..3 {
            pacer.add_chunk(&chunk(7680)).unwrap();
        }

        let (emitted_1, slot_1, len_1) = next_play(&mut events).await;
        let (emitted_2, slot_2, _) = next_play(&mut events).await;
        let (emitted_3, slot_3, _) = next_play(&mut events).await;

        assert_eq!(len_1, 7680);
        assert_eq!(slot_1 - started, Duration::from_millis(100));
        assert_eq!(slot_2 - slot_1, Duration::from_millis(480));
        assert_eq!(slot_3 - slot_2, Duration::from_millis(480));

        let tolerance = Duration::from_millis(60);
        for gap in [emitted_2 - emitted_1, emitted_3 - emitted_2] {
            let drift = if gap > Duration::from_millis(480) {
                gap - Duration::from_millis(480)
            } else {
                Duration::from_millis(480) - gap
            };
            assert!(drift <= tolerance, "frames emitted {:?} apart", gap);
        }

        // not complete until told so
        assert!(timeout(Duration::from_secs(2), events.recv()).await.is_err());

        pacer.mark_complete();
        assert_eq!(events.recv().await, Some(PacerEvent::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_waits_for_queue_to_drain() {
        let (pacer, mut events) = PlaybackPacer::spawn(PacerConfig::default());
        pacer.add_chunk(&chunk(7680 * 2)).unwrap();
        pacer.mark_complete();

        let mut plays = 0;
        loop {
            match events.recv().await {
                Some(PacerEvent::Play { .. }) => plays += 1,
                Some(PacerEvent::Complete) => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(plays, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_queue() {
        let (pacer, mut events) = PlaybackPacer::spawn(PacerConfig::default());
        pacer.add_chunk(&chunk(7680 * 5)).unwrap();

        next_play(&mut events).await;
        pacer.stop();
        assert_eq!(events.recv().await, Some(PacerEvent::Stop));

        // nothing left to play after the stop
        assert!(timeout(Duration::from_secs(5), events.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_timers() {
        let (pacer, mut events) = PlaybackPacer::spawn(PacerConfig::default());
        pacer.add_chunk(&chunk(7680 * 3)).unwrap();
        drop(pacer);

        // the task is gone before its first frame was due, so nothing plays
        let next = timeout(Duration::from_secs(5), events.recv()).await;
        assert_eq!(next.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remainder_becomes_short_frame() {
        let config = PacerConfig::for_rate(8000, Duration::from_millis(480));
        assert_eq!(config.frame_size, 3840);

        let (pacer, mut events) = PlaybackPacer::spawn(config);
        pacer.add_chunk(&chunk(3840 + 100)).unwrap();

        let (_, _, first) = next_play(&mut events).await;
        let (_, _, second) = next_play(&mut events).await;
        assert_eq!((first, second), (3840, 100));
    }

    #[test]
    fn test_underrun_restarts_timeline_from_now() {
        let mut timeline = Timeline::new(PacerConfig::default());
        let start = Instant::now();
        let mut out = Vec::new();

        timeline.enqueue(vec![vec![0.0; 7680]], start);
        timeline.tick(start, &mut out);
        assert_eq!(out.len(), 1);

        // a late chunk arrives two seconds after the first one ran out
        let late = start + Duration::from_secs(3);
        out.clear();
        timeline.enqueue(vec![vec![0.0; 7680]], late);
        timeline.tick(late, &mut out);

        match &out[0] {
            PacerEvent::Play { starts_at, .. } => assert_eq!(*starts_at, late),
            other => panic!("expected play, got {:?}", other),
        }
    }
}
