//! Replay: re-emits an exported run's events at a configurable speed.
//!
//! Replayed events appear under `replay:`-prefixed topics (the original
//! event rides in the payload untouched), so live handlers never mistake a
//! replay for the present. Speed affects timing only, never order; the
//! inter-event delay is the recorded gap divided by speed, floored at 10 ms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{topics, EventBus};
use crate::timeline::{ExportedRun, TimelineEvent};

/// Allowed playback speeds; requested speeds snap to the nearest.
pub const SPEEDS: [f64; 5] = [1.0, 2.0, 5.0, 10.0, 50.0];
/// Minimum inter-event delay.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay is not running")]
    NotRunning,
}

#[derive(Clone, Debug)]
pub enum ReplayCommand {
    Play,
    Pause,
    Stop,
    Step,
    Seek(usize),
    SetSpeed(f64),
}

#[derive(Clone, Copy, Debug)]
pub struct ReplayStatus {
    pub position: usize,
    pub total: usize,
    pub playing: bool,
    pub speed: f64,
}

/// Snaps to the nearest allowed speed.
pub fn snap_speed(requested: f64) -> f64 {
    SPEEDS
        .iter()
        .copied()
        .min_by(|a, b| {
            (a - requested)
                .abs()
                .partial_cmp(&(b - requested).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(1.0)
}

/// Delay before the event at `position`, given the previous event.
fn delay_between(prev: &TimelineEvent, next: &TimelineEvent, speed: f64) -> Duration {
    let gap_ms = next.ts.saturating_sub(prev.ts) as f64 / speed;
    Duration::from_millis(gap_ms as u64).max(MIN_DELAY)
}

/// Control surface for a spawned replay.
pub struct ReplayHandle {
    cmd_tx: mpsc::Sender<ReplayCommand>,
    status: Arc<Mutex<ReplayStatus>>,
}

impl ReplayHandle {
    pub async fn send(&self, command: ReplayCommand) -> Result<(), ReplayError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ReplayError::NotRunning)
    }

    pub async fn play(&self) -> Result<(), ReplayError> {
        self.send(ReplayCommand::Play).await
    }

    pub async fn pause(&self) -> Result<(), ReplayError> {
        self.send(ReplayCommand::Pause).await
    }

    pub async fn set_speed(&self, speed: f64) -> Result<(), ReplayError> {
        self.send(ReplayCommand::SetSpeed(speed)).await
    }

    pub fn status(&self) -> ReplayStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawns the replay timer task over a loaded run.
pub fn spawn(bus: Arc<EventBus>, run: ExportedRun) -> ReplayHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let status = Arc::new(Mutex::new(ReplayStatus {
        position: 0,
        total: run.events.len(),
        playing: false,
        speed: 1.0,
    }));
    let task_status = Arc::clone(&status);
    tokio::spawn(run_replay(bus, run, cmd_rx, task_status));
    ReplayHandle { cmd_tx, status }
}

async fn run_replay(
    bus: Arc<EventBus>,
    run: ExportedRun,
    mut cmd_rx: mpsc::Receiver<ReplayCommand>,
    status: Arc<Mutex<ReplayStatus>>,
) {
    let events = run.events;
    let read = |status: &Arc<Mutex<ReplayStatus>>| *status.lock().unwrap_or_else(|e| e.into_inner());
    let emit_at = |position: usize| {
        let event = &events[position];
        bus.emit(
            &topics::replay_topic(&event.event_type),
            serde_json::to_value(event).unwrap_or(json!({})),
        );
    };
    let finish = |status: &Arc<Mutex<ReplayStatus>>| {
        let mut s = status.lock().unwrap_or_else(|e| e.into_inner());
        s.playing = false;
        bus.emit(topics::REPLAY_COMPLETED, json!({ "events": events.len() }));
    };

    loop {
        let current = read(&status);
        let command = if current.playing && current.position < events.len() {
            let delay = if current.position == 0 {
                Duration::ZERO
            } else {
                delay_between(
                    &events[current.position - 1],
                    &events[current.position],
                    current.speed,
                )
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    emit_at(current.position);
                    let done = {
                        let mut s = status.lock().unwrap_or_else(|e| e.into_inner());
                        s.position += 1;
                        s.position >= events.len()
                    };
                    if done {
                        finish(&status);
                    }
                    continue;
                }
                command = cmd_rx.recv() => command,
            }
        } else {
            cmd_rx.recv().await
        };

        let Some(command) = command else {
            return;
        };
        debug!(?command, "replay command");
        let mut s = status.lock().unwrap_or_else(|e| e.into_inner());
        match command {
            ReplayCommand::Play => {
                if s.position >= events.len() {
                    s.position = 0; // replaying a finished run starts over
                }
                s.playing = true;
            }
            ReplayCommand::Pause => s.playing = false,
            ReplayCommand::Stop => {
                s.playing = false;
                s.position = 0;
            }
            ReplayCommand::Step => {
                if s.position < events.len() {
                    let position = s.position;
                    s.position += 1;
                    let done = s.position >= events.len();
                    drop(s);
                    emit_at(position);
                    if done {
                        finish(&status);
                    }
                }
            }
            ReplayCommand::Seek(position) => {
                s.position = position.min(events.len());
            }
            ReplayCommand::SetSpeed(speed) => {
                s.speed = snap_speed(speed);
            }
        }
    }
}
