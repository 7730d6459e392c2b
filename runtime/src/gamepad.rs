//! Operator references and mode commands from a gamepad.
//!
//! A worker thread polls `gilrs` and publishes the latest stick reference on a
//! single-slot channel; the balance loop reads it without blocking. Left stick
//! Y sets ground velocity, right stick X sets yaw rate. Button A requests
//! Start, X requests Stop and B requests Reset.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use crate::controller::OperatorCommand;
use crate::reference::{Reference, ReferenceSource};

/// Ground velocity range in m/s (backward, forward).
const VELOCITY_RANGE: [f64; 2] = [-0.4, 0.6];
/// Yaw rate range in rad/s.
const YAW_RANGE: [f64; 2] = [-1.5, 1.5];
/// Stick values below this read as zero.
const DEADZONE: f64 = 0.08;

/// Button state with debounce/trigger detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonState {
    pub is_pressed: bool,
    pub triggered: bool,
    released: bool,
    last_pressed_time: f64,
}

impl ButtonState {
    const TIMEOUT: f64 = 0.2;

    fn new() -> Self {
        Self {
            released: true,
            ..Default::default()
        }
    }

    fn update(&mut self, value: bool, now: f64) {
        if self.is_pressed && !value {
            self.released = true;
        }
        self.is_pressed = value;

        if self.released && self.is_pressed && (now - self.last_pressed_time > Self::TIMEOUT) {
            self.triggered = true;
            self.last_pressed_time = now;
        } else {
            self.triggered = false;
        }

        if self.is_pressed {
            self.released = false;
        }
    }
}

/// Scale a stick value in [-1, 1] onto an asymmetric range.
fn scale_axis(value: f64, range: [f64; 2]) -> f64 {
    if value.abs() < DEADZONE {
        0.0
    } else if value >= 0.0 {
        value.min(1.0) * range[1].abs()
    } else {
        value.max(-1.0) * range[0].abs()
    }
}

/// Stick positions to a velocity reference. Axes are already sign-corrected
/// so that up and left are positive.
fn stick_reference(left_y: f64, right_x: f64) -> Reference {
    Reference {
        ground_velocity: scale_axis(left_y, VELOCITY_RANGE),
        ground_position: None,
        yaw_rate: scale_axis(right_x, YAW_RANGE),
    }
}

#[derive(Debug, Default)]
struct CommandButtons {
    start: ButtonState,
    stop: ButtonState,
    reset: ButtonState,
}

impl CommandButtons {
    fn new() -> Self {
        Self {
            start: ButtonState::new(),
            stop: ButtonState::new(),
            reset: ButtonState::new(),
        }
    }

    /// Update with raw A/X/B states and return the triggered command, if any.
    fn update(&mut self, a: bool, x: bool, b: bool, now: f64) -> Option<OperatorCommand> {
        self.start.update(a, now);
        self.stop.update(x, now);
        self.reset.update(b, now);

        // Stop wins over start when both fire on the same tick.
        if self.stop.triggered {
            Some(OperatorCommand::Stop)
        } else if self.reset.triggered {
            Some(OperatorCommand::Reset)
        } else if self.start.triggered {
            Some(OperatorCommand::Start)
        } else {
            None
        }
    }
}

/// Gamepad-driven reference source running its polling in a background thread.
pub struct GamepadReference {
    receiver: Receiver<Reference>,
    stop_tx: Sender<()>,
    last: Reference,
}

impl GamepadReference {
    /// Start the polling thread. Returns the reference source and the
    /// operator command stream for the balance loop.
    pub fn spawn(poll_freq: u32) -> (Self, Receiver<OperatorCommand>) {
        let (data_tx, data_rx) = bounded::<Reference>(1);
        let (command_tx, command_rx) = bounded::<OperatorCommand>(8);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let period = Duration::from_secs_f64(1.0 / poll_freq.max(1) as f64);

        thread::spawn(move || {
            gamepad_worker(data_tx, command_tx, stop_rx, period);
        });

        (
            Self {
                receiver: data_rx,
                stop_tx,
                last: Reference::default(),
            },
            command_rx,
        )
    }

    /// Signal the background thread to stop.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

impl ReferenceSource for GamepadReference {
    /// Latest stick reference (non-blocking). Holds the last one between updates.
    fn reference(&mut self) -> Reference {
        if let Ok(reference) = self.receiver.try_recv() {
            self.last = reference;
        }
        self.last
    }
}

impl Drop for GamepadReference {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background worker that polls the gamepad at the given period.
fn gamepad_worker(
    data_tx: Sender<Reference>,
    command_tx: Sender<OperatorCommand>,
    stop_rx: Receiver<()>,
    period: Duration,
) {
    use gilrs::{Axis, Button, EventType, Gilrs};

    let mut gilrs = match Gilrs::new() {
        Ok(g) => g,
        Err(e) => {
            tracing::error!("Failed to initialize gamepad library: {}", e);
            return;
        }
    };

    tracing::info!("Gamepad input thread started");

    let mut left_y: f64 = 0.0;
    let mut right_x: f64 = 0.0;

    let mut a_pressed = false;
    let mut b_pressed = false;
    let mut x_pressed = false;

    let mut buttons = CommandButtons::new();
    let start_time = Instant::now();

    loop {
        let tick_start = Instant::now();

        if stop_rx.try_recv().is_ok() {
            break;
        }

        while let Some(event) = gilrs.next_event() {
            match event.event {
                EventType::AxisChanged(axis, value, _) => {
                    let v = value as f64;
                    match axis {
                        Axis::LeftStickY => left_y = v,
                        Axis::RightStickX => right_x = -v,
                        _ => {}
                    }
                }
                EventType::ButtonPressed(button, _) => match button {
                    Button::South => a_pressed = true,
                    Button::East => b_pressed = true,
                    Button::West => x_pressed = true,
                    _ => {}
                },
                EventType::ButtonReleased(button, _) => match button {
                    Button::South => a_pressed = false,
                    Button::East => b_pressed = false,
                    Button::West => x_pressed = false,
                    _ => {}
                },
                EventType::Disconnected => {
                    // Stop moving when the pad goes away.
                    left_y = 0.0;
                    right_x = 0.0;
                    tracing::warn!("Gamepad disconnected");
                }
                _ => {}
            }
        }

        let now = start_time.elapsed().as_secs_f64();
        if let Some(command) = buttons.update(a_pressed, x_pressed, b_pressed, now) {
            tracing::info!("Gamepad command {:?}", command);
            if let Err(TrySendError::Disconnected(_)) = command_tx.try_send(command) {
                break;
            }
        }

        match data_tx.try_send(stick_reference(left_y, right_x)) {
            Ok(()) => {}
            // Receiver hasn't consumed yet; next tick sends fresh data.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }

        let elapsed = tick_start.elapsed();
        if elapsed < period {
            spin_sleep::sleep(period - elapsed);
        }
    }

    tracing::info!("Gamepad worker thread exiting");
}
