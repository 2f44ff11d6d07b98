//! Input injection onto the screen-capture control socket.
//!
//! The encoder is stateless: it turns fractional coordinates plus the current
//! resolution into big-endian packed control messages, and writes them through
//! a handle that serializes access to the control socket.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::Result;

use super::ControlHandle;

const MSG_TYPE_INJECT_TOUCH: u8 = 2;
const MSG_TYPE_INJECT_SCROLL: u8 = 3;

const BUTTON_PRIMARY: i32 = 1;
const PRESSURE_FULL: u16 = 0xffff;
const VIRTUAL_FINGER: i64 = -1;

const DEFAULT_SWIPE_UNIT: u32 = 5;
const DEFAULT_SWIPE_DELAY: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MotionAction {
    Down = 0,
    Up = 1,
    Move = 2,
}

impl MotionAction {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => MotionAction::Down,
            1 => MotionAction::Up,
            _ => MotionAction::Move,
        }
    }
}

/// Inbound WebSocket control messages. Coordinates are fractions in `[0, 1]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Touch {
        x: f64,
        y: f64,
        action: u8,
    },
    Scroll {
        x: f64,
        y: f64,
        distance_x: i32,
        distance_y: i32,
    },
    Swipe {
        x: f64,
        y: f64,
        end_x: f64,
        end_y: f64,
        #[serde(default = "default_unit")]
        unit: u32,
        #[serde(default = "default_delay")]
        delay: f64,
    },
}

fn default_unit() -> u32 {
    DEFAULT_SWIPE_UNIT
}

fn default_delay() -> f64 {
    DEFAULT_SWIPE_DELAY
}

/// Scales a fraction onto a screen dimension, clamped to `[0, dim]`.
fn scale(fraction: f64, dim: u16) -> i32 {
    let value = fraction * f64::from(dim);
    value.clamp(0.0, f64::from(dim)) as i32
}

/// 28-byte touch message: type, action, touch id, x, y, w, h, pressure,
/// buttons. Pressure drops to zero on UP.
pub fn touch_message(x: f64, y: f64, action: MotionAction, resolution: (u16, u16)) -> Bytes {
    let (w, h) = resolution;
    let pressure = match action {
        MotionAction::Up => 0,
        _ => PRESSURE_FULL,
    };
    let mut buf = BytesMut::with_capacity(28);
    buf.put_u8(MSG_TYPE_INJECT_TOUCH);
    buf.put_u8(action as u8);
    buf.put_i64(VIRTUAL_FINGER);
    buf.put_i32(scale(x, w));
    buf.put_i32(scale(y, h));
    buf.put_u16(w);
    buf.put_u16(h);
    buf.put_u16(pressure);
    buf.put_i32(BUTTON_PRIMARY);
    buf.freeze()
}

/// 25-byte scroll message: type, x, y, w, h, dx, dy, buttons.
pub fn scroll_message(x: f64, y: f64, dx: i32, dy: i32, resolution: (u16, u16)) -> Bytes {
    let (w, h) = resolution;
    let mut buf = BytesMut::with_capacity(25);
    buf.put_u8(MSG_TYPE_INJECT_SCROLL);
    buf.put_i32(scale(x, w));
    buf.put_i32(scale(y, h));
    buf.put_u16(w);
    buf.put_u16(h);
    buf.put_i32(dx);
    buf.put_i32(dy);
    buf.put_i32(BUTTON_PRIMARY);
    buf.freeze()
}

/// Number of MOVE events for a swipe of `unit`-pixel steps along the
/// dominant axis.
pub fn swipe_steps(dx: f64, dy: f64, unit: u32) -> u32 {
    let span = dx.abs().max(dy.abs());
    ((span / f64::from(unit.max(1))).ceil() as u32).max(1)
}

/// Stateless encoder writing through the per-device control handle.
#[derive(Clone)]
pub struct InputController {
    handle: ControlHandle,
}

impl InputController {
    pub(super) fn new(handle: ControlHandle) -> Self {
        Self { handle }
    }

    pub async fn dispatch(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::Touch { x, y, action } => {
                self.touch(x, y, MotionAction::from_raw(action)).await
            }
            ControlMessage::Scroll { x, y, distance_x, distance_y } => {
                self.scroll(x, y, distance_x, distance_y).await
            }
            ControlMessage::Swipe { x, y, end_x, end_y, unit, delay } => {
                self.swipe(x, y, end_x, end_y, unit, delay).await
            }
        }
    }

    pub async fn touch(&self, x: f64, y: f64, action: MotionAction) -> Result<()> {
        let frame = touch_message(x, y, action, self.handle.resolution());
        self.handle.write_frame(frame).await
    }

    pub async fn scroll(&self, x: f64, y: f64, dx: i32, dy: i32) -> Result<()> {
        let frame = scroll_message(x, y, dx, dy, self.handle.resolution());
        self.handle.write_frame(frame).await
    }

    /// One DOWN, `steps` MOVEs spaced by `delay / steps`, one UP, linearly
    /// interpolated between the endpoints.
    pub async fn swipe(
        &self,
        x: f64,
        y: f64,
        end_x: f64,
        end_y: f64,
        unit: u32,
        delay: f64,
    ) -> Result<()> {
        let (w, h) = self.handle.resolution();
        let (x0, y0) = (scale(x, w) as f64, scale(y, h) as f64);
        let (x1, y1) = (scale(end_x, w) as f64, scale(end_y, h) as f64);

        let steps = swipe_steps(x1 - x0, y1 - y0, unit);
        let pause = Duration::from_secs_f64((delay / f64::from(steps)).max(0.0));

        self.touch(x, y, MotionAction::Down).await?;
        for step in 1..=steps {
            let t = f64::from(step) / f64::from(steps);
            let px = (x0 + (x1 - x0) * t) / f64::from(w.max(1));
            let py = (y0 + (y1 - y0) * t) / f64::from(h.max(1));
            self.touch(px, py, MotionAction::Move).await?;
            tokio::time::sleep(pause).await;
        }
        self.touch(end_x, end_y, MotionAction::Up).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RES: (u16, u16) = (720, 1280);

    #[test]
    fn touch_layout_is_28_bytes_big_endian() {
        let frame = touch_message(0.5, 0.5, MotionAction::Down, RES);
        assert_eq!(frame.len(), 28);
        assert_eq!(frame[0], MSG_TYPE_INJECT_TOUCH);
        assert_eq!(frame[1], 0); // DOWN
        assert_eq!(&frame[2..10], (-1i64).to_be_bytes().as_slice());
        assert_eq!(&frame[10..14], 360i32.to_be_bytes().as_slice());
        assert_eq!(&frame[14..18], 640i32.to_be_bytes().as_slice());
        assert_eq!(&frame[18..20], 720u16.to_be_bytes().as_slice());
        assert_eq!(&frame[20..22], 1280u16.to_be_bytes().as_slice());
        assert_eq!(&frame[22..24], 0xffffu16.to_be_bytes().as_slice());
        assert_eq!(&frame[24..28], 1i32.to_be_bytes().as_slice());
    }

    #[test]
    fn pressure_is_zero_on_up() {
        let frame = touch_message(0.5, 0.5, MotionAction::Up, RES);
        assert_eq!(&frame[22..24], 0u16.to_be_bytes().as_slice());
    }

    #[test]
    fn scroll_layout_is_25_bytes() {
        let frame = scroll_message(0.0, 1.0, 3, -4, RES);
        assert_eq!(frame.len(), 25);
        assert_eq!(frame[0], MSG_TYPE_INJECT_SCROLL);
        assert_eq!(&frame[1..5], 0i32.to_be_bytes().as_slice());
        assert_eq!(&frame[5..9], 1280i32.to_be_bytes().as_slice());
        assert_eq!(&frame[13..17], 3i32.to_be_bytes().as_slice());
        assert_eq!(&frame[17..21], (-4i32).to_be_bytes().as_slice());
    }

    #[test]
    fn coordinates_clamp_to_screen() {
        assert_eq!(scale(-0.01, 720), 0);
        assert_eq!(scale(0.0, 720), 0);
        assert_eq!(scale(1.0, 720), 720);
        assert_eq!(scale(1.5, 720), 720);
    }

    #[test]
    fn swipe_step_count_follows_dominant_axis() {
        assert_eq!(swipe_steps(10.0, 2.0, 5), 2);
        assert_eq!(swipe_steps(-12.0, 2.0, 5), 3);
        assert_eq!(swipe_steps(0.0, 0.0, 5), 1);
        assert_eq!(swipe_steps(3.0, 99.0, 5), 20);
    }
}
