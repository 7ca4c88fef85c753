//! Synthetic moving colour bars

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{FrameProducer, InputEvent, ProducerContext};
use crate::error::Result;
use crate::media::{Frame, RgbaImage};

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Scrolls eight SMPTE-style bars one column per frame.
/// Any pressed button reverses the scroll direction.
#[derive(Debug, Default)]
pub struct PatternProducer {
    offset: u32,
    reversed: bool,
}

impl PatternProducer {
    fn render(&self, width: u32, height: u32) -> Vec<u8> {
        let bar_width = (width / BARS.len() as u32).max(1);
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + self.offset) / bar_width) as usize % BARS.len();
                data.extend_from_slice(&BARS[bar]);
                data.push(255);
            }
        }
        data
    }

    fn advance(&mut self, width: u32) {
        let width = width.max(1);
        self.offset = if self.reversed {
            (self.offset + width - 1) % width
        } else {
            (self.offset + 1) % width
        };
    }

    fn on_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::Buttons { player, bitmap } => {
                trace!(player, bitmap, "Pattern input");
                if bitmap != 0 {
                    self.reversed = !self.reversed;
                }
            }
            InputEvent::Disconnect { session } => {
                debug!(session_id = %session, "Peer left pattern room");
            }
        }
    }
}

#[async_trait]
impl FrameProducer for PatternProducer {
    async fn run(mut self: Box<Self>, mut ctx: ProducerContext) -> Result<()> {
        let period = Duration::from_secs(1) / ctx.fps.max(1);
        let ticks = ctx.ticks_per_frame();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timestamp: u32 = 0;
        let mut input_open = true;

        debug!(room_id = %ctx.room_id, fps = ctx.fps, "Pattern producer started");

        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                event = ctx.input.recv(), if input_open => match event {
                    Some(event) => self.on_input(event),
                    None => input_open = false,
                },
                _ = interval.tick() => {
                    let image = RgbaImage::new(ctx.width, ctx.height, self.render(ctx.width, ctx.height))?;
                    let frame = Frame { image, timestamp };
                    if ctx.frames.send(frame).await.is_err() {
                        break;
                    }
                    timestamp = timestamp.wrapping_add(ticks);
                    self.advance(ctx.width);
                }
            }
        }

        debug!(room_id = %ctx.room_id, "Pattern producer stopped");
        Ok(())
    }
}
