//! Verbose frame logging.

use std::sync::Arc;

use async_trait::async_trait;
use spiral_common::error::Result;
use spiral_common::proto::Frame;
use tracing::info;

use super::{Context, Direction, Filter, FrameListener, Plugin, Selector};

/// Logs every frame with its direction.
pub struct VerboseLog;

impl VerboseLog {
    pub fn plugin() -> Plugin {
        Plugin::new(vec![
            Arc::new(Tap(Direction::ClientToServer)),
            Arc::new(Tap(Direction::ServerToClient)),
        ])
    }
}

struct Tap(Direction);

#[async_trait]
impl FrameListener for Tap {
    fn filter(&self) -> Filter {
        Filter::new(self.0, Selector::Any)
    }

    fn dirty(&self) -> bool {
        false
    }

    async fn handle(&self, _ctx: &Context, frame: &mut Frame) -> Result<bool> {
        info!("[{}] {}", self.0, hex::encode(&frame.original));
        Ok(true)
    }
}
