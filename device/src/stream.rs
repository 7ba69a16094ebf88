//! Streams and events.
//!
//! A stream is an ordering domain: copies and launches enqueued on the same
//! stream execute in submission order. Events mark a point on a stream that
//! other streams (or the host) can wait for.

use std::sync::Arc;

use crate::driver::Driver;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("stream#{_0}")]
pub struct StreamId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("event#{_0}")]
pub struct EventId(pub u32);

/// Owned stream, destroyed on drop.
#[derive(Debug)]
pub struct Stream {
    driver: Arc<dyn Driver>,
    id: StreamId,
}

impl Stream {
    pub fn new(driver: &Arc<dyn Driver>) -> Result<Self> {
        let id = driver.create_stream()?;
        Ok(Self { driver: Arc::clone(driver), id })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Block until all work enqueued on this stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.driver.synchronize_stream(self.id)
    }

    pub fn record(&self, event: EventId) -> Result<()> {
        self.driver.record_event(event, self.id)
    }

    /// Make later work on this stream wait for `event`.
    pub fn wait(&self, event: EventId) -> Result<()> {
        self.driver.stream_wait_event(self.id, event)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(error) = self.driver.destroy_stream(self.id) {
            tracing::warn!(stream = %self.id, %error, "failed to destroy stream");
        }
    }
}
