use crate::{
    driver::{error::DriverError, EventStatus},
    event::Event,
};
use core::future::Future;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// Completes when the operation of an event has completed.
///
/// Polls the event status, errors if the operation terminated abnormally.
#[derive(Debug)]
pub struct EventFuture {
    event: Event,
}

impl EventFuture {
    pub fn new(event: Event) -> Self {
        Self { event }
    }
    pub fn event(&self) -> &Event {
        &self.event
    }
    /// Blocks the thread until the future is ready.
    pub fn block(self) -> Result<(), DriverError> {
        blocker::block(self)
    }
}

impl From<Event> for EventFuture {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}

impl Future for EventFuture {
    type Output = Result<(), DriverError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.event.status() {
            Ok(EventStatus::Complete) => Poll::Ready(Ok(())),
            Ok(EventStatus::Error(status)) => {
                Poll::Ready(Err(DriverError::new("event execution", status)))
            }
            Ok(_) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RuntimeOptions,
        driver::{emulated::EmulatedDriver, DeviceClass},
        queue::CommandQueue,
    };
    use std::sync::Arc;

    #[test]
    fn marker_future() {
        let driver = Arc::new(EmulatedDriver::new());
        let info = driver.device_info(DeviceClass::Cpu);
        let mut queue = CommandQueue::new(driver, &info, &RuntimeOptions::default()).unwrap();
        let marker = queue.enqueue_marker(&[]).unwrap();
        let event = queue.resolve_event(marker).unwrap();
        EventFuture::from(event.clone()).block().unwrap();
        queue.reset();
        assert!(EventFuture::new(event).block().is_err());
    }
}
