/*!
Events and the per queue event pool.

Every enqueued operation produces a native event. The [`EventPool`] of the
queue stores it in a slot and hands out the slot index as a [`LocalEvent`].
Slots are reused circularly, the previous native event of a slot is released
before the slot is overwritten. A [retained](EventPool::retain) slot is never
overwritten.

Local events are only meaningful to the queue that created them.
*/

use crate::{
    config::ExhaustionPolicy,
    driver::{
        error::DriverError, ComputeDriver, EventStatus, NativeEvent, NativeQueue, ProfilingInfo,
    },
};
use error::IntegrityViolation;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Errors.
pub mod error {
    use super::EventDescriptor;

    /// Event bookkeeping can no longer be trusted.
    ///
    /// Continuing would drop dependency edges between operations.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
    pub enum IntegrityViolation {
        #[error("driver returned an invalid event for {descriptor} (tag {tag:#x})")]
        InvalidEvent {
            descriptor: EventDescriptor,
            tag: u64,
        },
        #[error("event pool exhausted, {retained} of {capacity} slots retained")]
        PoolExhausted { retained: usize, capacity: usize },
        #[error("wait list of {requested} events exceeds the limit of {capacity}")]
        WaitListOverflow { requested: usize, capacity: usize },
    }
}

/// Tag of barriers and markers.
pub const SYNC_TAG: u64 = 0x12;

/// Index of an event within its queue's pool.
///
/// [`LocalEvent::INVALID`] is returned by failed operations and is ignored
/// as a dependency.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LocalEvent(i32);

impl LocalEvent {
    pub const INVALID: Self = Self(-1);
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }
    pub const fn raw(&self) -> i32 {
        self.0
    }
    pub const fn is_valid(&self) -> bool {
        self.0 >= 0
    }
    fn index(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Debug for LocalEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(f, "LocalEvent({})", self.0)
        } else {
            f.write_str("LocalEvent::INVALID")
        }
    }
}

impl Default for LocalEvent {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Element width of a transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum ElementKind {
    #[display(fmt = "byte")]
    Byte,
    #[display(fmt = "short")]
    Short,
    #[display(fmt = "int")]
    Int,
    #[display(fmt = "long")]
    Long,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "double")]
    Double,
}

/// The kind of operation an event tracks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum EventDescriptor {
    #[display(fmt = "kernel (serial)")]
    KernelSerial,
    #[display(fmt = "kernel (parallel)")]
    KernelParallel,
    #[display(fmt = "write ({})", _0)]
    Write(ElementKind),
    #[display(fmt = "read ({})", _0)]
    Read(ElementKind),
    #[display(fmt = "barrier")]
    Barrier,
    #[display(fmt = "marker")]
    Marker,
}

/// An event resolved from a pool.
///
/// The native event stays valid until its slot is reclaimed, which does not
/// happen while the local event is retained.
#[derive(Clone)]
pub struct Event {
    local: LocalEvent,
    native: NativeEvent,
    descriptor: EventDescriptor,
    tag: u64,
    queue: NativeQueue,
    driver: Arc<dyn ComputeDriver>,
}

impl Event {
    pub fn local(&self) -> LocalEvent {
        self.local
    }
    pub fn native(&self) -> NativeEvent {
        self.native
    }
    pub fn descriptor(&self) -> EventDescriptor {
        self.descriptor
    }
    pub fn tag(&self) -> u64 {
        self.tag
    }
    /// The queue the event was enqueued on.
    pub fn queue(&self) -> NativeQueue {
        self.queue
    }
    /// Blocks until the operation has completed.
    pub fn wait(&self) -> Result<(), DriverError> {
        self.driver.wait_for_events(&[self.native])
    }
    pub fn status(&self) -> Result<EventStatus, DriverError> {
        self.driver.event_status(self.native)
    }
    /// Requires a profiling queue.
    pub fn profiling(&self) -> Result<ProfilingInfo, DriverError> {
        self.driver.event_profiling_info(self.native)
    }
    /// Execution time in nanoseconds.
    pub fn elapsed(&self) -> Result<u64, DriverError> {
        self.profiling().map(|x| x.elapsed())
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("local", &self.local)
            .field("native", &self.native)
            .field("descriptor", &self.descriptor)
            .field("tag", &format_args!("{:#x}", self.tag))
            .field("queue", &self.queue)
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    native: NativeEvent,
    descriptor: EventDescriptor,
    tag: u64,
}

#[derive(Clone, Copy, Debug)]
enum Slot {
    Free,
    Live(Entry),
    Retained(Entry),
}

impl Slot {
    fn entry(&self) -> Option<&Entry> {
        match self {
            Self::Free => None,
            Self::Live(entry) | Self::Retained(entry) => Some(entry),
        }
    }
    fn is_retained(&self) -> bool {
        matches!(self, Self::Retained(_))
    }
}

/// Length prefixed scratch buffer for wait lists.
#[derive(Debug)]
pub struct WaitList {
    len: usize,
    events: Box<[NativeEvent]>,
}

impl WaitList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            len: 0,
            events: vec![NativeEvent::NULL; capacity].into_boxed_slice(),
        }
    }
    pub fn capacity(&self) -> usize {
        self.events.len()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn as_slice(&self) -> &[NativeEvent] {
        &self.events[..self.len]
    }
}

/// Fixed capacity registry of the events of one queue.
pub struct EventPool {
    driver: Arc<dyn ComputeDriver>,
    queue: NativeQueue,
    slots: Vec<Slot>,
    cursor: usize,
    circular: bool,
    exhaustion_policy: ExhaustionPolicy,
}

impl EventPool {
    /// A circular pool of `capacity` slots.
    ///
    /// **Panics**
    /// - If `capacity` is 0.
    /// - If `capacity` exceeds `i32::MAX`.
    pub fn new(driver: Arc<dyn ComputeDriver>, queue: NativeQueue, capacity: usize) -> Self {
        assert!(capacity > 0, "event pool capacity must be positive");
        assert!(i32::try_from(capacity).is_ok(), "event pool capacity overflows i32");
        Self {
            driver,
            queue,
            slots: vec![Slot::Free; capacity],
            cursor: 0,
            circular: true,
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }
    /// Whether slots are reused after the end is reached. Defaults to true.
    pub fn circular(mut self, circular: bool) -> Self {
        self.circular = circular;
        self
    }
    pub fn exhaustion_policy(mut self, exhaustion_policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = exhaustion_policy;
        self
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn retained_count(&self) -> usize {
        self.slots.iter().filter(|x| x.is_retained()).count()
    }
    /// The queue the events belong to.
    pub fn queue(&self) -> NativeQueue {
        self.queue
    }
    fn find_slot(&self) -> Option<usize> {
        let capacity = self.slots.len();
        if self.circular {
            (0..capacity)
                .map(|i| (self.cursor + i) % capacity)
                .find(|i| !self.slots[*i].is_retained())
        } else {
            (self.cursor..capacity).find(|i| !self.slots[*i].is_retained())
        }
    }
    fn release_native(&self, native: NativeEvent) {
        if let Err(error) = self.driver.release_event(native) {
            tracing::error!(?native, %error, "failed to release event");
        }
    }
    /// Stores `native` and returns its local event.
    ///
    /// **errors**
    /// - [`IntegrityViolation::InvalidEvent`] if `native` is not valid.
    /// - [`IntegrityViolation::PoolExhausted`] if no slot is available and the policy is
    /// [`ExhaustionPolicy::Fatal`]. With [`ExhaustionPolicy::Error`] `native` is released and
    /// [`LocalEvent::INVALID`] is returned.
    pub fn register(
        &mut self,
        native: NativeEvent,
        descriptor: EventDescriptor,
        tag: u64,
    ) -> Result<LocalEvent, IntegrityViolation> {
        if !native.is_valid() {
            tracing::error!(%descriptor, tag, "driver returned an invalid event");
            return Err(IntegrityViolation::InvalidEvent { descriptor, tag });
        }
        let index = if let Some(index) = self.find_slot() {
            index
        } else {
            let retained = self.retained_count();
            let capacity = self.capacity();
            return match self.exhaustion_policy {
                ExhaustionPolicy::Fatal => {
                    tracing::error!(%descriptor, tag, retained, capacity, "event pool exhausted");
                    Err(IntegrityViolation::PoolExhausted { retained, capacity })
                }
                ExhaustionPolicy::Error => {
                    tracing::error!(
                        %descriptor,
                        tag,
                        retained,
                        capacity,
                        "event pool exhausted, dropping event"
                    );
                    self.release_native(native);
                    Ok(LocalEvent::INVALID)
                }
            };
        };
        if let Slot::Live(entry) = self.slots[index] {
            self.release_native(entry.native);
        }
        self.slots[index] = Slot::Live(Entry {
            native,
            descriptor,
            tag,
        });
        self.cursor = if self.circular {
            (index + 1) % self.capacity()
        } else {
            index + 1
        };
        Ok(LocalEvent(index as i32))
    }
    /// Exempts `event` from reclamation.
    ///
    /// Returns false if `event` was not live.
    pub fn retain(&mut self, event: LocalEvent) -> bool {
        match event.index().and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => match *slot {
                Slot::Live(entry) => {
                    *slot = Slot::Retained(entry);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }
    /// Makes a retained `event` reclaimable again.
    ///
    /// Returns false if `event` was not retained.
    pub fn release(&mut self, event: LocalEvent) -> bool {
        match event.index().and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => match *slot {
                Slot::Retained(entry) => {
                    *slot = Slot::Live(entry);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }
    pub fn is_retained(&self, event: LocalEvent) -> bool {
        event
            .index()
            .and_then(|i| self.slots.get(i))
            .map_or(false, Slot::is_retained)
    }
    /// The native event of `event`, if its slot is occupied.
    pub fn native(&self, event: LocalEvent) -> Option<NativeEvent> {
        event
            .index()
            .and_then(|i| self.slots.get(i))
            .and_then(Slot::entry)
            .map(|x| x.native)
    }
    pub fn resolve(&self, event: LocalEvent) -> Option<Event> {
        let index = event.index()?;
        let entry = self.slots.get(index)?.entry()?;
        Some(self.event(index, entry))
    }
    fn event(&self, index: usize, entry: &Entry) -> Event {
        Event {
            local: LocalEvent(index as i32),
            native: entry.native,
            descriptor: entry.descriptor,
            tag: entry.tag,
            queue: self.queue,
            driver: self.driver.clone(),
        }
    }
    /// Occupied slots in slot order.
    pub fn events(&self) -> Vec<Event> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some(self.event(i, slot.entry()?)))
            .collect()
    }
    /** Writes the native events of `dependencies` to `scratch`.

    Returns `None` for in order queues, which need no wait list, and when no
    dependency maps to an occupied slot. Invalid local events and free slots
    are skipped.

    **errors**
    - [`IntegrityViolation::WaitListOverflow`] if more events remain than `scratch` holds.
    */
    pub fn serialize<'a>(
        &self,
        dependencies: &[LocalEvent],
        out_of_order: bool,
        scratch: &'a mut WaitList,
    ) -> Result<Option<&'a [NativeEvent]>, IntegrityViolation> {
        scratch.len = 0;
        if !out_of_order || dependencies.is_empty() {
            return Ok(None);
        }
        let capacity = scratch.capacity();
        let mut requested = 0;
        for native in dependencies.iter().filter_map(|x| self.native(*x)) {
            if requested < capacity {
                scratch.events[requested] = native;
            }
            requested += 1;
        }
        if requested > capacity {
            tracing::error!(requested, capacity, "wait list overflow");
            return Err(IntegrityViolation::WaitListOverflow {
                requested,
                capacity,
            });
        }
        scratch.len = requested;
        if scratch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(scratch.as_slice()))
        }
    }
    /// Releases every native event and frees all slots.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.entry() {
                if let Err(error) = self.driver.release_event(entry.native) {
                    tracing::error!(native = ?entry.native, %error, "failed to release event");
                }
            }
            *slot = Slot::Free;
        }
        self.cursor = 0;
    }
    /// Logs every occupied slot.
    pub fn dump(&self) {
        tracing::debug!(
            queue = ?self.queue,
            capacity = self.capacity(),
            cursor = self.cursor,
            "event pool"
        );
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot.entry() {
                tracing::debug!(
                    event = i,
                    native = ?entry.native,
                    descriptor = %entry.descriptor,
                    tag = entry.tag,
                    retained = slot.is_retained(),
                    "slot"
                );
            }
        }
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        self.reset();
    }
}

impl Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("queue", &self.queue)
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("circular", &self.circular)
            .field("exhaustion_policy", &self.exhaustion_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{emulated::EmulatedDriver, DeviceClass, QueueProperties};

    struct Fixture {
        driver: Arc<EmulatedDriver>,
        queue: NativeQueue,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = Arc::new(EmulatedDriver::new());
            let info = driver.device_info(DeviceClass::Gpu);
            let queue = driver
                .create_command_queue(info.device, QueueProperties::empty())
                .unwrap();
            Self { driver, queue }
        }
        fn pool(&self, capacity: usize) -> EventPool {
            EventPool::new(self.driver.clone(), self.queue, capacity)
        }
        fn native(&self) -> NativeEvent {
            self.driver
                .enqueue_marker_with_wait_list(self.queue, None)
                .unwrap()
        }
        fn register(&self, pool: &mut EventPool) -> Result<LocalEvent, IntegrityViolation> {
            pool.register(self.native(), EventDescriptor::Marker, SYNC_TAG)
        }
    }

    #[test]
    fn fifth_register_reuses_first_slot() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        let events: Vec<_> = (0..4)
            .map(|_| fixture.register(&mut pool).unwrap())
            .collect();
        assert_eq!(events, (0..4).map(LocalEvent::new).collect::<Vec<_>>());
        let first = pool.native(events[0]).unwrap();
        assert_eq!(fixture.driver.release_count(first), 0);
        let fifth = fixture.native();
        assert_eq!(
            pool.register(fifth, EventDescriptor::KernelParallel, 7).unwrap(),
            LocalEvent::new(0)
        );
        assert_eq!(fixture.driver.release_count(first), 1);
        assert_eq!(pool.native(LocalEvent::new(0)), Some(fifth));
        let event = pool.resolve(LocalEvent::new(0)).unwrap();
        assert_eq!(event.descriptor(), EventDescriptor::KernelParallel);
        assert_eq!(event.tag(), 7);
    }

    #[test]
    fn retained_slots_are_skipped() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        for _ in 0..4 {
            fixture.register(&mut pool).unwrap();
        }
        assert!(pool.retain(LocalEvent::new(0)));
        assert!(pool.retain(LocalEvent::new(2)));
        assert!(!pool.retain(LocalEvent::new(2)));
        let retained = [pool.native(LocalEvent::new(0)), pool.native(LocalEvent::new(2))];
        for _ in 0..10 {
            let event = fixture.register(&mut pool).unwrap();
            assert!(!pool.is_retained(event), "{event:?}");
            assert!(event == LocalEvent::new(1) || event == LocalEvent::new(3));
        }
        assert_eq!(
            [pool.native(LocalEvent::new(0)), pool.native(LocalEvent::new(2))],
            retained
        );
        assert!(pool.release(LocalEvent::new(0)));
        assert!(!pool.release(LocalEvent::new(0)));
        assert_eq!(pool.retained_count(), 1);
    }

    #[test]
    fn exhausted_fatal() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(2);
        for _ in 0..2 {
            let event = fixture.register(&mut pool).unwrap();
            pool.retain(event);
        }
        assert_eq!(
            fixture.register(&mut pool).unwrap_err(),
            IntegrityViolation::PoolExhausted {
                retained: 2,
                capacity: 2
            }
        );
    }

    #[test]
    fn exhausted_error_drops_event() {
        let fixture = Fixture::new();
        let mut pool = fixture
            .pool(1)
            .exhaustion_policy(ExhaustionPolicy::Error);
        let event = fixture.register(&mut pool).unwrap();
        pool.retain(event);
        let dropped = fixture.native();
        assert_eq!(
            pool.register(dropped, EventDescriptor::Barrier, SYNC_TAG)
                .unwrap(),
            LocalEvent::INVALID
        );
        assert_eq!(fixture.driver.release_count(dropped), 1);
    }

    #[test]
    fn non_circular_exhausts_at_end() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(3).circular(false);
        for _ in 0..3 {
            fixture.register(&mut pool).unwrap();
        }
        assert!(matches!(
            fixture.register(&mut pool),
            Err(IntegrityViolation::PoolExhausted { retained: 0, .. })
        ));
        pool.reset();
        assert_eq!(fixture.register(&mut pool).unwrap(), LocalEvent::new(0));
    }

    #[test]
    fn invalid_native_event() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        let error = pool
            .register(
                NativeEvent::INVALID,
                EventDescriptor::Write(ElementKind::Float),
                0xAB,
            )
            .unwrap_err();
        assert_eq!(
            error,
            IntegrityViolation::InvalidEvent {
                descriptor: EventDescriptor::Write(ElementKind::Float),
                tag: 0xAB
            }
        );
        assert!(pool.events().is_empty());
    }

    #[test]
    fn serialize_in_order() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        let event = fixture.register(&mut pool).unwrap();
        let mut scratch = WaitList::with_capacity(4);
        assert_eq!(pool.serialize(&[event], false, &mut scratch).unwrap(), None);
    }

    #[test]
    fn serialize_out_of_order() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        let a = fixture.register(&mut pool).unwrap();
        let b = fixture.register(&mut pool).unwrap();
        let native_b = pool.native(b).unwrap();
        let native_a = pool.native(a).unwrap();
        let mut scratch = WaitList::with_capacity(4);
        let wait_list = pool
            .serialize(
                &[b, LocalEvent::INVALID, LocalEvent::new(3), a],
                true,
                &mut scratch,
            )
            .unwrap();
        assert_eq!(wait_list, Some([native_b, native_a].as_slice()));
        assert_eq!(scratch.len(), 2);
        assert_eq!(
            pool.serialize(&[LocalEvent::INVALID], true, &mut scratch)
                .unwrap(),
            None
        );
    }

    #[test]
    fn serialize_overflow() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        let events: Vec<_> = (0..3)
            .map(|_| fixture.register(&mut pool).unwrap())
            .collect();
        let mut scratch = WaitList::with_capacity(2);
        assert_eq!(
            pool.serialize(&events, true, &mut scratch).unwrap_err(),
            IntegrityViolation::WaitListOverflow {
                requested: 3,
                capacity: 2
            }
        );
    }

    #[test]
    fn reset_releases_everything() {
        let fixture = Fixture::new();
        let mut pool = fixture.pool(4);
        for _ in 0..3 {
            fixture.register(&mut pool).unwrap();
        }
        pool.retain(LocalEvent::new(1));
        assert_eq!(fixture.driver.stats().live_events, 3);
        pool.reset();
        assert_eq!(fixture.driver.stats().live_events, 0);
        assert_eq!(pool.retained_count(), 0);
        assert!(pool.resolve(LocalEvent::new(1)).is_none());
    }
}
