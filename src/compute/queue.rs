use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytemuck::Pod;
use tracing::trace;

use super::buffer::Buffer;
use super::platform::Device;
use super::program::{Kernel, KernelArg, Launch, NdRange};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum EventState {
    Queued,
    Running { start: Instant },
    Complete { start: Instant, end: Instant },
    Failed(String),
}

#[derive(Debug)]
struct EventInner {
    queued: Instant,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion handle of one queued command.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                queued: Instant::now(),
                state: Mutex::new(EventState::Queued),
                done: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete.
    pub fn complete() -> Self {
        let now = Instant::now();
        let event = Self::new();
        event.set(EventState::Complete {
            start: now,
            end: now,
        });
        event
    }

    fn set(&self, state: EventState) {
        if let Ok(mut guard) = self.inner.state.lock() {
            *guard = state;
        }
        self.inner.done.notify_all();
    }

    fn start(&self) {
        self.set(EventState::Running {
            start: Instant::now(),
        });
    }

    fn finish(&self, result: Result<()>) {
        let end = Instant::now();
        let start = match self.inner.state.lock().map(|s| s.clone()) {
            Ok(EventState::Running { start }) => start,
            _ => end,
        };
        match result {
            Ok(()) => self.set(EventState::Complete { start, end }),
            Err(e) => self.set(EventState::Failed(e.to_string())),
        }
    }

    /// Blocks until the command finished and reports its failure, if any.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        loop {
            let outcome = match &*state {
                EventState::Complete { .. } => Some(Ok(())),
                EventState::Failed(message) => Some(Err(Error::DeviceRuntime(message.clone()))),
                _ => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            state = self.inner.done.wait(state)?;
        }
    }

    pub fn wait_all(events: &[Event]) -> Result<()> {
        for event in events {
            event.wait()?;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.inner.state.lock().map(|s| s.clone()),
            Ok(EventState::Complete { .. })
        )
    }

    /// Start-to-end execution time, once the command completed.
    pub fn elapsed(&self) -> Option<Duration> {
        match self.inner.state.lock().ok()?.clone() {
            EventState::Complete { start, end } => Some(end - start),
            _ => None,
        }
    }

    /// Time spent waiting in the queue before execution started.
    pub fn queued_for(&self) -> Option<Duration> {
        match self.inner.state.lock().ok()?.clone() {
            EventState::Running { start } | EventState::Complete { start, .. } => {
                Some(start - self.inner.queued)
            }
            _ => None,
        }
    }
}

type Work = Box<dyn FnOnce(&Device) -> Result<()> + Send>;

struct Command {
    wait_list: Vec<Event>,
    event: Event,
    work: Work,
}

struct QueueInner {
    id: usize,
    device: Device,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// In-order command queue bound to one device.
///
/// Commands run on a dedicated thread in submission order. A command first
/// waits for its wait list; if any of those events failed the command fails
/// without running.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn new(id: usize, device: Device) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker_device = device.clone();
        let worker = std::thread::Builder::new()
            .name(format!("queue-{}-{}", id, device.name()))
            .spawn(move || serve(worker_device, receiver))?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                id,
                device,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    fn submit(&self, wait_list: &[Event], work: Work) -> Result<Event> {
        let event = Event::new();
        let command = Command {
            wait_list: wait_list.to_vec(),
            event: event.clone(),
            work,
        };
        let sender = self.inner.sender.lock()?;
        sender
            .as_ref()
            .ok_or_else(|| Error::DeviceRuntime(format!("queue {} is shut down", self.id())))?
            .send(command)
            .map_err(|_| Error::DeviceRuntime(format!("queue {} worker exited", self.id())))?;
        Ok(event)
    }

    /// Copies `data` into the start of `buffer`. The data is captured before
    /// returning, so a non-blocking write may be followed by reuse of `data`.
    pub fn enqueue_write_buffer<T: Pod>(
        &self,
        buffer: &Buffer,
        blocking: bool,
        data: &[T],
        wait_list: &[Event],
    ) -> Result<Event> {
        let bytes = bytemuck::cast_slice::<T, u8>(data).to_vec();
        if bytes.len() > buffer.size() {
            return Err(Error::DeviceRuntime(format!(
                "write of {} bytes overflows buffer of {} bytes",
                bytes.len(),
                buffer.size()
            )));
        }
        let target = buffer.clone();
        let event = self.submit(wait_list, Box::new(move |_: &Device| target.write_bytes(&bytes)))?;
        if blocking {
            event.wait()?;
        }
        Ok(event)
    }

    /// Blocking read of the whole buffer as `T` elements.
    pub fn enqueue_read_buffer<T: Pod + Send>(
        &self,
        buffer: &Buffer,
        wait_list: &[Event],
    ) -> Result<Vec<T>> {
        let slot = Arc::new(Mutex::new(Vec::<T>::new()));
        let out = slot.clone();
        let source = buffer.clone();
        let event = self.submit(
            wait_list,
            Box::new(move |_: &Device| {
                let values = source.read::<T>()?.to_vec();
                *out.lock()? = values;
                Ok(())
            }),
        )?;
        event.wait()?;
        let values = std::mem::take(&mut *slot.lock()?);
        Ok(values)
    }

    pub fn enqueue_copy_buffer(
        &self,
        source: &Buffer,
        destination: &Buffer,
        wait_list: &[Event],
    ) -> Result<Event> {
        if source.size() > destination.size() {
            return Err(Error::DeviceRuntime(format!(
                "copy of {} bytes overflows buffer of {} bytes",
                source.size(),
                destination.size()
            )));
        }
        let (source, destination) = (source.clone(), destination.clone());
        self.submit(wait_list, Box::new(move |_: &Device| destination.copy_from(&source)))
    }

    /// Validates the launch, then queues it. Invalid launches never reach the queue.
    pub fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        args: Vec<KernelArg>,
        range: NdRange,
        wait_list: &[Event],
    ) -> Result<Event> {
        kernel.validate(&args, &range, self.device().info())?;
        trace!(kernel = kernel.name(), queue = self.id(), ?range, "enqueue");

        let kernel = *kernel;
        self.submit(
            wait_list,
            Box::new(move |device: &Device| {
                let launch = Launch {
                    kernel: kernel.name(),
                    args: &args,
                    range,
                    device: device.info(),
                };
                device.execute(|| kernel.run(&launch))
            }),
        )
    }

    /// Event that completes once everything queued before it completed.
    pub fn enqueue_marker(&self, wait_list: &[Event]) -> Result<Event> {
        self.submit(wait_list, Box::new(|_: &Device| Ok(())))
    }

    pub fn finish(&self) -> Result<()> {
        self.enqueue_marker(&[])?.wait()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Queue {}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device.name())
            .finish()
    }
}

fn serve(device: Device, receiver: Receiver<Command>) {
    for command in receiver {
        let dependencies = Event::wait_all(&command.wait_list);
        if let Err(e) = dependencies {
            command.event.finish(Err(Error::DeviceRuntime(format!(
                "dependency failed: {}",
                e
            ))));
            continue;
        }
        command.event.start();
        let work = command.work;
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(&device)))
            .unwrap_or_else(|payload| Err(Error::DeviceRuntime(panic_message(payload))));
        command.event.finish(result);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("command panicked: {}", message)
}

#[cfg(test)]
mod test {
    use crate::compute::buffer::MemAccess;
    use crate::compute::platform::DeviceInfo;

    use super::*;

    fn queue() -> Queue {
        let device = Device::new(0, DeviceInfo::cpu("cpu", 2)).unwrap();
        Queue::new(0, device).unwrap()
    }

    #[test]
    fn write_then_read_in_order() {
        let queue = queue();
        let buffer = Buffer::new(MemAccess::ReadWrite, 4 * 8);
        queue
            .enqueue_write_buffer(&buffer, false, &[1.0f64, 2.0, 3.0, 4.0], &[])
            .unwrap();
        let values = queue.enqueue_read_buffer::<f64>(&buffer, &[]).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn failed_dependency_fails_dependents() {
        let queue = queue();
        let small = Buffer::new(MemAccess::ReadWrite, 8);
        let large = Buffer::new(MemAccess::ReadWrite, 16);
        let failing = queue
            .submit(&[], Box::new(|_: &Device| Err(Error::DeviceRuntime("boom".into()))))
            .unwrap();
        let dependent = queue.enqueue_copy_buffer(&small, &large, &[failing.clone()]).unwrap();
        assert!(failing.wait().is_err());
        let Err(Error::DeviceRuntime(message)) = dependent.wait() else {
            panic!("dependent command should fail");
        };
        assert!(message.contains("dependency failed"));

        // the queue keeps serving after a failure
        queue.finish().unwrap();
    }

    #[test]
    fn panicking_command_fails_its_event() {
        let queue = queue();
        let panicking = queue
            .submit(&[], Box::new(|_: &Device| panic!("kernel bug")))
            .unwrap();
        let Err(Error::DeviceRuntime(message)) = panicking.wait() else {
            panic!("a panicking command should fail its event");
        };
        assert!(message.contains("kernel bug"));

        let buffer = Buffer::new(MemAccess::ReadWrite, 8);
        queue.enqueue_write_buffer(&buffer, true, &[7.0f64], &[]).unwrap();
        assert_eq!(queue.enqueue_read_buffer::<f64>(&buffer, &[]).unwrap(), vec![7.0]);
    }

    #[test]
    fn events_carry_profiling_times() {
        let queue = queue();
        let event = queue.enqueue_marker(&[]).unwrap();
        event.wait().unwrap();
        assert!(event.is_complete());
        assert!(event.elapsed().is_some());
        assert!(event.queued_for().is_some());
        assert_eq!(Event::complete().elapsed(), Some(Duration::ZERO));
    }

    #[test]
    fn oversized_write_is_rejected_up_front() {
        let queue = queue();
        let buffer = Buffer::new(MemAccess::ReadOnly, 4);
        assert!(queue
            .enqueue_write_buffer(&buffer, true, &[1.0f64], &[])
            .is_err());
    }
}
