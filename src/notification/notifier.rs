use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{DeliveryMode, RemovalListener, RemovalNotification};
use crate::common::concurrent::{
    constants::MAX_NOTIFICATIONS_PER_TASK,
    thread_pool::{PoolName, ThreadPool, ThreadPoolRegistry},
};

pub(crate) enum RemovalNotifier<K, V> {
    Blocking(BlockingRemovalNotifier<K, V>),
    ThreadPool(ThreadPoolRemovalNotifier<K, V>),
}

impl<K, V> RemovalNotifier<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        listener: RemovalListener<K, V>,
        mode: DeliveryMode,
        cache_name: Option<String>,
    ) -> Self {
        match mode {
            DeliveryMode::Immediate => {
                Self::Blocking(BlockingRemovalNotifier::new(listener, cache_name))
            }
            DeliveryMode::Queued => {
                Self::ThreadPool(ThreadPoolRemovalNotifier::new(listener, cache_name))
            }
        }
    }

    pub(crate) fn is_blocking(&self) -> bool {
        matches!(self, RemovalNotifier::Blocking(_))
    }

    pub(crate) fn notify(&self, notification: RemovalNotification<K, V>) {
        match self {
            RemovalNotifier::Blocking(notifier) => notifier.notify(notification),
            RemovalNotifier::ThreadPool(notifier) => notifier.add_notification(notification),
        }
    }

    /// Makes sure that a notification task is scheduled if there are queued
    /// notifications.
    pub(crate) fn sync(&self) {
        if let RemovalNotifier::ThreadPool(notifier) = self {
            notifier.submit_task_if_necessary();
        }
    }
}

pub(crate) struct BlockingRemovalNotifier<K, V> {
    listener: RemovalListener<K, V>,
    cache_name: Option<String>,
}

impl<K, V> BlockingRemovalNotifier<K, V> {
    fn new(listener: RemovalListener<K, V>, cache_name: Option<String>) -> Self {
        Self {
            listener,
            cache_name,
        }
    }

    fn notify(&self, notification: RemovalNotification<K, V>) {
        call_listener(&self.listener, notification, self.cache_name.as_deref());
    }
}

pub(crate) struct ThreadPoolRemovalNotifier<K, V> {
    snd: Sender<RemovalNotification<K, V>>,
    state: Arc<NotifierState<K, V>>,
    thread_pool: Arc<ThreadPool>,
}

impl<K, V> Drop for ThreadPoolRemovalNotifier<K, V> {
    fn drop(&mut self) {
        let state = &self.state;

        // Wait for the notification task to finish. (busy loop)
        while state.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Disallow to create and run a notification task by now, and deliver the
        // remaining notifications on this thread.
        state.shutdown();
        while let Ok(notification) = state.rcv.try_recv() {
            call_listener(&state.listener, notification, state.cache_name.as_deref());
        }

        ThreadPoolRegistry::release_pool(&self.thread_pool);
    }
}

impl<K, V> ThreadPoolRemovalNotifier<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(listener: RemovalListener<K, V>, cache_name: Option<String>) -> Self {
        // The channel is unbounded because notifications are queued while the
        // segment lock is held.
        let (snd, rcv) = crossbeam_channel::unbounded();
        let thread_pool = ThreadPoolRegistry::acquire_pool(PoolName::RemovalNotifier);
        let state = NotifierState {
            task_lock: Default::default(),
            rcv,
            listener,
            cache_name,
            is_running: Default::default(),
            is_shutting_down: Default::default(),
        };
        Self {
            snd,
            state: Arc::new(state),
            thread_pool,
        }
    }

    fn add_notification(&self, notification: RemovalNotification<K, V>) {
        // The receiver lives in `self.state`, so the channel cannot be
        // disconnected while `self` is alive.
        if self.snd.send(notification).is_ok() {
            self.submit_task_if_necessary();
        }
    }

    fn submit_task_if_necessary(&self) {
        if !self.snd.is_empty() && self.state.try_start() {
            let task = NotificationTask::new(&self.state);
            self.thread_pool.pool.execute(move || {
                task.execute();
            });
        }
    }
}

struct NotificationTask<K, V> {
    state: Arc<NotifierState<K, V>>,
}

impl<K, V> NotificationTask<K, V> {
    fn new(state: &Arc<NotifierState<K, V>>) -> Self {
        Self {
            state: Arc::clone(state),
        }
    }

    fn execute(&self) {
        let state = &self.state;
        loop {
            {
                let _task_lock = state.task_lock.lock();
                let mut count = 0u16;

                while let Ok(notification) = state.rcv.try_recv() {
                    call_listener(&state.listener, notification, state.cache_name.as_deref());
                    count += 1;

                    if count > MAX_NOTIFICATIONS_PER_TASK || state.is_shutting_down() {
                        break;
                    }
                }
            }
            state.set_running(false);

            // A notification may have been queued after the last `try_recv` but
            // before `set_running(false)`. Its sender may have seen this task as
            // still running, so pick it up here.
            if state.rcv.is_empty() || state.is_shutting_down() || !state.try_start() {
                break;
            }
        }
    }
}

struct NotifierState<K, V> {
    task_lock: Mutex<()>,
    rcv: Receiver<RemovalNotification<K, V>>,
    listener: RemovalListener<K, V>,
    cache_name: Option<String>,
    is_running: AtomicBool,
    is_shutting_down: AtomicBool,
}

impl<K, V> NotifierState<K, V> {
    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Tries to flip `is_running` from false to true.
    fn try_start(&self) -> bool {
        !self.is_shutting_down()
            && self
                .is_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn set_running(&self, value: bool) {
        self.is_running.store(value, Ordering::Release);
    }

    fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Release);
    }
}

/// Calls the listener, catching a panic so that it cannot corrupt the state of
/// the cache or abort the calling operation.
fn call_listener<K, V>(
    listener: &RemovalListener<K, V>,
    notification: RemovalNotification<K, V>,
    _cache_name: Option<&str>,
) {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    // Safety: It is safe to assert unwind safety here because the listener owns
    // the notification and the cache state was already updated.
    let result = catch_unwind(AssertUnwindSafe(|| listener(notification)));
    if let Err(_payload) = result {
        #[cfg(feature = "logging")]
        log_panic(&*_payload, _cache_name);
    }
}

#[cfg(feature = "logging")]
fn log_panic(payload: &(dyn std::any::Any + Send + 'static), cache_name: Option<&str>) {
    // Try to downcast the payload into &str or String.
    let message: Option<std::borrow::Cow<'_, str>> =
        (payload.downcast_ref::<&str>().map(|s| (*s).into()))
            .or_else(|| payload.downcast_ref::<String>().map(Into::into));

    let cn = cache_name
        .map(|name| format!("[{name}] "))
        .unwrap_or_default();

    if let Some(m) = message {
        log::error!("{cn}The removal listener panicked at '{m}'");
    } else {
        log::error!("{cn}The removal listener panicked");
    }
}
