//! `timer.after`, `timer.every` and `timer.cancel`
//!
//! The callback's own handle identifies the timer; scripts get its raw
//! value as the timer id. The timer thread starts with the first schedule.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Value};
use tether_engine_core::timer::TimerService;
use tether_engine_core::{AdapterLifecycle, EventQueue, ProducerSet, QueueConfig, JOIN_TIMEOUT};
use tether_protocol::Handle;

use crate::bindings::{arg_function, arg_integer, arg_number, ok_or_nil};
use crate::{Callbacks, Capability, InstallContext};

struct Inner {
    queue: Arc<EventQueue>,
    producers: ProducerSet,
    service: RefCell<Option<TimerService>>,
    lifecycle: AdapterLifecycle,
}

impl Inner {
    fn schedule(
        &self,
        lua: &Lua,
        callbacks: &Callbacks,
        seconds: &Value,
        callback: &Value,
        repeat: bool,
    ) -> Result<i64, String> {
        if !self.lifecycle.accepts_work() {
            return Err("timers are shutting down".into());
        }
        let seconds = arg_number(seconds, "seconds")?;
        let delay = Duration::try_from_secs_f64(seconds)
            .map_err(|_| format!("invalid delay {seconds}"))?;
        let callback = arg_function(callback, "callback")?;

        let mut service = self.service.borrow_mut();
        if service.is_none() {
            let spawned = TimerService::spawn(&self.producers, self.queue.clone())
                .map_err(|e| format!("cannot start timer thread: {e}"))?;
            *service = Some(spawned);
        }
        let Some(service) = service.as_ref() else {
            return Err("timer thread unavailable".into());
        };

        let handle = callbacks
            .register(lua, callback)
            .map_err(|e| e.to_string())?;
        service.schedule(handle, delay, repeat.then_some(delay));
        self.lifecycle.activate();
        Ok(handle.to_raw() as i64)
    }

    fn cancel(&self, id: &Value) -> Result<bool, String> {
        let handle = Handle::from_raw(arg_integer(id, "id")? as u64);
        Ok(self
            .service
            .borrow()
            .as_ref()
            .is_some_and(|service| service.cancel(handle)))
    }
}

pub struct Timers {
    inner: Rc<Inner>,
}

impl Timers {
    pub fn new(queue: &QueueConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                queue: Arc::new(EventQueue::new("timers", queue)),
                producers: ProducerSet::new("timers"),
                service: RefCell::new(None),
                lifecycle: AdapterLifecycle::new("timers"),
            }),
        }
    }
}

impl Capability for Timers {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn install(&self, lua: &Lua, ctx: &InstallContext) -> mlua::Result<()> {
        let timer = lua.create_table()?;

        for (name, repeat) in [("after", false), ("every", true)] {
            let (inner, callbacks) = (self.inner.clone(), ctx.callbacks.clone());
            timer.set(
                name,
                lua.create_function(move |lua, (seconds, callback): (Value, Value)| {
                    let id = inner.schedule(lua, &callbacks, &seconds, &callback, repeat);
                    ok_or_nil(lua, id)
                })?,
            )?;
        }

        let inner = self.inner.clone();
        timer.set(
            "cancel",
            lua.create_function(move |lua, id: Value| ok_or_nil(lua, inner.cancel(&id)))?,
        )?;

        lua.globals().set("timer", timer)?;
        Ok(())
    }

    fn queue(&self) -> Option<&Arc<EventQueue>> {
        Some(&self.inner.queue)
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.inner.lifecycle
    }

    fn shutdown(&self) {
        let pending = self.inner.service.borrow().as_ref().map_or(0, TimerService::pending);
        self.inner.producers.shutdown(JOIN_TIMEOUT);
        tracing::debug!(pending, "Timers shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{eval, pump_until, session_with};
    use crate::BridgeError;

    fn count(session: &crate::Session, name: &str) -> i64 {
        session.lua().globals().get::<Option<i64>>(name).unwrap().unwrap_or(0)
    }

    #[test]
    fn after_fires_once_then_releases() {
        let session = session_with(Box::new(Timers::new(&QueueConfig::default())));
        let id: i64 = eval(&session, "return timer.after(0.01, function() fired = (fired or 0) + 1 end)");
        let handle = Handle::from_raw(id as u64);
        assert!(session.resolve(handle).is_ok());

        assert!(pump_until(&session, |s| count(s, "fired") == 1));
        // The close that follows the single fire releases the callback
        assert!(pump_until(&session, |s| s.resolve(handle).is_err()));
        assert_eq!(session.resolve(handle), Err(BridgeError::InvalidHandle(handle)));
        assert_eq!(count(&session, "fired"), 1);
    }

    #[test]
    fn every_repeats_until_cancelled() {
        let session = session_with(Box::new(Timers::new(&QueueConfig::default())));
        let id: i64 = eval(&session, "return timer.every(0.005, function() ticks = (ticks or 0) + 1 end)");
        assert!(pump_until(&session, |s| count(s, "ticks") >= 3));

        let cancelled: bool = eval(&session, &format!("return timer.cancel({id})"));
        assert!(cancelled);
        let handle = Handle::from_raw(id as u64);
        assert!(pump_until(&session, |s| s.resolve(handle).is_err()));

        let again: bool = eval(&session, &format!("return timer.cancel({id})"));
        assert!(!again);
    }

    #[test]
    fn bad_arguments_return_nil() {
        let session = session_with(Box::new(Timers::new(&QueueConfig::default())));
        let (value, message): (Value, String) = eval(&session, "return timer.after(-1, function() end)");
        assert!(value.is_nil());
        assert!(message.contains("-1"));

        let (value, message): (Value, String) = eval(&session, "return timer.after(1, 'nope')");
        assert!(value.is_nil());
        assert!(message.contains("function"));
    }

    #[test]
    fn out_of_range_delay_returns_nil() {
        let session = session_with(Box::new(Timers::new(&QueueConfig::default())));
        for delay in ["1e30", "0/0", "math.huge"] {
            let (value, message): (Value, String) =
                eval(&session, &format!("return timer.after({delay}, function() end)"));
            assert!(value.is_nil());
            assert!(message.contains("invalid delay"));
        }
        let id: i64 = eval(&session, "return timer.after(1e9, function() end)");
        assert!(id > 0);
    }

    #[test]
    fn close_stops_timer_thread() {
        let session = session_with(Box::new(Timers::new(&QueueConfig::default())));
        let _: i64 = eval(&session, "return timer.every(10, function() end)");
        session.close().unwrap();
        assert_eq!(
            session.adapter_states(),
            vec![("timers", tether_engine_core::AdapterState::Closed)]
        );
    }
}
