//! `print`, `info`, `warn`, `printerror` and the `rconsole*` aliases

use std::sync::{Arc, Mutex};

use mlua::{Lua, MultiValue};
use serde::{Deserialize, Serialize};
use tether_engine_core::{AdapterLifecycle, MutexExt};

use crate::bindings::display_value;
use crate::{Capability, InstallContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    Print,
    Info,
    Warn,
    Error,
}

/// Receives script output. Implemented by the host.
pub trait OutputSink: Send + Sync {
    fn write(&self, level: OutputLevel, text: &str);
}

/// Forwards script output to `tracing` under the `tether::script` target
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write(&self, level: OutputLevel, text: &str) {
        match level {
            OutputLevel::Print | OutputLevel::Info => {
                tracing::info!(target: "tether::script", "{text}")
            }
            OutputLevel::Warn => tracing::warn!(target: "tether::script", "{text}"),
            OutputLevel::Error => tracing::error!(target: "tether::script", "{text}"),
        }
    }
}

/// Keeps output in memory
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<(OutputLevel, String)>>,
}

impl BufferSink {
    pub fn lines(&self) -> Vec<(OutputLevel, String)> {
        self.lines.lock_or_recover().clone()
    }

    pub fn take(&self) -> Vec<(OutputLevel, String)> {
        std::mem::take(&mut *self.lines.lock_or_recover())
    }
}

impl OutputSink for BufferSink {
    fn write(&self, level: OutputLevel, text: &str) {
        self.lines.lock_or_recover().push((level, text.to_string()));
    }
}

const GLOBALS: [(&str, OutputLevel); 8] = [
    ("print", OutputLevel::Print),
    ("info", OutputLevel::Info),
    ("warn", OutputLevel::Warn),
    ("printerror", OutputLevel::Error),
    ("rconsoleprint", OutputLevel::Print),
    ("rconsoleinfo", OutputLevel::Info),
    ("rconsolewarn", OutputLevel::Warn),
    ("rconsoleerr", OutputLevel::Error),
];

pub struct Console {
    sink: Arc<dyn OutputSink>,
    lifecycle: AdapterLifecycle,
}

impl Console {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            lifecycle: AdapterLifecycle::new("console"),
        }
    }
}

impl Capability for Console {
    fn name(&self) -> &'static str {
        "console"
    }

    fn install(&self, lua: &Lua, _ctx: &InstallContext) -> mlua::Result<()> {
        let globals = lua.globals();
        for (name, level) in GLOBALS {
            let sink = self.sink.clone();
            let function = lua.create_function(move |_, args: MultiValue| {
                let text = args.iter().map(display_value).collect::<Vec<_>>().join(" ");
                sink.write(level, &text);
                Ok(())
            })?;
            globals.set(name, function)?;
        }
        self.lifecycle.activate();
        Ok(())
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{buffer, session_with};
    use crate::compile;

    #[test]
    fn output_reaches_sink() {
        let sink = buffer();
        let session = session_with(Box::new(Console::new(sink.clone())));
        let unit = compile(
            "print('a', 1, 2.0, nil, true) warn('careful') printerror('bad') rconsoleinfo('i')",
            "console",
        )
        .unwrap();
        session.execute(&unit).unwrap();

        assert_eq!(
            sink.take(),
            vec![
                (OutputLevel::Print, "a 1 2.0 nil true".to_string()),
                (OutputLevel::Warn, "careful".to_string()),
                (OutputLevel::Error, "bad".to_string()),
                (OutputLevel::Info, "i".to_string()),
            ]
        );
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn empty_print_writes_empty_line() {
        let sink = buffer();
        let session = session_with(Box::new(Console::new(sink.clone())));
        session.execute(&compile("print()", "console").unwrap()).unwrap();
        assert_eq!(sink.lines(), vec![(OutputLevel::Print, String::new())]);
    }
}
