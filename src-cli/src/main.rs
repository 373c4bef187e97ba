//! tether command-line host
//!
//! Opens one sandboxed session, runs a script file from the workspace and
//! keeps pumping its events for a while so timers, sockets and frame
//! callbacks get to run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tether_protocol::{ScriptValue, StatusCode};
use tether_script_host::{compile_file, BridgeError, Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run untrusted Lua scripts in a sandboxed session", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON runtime configuration; flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and pump its events
    Run {
        /// Script path, relative to the workspace root
        file: String,
        #[command(flatten)]
        overrides: Overrides,
        /// Keep pumping events this long after the script returns
        #[arg(short, long, default_value_t = 0)]
        duration_ms: u64,
        /// Pump cadence
        #[arg(long, default_value_t = 16)]
        pump_interval_ms: u64,
        /// Events dispatched per pump
        #[arg(long, default_value_t = 64)]
        batch: usize,
    },

    /// Compile a script without running it
    Check {
        /// Script path, relative to the workspace root
        file: String,
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Clone, Default)]
struct Overrides {
    /// Directory scripts and the store file resolve against
    #[arg(short, long)]
    workspace: Option<PathBuf>,
    /// Instruction limit per call
    #[arg(long)]
    max_instructions: Option<u64>,
    /// Wall-clock limit per call
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Interpreter memory limit in bytes
    #[arg(long)]
    max_memory: Option<usize>,
    /// Skip a bundled capability (console, crypto, http, websocket, drawing, timers, store)
    #[arg(long = "disable", value_name = "CAPABILITY")]
    disabled: Vec<String>,
    /// Refuse network access to this host and its subdomains
    #[arg(long = "deny-host", value_name = "HOST")]
    deny_hosts: Vec<String>,
}

impl Overrides {
    fn apply(&self, config: &mut RuntimeConfig) -> anyhow::Result<()> {
        let session = &mut config.session;
        if let Some(root) = &self.workspace {
            session.workspace_root = root.clone();
        }
        if let Some(max) = self.max_instructions {
            session.limits.max_instructions = Some(max);
        }
        if let Some(ms) = self.timeout_ms {
            session.limits.max_wall_time_ms = Some(ms);
        }
        if let Some(bytes) = self.max_memory {
            session.limits.max_memory = Some(bytes);
        }
        for host in &self.deny_hosts {
            session.network.deny_host(host);
        }
        let caps = &mut session.capabilities;
        for name in &self.disabled {
            let flag = match name.as_str() {
                "console" => &mut caps.console,
                "crypto" => &mut caps.crypto,
                "http" => &mut caps.http,
                "websocket" => &mut caps.websocket,
                "drawing" => &mut caps.drawing,
                "timers" => &mut caps.timers,
                "store" => &mut caps.store,
                other => bail!("Unknown capability '{other}'"),
            };
            *flag = false;
        }
        Ok(())
    }
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    overrides.apply(&mut config)?;
    Ok(config)
}

/// JSON view of script results
fn render(value: &ScriptValue) -> serde_json::Value {
    match value {
        ScriptValue::Nil => serde_json::Value::Null,
        ScriptValue::Boolean(b) => json!(b),
        ScriptValue::Integer(i) => json!(i),
        ScriptValue::Number(n) => json!(n),
        ScriptValue::String(bytes) => json!(String::from_utf8_lossy(bytes)),
        ScriptValue::Table(pairs) => serde_json::Value::Array(
            pairs
                .iter()
                .map(|(k, v)| json!([render(k), render(v)]))
                .collect(),
        ),
        ScriptValue::Opaque(kind) => json!(format!("<{kind}>")),
    }
}

fn failure(error: &BridgeError) -> anyhow::Error {
    anyhow::anyhow!("{}: {error}", error.status())
}

fn run(
    config: RuntimeConfig,
    file: &str,
    duration: Duration,
    interval: Duration,
    batch: usize,
) -> anyhow::Result<()> {
    let unit = compile_file(file, &config.session.workspace_root, &config.session.limits)
        .map_err(|e| failure(&e))?;

    let runtime = Runtime::new(config);
    let session = runtime.open().map_err(|e| failure(&e))?;
    tracing::info!(%session, file, digest = %unit.digest_hex(), "Running script");

    let values = runtime.execute(session, &unit).map_err(|e| failure(&e))?;
    if !values.is_empty() {
        let rendered: Vec<_> = values.iter().map(render).collect();
        println!("{}", serde_json::to_string(&rendered)?);
    }

    let deadline = Instant::now() + duration;
    let mut dispatched = 0;
    while Instant::now() < deadline {
        match runtime.pump(session, batch) {
            Ok(report) => dispatched += report.dispatched,
            Err(e) if e.status() == StatusCode::InvalidSession => {
                tracing::warn!(%session, "Session closed while pumping");
                break;
            }
            Err(e) => return Err(failure(&e)),
        }
        std::thread::sleep(interval);
    }
    if dispatched > 0 {
        tracing::info!(%session, dispatched, "Callbacks dispatched");
    }

    runtime.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tether=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            overrides,
            duration_ms,
            pump_interval_ms,
            batch,
        } => {
            let config = load_config(cli.config.as_deref(), &overrides)?;
            run(
                config,
                &file,
                Duration::from_millis(duration_ms),
                Duration::from_millis(pump_interval_ms.max(1)),
                batch,
            )
        }
        Commands::Check { file, overrides } => {
            let config = load_config(cli.config.as_deref(), &overrides)?;
            let unit = compile_file(&file, &config.session.workspace_root, &config.session.limits)
                .map_err(|e| failure(&e))?;
            println!("{} ok ({})", unit.name(), unit.digest_hex());
            Ok(())
        }
        Commands::Config { overrides } => {
            let config = load_config(cli.config.as_deref(), &overrides)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.json");
        std::fs::write(
            &path,
            r#"{"auto_pump_interval_ms": 10, "session": {"render_hz": 30, "limits": {"max_instructions": 5}}}"#,
        )
        .unwrap();

        let overrides = Overrides {
            max_instructions: Some(1000),
            disabled: vec!["http".into(), "drawing".into()],
            deny_hosts: vec!["blocked.example".into()],
            ..Overrides::default()
        };
        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.auto_pump_interval_ms, Some(10));
        assert_eq!(config.session.render_hz, 30);
        assert_eq!(config.session.limits.max_instructions, Some(1000));
        assert!(!config.session.capabilities.http);
        assert!(!config.session.capabilities.drawing);
        assert!(config.session.capabilities.timers);
        assert!(config
            .session
            .network
            .deny_hosts
            .contains(&"blocked.example".to_string()));
    }

    #[test]
    fn unknown_capability_is_an_error() {
        let overrides = Overrides {
            disabled: vec!["gpu".into()],
            ..Overrides::default()
        };
        let err = load_config(None, &overrides).unwrap_err();
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn render_results() {
        let table = ScriptValue::Table(vec![(
            ScriptValue::String(b"k".to_vec()),
            ScriptValue::Integer(1),
        )]);
        assert_eq!(render(&table), json!([["k", 1]]));
        assert_eq!(render(&ScriptValue::Nil), serde_json::Value::Null);
    }

    #[test]
    fn run_script_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.lua"),
            "timer.after(0, function() print('tick') end) return 1",
        )
        .unwrap();
        let mut config = RuntimeConfig::default();
        config.session.workspace_root = dir.path().to_path_buf();
        config.session.capabilities.drawing = false;
        run(
            config,
            "main.lua",
            Duration::from_millis(50),
            Duration::from_millis(5),
            16,
        )
        .unwrap();
    }
}
