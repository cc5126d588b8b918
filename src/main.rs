//! CLI front-end (specification §4.10, command table in §6).
//!
//! Grounded on the teacher's `main.rs`: a thin argument parser driving a
//! lazily-opened device handle, one subcommand per line of work, process
//! exit status carrying the outcome. This version widens the single
//! hardcoded Volca Sample 2 path into the full connector registry and adds
//! the commands the specification's table lists (`ld`, `info`, `df`, `ls`,
//! `mkdir`, `mv`, `rm`, `dl`, `ul`).

mod opt;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tracing_subscriber::EnvFilter;

use elektroid_core::backend::Backend;
use elektroid_core::connector::{ConnectorDescriptor, Handshake, Registry};
use elektroid_core::connectors::{microfreak::MicroFreak, sds::MidiSds, system, volca_sample, volca_sample2::VolcaSample2};
use elektroid_core::error::CoreError;
use elektroid_core::fs_ops::FsOps;
use elektroid_core::task::{AlwaysReplace, Task, TaskEngine, TaskKind, TaskStatus};

use opt::{Operation, Opts};

/// Probes a device by running the connector's own `readdir("/")` one step;
/// any wire-level failure is folded into `NotConnected` so the registry
/// moves on to the next candidate instead of aborting the whole attach
/// (specification §4.3 steps 4-7).
fn probe_handshake(
    fs_ops: Arc<dyn FsOps>,
    name: &'static str,
) -> Box<dyn Fn(&Backend) -> Result<Handshake, CoreError> + Send + Sync> {
    Box::new(move |backend: &Backend| {
        let mut iter = fs_ops.readdir(backend, "/", None)?;
        if let Some(Err(_)) = iter.next() {
            return Err(CoreError::NotConnected);
        }
        Ok(Handshake {
            fs_ops: fs_ops.clone(),
            name: name.to_string(),
            version: String::new(),
            description: fs_ops.id().to_string(),
        })
    })
}

fn midi_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(ConnectorDescriptor {
        name: "volca-sample2",
        standard: false,
        regex: Some(Regex::new("(?i)volca sample").unwrap()),
        handshake: probe_handshake(Arc::new(VolcaSample2::new(0)), "Volca Sample 2"),
    });
    registry.register(ConnectorDescriptor {
        name: "microfreak",
        standard: false,
        regex: Some(Regex::new("(?i)microfreak").unwrap()),
        handshake: probe_handshake(Arc::new(MicroFreak::new(0)), "MicroFreak"),
    });
    registry.register(ConnectorDescriptor {
        name: "sds",
        standard: false,
        regex: None,
        handshake: probe_handshake(Arc::new(MidiSds::new(0)), "MIDI Sampler"),
    });
    registry
}

/// Connector families that never touch a MIDI port at all
/// (`CONNECTOR_OPTION_NO_MIDI`); selected directly by id instead of through
/// [`Registry::attach`].
fn no_midi_filesystems() -> Vec<(String, Arc<dyn FsOps>)> {
    let mut out: Vec<(String, Arc<dyn FsOps>)> = Vec::new();
    for fs in volca_sample::all_variants() {
        out.push((fs.id().to_string(), Arc::new(fs)));
    }
    for (id, fs) in system::all_variants() {
        out.push((id, Arc::new(fs)));
    }
    out
}

/// A device opened for the duration of one process run (specification
/// §4.10: "the CLI opens exactly one backend, lazily, on first use").
struct OpenDevice {
    backend: Arc<Backend>,
    fs_ops: Arc<dyn FsOps>,
}

struct App {
    registry: Registry,
    no_midi: Vec<(String, Arc<dyn FsOps>)>,
    task_engine: TaskEngine,
    opened: Option<(String, OpenDevice)>,
}

impl App {
    fn new() -> Self {
        Self {
            registry: midi_registry(),
            no_midi: no_midi_filesystems(),
            task_engine: TaskEngine::new(Box::new(AlwaysReplace)),
            opened: None,
        }
    }

    fn list_midi_ports() -> Vec<String> {
        let Ok(midi_in) = midir::MidiInput::new("elektroid") else {
            return Vec::new();
        };
        midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect()
    }

    fn list_devices(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Self::list_midi_ports().into_iter().map(|n| (n.clone(), n)).collect();
        for (id, fs) in &self.no_midi {
            out.push((id.clone(), fs.display_name().to_string()));
        }
        out
    }

    /// Opens `device` if it is not already the currently open one, choosing
    /// between a real MIDI backend and a no-MIDI connector by id.
    fn open(&mut self, device: &str) -> Result<&OpenDevice, CoreError> {
        if self.opened.as_ref().map(|(d, _)| d.as_str()) == Some(device) {
            return Ok(&self.opened.as_ref().unwrap().1);
        }

        if let Some((_, fs_ops)) = self.no_midi.iter().find(|(id, _)| id == device) {
            let backend = Arc::new(Backend::new(false));
            self.opened = Some((device.to_string(), OpenDevice { backend, fs_ops: fs_ops.clone() }));
            return Ok(&self.opened.as_ref().unwrap().1);
        }

        let backend = Backend::new(true);
        backend.open(device)?;
        let handshake = self.registry.attach(&backend, device)?;
        let backend = Arc::new(backend);
        self.opened = Some((device.to_string(), OpenDevice { backend, fs_ops: handshake.fs_ops }));
        Ok(&self.opened.as_ref().unwrap().1)
    }
}

/// Splits `<device>/<path>` at the first `/`, defaulting the path to `/`.
fn split_device_path(arg: &str) -> (&str, String) {
    match arg.split_once('/') {
        Some((device, path)) if !path.is_empty() => (device, format!("/{path}")),
        Some((device, _)) => (device, "/".to_string()),
        None => (arg, "/".to_string()),
    }
}

fn run_task(engine: &TaskEngine, task: Arc<Task>) -> Result<(), CoreError> {
    engine.enqueue(task.clone());
    loop {
        match task.status() {
            TaskStatus::Queued | TaskStatus::Running => std::thread::sleep(Duration::from_millis(20)),
            TaskStatus::CompletedOk => return Ok(()),
            TaskStatus::Canceled => return Err(CoreError::Canceled),
            TaskStatus::CompletedError => return Err(CoreError::Wire),
        }
    }
}

fn run(opts: Opts) -> Result<(), CoreError> {
    let mut app = App::new();

    match opts.cmd {
        Operation::Ld => {
            for (id, name) in app.list_devices() {
                println!("{id} {name}");
            }
        }
        Operation::Info { device } => {
            let opened = app.open(&device)?;
            let identity = opened.backend.identity.lock().expect("identity mutex poisoned").clone();
            println!("filesystem: {}", opened.fs_ops.id());
            if !identity.company.is_empty() {
                println!("manufacturer: {:02x?}", identity.company);
            }
        }
        Operation::Df { device } => {
            let opened = app.open(&device)?;
            let (used, total) = opened.fs_ops.storage_stats(&opened.backend)?;
            println!("{used} {total}");
        }
        Operation::Ls { device_path } => {
            let (device, path) = split_device_path(&device_path);
            let opened = app.open(device)?;
            for item in opened.fs_ops.readdir(&opened.backend, &path, None)? {
                let item = item?;
                let kind = match item.kind {
                    elektroid_core::fs_ops::ItemKind::File => "f",
                    elektroid_core::fs_ops::ItemKind::Dir => "d",
                };
                let size = item.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                let id = item.id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{kind} {size} {id} {}", item.name);
            }
        }
        Operation::Mkdir { device_path } => {
            let (device, path) = split_device_path(&device_path);
            let opened = app.open(device)?;
            opened.fs_ops.mkdir(&opened.backend, &path)?;
        }
        Operation::Mv { src, dst } => {
            let (device, src_path) = split_device_path(&src);
            let (dst_device, dst_path) = split_device_path(&dst);
            if device != dst_device {
                return Err(CoreError::BadInput);
            }
            let opened = app.open(device)?;
            opened.fs_ops.move_(&opened.backend, &src_path, &dst_path)?;
        }
        Operation::Rm { device_path } => {
            let (device, path) = split_device_path(&device_path);
            let opened = app.open(device)?;
            opened.fs_ops.delete(&opened.backend, &path)?;
        }
        Operation::Dl { src, local_dir } => {
            let (device, src_path) = split_device_path(&src);
            let opened = app.open(device)?;
            let dst = format!("{}/{}", local_dir.trim_end_matches('/'), src_path.trim_start_matches('/'));
            let batch = app.task_engine.new_batch_id();
            let task = Task::new(
                TaskKind::Download,
                src_path,
                dst,
                opened.fs_ops.clone(),
                opened.backend.clone(),
                batch,
                elektroid_core::task::OverwriteMode::Replace,
            );
            run_task(&app.task_engine, task)?;
        }
        Operation::Ul { local_file, device_path } => {
            let (device, dst_path) = split_device_path(&device_path);
            let opened = app.open(device)?;
            let batch = app.task_engine.new_batch_id();
            let task = Task::new(
                TaskKind::Upload,
                local_file,
                dst_path,
                opened.fs_ops.clone(),
                opened.backend.clone(),
                batch,
                elektroid_core::task::OverwriteMode::Replace,
            );
            run_task(&app.task_engine, task)?;
        }
    }
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    let level = match opts.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match run(opts) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("elektroid-cli: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
