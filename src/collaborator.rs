// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - External Collaborators
//
// Trip generator, simulator and loader are separate programs. They are run
// synchronously through `CommandRunner`, which tests replace with doubles.
// There is no timeout on a collaborator call.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::allocator::allocate;
use crate::config::{CalibrationConfig, CommandConfig, DemandConfig, SimulatorConfig};
use crate::demand::{plan_generation, GenerationRequest, SeedSequence};
use crate::error::{CalibrationError, Result};
use crate::types::{AllocatedIntervals, VehicleClass, VehicleClassMix};

// ─── Process Invocation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    /// Start from a configured program and its leading arguments.
    pub fn from_command(command: &CommandConfig) -> Self {
        Self { program: command.program.clone(), args: command.args.clone() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(name).arg(value.to_string())
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    /// Value following `name`, if present.
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a collaborator finished. `code` is `None` when it was killed by a
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn terminated() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "termination by signal"),
        }
    }
}

/// Runs an external program to completion.
pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<ExitStatus>;
}

/// Spawns real processes with inherited stdio and waits for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<ExitStatus> {
        debug!(command = %invocation, "spawning");
        let status = std::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .status()
            .map_err(|e| CalibrationError::ProcessFailure {
                program: invocation.program.clone(),
                status: format!("spawn failure ({})", e),
            })?;
        Ok(status.into())
    }
}

/// Run `invocation` and turn a non-zero exit into `ProcessFailure`.
pub fn run_checked<R: CommandRunner + ?Sized>(runner: &mut R, invocation: &Invocation) -> Result<()> {
    let status = runner.run(invocation)?;
    if status.success() {
        Ok(())
    } else {
        Err(CalibrationError::ProcessFailure {
            program: invocation.program.clone(),
            status: status.to_string(),
        })
    }
}

// ─── Simulation Cycle ───────────────────────────────────────────────────────

/// Regenerates demand for a total trip amount, simulates it and loads the
/// simulated sensor output into the simulated store.
pub trait SimulationCycle {
    fn regenerate(&mut self, amount: u64) -> Result<()>;
}

/// The generator → simulator → loader chain built from configuration.
pub struct ExternalPipeline<R: CommandRunner> {
    runner: R,
    demand: DemandConfig,
    generator: CommandConfig,
    simulator: SimulatorConfig,
    loader: CommandConfig,
    mix: VehicleClassMix,
    intervals: AllocatedIntervals,
    seeds: SeedSequence,
}

impl<R: CommandRunner> ExternalPipeline<R> {
    pub fn new(config: &CalibrationConfig, runner: R) -> Result<Self> {
        if !config.demand.net_file.is_file() {
            return Err(CalibrationError::config(format!(
                "network file {} does not exist",
                config.demand.net_file.display()
            )));
        }
        let profile = config.demand.demand_profile()?;
        let intervals = allocate(&profile, config.demand.window()?)?;
        Ok(Self {
            runner,
            demand: config.demand.clone(),
            generator: config.generator.clone(),
            simulator: config.simulator.clone(),
            loader: config.loader.clone(),
            mix: config.demand.classes.mix()?,
            intervals,
            seeds: SeedSequence::new(config.demand.base_seed),
        })
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn fragment_dir(&self) -> PathBuf {
        self.demand.output_dir.join("fragments")
    }

    /// Path of the merged trip file for `class`.
    pub fn trips_path(&self, class: VehicleClass) -> PathBuf {
        trips_file_name(&self.demand.output_dir, class)
    }

    fn generator_invocation(&self, request: &GenerationRequest, output: &Path) -> Invocation {
        let invocation = Invocation::from_command(&self.generator)
            .flag("-n", self.demand.net_file.display())
            .flag("-b", request.begin)
            .flag("-e", request.end)
            .flag("-p", request.period)
            .flag("--fringe-factor", self.demand.fringe_factor)
            .flag("-s", request.seed)
            .flag("--prefix", &request.id_prefix)
            .flag("-o", output.display());
        match request.class {
            VehicleClass::Car => invocation,
            VehicleClass::Pedestrian => invocation.arg("--pedestrians"),
            other => invocation.flag("--vehicle-class", other.sumo_class()),
        }
    }

    /// Run the trip generator once per planned request and merge the
    /// fragments into one trip file per class. Returns the merged files.
    pub fn generate(&mut self, amount: u64) -> Result<Vec<PathBuf>> {
        let requests = plan_generation(amount, &self.mix, &self.intervals, &mut self.seeds);
        let fragment_dir = self.fragment_dir();
        fs::create_dir_all(&fragment_dir).map_err(|e| CalibrationError::io(&fragment_dir, e))?;

        let mut fragments: BTreeMap<VehicleClass, Vec<PathBuf>> = BTreeMap::new();
        for (class, _) in self.mix.iter() {
            fragments.entry(class).or_default();
        }
        for request in &requests {
            let output = fragment_dir.join(format!(
                "{}_{}.trips.xml",
                request.class.label(),
                request.interval_index
            ));
            let invocation = self.generator_invocation(request, &output);
            debug!(class = %request.class, seed = request.seed, period = request.period, "generating fragment");
            run_checked(&mut self.runner, &invocation)?;
            fragments.entry(request.class).or_default().push(output);
        }

        let mut merged = Vec::new();
        for (class, files) in &fragments {
            let target = self.trips_path(*class);
            let trips = merge_trip_fragments(files, &target)?;
            info!(%class, trips, file = %target.display(), "trip file written");
            for file in files {
                fs::remove_file(file).map_err(|e| CalibrationError::io(file, e))?;
            }
            merged.push(target);
        }
        Ok(merged)
    }

    fn simulate(&mut self) -> Result<()> {
        let invocation = Invocation::new(self.simulator.program.clone());
        let invocation = self
            .simulator
            .args
            .iter()
            .fold(invocation, |inv, a| inv.arg(a.clone()))
            .flag("-c", self.simulator.config.display());
        info!(command = %invocation, "simulating");
        run_checked(&mut self.runner, &invocation)
    }

    fn load(&mut self) -> Result<()> {
        let invocation = Invocation::from_command(&self.loader);
        info!(command = %invocation, "loading simulated sensor output");
        run_checked(&mut self.runner, &invocation)
    }
}

impl<R: CommandRunner> SimulationCycle for ExternalPipeline<R> {
    fn regenerate(&mut self, amount: u64) -> Result<()> {
        self.generate(amount)?;
        self.simulate()?;
        self.load()
    }
}

pub fn trips_file_name(dir: &Path, class: VehicleClass) -> PathBuf {
    dir.join(format!("osm.{}.trips.xml", class.sumo_class()))
}

// ─── Fragment Merging ───────────────────────────────────────────────────────

/// A top-level element of a trip file, kept as raw events.
struct RouteItem {
    depart: f64,
    events: Vec<Event<'static>>,
}

pub(crate) fn attr_value(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Departure of a top-level item, `depart` or `begin`. Items with neither
/// sort first; a value that is not a number is rejected.
fn item_depart(path: &Path, element: &BytesStart<'_>) -> Result<f64> {
    let raw = match attr_value(element, b"depart")? {
        Some(v) => Some(v),
        None => attr_value(element, b"begin")?,
    };
    match raw {
        None => Ok(0.0),
        Some(v) => v.trim().parse::<f64>().map_err(|_| {
            CalibrationError::config(format!(
                "trip in {} has non-numeric depart {:?}",
                path.display(),
                v
            ))
        }),
    }
}

/// Collect `vType` declarations (first one per id wins) and every other
/// top-level element of `path`.
fn read_fragment(
    path: &Path,
    vtypes: &mut Vec<Vec<Event<'static>>>,
    seen_vtypes: &mut HashSet<String>,
    items: &mut Vec<RouteItem>,
) -> Result<()> {
    let file = File::open(path).map_err(|e| CalibrationError::io(path, e))?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<RouteItem> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                depth += 1;
                if depth == 2 {
                    current = Some(RouteItem {
                        depart: item_depart(path, &e)?,
                        events: vec![Event::Start(e.into_owned())],
                    });
                } else if let Some(item) = current.as_mut() {
                    item.events.push(Event::Start(e.into_owned()));
                }
            }
            Event::Empty(e) => {
                if depth == 1 {
                    if e.name().as_ref() == b"vType" {
                        let id = attr_value(&e, b"id")?.unwrap_or_default();
                        if seen_vtypes.insert(id) {
                            vtypes.push(vec![Event::Empty(e.into_owned())]);
                        }
                    } else {
                        items.push(RouteItem {
                            depart: item_depart(path, &e)?,
                            events: vec![Event::Empty(e.into_owned())],
                        });
                    }
                } else if let Some(item) = current.as_mut() {
                    item.events.push(Event::Empty(e.into_owned()));
                }
            }
            Event::End(e) => {
                if depth >= 2 {
                    if let Some(item) = current.as_mut() {
                        item.events.push(Event::End(e.into_owned()));
                    }
                    if depth == 2 {
                        if let Some(item) = current.take() {
                            let is_vtype = matches!(
                                item.events.first(),
                                Some(Event::Start(s)) if s.name().as_ref() == b"vType"
                            );
                            if is_vtype {
                                let id = match item.events.first() {
                                    Some(Event::Start(s)) => attr_value(s, b"id")?.unwrap_or_default(),
                                    _ => String::new(),
                                };
                                if seen_vtypes.insert(id) {
                                    vtypes.push(item.events);
                                }
                            } else {
                                items.push(item);
                            }
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Merge trip fragments into one `<routes>` file sorted by departure.
/// Returns the number of merged items.
pub fn merge_trip_fragments(fragments: &[PathBuf], output: &Path) -> Result<usize> {
    let mut vtypes = Vec::new();
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for fragment in fragments {
        read_fragment(fragment, &mut vtypes, &mut seen, &mut items)?;
    }
    // Stable, so equal departures keep generation order.
    items.sort_by(|a, b| a.depart.total_cmp(&b.depart));

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CalibrationError::io(parent, e))?;
    }
    let file = File::create(output).map_err(|e| CalibrationError::io(output, e))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("routes")))?;
    for vtype in &vtypes {
        for event in vtype {
            writer.write_event(event)?;
        }
    }
    for item in &items {
        for event in &item.events {
            writer.write_event(event)?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("routes")))?;
    writer
        .into_inner()
        .flush()
        .map_err(|e| CalibrationError::io(output, e))?;
    Ok(items.len())
}
