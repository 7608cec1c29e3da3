// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Calibrator Additional File
//
// Serializes a `CalibratorDocument` into the simulator's additional-file
// format and registers that file in the simulator master configuration.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::collaborator::attr_value;
use crate::error::{CalibrationError, Result};
use crate::types::{duplicate_edge_id, CalibratorDocument, MonitoredEdge};

pub fn probe_id(edge: &MonitoredEdge) -> String {
    format!("probe_{}", edge.edge_id)
}

pub fn calibrator_id(edge: &MonitoredEdge) -> String {
    format!("calib_{}", edge.edge_id)
}

// ─── Writing ────────────────────────────────────────────────────────────────

fn check_unique_edges(document: &CalibratorDocument) -> Result<()> {
    match duplicate_edge_id(&document.edges) {
        Some(id) => Err(CalibrationError::config(format!(
            "edge {} has more than one calibrator",
            id
        ))),
        None => Ok(()),
    }
}

fn write_document<W: Write>(writer: &mut Writer<W>, document: &CalibratorDocument) -> Result<()> {
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("additional")))?;

    let vt = &document.vehicle_type;
    let (accel, decel, sigma, length, max_speed) = (
        vt.accel.to_string(),
        vt.decel.to_string(),
        vt.sigma.to_string(),
        vt.length.to_string(),
        vt.max_speed.to_string(),
    );
    let mut vtype = BytesStart::new("vType");
    vtype.push_attribute(("id", vt.id.as_str()));
    vtype.push_attribute(("accel", accel.as_str()));
    vtype.push_attribute(("decel", decel.as_str()));
    vtype.push_attribute(("sigma", sigma.as_str()));
    vtype.push_attribute(("length", length.as_str()));
    vtype.push_attribute(("maxSpeed", max_speed.as_str()));
    writer.write_event(Event::Empty(vtype))?;

    let freq = document.probe_frequency.to_string();
    for edge in &document.edges {
        let id = probe_id(edge);
        let mut probe = BytesStart::new("routeProbe");
        probe.push_attribute(("id", id.as_str()));
        probe.push_attribute(("edge", edge.edge_id.as_str()));
        probe.push_attribute(("freq", freq.as_str()));
        probe.push_attribute(("file", document.probe_output.as_str()));
        writer.write_event(Event::Empty(probe))?;
    }

    for edge in &document.edges {
        let id = calibrator_id(edge);
        let probe = probe_id(edge);
        let pos = edge.position.to_string();
        let mut calibrator = BytesStart::new("calibrator");
        calibrator.push_attribute(("id", id.as_str()));
        calibrator.push_attribute(("edge", edge.edge_id.as_str()));
        calibrator.push_attribute(("pos", pos.as_str()));
        calibrator.push_attribute(("routeProbe", probe.as_str()));
        calibrator.push_attribute(("output", document.calibrator_output.as_str()));

        let flows: Vec<_> = document.flows_for(&edge.edge_id).collect();
        if flows.is_empty() {
            writer.write_event(Event::Empty(calibrator))?;
            continue;
        }
        writer.write_event(Event::Start(calibrator))?;
        for flow in flows {
            let begin = flow.interval_begin.to_string();
            let end = flow.interval_end.to_string();
            let vph = flow.vehicles_per_hour.to_string();
            let speed = format!("{:.2}", flow.mean_speed);
            let mut element = BytesStart::new("flow");
            element.push_attribute(("begin", begin.as_str()));
            element.push_attribute(("end", end.as_str()));
            element.push_attribute(("vehsPerHour", vph.as_str()));
            element.push_attribute(("speed", speed.as_str()));
            element.push_attribute(("type", vt.id.as_str()));
            element.push_attribute(("route", probe.as_str()));
            writer.write_event(Event::Empty(element))?;
        }
        writer.write_event(Event::End(BytesEnd::new("calibrator")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("additional")))?;
    Ok(())
}

/// Render the document to bytes.
pub fn render_calibrators(document: &CalibratorDocument) -> Result<Vec<u8>> {
    check_unique_edges(document)?;
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    write_document(&mut writer, document)?;
    Ok(writer.into_inner())
}

/// Write the calibrator additional file to `path`.
pub fn write_calibrators(document: &CalibratorDocument, path: &Path) -> Result<()> {
    check_unique_edges(document)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CalibrationError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| CalibrationError::io(path, e))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 4);
    write_document(&mut writer, document)?;
    writer
        .into_inner()
        .flush()
        .map_err(|e| CalibrationError::io(path, e))?;
    info!(
        file = %path.display(),
        edges = document.edges.len(),
        flows = document.flows.len(),
        "calibrator file written"
    );
    Ok(())
}

// ─── Registration ───────────────────────────────────────────────────────────

/// Add `file` to a comma separated additional-files value unless present.
pub fn append_additional_file(value: &str, file: &str) -> String {
    let present = value
        .split(|c: char| c == ',' || c.is_whitespace())
        .any(|entry| entry == file);
    if present {
        value.to_string()
    } else if value.trim().is_empty() {
        file.to_string()
    } else {
        format!("{},{}", value.trim_end_matches(|c: char| c == ',' || c.is_whitespace()), file)
    }
}

fn additional_files_element<'a>(original: &'a BytesStart<'a>, file: &str) -> Result<BytesStart<'a>> {
    let current = attr_value(original, b"value")?.unwrap_or_default();
    let updated = append_additional_file(&current, file);
    let mut element = BytesStart::new("additional-files");
    let mut has_value = false;
    for attr in original.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"value" {
            element.push_attribute(("value", updated.as_str()));
            has_value = true;
        } else {
            element.push_attribute(attr);
        }
    }
    if !has_value {
        element.push_attribute(("value", updated.as_str()));
    }
    Ok(element)
}

/// Register `file` in the `additional-files` entry of a simulator master
/// configuration. Creates the entry inside `<input>` when missing. Returns
/// whether the configuration changed.
pub fn register_additional_file(sumocfg: &Path, file: &str) -> Result<bool> {
    let handle = File::open(sumocfg).map_err(|e| CalibrationError::io(sumocfg, e))?;
    let mut reader = Reader::from_reader(BufReader::new(handle));
    let mut writer = Writer::new(Vec::new());
    let mut buf = Vec::new();
    let mut found = false;
    let mut inserted = false;
    let mut before: Option<String> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"additional-files" => {
                found = true;
                before = attr_value(e, b"value")?;
                let element = additional_files_element(e, file)?;
                if matches!(event, Event::Empty(_)) {
                    writer.write_event(Event::Empty(element))?;
                } else {
                    writer.write_event(Event::Start(element))?;
                }
            }
            Event::End(e) if e.name().as_ref() == b"input" && !found => {
                let mut element = BytesStart::new("additional-files");
                element.push_attribute(("value", file));
                writer.write_event(Event::Empty(element))?;
                writer.write_event(&event)?;
                inserted = true;
                found = true;
            }
            Event::Eof => break,
            _ => writer.write_event(&event)?,
        }
        buf.clear();
    }

    if !found {
        return Err(CalibrationError::config(format!(
            "{} has neither an additional-files entry nor an input section",
            sumocfg.display()
        )));
    }
    let changed = inserted || before.as_deref().map(|v| append_additional_file(v, file) != v).unwrap_or(true);
    if !changed {
        debug!(config = %sumocfg.display(), file, "already registered");
        return Ok(false);
    }
    fs::write(sumocfg, writer.into_inner()).map_err(|e| CalibrationError::io(sumocfg, e))?;
    info!(config = %sumocfg.display(), file, "registered additional file");
    Ok(true)
}

/// `output` as the simulator resolves it from `sumocfg`, which is relative
/// to the directory holding the configuration.
pub fn additional_file_entry(sumocfg: &Path, output: &Path) -> Result<String> {
    let base = sumocfg.parent().unwrap_or_else(|| Path::new(""));
    let (base, target) = if base.is_absolute() == output.is_absolute() {
        (base.to_path_buf(), output.to_path_buf())
    } else {
        let cwd = std::env::current_dir().map_err(|e| CalibrationError::io(".", e))?;
        (cwd.join(base), cwd.join(output))
    };
    let base: Vec<Component> = base
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let target: Vec<Component> = target
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();

    if base[common..].iter().any(|c| matches!(c, Component::ParentDir)) {
        let absolute = fs::canonicalize(output).map_err(|e| CalibrationError::io(output, e))?;
        return Ok(absolute.to_string_lossy().into_owned());
    }
    let mut relative = PathBuf::new();
    for _ in &base[common..] {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    Ok(relative.to_string_lossy().into_owned())
}

/// Register the calibrator file at `output` in `sumocfg`.
pub fn register_calibrators(sumocfg: &Path, output: &Path) -> Result<bool> {
    let entry = additional_file_entry(sumocfg, output)?;
    register_additional_file(sumocfg, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CalibratorFlow, VehicleTypeParams};
    use tempfile::tempdir;

    fn document() -> CalibratorDocument {
        let edges = vec![
            MonitoredEdge { edge_id: "E1".into(), position: 12.5, sensor_id: 1 },
            MonitoredEdge { edge_id: "E2".into(), position: 3.0, sensor_id: 2 },
        ];
        let flows = vec![CalibratorFlow {
            edge_id: "E1".into(),
            position: 12.5,
            sensor_id: 1,
            interval_begin: 0,
            interval_end: 3_600,
            vehicles_per_hour: 42,
            mean_speed: 13.456,
        }];
        CalibratorDocument {
            vehicle_type: VehicleTypeParams::default(),
            edges,
            flows,
            probe_frequency: 3_600,
            probe_output: "routeprobe_output.xml".into(),
            calibrator_output: "calibrator_output.xml".into(),
        }
    }

    #[test]
    fn document_layout() {
        let xml = String::from_utf8(render_calibrators(&document()).unwrap()).unwrap();
        assert!(xml.contains(r#"<vType id="calibrator_vehicle" accel="2.6" decel="4.5" sigma="0.5" length="5" maxSpeed="70"/>"#));
        assert!(xml.contains(r#"<routeProbe id="probe_E1" edge="E1" freq="3600" file="routeprobe_output.xml"/>"#));
        assert!(xml.contains(
            r#"<calibrator id="calib_E1" edge="E1" pos="12.5" routeProbe="probe_E1" output="calibrator_output.xml">"#
        ));
        assert!(xml.contains(
            r#"<flow begin="0" end="3600" vehsPerHour="42" speed="13.46" type="calibrator_vehicle" route="probe_E1"/>"#
        ));
        // Edge without data still gets its calibrator.
        assert!(xml.contains(r#"<calibrator id="calib_E2" edge="E2" pos="3" routeProbe="probe_E2" output="calibrator_output.xml"/>"#));
        assert!(xml.find("<routeProbe").unwrap() < xml.find("<calibrator").unwrap());
    }

    #[test]
    fn repeated_edge_id_is_rejected() {
        let mut doc = document();
        doc.edges[1].edge_id = "E1".into();
        assert!(render_calibrators(&doc).unwrap_err().is_configuration());
    }

    #[test]
    fn append_is_idempotent() {
        assert_eq!(append_additional_file("", "calibrator.xml"), "calibrator.xml");
        assert_eq!(append_additional_file("a.xml", "calibrator.xml"), "a.xml,calibrator.xml");
        let once = append_additional_file("a.xml", "calibrator.xml");
        assert_eq!(append_additional_file(&once, "calibrator.xml"), once);
        assert_eq!(append_additional_file("a.xml b.xml", "b.xml"), "a.xml b.xml");
        assert_eq!(append_additional_file("a.xml,", "c.xml"), "a.xml,c.xml");
    }

    #[test]
    fn registers_in_existing_entry_once() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("osm.sumocfg");
        fs::write(
            &cfg,
            "<configuration>\n    <input>\n        <net-file value=\"osm.net.xml\"/>\n        <additional-files value=\"osm.poly.xml\"/>\n    </input>\n</configuration>\n",
        )
        .unwrap();

        assert!(register_additional_file(&cfg, "calibrator.xml").unwrap());
        let text = fs::read_to_string(&cfg).unwrap();
        assert!(text.contains(r#"<additional-files value="osm.poly.xml,calibrator.xml"/>"#), "{}", text);
        assert!(text.contains(r#"<net-file value="osm.net.xml"/>"#));

        assert!(!register_additional_file(&cfg, "calibrator.xml").unwrap());
        assert_eq!(fs::read_to_string(&cfg).unwrap(), text);
    }

    #[test]
    fn inserts_entry_into_input_section() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("osm.sumocfg");
        fs::write(&cfg, "<configuration><input><net-file value=\"osm.net.xml\"/></input></configuration>").unwrap();
        assert!(register_additional_file(&cfg, "calibrator.xml").unwrap());
        let text = fs::read_to_string(&cfg).unwrap();
        assert!(text.contains(r#"<additional-files value="calibrator.xml"/></input>"#), "{}", text);
    }

    #[test]
    fn entry_is_relative_to_the_config_directory() {
        let entry = |cfg: &str, out: &str| additional_file_entry(Path::new(cfg), Path::new(out)).unwrap();
        assert_eq!(entry("scenario/osm.sumocfg", "scenario/calibrator.xml"), "calibrator.xml");
        assert_eq!(entry("./scenario/osm.sumocfg", "scenario/./calibrator.xml"), "calibrator.xml");
        assert_eq!(entry("osm.sumocfg", "out/calibrator.xml"), "out/calibrator.xml");
        assert_eq!(entry("scenario/osm.sumocfg", "calibrator.xml"), "../calibrator.xml");
        assert_eq!(entry("/a/b/osm.sumocfg", "/a/c/calibrator.xml"), "../c/calibrator.xml");
    }

    #[test]
    fn calibrators_register_next_to_the_config() {
        let dir = tempdir().unwrap();
        let scenario = dir.path().join("scenario");
        fs::create_dir_all(&scenario).unwrap();
        let cfg = scenario.join("osm.sumocfg");
        fs::write(&cfg, "<configuration><input><net-file value=\"osm.net.xml\"/></input></configuration>").unwrap();

        assert!(register_calibrators(&cfg, &scenario.join("calibrator.xml")).unwrap());
        let text = fs::read_to_string(&cfg).unwrap();
        assert!(text.contains(r#"<additional-files value="calibrator.xml"/>"#), "{}", text);
        assert!(!register_calibrators(&cfg, &scenario.join("calibrator.xml")).unwrap());
    }

    #[test]
    fn config_without_input_is_rejected() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("osm.sumocfg");
        fs::write(&cfg, "<configuration/>").unwrap();
        assert!(register_additional_file(&cfg, "calibrator.xml").unwrap_err().is_configuration());
    }
}
